//! The pipeline orchestrator.
//!
//! Drives each event through the state machine:
//!
//! ```text
//! INGESTED -> NORMALIZED -> BUFFERED -> SCORED -> TRIAGED
//!   -> (ANALYZED?) -> (REMEDIATED?) -> NOTIFIED? -> STORED -> DONE
//!                               \
//!                                -> DEAD_LETTERED
//! ```
//!
//! Each event is owned by exactly one task from scoring to its terminal
//! state; concurrency is bounded by permits taken at ingress. Stages
//! degrade rather than fail wherever a meaningful degraded outcome exists,
//! so the only dead-letter paths are malformed input and a permanent model
//! schema rejection. A store outage after bounded retries spools the alert
//! to disk instead of losing it.

use crate::analysis::{self, AnalysisClient, DeepAnalysisGate};
use crate::bus::{self, BusMessage};
use crate::config::Config;
use crate::dlq::{DeadLetter, DeadLetterQueue, DeadLetterSpool};
use crate::error::StoreError;
use crate::event::{Alert, AlertStatus, Event, MlVerdict, RemediationOutcome};
use crate::ingress::Ingress;
use crate::metrics;
use crate::notify::{AlertPublisher, Notifier};
use crate::remediation::{self, Effector, RemediationGate};
use crate::retry::BackoffSchedule;
use crate::scorer::{MlClient, Scorer};
use crate::store::AlertStore;
use crate::triage;
use chrono::Utc;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// The external collaborators, injected at startup.
pub struct PipelineClients {
    pub ml: Arc<dyn MlClient>,
    pub analysis: Arc<dyn AnalysisClient>,
    pub effector: Arc<dyn Effector>,
    pub publisher: Arc<dyn AlertPublisher>,
    pub store: Arc<dyn AlertStore>,
}

/// Stage handlers shared by all worker tasks.
struct Stages {
    config: watch::Receiver<Arc<Config>>,
    scorer: Scorer,
    analysis: DeepAnalysisGate,
    remediation: RemediationGate,
    notifier: Notifier,
    store: Arc<dyn AlertStore>,
    dlq: Arc<DeadLetterQueue>,
    spool: DeadLetterSpool,
    store_schedule: BackoffSchedule,
}

/// A running pipeline: ingress handle, partition workers, and the
/// concurrency limiter used to drain on shutdown.
pub struct Pipeline {
    ingress: Arc<Ingress>,
    workers: Vec<JoinHandle<()>>,
    limiter: Arc<Semaphore>,
    max_events: u32,
    dlq: Arc<DeadLetterQueue>,
}

impl Pipeline {
    /// Spawn the partition workers and return the running pipeline.
    ///
    /// Sizing knobs (bus capacity, partition count, concurrency limits)
    /// are fixed at start; thresholds and the action policy are re-read
    /// from the config channel at every gate decision.
    pub fn start(config: watch::Receiver<Arc<Config>>, clients: PipelineClients) -> Pipeline {
        let cfg = config.borrow().clone();

        let limiter = Arc::new(Semaphore::new(cfg.limits.max_concurrent_events as usize));
        let (event_bus, receivers) = bus::channel(cfg.bus.partitions, cfg.bus.capacity);
        let dlq = Arc::new(DeadLetterQueue::new());

        let stages = Arc::new(Stages {
            config: config.clone(),
            scorer: Scorer::new(
                clients.ml,
                cfg.ml.model_version.clone(),
                BackoffSchedule::new(cfg.ml.initial_backoff_ms, cfg.ml.max_attempts, cfg.ml.budget_ms),
                cfg.limits.oracle_concurrency,
            ),
            analysis: DeepAnalysisGate::new(
                clients.analysis,
                Duration::from_millis(cfg.analysis.timeout_ms),
                cfg.limits.oracle_concurrency,
            ),
            remediation: RemediationGate::new(
                clients.effector,
                Duration::from_millis(cfg.remediation.effector_timeout_ms),
                cfg.limits.oracle_concurrency,
            ),
            notifier: Notifier::new(
                clients.publisher,
                cfg.notify.dedup_window_ms,
                cfg.notify.dedup_capacity,
            ),
            store: clients.store,
            dlq: Arc::clone(&dlq),
            spool: DeadLetterSpool::new(cfg.general.data_dir.join("dlq")),
            store_schedule: BackoffSchedule::new(200, 4, cfg.store.budget_ms),
        });

        let workers = receivers
            .into_iter()
            .enumerate()
            .map(|(partition, rx)| {
                let stages = Arc::clone(&stages);
                tokio::spawn(partition_worker(partition, stages, rx))
            })
            .collect();

        let ingress = Arc::new(Ingress {
            bus: event_bus,
            limiter: Arc::clone(&limiter),
            dlq: Arc::clone(&dlq),
            draining: AtomicBool::new(false),
        });

        info!(
            partitions = cfg.bus.partitions,
            bus_capacity = cfg.bus.capacity,
            max_concurrent_events = cfg.limits.max_concurrent_events,
            "pipeline started"
        );

        Pipeline {
            ingress,
            workers,
            limiter,
            max_events: cfg.limits.max_concurrent_events,
            dlq,
        }
    }

    pub fn ingress(&self) -> Arc<Ingress> {
        Arc::clone(&self.ingress)
    }

    pub fn dlq(&self) -> Arc<DeadLetterQueue> {
        Arc::clone(&self.dlq)
    }

    /// Drain and stop. New submissions are rejected immediately; in-flight
    /// events (buffered ones included, since they hold permits) run to
    /// their terminal state or until `grace` elapses. Returns whether the
    /// drain completed cleanly.
    pub async fn shutdown(self, grace: Duration) -> bool {
        self.ingress.begin_drain();
        info!("draining pipeline");

        let drained = tokio::time::timeout(
            grace,
            Arc::clone(&self.limiter).acquire_many_owned(self.max_events),
        )
        .await
        .is_ok();

        for worker in &self.workers {
            worker.abort();
        }

        if drained {
            info!("pipeline drained");
        } else {
            warn!(in_flight = metrics::IN_FLIGHT.get(), "drain grace expired with work in flight");
        }
        drained
    }
}

/// Consumes one bus partition. Scoring runs inline so events sharing an
/// event id keep their enqueue order; everything after scoring is spawned
/// per event.
async fn partition_worker(
    partition: usize,
    stages: Arc<Stages>,
    mut rx: mpsc::Receiver<BusMessage>,
) {
    while let Some(message) = rx.recv().await {
        metrics::BUS_DEPTH.dec();

        let retention = Duration::from_secs(stages.config.borrow().bus.retention_secs);
        if message.enqueued_at.elapsed() > retention {
            metrics::BUS_AGED_OUT.inc();
            metrics::IN_FLIGHT.dec();
            warn!(
                event_id = %message.event.event_id,
                partition,
                "dropping message past retention window"
            );
            continue;
        }

        let scored_at = Instant::now();
        match stages.scorer.score(&message.event).await {
            Ok(ml) => {
                metrics::observe_stage("score", scored_at.elapsed());
                let stages = Arc::clone(&stages);
                tokio::spawn(drive(
                    stages,
                    message.event,
                    ml,
                    message.ingress_at,
                    message.permit,
                ));
            }
            Err(err) => {
                metrics::observe_stage("score", scored_at.elapsed());
                let mut alert = Alert::new(message.event);
                alert.status = AlertStatus::DeadLettered;
                dead_letter(&stages, alert, "score", err.to_string()).await;
                metrics::IN_FLIGHT.dec();
            }
        }
    }
}

/// Carries one scored event to its terminal state.
async fn drive(
    stages: Arc<Stages>,
    event: Event,
    ml: MlVerdict,
    ingress_at: Instant,
    _permit: OwnedSemaphorePermit,
) {
    let triaged_at = Instant::now();
    let verdict = triage::triage(&event, &ml);
    metrics::observe_stage("triage", triaged_at.elapsed());

    let deadline = {
        let cfg = stages.config.borrow();
        ingress_at + Duration::from_millis(cfg.limits.event_deadline_ms)
    };
    let event_id = event.event_id.clone();

    let mut analysis_report = None;
    let mut remediation_record = None;
    let mut deadline_hit = false;

    // Deep analysis. Threshold and policy are read here, not at ingestion.
    if check_deadline(&event_id, deadline, &mut deadline_hit) {
        let (policy, warn_threshold) = {
            let cfg = stages.config.borrow();
            (cfg.triage.action_policy, cfg.triage.warn_threshold)
        };
        if analysis::should_fire(verdict.priority_score, warn_threshold, policy) {
            let started = Instant::now();
            analysis_report = Some(stages.analysis.analyze(&event, &ml, &verdict).await);
            metrics::observe_stage("analysis", started.elapsed());
        }
    }

    // Remediation. Same decision-time read, so a policy flip to
    // notify_only takes effect for events already in flight.
    if check_deadline(&event_id, deadline, &mut deadline_hit) {
        let (policy, remediate_threshold, rules) = {
            let cfg = stages.config.borrow();
            (
                cfg.triage.action_policy,
                cfg.triage.remediate_threshold,
                cfg.remediation.rules.clone(),
            )
        };
        if remediation::should_fire(verdict.priority_score, remediate_threshold, policy) {
            let started = Instant::now();
            remediation_record = Some(stages.remediation.remediate(&event, &rules).await);
            metrics::observe_stage("remediation", started.elapsed());
        }
    }

    let mut alert = Alert::new(event);
    alert.ml = Some(ml);
    alert.triage = Some(verdict);
    alert.analysis = analysis_report;
    alert.remediation = remediation_record;

    // A budget crossed during analysis or remediation still short-circuits
    // notification and forces STORED_ONLY below.
    let mut notified = false;
    if check_deadline(&event_id, deadline, &mut deadline_hit) {
        let warn_threshold = stages.config.borrow().triage.warn_threshold;
        if Notifier::should_fire(&alert, warn_threshold) {
            let started = Instant::now();
            notified = stages.notifier.notify(&alert).await;
            metrics::observe_stage("notify", started.elapsed());
        }
    }

    let remediated = alert
        .remediation
        .as_ref()
        .map(|r| r.outcome == RemediationOutcome::Succeeded)
        .unwrap_or(false);
    alert.status = if deadline_hit {
        AlertStatus::StoredOnly
    } else if remediated {
        AlertStatus::Remediated
    } else if notified {
        AlertStatus::Notified
    } else {
        AlertStatus::StoredOnly
    };

    let started = Instant::now();
    let stored = store_with_retry(&stages, alert.clone()).await;
    metrics::observe_stage("store", started.elapsed());
    if let Err(err) = stored {
        metrics::STORE_FAILURES.inc();
        error!(
            event_id = %alert.event.event_id,
            error = %err,
            "alert store unavailable, spooling to persistent dead-letter"
        );
        if let Err(spool_err) = stages.spool.spool(&alert) {
            error!(
                event_id = %alert.event.event_id,
                error = %spool_err,
                "failed to spool alert, enrichment lost"
            );
        }
    }

    metrics::EVENTS_COMPLETED
        .with_label_values(&[status_label(alert.status)])
        .inc();
    metrics::observe_stage("total", ingress_at.elapsed());
    metrics::IN_FLIGHT.dec();
}

/// Returns whether the analysis, remediation, and notify stages may still
/// run. Flips `deadline_hit` and counts the SLO violation the first time
/// the budget is exceeded; later calls stay short-circuited.
fn check_deadline(event_id: &str, deadline: Instant, deadline_hit: &mut bool) -> bool {
    if *deadline_hit {
        return false;
    }
    if Instant::now() >= deadline {
        *deadline_hit = true;
        metrics::SLO_VIOLATIONS.inc();
        warn!(event_id, "end-to-end budget exceeded, short-circuiting optional stages");
        return false;
    }
    true
}

/// Record a refused event and preserve whatever enrichment exists.
async fn dead_letter(stages: &Stages, alert: Alert, stage: &'static str, reason: String) {
    error!(event_id = %alert.event.event_id, stage, reason = %reason, "event dead-lettered");
    stages.dlq.push(DeadLetter {
        at: Utc::now(),
        stage: stage.to_string(),
        reason,
        alert: Some(alert.clone()),
        raw: None,
    });

    if store_with_retry(stages, alert.clone()).await.is_err() {
        metrics::STORE_FAILURES.inc();
        if let Err(err) = stages.spool.spool(&alert) {
            error!(
                event_id = %alert.event.event_id,
                error = %err,
                "failed to spool dead-lettered alert"
            );
        }
    }

    metrics::EVENTS_COMPLETED
        .with_label_values(&[status_label(AlertStatus::DeadLettered)])
        .inc();
}

async fn store_with_retry(stages: &Stages, alert: Alert) -> Result<(), StoreError> {
    let schedule = stages.store_schedule;
    let started = Instant::now();
    let mut last = StoreError::Unavailable("store budget exhausted".to_string());

    for attempt in 1..=schedule.max_attempts {
        let remaining = schedule.budget.saturating_sub(started.elapsed());
        if remaining.is_zero() {
            break;
        }
        match tokio::time::timeout(remaining, stages.store.put(alert.clone())).await {
            Ok(Ok(())) => return Ok(()),
            Ok(Err(err)) => last = err,
            Err(_) => last = StoreError::Unavailable("timeout".to_string()),
        }
        if let Some(delay) = schedule.delay_after(attempt) {
            metrics::ORACLE_RETRIES.with_label_values(&["store"]).inc();
            let capped = delay.min(schedule.budget.saturating_sub(started.elapsed()));
            tokio::time::sleep(capped).await;
        }
    }
    Err(last)
}

fn status_label(status: AlertStatus) -> &'static str {
    match status {
        AlertStatus::StoredOnly => "STORED_ONLY",
        AlertStatus::Notified => "NOTIFIED",
        AlertStatus::Remediated => "REMEDIATED",
        AlertStatus::DeadLettered => "DEAD_LETTERED",
    }
}
