//! Ingress adapter.
//!
//! External sources push raw findings through [`Ingress::submit`]. A
//! rejection is either retryable (`Backpressure`, `Draining`) or permanent
//! (`MalformedSource`); the caller owns the retry.

use crate::bus::{BusMessage, EventBus};
use crate::dlq::{DeadLetter, DeadLetterQueue};
use crate::metrics;
use crate::normalizer;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Semaphore;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum RejectReason {
    Backpressure,
    Draining,
    MalformedSource,
}

impl RejectReason {
    pub fn is_retryable(&self) -> bool {
        !matches!(self, RejectReason::MalformedSource)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitOutcome {
    pub accepted: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<RejectReason>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_id: Option<String>,
}

impl SubmitOutcome {
    fn accepted(event_id: String) -> Self {
        Self {
            accepted: true,
            reason: None,
            event_id: Some(event_id),
        }
    }

    fn rejected(reason: RejectReason) -> Self {
        Self {
            accepted: false,
            reason: Some(reason),
            event_id: None,
        }
    }
}

pub struct Ingress {
    pub(crate) bus: EventBus,
    pub(crate) limiter: Arc<Semaphore>,
    pub(crate) dlq: Arc<DeadLetterQueue>,
    pub(crate) draining: AtomicBool,
}

impl Ingress {
    /// Accept one raw finding. Normalizes, takes a concurrency permit, and
    /// buffers the event for scoring. Never blocks: saturation comes back
    /// as `Backpressure` for the caller to retry.
    pub fn submit(&self, source_tag: &str, raw: &Value) -> SubmitOutcome {
        if self.draining.load(Ordering::Relaxed) {
            metrics::EVENTS_REJECTED.with_label_values(&["Draining"]).inc();
            return SubmitOutcome::rejected(RejectReason::Draining);
        }

        let ingress_at = Instant::now();
        let event = match normalizer::normalize(source_tag, raw) {
            Ok(event) => event,
            Err(err) => {
                warn!(source = source_tag, error = %err, "rejecting malformed finding");
                metrics::EVENTS_REJECTED
                    .with_label_values(&["MalformedSource"])
                    .inc();
                self.dlq.push(DeadLetter {
                    at: Utc::now(),
                    stage: "normalize".to_string(),
                    reason: err.to_string(),
                    alert: None,
                    raw: Some(raw.clone()),
                });
                return SubmitOutcome::rejected(RejectReason::MalformedSource);
            }
        };
        metrics::observe_stage("normalize", ingress_at.elapsed());

        let permit = match self.limiter.clone().try_acquire_owned() {
            Ok(permit) => permit,
            Err(_) => {
                metrics::EVENTS_REJECTED
                    .with_label_values(&["Backpressure"])
                    .inc();
                return SubmitOutcome::rejected(RejectReason::Backpressure);
            }
        };

        let event_id = event.event_id.clone();
        let message = BusMessage {
            event,
            ingress_at,
            enqueued_at: Instant::now(),
            permit,
        };

        match self.bus.try_enqueue(message) {
            Ok(()) => {
                debug!(event_id = %event_id, source = source_tag, "event buffered");
                metrics::EVENTS_INGESTED.with_label_values(&[source_tag]).inc();
                metrics::IN_FLIGHT.inc();
                SubmitOutcome::accepted(event_id)
            }
            Err(_) => {
                metrics::EVENTS_REJECTED
                    .with_label_values(&["Backpressure"])
                    .inc();
                SubmitOutcome::rejected(RejectReason::Backpressure)
            }
        }
    }

    /// Stop accepting new work. In-flight events run to a terminal state.
    pub fn begin_drain(&self) {
        self.draining.store(true, Ordering::Relaxed);
    }

    pub fn is_draining(&self) -> bool {
        self.draining.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus;
    use serde_json::json;

    fn make_ingress(capacity: usize, permits: usize) -> (Ingress, Vec<tokio::sync::mpsc::Receiver<BusMessage>>) {
        let (event_bus, receivers) = bus::channel(1, capacity);
        let ingress = Ingress {
            bus: event_bus,
            limiter: Arc::new(Semaphore::new(permits)),
            dlq: Arc::new(DeadLetterQueue::new()),
            draining: AtomicBool::new(false),
        };
        (ingress, receivers)
    }

    fn finding(id: &str) -> Value {
        json!({
            "id": id,
            "time": "2024-06-01T12:00:00Z",
            "account": "123456789012",
            "region": "eu-central-1",
            "detail-type": "GuardDuty Finding",
            "detail": { "severity": 5.0 }
        })
    }

    #[tokio::test]
    async fn test_submit_accepted() {
        let (ingress, _receivers) = make_ingress(10, 10);
        let outcome = ingress.submit("aws.guardduty", &finding("evt-1"));
        assert!(outcome.accepted);
        assert_eq!(outcome.event_id.as_deref(), Some("evt-1"));
    }

    #[tokio::test]
    async fn test_malformed_goes_to_dlq() {
        let (ingress, _receivers) = make_ingress(10, 10);
        let outcome = ingress.submit("aws.guardduty", &json!({ "detail": {} }));
        assert!(!outcome.accepted);
        assert_eq!(outcome.reason, Some(RejectReason::MalformedSource));
        assert!(!outcome.reason.unwrap().is_retryable());
        assert_eq!(ingress.dlq.len(), 1);
    }

    #[tokio::test]
    async fn test_saturated_limiter_is_backpressure() {
        let (ingress, _receivers) = make_ingress(10, 1);
        assert!(ingress.submit("aws.guardduty", &finding("evt-1")).accepted);
        let outcome = ingress.submit("aws.guardduty", &finding("evt-2"));
        assert_eq!(outcome.reason, Some(RejectReason::Backpressure));
        assert!(outcome.reason.unwrap().is_retryable());
    }

    #[tokio::test]
    async fn test_full_bus_is_backpressure_and_releases_permit() {
        let (ingress, _receivers) = make_ingress(1, 8);
        assert!(ingress.submit("aws.guardduty", &finding("evt-1")).accepted);
        let outcome = ingress.submit("aws.guardduty", &finding("evt-2"));
        assert_eq!(outcome.reason, Some(RejectReason::Backpressure));
        // The rejected submission must not leak its permit.
        assert_eq!(ingress.limiter.available_permits(), 7);
    }

    #[tokio::test]
    async fn test_draining_rejects() {
        let (ingress, _receivers) = make_ingress(10, 10);
        ingress.begin_drain();
        let outcome = ingress.submit("aws.guardduty", &finding("evt-1"));
        assert_eq!(outcome.reason, Some(RejectReason::Draining));
    }

    #[test]
    fn test_reject_reason_wire_strings() {
        assert_eq!(
            serde_json::to_string(&RejectReason::Backpressure).unwrap(),
            "\"Backpressure\""
        );
        assert_eq!(
            serde_json::to_string(&RejectReason::MalformedSource).unwrap(),
            "\"MalformedSource\""
        );
    }
}
