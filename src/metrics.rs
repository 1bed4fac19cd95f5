//! Prometheus metrics and stage latency tracking.

use once_cell::sync::Lazy;
use prometheus::{
    HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
    TextEncoder,
};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

pub static REGISTRY: Lazy<Registry> = Lazy::new(Registry::new);

pub static EVENTS_INGESTED: Lazy<IntCounterVec> = Lazy::new(|| {
    let opts = Opts::new("vigil_events_ingested_total", "Events accepted at ingress by source");
    let counter = IntCounterVec::new(opts, &["source"]).unwrap();
    REGISTRY.register(Box::new(counter.clone())).unwrap();
    counter
});

pub static EVENTS_COMPLETED: Lazy<IntCounterVec> = Lazy::new(|| {
    let opts = Opts::new("vigil_events_completed_total", "Events reaching a terminal state by status");
    let counter = IntCounterVec::new(opts, &["status"]).unwrap();
    REGISTRY.register(Box::new(counter.clone())).unwrap();
    counter
});

pub static EVENTS_REJECTED: Lazy<IntCounterVec> = Lazy::new(|| {
    let opts = Opts::new("vigil_events_rejected_total", "Submissions rejected at ingress by reason");
    let counter = IntCounterVec::new(opts, &["reason"]).unwrap();
    REGISTRY.register(Box::new(counter.clone())).unwrap();
    counter
});

pub static DEAD_LETTERED: Lazy<IntCounter> = Lazy::new(|| {
    let counter = IntCounter::new("vigil_dead_lettered_total", "Events routed to the dead-letter queue").unwrap();
    REGISTRY.register(Box::new(counter.clone())).unwrap();
    counter
});

pub static BUS_AGED_OUT: Lazy<IntCounter> = Lazy::new(|| {
    let counter = IntCounter::new("vigil_bus_aged_out_total", "Bus messages dropped past the retention window").unwrap();
    REGISTRY.register(Box::new(counter.clone())).unwrap();
    counter
});

pub static SEVERITY_DEFAULTED: Lazy<IntCounter> = Lazy::new(|| {
    let counter = IntCounter::new("vigil_severity_defaulted_total", "Findings normalized with a defaulted severity band").unwrap();
    REGISTRY.register(Box::new(counter.clone())).unwrap();
    counter
});

pub static ORACLE_RETRIES: Lazy<IntCounterVec> = Lazy::new(|| {
    let opts = Opts::new("vigil_oracle_retries_total", "Oracle call retries by oracle");
    let counter = IntCounterVec::new(opts, &["oracle"]).unwrap();
    REGISTRY.register(Box::new(counter.clone())).unwrap();
    counter
});

pub static ORACLE_EXHAUSTED: Lazy<IntCounterVec> = Lazy::new(|| {
    let opts = Opts::new("vigil_oracle_exhausted_total", "Oracle calls degraded after retry exhaustion");
    let counter = IntCounterVec::new(opts, &["oracle"]).unwrap();
    REGISTRY.register(Box::new(counter.clone())).unwrap();
    counter
});

pub static REMEDIATIONS: Lazy<IntCounterVec> = Lazy::new(|| {
    let opts = Opts::new("vigil_remediations_total", "Remediation gate results by outcome");
    let counter = IntCounterVec::new(opts, &["outcome"]).unwrap();
    REGISTRY.register(Box::new(counter.clone())).unwrap();
    counter
});

pub static NOTIFICATIONS_SENT: Lazy<IntCounter> = Lazy::new(|| {
    let counter = IntCounter::new("vigil_notifications_sent_total", "Notifications published").unwrap();
    REGISTRY.register(Box::new(counter.clone())).unwrap();
    counter
});

pub static NOTIFICATIONS_SUPPRESSED: Lazy<IntCounter> = Lazy::new(|| {
    let counter = IntCounter::new("vigil_notifications_suppressed_total", "Notifications suppressed by dedup").unwrap();
    REGISTRY.register(Box::new(counter.clone())).unwrap();
    counter
});

pub static SLO_VIOLATIONS: Lazy<IntCounter> = Lazy::new(|| {
    let counter = IntCounter::new("vigil_slo_violations_total", "Events exceeding the end-to-end deadline").unwrap();
    REGISTRY.register(Box::new(counter.clone())).unwrap();
    counter
});

pub static STORE_FAILURES: Lazy<IntCounter> = Lazy::new(|| {
    let counter = IntCounter::new("vigil_store_failures_total", "Alert store writes spooled after retry exhaustion").unwrap();
    REGISTRY.register(Box::new(counter.clone())).unwrap();
    counter
});

pub static IN_FLIGHT: Lazy<IntGauge> = Lazy::new(|| {
    let gauge = IntGauge::new("vigil_in_flight_events", "Events currently owned by orchestrator tasks").unwrap();
    REGISTRY.register(Box::new(gauge.clone())).unwrap();
    gauge
});

pub static BUS_DEPTH: Lazy<IntGauge> = Lazy::new(|| {
    let gauge = IntGauge::new("vigil_bus_depth", "Messages buffered in the event bus").unwrap();
    REGISTRY.register(Box::new(gauge.clone())).unwrap();
    gauge
});

pub static DLQ_DEPTH: Lazy<IntGauge> = Lazy::new(|| {
    let gauge = IntGauge::new("vigil_dlq_depth", "Entries held in the in-memory dead-letter queue").unwrap();
    REGISTRY.register(Box::new(gauge.clone())).unwrap();
    gauge
});

pub static STAGE_LATENCY: Lazy<HistogramVec> = Lazy::new(|| {
    let opts = HistogramOpts::new("vigil_stage_latency_seconds", "Stage latency by stage").buckets(vec![
        0.001, 0.005, 0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 15.0, 30.0, 60.0,
    ]);
    let histogram = HistogramVec::new(opts, &["stage"]).unwrap();
    REGISTRY.register(Box::new(histogram.clone())).unwrap();
    histogram
});

/// Render the registry in the Prometheus text format.
pub fn gather() -> String {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    encoder.encode_to_string(&metric_families).unwrap_or_default()
}

/// Record a stage latency sample in both the histogram and the quantile
/// tracker backing the health surface.
pub fn observe_stage(stage: &'static str, elapsed: Duration) {
    let secs = elapsed.as_secs_f64();
    STAGE_LATENCY.with_label_values(&[stage]).observe(secs);
    LATENCIES.record(stage, secs);
}

const LATENCY_SAMPLE_CAP: usize = 1_024;

/// Bounded per-stage sample reservoir. The health endpoint reports p50,
/// p95, and p99 over the most recent samples.
pub struct LatencyTracker {
    samples: Mutex<HashMap<&'static str, VecDeque<f64>>>,
}

#[derive(Debug, Clone, Copy, serde::Serialize)]
pub struct StagePercentiles {
    pub p50: f64,
    pub p95: f64,
    pub p99: f64,
}

pub static LATENCIES: Lazy<LatencyTracker> = Lazy::new(LatencyTracker::new);

impl LatencyTracker {
    fn new() -> Self {
        Self {
            samples: Mutex::new(HashMap::new()),
        }
    }

    pub fn record(&self, stage: &'static str, secs: f64) {
        let mut samples = match self.samples.lock() {
            Ok(guard) => guard,
            Err(_) => return,
        };
        let window = samples.entry(stage).or_default();
        if window.len() >= LATENCY_SAMPLE_CAP {
            window.pop_front();
        }
        window.push_back(secs);
    }

    pub fn percentiles(&self) -> BTreeMap<String, StagePercentiles> {
        let samples = match self.samples.lock() {
            Ok(guard) => guard,
            Err(_) => return BTreeMap::new(),
        };
        let mut out = BTreeMap::new();
        for (stage, window) in samples.iter() {
            if window.is_empty() {
                continue;
            }
            let mut sorted: Vec<f64> = window.iter().copied().collect();
            sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
            out.insert(
                stage.to_string(),
                StagePercentiles {
                    p50: quantile(&sorted, 0.50),
                    p95: quantile(&sorted, 0.95),
                    p99: quantile(&sorted, 0.99),
                },
            );
        }
        out
    }
}

fn quantile(sorted: &[f64], q: f64) -> f64 {
    let idx = ((sorted.len() - 1) as f64 * q).round() as usize;
    sorted[idx.min(sorted.len() - 1)]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quantile_small_sample() {
        let sorted = vec![1.0, 2.0, 3.0, 4.0];
        assert_eq!(quantile(&sorted, 0.50), 3.0);
        assert_eq!(quantile(&sorted, 0.99), 4.0);
    }

    #[test]
    fn test_tracker_bounded() {
        let tracker = LatencyTracker::new();
        for i in 0..(LATENCY_SAMPLE_CAP + 100) {
            tracker.record("score", i as f64);
        }
        let samples = tracker.samples.lock().unwrap();
        assert_eq!(samples.get("score").unwrap().len(), LATENCY_SAMPLE_CAP);
    }

    #[test]
    fn test_tracker_percentiles() {
        let tracker = LatencyTracker::new();
        for i in 1..=100 {
            tracker.record("store", i as f64 / 1000.0);
        }
        let pcts = tracker.percentiles();
        let store = pcts.get("store").unwrap();
        assert!(store.p50 < store.p95);
        assert!(store.p95 <= store.p99);
    }
}
