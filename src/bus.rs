//! Partitioned event bus between normalization and scoring.
//!
//! Events hash to a partition by event id, each partition is a bounded
//! FIFO channel with a single consumer, so messages sharing an event id
//! are scored in enqueue order. Nothing is promised across partitions.
//! A full partition is backpressure, surfaced to the ingress caller.

use crate::error::EnqueueError;
use crate::event::Event;
use crate::metrics;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::time::Instant;
use tokio::sync::mpsc;
use tokio::sync::OwnedSemaphorePermit;

/// One unit of buffered work. The permit bounds total in-flight events;
/// it travels with the event until a terminal state drops it.
pub struct BusMessage {
    pub event: Event,
    /// When ingress accepted the submission. Starts the end-to-end budget.
    pub ingress_at: Instant,
    pub enqueued_at: Instant,
    pub permit: OwnedSemaphorePermit,
}

/// Sender half, shared by ingress adapters.
#[derive(Clone)]
pub struct EventBus {
    senders: Vec<mpsc::Sender<BusMessage>>,
}

/// Build a bus with `partitions` consumers sharing `capacity` total slots.
pub fn channel(partitions: usize, capacity: usize) -> (EventBus, Vec<mpsc::Receiver<BusMessage>>) {
    let partitions = partitions.max(1);
    let per_partition = (capacity / partitions).max(1);

    let mut senders = Vec::with_capacity(partitions);
    let mut receivers = Vec::with_capacity(partitions);
    for _ in 0..partitions {
        let (tx, rx) = mpsc::channel(per_partition);
        senders.push(tx);
        receivers.push(rx);
    }

    (EventBus { senders }, receivers)
}

impl EventBus {
    pub fn partitions(&self) -> usize {
        self.senders.len()
    }

    pub fn partition_for(&self, event_id: &str) -> usize {
        let mut hasher = DefaultHasher::new();
        event_id.hash(&mut hasher);
        (hasher.finish() as usize) % self.senders.len()
    }

    /// Non-blocking enqueue. A full partition queue is backpressure.
    pub fn try_enqueue(&self, message: BusMessage) -> Result<(), EnqueueError> {
        let idx = self.partition_for(&message.event.event_id);
        match self.senders[idx].try_send(message) {
            Ok(()) => {
                metrics::BUS_DEPTH.inc();
                Ok(())
            }
            Err(mpsc::error::TrySendError::Full(_)) => Err(EnqueueError::Backpressure),
            Err(mpsc::error::TrySendError::Closed(_)) => Err(EnqueueError::Closed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{SeverityBand, SourceKind};
    use chrono::Utc;
    use serde_json::json;
    use std::sync::Arc;
    use tokio::sync::Semaphore;

    fn make_event(id: &str) -> Event {
        Event {
            event_id: id.to_string(),
            observed_at: Utc::now(),
            ingested_at: Utc::now(),
            source: SourceKind::GuardDuty,
            account: "123456789012".to_string(),
            region: "eu-central-1".to_string(),
            kind: "Recon".to_string(),
            severity_band: SeverityBand::Medium,
            raw: json!({}),
        }
    }

    fn make_message(id: &str, limiter: &Arc<Semaphore>) -> BusMessage {
        BusMessage {
            event: make_event(id),
            ingress_at: Instant::now(),
            enqueued_at: Instant::now(),
            permit: limiter.clone().try_acquire_owned().unwrap(),
        }
    }

    #[tokio::test]
    async fn test_same_key_same_partition() {
        let (bus, _receivers) = channel(4, 100);
        let p1 = bus.partition_for("evt-abc");
        let p2 = bus.partition_for("evt-abc");
        assert_eq!(p1, p2);
    }

    #[tokio::test]
    async fn test_enqueue_order_preserved_per_key() {
        let limiter = Arc::new(Semaphore::new(16));
        let (bus, mut receivers) = channel(2, 16);

        for i in 0..3 {
            let mut message = make_message("evt-ordered", &limiter);
            message.event.raw = json!({ "seq": i });
            bus.try_enqueue(message).unwrap();
        }

        let idx = bus.partition_for("evt-ordered");
        for expected in 0..3 {
            let message = receivers[idx].recv().await.unwrap();
            assert_eq!(message.event.raw["seq"], json!(expected));
        }
    }

    #[tokio::test]
    async fn test_full_partition_is_backpressure() {
        let limiter = Arc::new(Semaphore::new(16));
        let (bus, _receivers) = channel(1, 2);

        bus.try_enqueue(make_message("evt-1", &limiter)).unwrap();
        bus.try_enqueue(make_message("evt-2", &limiter)).unwrap();
        assert_eq!(
            bus.try_enqueue(make_message("evt-3", &limiter)).unwrap_err(),
            EnqueueError::Backpressure
        );
    }

    #[tokio::test]
    async fn test_closed_partition_reports_closed() {
        let limiter = Arc::new(Semaphore::new(16));
        let (bus, receivers) = channel(1, 2);
        drop(receivers);
        assert_eq!(
            bus.try_enqueue(make_message("evt-1", &limiter)).unwrap_err(),
            EnqueueError::Closed
        );
    }
}
