//! Operator notification.
//!
//! Fires for alerts triaged strictly above the warn threshold, and for any
//! alert whose remediation failed. Publishing is best-effort through the
//! [`AlertPublisher`] seam; duplicates inside the dedup window are
//! suppressed.

use crate::dedup::NotifyDeduplicator;
use crate::error::PublishError;
use crate::event::{Alert, RemediationOutcome, SeverityBand};
use crate::metrics;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::warn;

/// The message handed to subscribers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertNotification {
    pub event_id: String,
    pub priority_band: SeverityBand,
    pub priority_score: f64,
    pub threat_score: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub risk_score: Option<f64>,
    pub summary: String,
    /// Lookup key for the stored alert: `<event_id>@<observed_at>`.
    pub store_key: String,
}

#[async_trait]
pub trait AlertPublisher: Send + Sync {
    async fn publish(&self, notification: &AlertNotification) -> Result<(), PublishError>;
}

/// Publisher that emits the notification as a structured log line.
#[derive(Debug, Default)]
pub struct LogPublisher;

#[async_trait]
impl AlertPublisher for LogPublisher {
    async fn publish(&self, notification: &AlertNotification) -> Result<(), PublishError> {
        warn!(
            event_id = %notification.event_id,
            priority_band = notification.priority_band.as_str(),
            priority_score = notification.priority_score,
            threat_score = notification.threat_score,
            risk_score = notification.risk_score,
            store_key = %notification.store_key,
            "{}",
            notification.summary
        );
        Ok(())
    }
}

/// Publisher that POSTs the notification to a webhook.
#[cfg(feature = "webhooks")]
pub struct WebhookPublisher {
    url: String,
    client: reqwest::Client,
}

#[cfg(feature = "webhooks")]
impl WebhookPublisher {
    pub fn new(url: String) -> Self {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(10))
            .build()
            .unwrap_or_default();
        Self { url, client }
    }
}

#[cfg(feature = "webhooks")]
#[async_trait]
impl AlertPublisher for WebhookPublisher {
    async fn publish(&self, notification: &AlertNotification) -> Result<(), PublishError> {
        let response = self
            .client
            .post(&self.url)
            .json(notification)
            .send()
            .await
            .map_err(|e| PublishError(e.to_string()))?;
        if !response.status().is_success() {
            return Err(PublishError(format!(
                "webhook returned status {}",
                response.status()
            )));
        }
        Ok(())
    }
}

pub struct Notifier {
    publisher: Arc<dyn AlertPublisher>,
    dedup: NotifyDeduplicator,
}

impl Notifier {
    pub fn new(publisher: Arc<dyn AlertPublisher>, dedup_window_ms: u64, dedup_capacity: usize) -> Self {
        Self {
            publisher,
            dedup: NotifyDeduplicator::new(dedup_window_ms, dedup_capacity),
        }
    }

    /// Notify when the priority is strictly above the warn threshold, or
    /// when remediation was attempted and failed.
    pub fn should_fire(alert: &Alert, warn_threshold: u32) -> bool {
        let above_warn = alert
            .triage
            .as_ref()
            .map(|t| t.priority_score > f64::from(warn_threshold))
            .unwrap_or(false);
        let remediation_failed = alert
            .remediation
            .as_ref()
            .map(|r| r.outcome == RemediationOutcome::Failed)
            .unwrap_or(false);
        above_warn || remediation_failed
    }

    /// Publish a notification for the alert. Returns true when the alert
    /// logically notified, whether or not the duplicate-suppressed publish
    /// actually went out.
    pub async fn notify(&self, alert: &Alert) -> bool {
        let notification = build_notification(alert);

        if !self.dedup.should_notify(&notification.event_id) {
            metrics::NOTIFICATIONS_SUPPRESSED.inc();
            return true;
        }

        match self.publisher.publish(&notification).await {
            Ok(()) => {
                metrics::NOTIFICATIONS_SENT.inc();
            }
            Err(err) => {
                warn!(
                    event_id = %notification.event_id,
                    error = %err,
                    "notification publish failed"
                );
            }
        }
        true
    }
}

fn build_notification(alert: &Alert) -> AlertNotification {
    let (priority_score, priority_band) = alert
        .triage
        .as_ref()
        .map(|t| (t.priority_score, t.priority_band))
        .unwrap_or((0.0, SeverityBand::Low));
    let threat_score = alert.ml.as_ref().map(|m| m.threat_score).unwrap_or(0.0);
    let risk_score = alert.analysis.as_ref().map(|a| a.risk_score);

    AlertNotification {
        event_id: alert.event.event_id.clone(),
        priority_band,
        priority_score,
        threat_score,
        risk_score,
        summary: summary_line(alert, priority_band, priority_score),
        store_key: format!(
            "{}@{}",
            alert.event.event_id,
            alert.event.observed_at.to_rfc3339()
        ),
    }
}

fn summary_line(alert: &Alert, band: SeverityBand, priority: f64) -> String {
    let remediation = match alert.remediation.as_ref().map(|r| r.outcome) {
        Some(RemediationOutcome::Succeeded) => ", remediated",
        Some(RemediationOutcome::Failed) => ", REMEDIATION FAILED",
        _ => "",
    };
    format!(
        "{} {} in {}/{} (priority {:.1}{})",
        band.as_str(),
        alert.event.kind,
        alert.event.account,
        alert.event.region,
        priority,
        remediation
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{
        Event, MlVerdict, RemediationRecord, SourceKind, TriageVerdict,
    };
    use chrono::Utc;
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn make_alert(priority: f64) -> Alert {
        let event = Event {
            event_id: "evt-1".to_string(),
            observed_at: Utc::now(),
            ingested_at: Utc::now(),
            source: SourceKind::GuardDuty,
            account: "123456789012".to_string(),
            region: "eu-central-1".to_string(),
            kind: "Recon:EC2/PortProbe".to_string(),
            severity_band: SeverityBand::High,
            raw: json!({}),
        };
        let mut alert = Alert::new(event);
        alert.ml = Some(MlVerdict {
            threat_score: 60.0,
            confidence: 0.8,
            model_version: "test".to_string(),
            scored_at: Utc::now(),
            error: None,
        });
        alert.triage = Some(TriageVerdict {
            priority_score: priority,
            priority_band: crate::triage::priority_band(priority),
            recommended_actions: vec![],
            triaged_at: Utc::now(),
        });
        alert
    }

    #[test]
    fn test_should_fire_strictly_above_warn() {
        assert!(!Notifier::should_fire(&make_alert(70.0), 70));
        assert!(Notifier::should_fire(&make_alert(70.5), 70));
        assert!(!Notifier::should_fire(&make_alert(10.0), 70));
    }

    #[test]
    fn test_failed_remediation_always_fires() {
        let mut alert = make_alert(10.0);
        alert.remediation = Some(RemediationRecord {
            attempted: true,
            action_kind: "DISABLE_CREDENTIAL".to_string(),
            outcome: RemediationOutcome::Failed,
            error: Some("iam:AccessDenied".to_string()),
            attempted_at: Utc::now(),
        });
        assert!(Notifier::should_fire(&alert, 70));
    }

    #[test]
    fn test_notification_carries_scores_and_key() {
        let mut alert = make_alert(84.5);
        alert.analysis = Some(crate::event::RiskReport {
            risk_score: 7.5,
            attack_vector: "recon".to_string(),
            recommended_actions: vec![],
            business_impact: String::new(),
            confidence: 0.9,
            analyzed_at: Utc::now(),
            error: None,
        });
        let notification = build_notification(&alert);
        assert_eq!(notification.priority_score, 84.5);
        assert_eq!(notification.threat_score, 60.0);
        assert_eq!(notification.risk_score, Some(7.5));
        assert!(notification.store_key.starts_with("evt-1@"));
        assert!(notification.summary.contains("Recon:EC2/PortProbe"));
    }

    struct CountingPublisher {
        calls: AtomicU32,
    }

    #[async_trait]
    impl AlertPublisher for CountingPublisher {
        async fn publish(&self, _: &AlertNotification) -> Result<(), PublishError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_duplicate_suppressed_within_window() {
        let publisher = Arc::new(CountingPublisher {
            calls: AtomicU32::new(0),
        });
        let notifier = Notifier::new(publisher.clone(), 300_000, 100);
        let alert = make_alert(95.0);

        assert!(notifier.notify(&alert).await);
        assert!(notifier.notify(&alert).await);
        assert_eq!(publisher.calls.load(Ordering::SeqCst), 1);
    }
}
