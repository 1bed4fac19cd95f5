//! Remediation gate.
//!
//! Fires only for priorities strictly above the remediate threshold under
//! the `full` action policy, and the policy is read at decision time. The
//! action comes from the operator's rule table; an unmapped finding is
//! recorded as skipped, never remediated with a guessed action.

use crate::config::{ActionPolicy, RemediationRule};
use crate::error::EffectorError;
use crate::event::{Event, RemediationAction, RemediationOutcome, RemediationRecord};
use crate::metrics;
use async_trait::async_trait;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tracing::{info, warn};

const ATTEMPTS: u32 = 2;

/// What the effector is asked to do. The effector contract requires
/// idempotency keyed on `(event_id, action)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActionRequest {
    pub event_id: String,
    pub action: RemediationAction,
    pub account: String,
    pub region: String,
    pub kind: String,
}

/// The external actuator seam.
#[async_trait]
pub trait Effector: Send + Sync {
    async fn execute(&self, request: &ActionRequest) -> Result<(), EffectorError>;
}

/// Should the gate fire for this priority under the current policy?
/// Strict inequality, same as the analysis gate.
pub fn should_fire(priority_score: f64, remediate_threshold: u32, policy: ActionPolicy) -> bool {
    policy == ActionPolicy::Full && priority_score > f64::from(remediate_threshold)
}

/// First matching rule wins; no match means no action.
pub fn select_action(rules: &[RemediationRule], event: &Event) -> RemediationAction {
    rules
        .iter()
        .find(|rule| rule.source == event.source.as_str() && event.kind.contains(&rule.kind_token))
        .map(|rule| rule.action)
        .unwrap_or(RemediationAction::None)
}

pub struct RemediationGate {
    effector: Arc<dyn Effector>,
    timeout: Duration,
    permits: Arc<Semaphore>,
}

impl RemediationGate {
    pub fn new(effector: Arc<dyn Effector>, timeout: Duration, concurrency: usize) -> Self {
        Self {
            effector,
            timeout,
            permits: Arc::new(Semaphore::new(concurrency)),
        }
    }

    /// Run the selected action through the effector, one retry on failure.
    /// Failure is recorded, never propagated: the alert still gets stored
    /// and the notifier fires on a failed outcome.
    pub async fn remediate(&self, event: &Event, rules: &[RemediationRule]) -> RemediationRecord {
        let action = select_action(rules, event);
        if action == RemediationAction::None {
            metrics::REMEDIATIONS.with_label_values(&["skipped"]).inc();
            return RemediationRecord {
                attempted: false,
                action_kind: RemediationAction::None.as_str().to_string(),
                outcome: RemediationOutcome::Skipped,
                error: None,
                attempted_at: Utc::now(),
            };
        }

        let request = ActionRequest {
            event_id: event.event_id.clone(),
            action,
            account: event.account.clone(),
            region: event.region.clone(),
            kind: event.kind.clone(),
        };

        let mut last_error = String::from("unavailable");
        for attempt in 1..=ATTEMPTS {
            let _permit = match self.permits.acquire().await {
                Ok(permit) => permit,
                Err(_) => break,
            };

            match tokio::time::timeout(self.timeout, self.effector.execute(&request)).await {
                Ok(Ok(())) => {
                    info!(
                        event_id = %event.event_id,
                        action = action.as_str(),
                        "remediation succeeded"
                    );
                    metrics::REMEDIATIONS.with_label_values(&["succeeded"]).inc();
                    return RemediationRecord {
                        attempted: true,
                        action_kind: action.as_str().to_string(),
                        outcome: RemediationOutcome::Succeeded,
                        error: None,
                        attempted_at: Utc::now(),
                    };
                }
                Ok(Err(err)) => {
                    warn!(
                        event_id = %event.event_id,
                        action = action.as_str(),
                        attempt,
                        error = %err,
                        "effector call failed"
                    );
                    last_error = err.to_string();
                }
                Err(_) => {
                    warn!(
                        event_id = %event.event_id,
                        action = action.as_str(),
                        attempt,
                        "effector call timed out"
                    );
                    last_error = "timeout".to_string();
                }
            }
        }

        metrics::REMEDIATIONS.with_label_values(&["failed"]).inc();
        RemediationRecord {
            attempted: true,
            action_kind: action.as_str().to_string(),
            outcome: RemediationOutcome::Failed,
            error: Some(last_error),
            attempted_at: Utc::now(),
        }
    }
}

/// Effector that records what it would have done. Stands in when no real
/// actuator is wired up.
#[derive(Debug, Default)]
pub struct LoggingEffector;

#[async_trait]
impl Effector for LoggingEffector {
    async fn execute(&self, request: &ActionRequest) -> Result<(), EffectorError> {
        info!(
            event_id = %request.event_id,
            action = request.action.as_str(),
            account = %request.account,
            region = %request.region,
            "logging effector invoked"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{SeverityBand, SourceKind};
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn make_event(kind: &str) -> Event {
        Event {
            event_id: "evt-1".to_string(),
            observed_at: Utc::now(),
            ingested_at: Utc::now(),
            source: SourceKind::GuardDuty,
            account: "123456789012".to_string(),
            region: "eu-central-1".to_string(),
            kind: kind.to_string(),
            severity_band: SeverityBand::Critical,
            raw: json!({}),
        }
    }

    fn rules() -> Vec<RemediationRule> {
        vec![
            RemediationRule {
                source: "aws.guardduty".to_string(),
                kind_token: "UnauthorizedAccess".to_string(),
                action: RemediationAction::DisableCredential,
            },
            RemediationRule {
                source: "aws.guardduty".to_string(),
                kind_token: "Recon".to_string(),
                action: RemediationAction::RevokeNetworkIngress,
            },
        ]
    }

    #[test]
    fn test_gate_is_strict_and_policy_bound() {
        assert!(!should_fire(90.0, 90, ActionPolicy::Full));
        assert!(should_fire(90.1, 90, ActionPolicy::Full));
        assert!(!should_fire(100.0, 90, ActionPolicy::NotifyOnly));
        assert!(!should_fire(100.0, 90, ActionPolicy::Off));
    }

    #[test]
    fn test_select_action_first_match_wins() {
        let event = make_event("UnauthorizedAccess:IAMUser/MaliciousIPCaller");
        assert_eq!(
            select_action(&rules(), &event),
            RemediationAction::DisableCredential
        );

        let event = make_event("Recon:EC2/PortProbeUnprotectedPort");
        assert_eq!(
            select_action(&rules(), &event),
            RemediationAction::RevokeNetworkIngress
        );
    }

    #[test]
    fn test_select_action_unmapped_is_none() {
        let event = make_event("CryptoCurrency:EC2/BitcoinTool.B");
        assert_eq!(select_action(&rules(), &event), RemediationAction::None);
        assert_eq!(select_action(&[], &event), RemediationAction::None);
    }

    #[test]
    fn test_select_action_respects_source() {
        let mut event = make_event("UnauthorizedAccess:IAMUser/X");
        event.source = SourceKind::SecurityHub;
        assert_eq!(select_action(&rules(), &event), RemediationAction::None);
    }

    struct CountingEffector {
        calls: AtomicU32,
        fail: bool,
    }

    #[async_trait]
    impl Effector for CountingEffector {
        async fn execute(&self, request: &ActionRequest) -> Result<(), EffectorError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                Err(EffectorError {
                    action: request.action.as_str().to_string(),
                    message: "iam:AccessDenied".to_string(),
                })
            } else {
                Ok(())
            }
        }
    }

    #[tokio::test]
    async fn test_unmapped_kind_records_skipped() {
        let effector = Arc::new(CountingEffector {
            calls: AtomicU32::new(0),
            fail: false,
        });
        let gate = RemediationGate::new(effector.clone(), Duration::from_secs(1), 4);
        let record = gate.remediate(&make_event("Backdoor:EC2/C2"), &rules()).await;
        assert!(!record.attempted);
        assert_eq!(record.outcome, RemediationOutcome::Skipped);
        assert_eq!(record.action_kind, "NONE");
        assert_eq!(effector.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_success_records_succeeded() {
        let effector = Arc::new(CountingEffector {
            calls: AtomicU32::new(0),
            fail: false,
        });
        let gate = RemediationGate::new(effector.clone(), Duration::from_secs(1), 4);
        let record = gate
            .remediate(&make_event("UnauthorizedAccess:IAMUser/X"), &rules())
            .await;
        assert!(record.attempted);
        assert_eq!(record.outcome, RemediationOutcome::Succeeded);
        assert_eq!(record.action_kind, "DISABLE_CREDENTIAL");
        assert_eq!(effector.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_failure_retries_once_then_records_failed() {
        let effector = Arc::new(CountingEffector {
            calls: AtomicU32::new(0),
            fail: true,
        });
        let gate = RemediationGate::new(effector.clone(), Duration::from_secs(1), 4);
        let record = gate
            .remediate(&make_event("UnauthorizedAccess:IAMUser/X"), &rules())
            .await;
        assert!(record.attempted);
        assert_eq!(record.outcome, RemediationOutcome::Failed);
        assert!(record.error.as_deref().unwrap().contains("AccessDenied"));
        assert_eq!(effector.calls.load(Ordering::SeqCst), 2);
    }
}
