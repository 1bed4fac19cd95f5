//! Scriptable doubles for the pipeline's external collaborators.

#![allow(dead_code)]

use async_trait::async_trait;
use serde_json::{json, Value};
use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use vigil::config::Config;
use vigil::error::{AnalysisError, EffectorError, MlError, PublishError, StoreError};
use vigil::event::{Alert, AlertKey, Event, RemediationAction};
use vigil::notify::{AlertNotification, AlertPublisher};
use vigil::remediation::{ActionRequest, Effector};
use vigil::scorer::{Feature, MlClient, MlScore};
use vigil::store::{AlertStore, MemoryStore};

/// A config sized for fast tests: millisecond retry schedules, two bus
/// partitions, and a remediation rule for unauthorized-access findings.
pub fn test_config(data_dir: &Path) -> Config {
    let mut config = Config::default();
    config.general.data_dir = data_dir.to_path_buf();
    config.bus.partitions = 2;
    config.ml.initial_backoff_ms = 5;
    config.ml.budget_ms = 300;
    config.analysis.timeout_ms = 1_000;
    config.remediation.effector_timeout_ms = 1_000;
    config.store.budget_ms = 200;
    config.remediation.rules = vec![vigil::config::RemediationRule {
        source: "aws.guardduty".to_string(),
        kind_token: "UnauthorizedAccess".to_string(),
        action: RemediationAction::DisableCredential,
    }];
    config
}

pub fn guardduty_finding(id: &str, severity: f64, kind: &str) -> Value {
    json!({
        "id": id,
        "time": "2024-06-01T12:00:00Z",
        "account": "123456789012",
        "region": "eu-central-1",
        "detail-type": kind,
        "detail": { "severity": severity, "type": kind }
    })
}

pub fn securityhub_finding(id: &str, normalized: f64, kind: &str) -> Value {
    json!({
        "id": id,
        "time": "2024-06-01T12:00:00Z",
        "account": "123456789012",
        "region": "eu-central-1",
        "detail-type": kind,
        "detail": { "Severity": { "Normalized": normalized } }
    })
}

/// Poll until the condition holds or the timeout elapses.
pub async fn wait_for(mut cond: impl FnMut() -> bool, timeout: Duration) -> bool {
    let start = std::time::Instant::now();
    while start.elapsed() < timeout {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}

/// Fetch a stored alert by event id once it appears.
pub async fn wait_for_alert(store: &MemoryStore, event_id: &str, timeout: Duration) -> Option<Alert> {
    let start = std::time::Instant::now();
    loop {
        if let Some(alert) = store
            .snapshot()
            .into_iter()
            .find(|a| a.event.event_id == event_id)
        {
            return Some(alert);
        }
        if start.elapsed() > timeout {
            return None;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MlBehavior {
    Succeed,
    AlwaysTransient,
    AlwaysPermanent,
}

/// Model oracle double. Records the `api_call_count` feature of every call
/// in arrival order so tests can assert per-partition ordering.
pub struct ScriptedMl {
    pub threat_score: f64,
    pub confidence: f64,
    pub behavior: MlBehavior,
    pub delay: Duration,
    pub calls: AtomicU32,
    pub seen: Mutex<Vec<f64>>,
}

impl ScriptedMl {
    pub fn returning(threat_score: f64, confidence: f64) -> Self {
        Self {
            threat_score,
            confidence,
            behavior: MlBehavior::Succeed,
            delay: Duration::ZERO,
            calls: AtomicU32::new(0),
            seen: Mutex::new(Vec::new()),
        }
    }

    pub fn failing(behavior: MlBehavior) -> Self {
        Self {
            behavior,
            ..Self::returning(0.0, 0.0)
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn call_count(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn seen_order(&self) -> Vec<f64> {
        self.seen.lock().unwrap().clone()
    }
}

#[async_trait]
impl MlClient for ScriptedMl {
    async fn score(&self, _model_version: &str, features: &[Feature]) -> Result<MlScore, MlError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(feature) = features.iter().find(|f| f.name == "api_call_count") {
            self.seen.lock().unwrap().push(feature.value);
        }
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        match self.behavior {
            MlBehavior::Succeed => Ok(MlScore {
                threat_score: self.threat_score,
                confidence: self.confidence,
            }),
            MlBehavior::AlwaysTransient => {
                Err(MlError::Transient("endpoint unavailable".to_string()))
            }
            MlBehavior::AlwaysPermanent => {
                Err(MlError::Permanent("feature schema mismatch".to_string()))
            }
        }
    }
}

/// Analysis oracle double: a fixed response after an optional delay.
pub struct ScriptedAnalysis {
    pub response: String,
    pub delay: Duration,
    pub calls: AtomicU32,
}

impl ScriptedAnalysis {
    pub fn returning(response: &str) -> Self {
        Self {
            response: response.to_string(),
            delay: Duration::ZERO,
            calls: AtomicU32::new(0),
        }
    }

    pub fn report(risk_score: f64) -> Self {
        Self::returning(&format!(
            r#"{{"risk_score": {risk_score}, "attack_vector": "credential abuse", "recommended_actions": ["ROTATE_KEYS"], "business_impact": "High", "confidence": 0.9}}"#
        ))
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn call_count(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl vigil::analysis::AnalysisClient for ScriptedAnalysis {
    async fn analyze(&self, _prompt: &str, _event: &Event) -> Result<String, AnalysisError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        Ok(self.response.clone())
    }
}

/// Effector double that counts invocations.
pub struct CountingEffector {
    pub calls: AtomicU32,
    pub fail: bool,
    pub delay: Duration,
}

impl CountingEffector {
    pub fn succeeding() -> Self {
        Self {
            calls: AtomicU32::new(0),
            fail: false,
            delay: Duration::ZERO,
        }
    }

    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::succeeding()
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn call_count(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Effector for CountingEffector {
    async fn execute(&self, request: &ActionRequest) -> Result<(), EffectorError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
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

/// Publisher double capturing the last notification.
pub struct CountingPublisher {
    pub calls: AtomicU32,
    pub last: Mutex<Option<AlertNotification>>,
}

impl CountingPublisher {
    pub fn new() -> Self {
        Self {
            calls: AtomicU32::new(0),
            last: Mutex::new(None),
        }
    }

    pub fn call_count(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn last_notification(&self) -> Option<AlertNotification> {
        self.last.lock().unwrap().clone()
    }
}

#[async_trait]
impl AlertPublisher for CountingPublisher {
    async fn publish(&self, notification: &AlertNotification) -> Result<(), PublishError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        *self.last.lock().unwrap() = Some(notification.clone());
        Ok(())
    }
}

/// A store that is always down.
pub struct FailingStore;

#[async_trait]
impl AlertStore for FailingStore {
    async fn put(&self, _alert: Alert) -> Result<(), StoreError> {
        Err(StoreError::Unavailable("connection refused".to_string()))
    }

    async fn get(&self, _key: &AlertKey) -> Result<Option<Alert>, StoreError> {
        Err(StoreError::Unavailable("connection refused".to_string()))
    }
}
