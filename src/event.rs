//! Canonical event and alert types.
//!
//! An [`Event`] is immutable once normalized. Enrichment is additive: each
//! pipeline stage attaches its own envelope (`ml`, `triage`, `analysis`,
//! `remediation`) and never rewrites an earlier one. The [`Alert`] is the
//! event plus whatever enrichment it accumulated, as written to the store.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Originating detector family.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum SourceKind {
    GuardDuty,
    SecurityHub,
    Other(String),
}

impl SourceKind {
    pub fn as_str(&self) -> &str {
        match self {
            SourceKind::GuardDuty => "aws.guardduty",
            SourceKind::SecurityHub => "aws.securityhub",
            SourceKind::Other(s) => s,
        }
    }

    /// Source weighting applied during triage. Findings from detectors
    /// with curated detections rank above raw log-derived ones.
    pub fn priority_multiplier(&self) -> f64 {
        match self {
            SourceKind::GuardDuty => 1.2,
            SourceKind::SecurityHub => 1.1,
            SourceKind::Other(_) => 1.0,
        }
    }
}

impl From<String> for SourceKind {
    fn from(s: String) -> Self {
        match s.as_str() {
            "aws.guardduty" => SourceKind::GuardDuty,
            "aws.securityhub" => SourceKind::SecurityHub,
            _ => SourceKind::Other(s),
        }
    }
}

impl From<SourceKind> for String {
    fn from(s: SourceKind) -> Self {
        s.as_str().to_string()
    }
}

impl std::fmt::Display for SourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Qualitative severity bucket derived from the source's native score at
/// normalization time.
#[derive(
    Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash,
)]
#[serde(rename_all = "UPPERCASE")]
pub enum SeverityBand {
    Low,
    Medium,
    High,
    Critical,
}

impl SeverityBand {
    /// Additive severity weight used by triage.
    pub fn priority_weight(&self) -> f64 {
        match self {
            SeverityBand::Low => 10.0,
            SeverityBand::Medium => 20.0,
            SeverityBand::High => 30.0,
            SeverityBand::Critical => 40.0,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SeverityBand::Low => "LOW",
            SeverityBand::Medium => "MEDIUM",
            SeverityBand::High => "HIGH",
            SeverityBand::Critical => "CRITICAL",
        }
    }
}

/// A canonical, immutable record of a single detection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    /// Source-emitted finding id; unique per finding, used as the
    /// partition key through the bus.
    pub event_id: String,
    /// Wall-clock timestamp from the source. Not monotonic across events.
    pub observed_at: DateTime<Utc>,
    /// Assigned by the normalizer.
    pub ingested_at: DateTime<Utc>,
    pub source: SourceKind,
    pub account: String,
    pub region: String,
    /// Detector-specific finding type.
    pub kind: String,
    pub severity_band: SeverityBand,
    /// Source-specific fields, carried untouched.
    pub raw: serde_json::Value,
}

/// ML scoring envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MlVerdict {
    /// Model output in [0, 100]. Zero when the oracle was unavailable.
    pub threat_score: f64,
    /// Model confidence in [0, 1].
    pub confidence: f64,
    pub model_version: String,
    pub scored_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Triage envelope. Deterministic function of the event and its ML verdict.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TriageVerdict {
    pub priority_score: f64,
    pub priority_band: SeverityBand,
    pub recommended_actions: Vec<String>,
    pub triaged_at: DateTime<Utc>,
}

/// Deep-analysis risk report. Present only when the analysis gate fired.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskReport {
    /// Risk rank in [0, 10]. Kept floating point end-to-end: the store
    /// contract requires at least six significant digits and forbids
    /// integer coercion.
    pub risk_score: f64,
    pub attack_vector: String,
    pub recommended_actions: Vec<String>,
    pub business_impact: String,
    pub confidence: f64,
    pub analyzed_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Outcome of an attempted (or skipped) remediation.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RemediationOutcome {
    Succeeded,
    Failed,
    Skipped,
}

/// Actions the effector knows how to perform. `None` records that the
/// policy table had no entry for the finding; the gate never invents one.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RemediationAction {
    DisableCredential,
    RevokeNetworkIngress,
    QuarantineInstance,
    RotateSecret,
    BlockAddress,
    None,
}

impl RemediationAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            RemediationAction::DisableCredential => "DISABLE_CREDENTIAL",
            RemediationAction::RevokeNetworkIngress => "REVOKE_NETWORK_INGRESS",
            RemediationAction::QuarantineInstance => "QUARANTINE_INSTANCE",
            RemediationAction::RotateSecret => "ROTATE_SECRET",
            RemediationAction::BlockAddress => "BLOCK_ADDRESS",
            RemediationAction::None => "NONE",
        }
    }
}

/// Remediation envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemediationRecord {
    /// True only when the effector was actually invoked.
    pub attempted: bool,
    pub action_kind: String,
    pub outcome: RemediationOutcome,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub attempted_at: DateTime<Utc>,
}

/// Terminal disposition of an alert.
///
/// `StoredOnly < Notified < Remediated` is the monotonic upsert order;
/// `DeadLettered` is orthogonal and, once set, final.
#[derive(
    Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AlertStatus {
    StoredOnly,
    Notified,
    Remediated,
    DeadLettered,
}

impl AlertStatus {
    /// Merge rule for concurrent or replayed store writes: status never
    /// moves backwards, and dead-lettered alerts stay dead-lettered.
    pub fn combine(stored: AlertStatus, incoming: AlertStatus) -> AlertStatus {
        if stored == AlertStatus::DeadLettered || incoming == AlertStatus::DeadLettered {
            AlertStatus::DeadLettered
        } else {
            stored.max(incoming)
        }
    }
}

/// Store key. Two writes with the same key refer to the same logical alert.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AlertKey {
    pub alert_id: String,
    pub observed_at: DateTime<Utc>,
}

/// An event plus its accumulated enrichment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Alert {
    #[serde(flatten)]
    pub event: Event,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ml: Option<MlVerdict>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub triage: Option<TriageVerdict>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub analysis: Option<RiskReport>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remediation: Option<RemediationRecord>,
    pub status: AlertStatus,
}

impl Alert {
    pub fn new(event: Event) -> Self {
        Self {
            event,
            ml: None,
            triage: None,
            analysis: None,
            remediation: None,
            status: AlertStatus::StoredOnly,
        }
    }

    pub fn key(&self) -> AlertKey {
        AlertKey {
            alert_id: self.event.event_id.clone(),
            observed_at: self.event.observed_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_source_kind_round_trip() {
        for tag in ["aws.guardduty", "aws.securityhub", "custom.scanner"] {
            let source = SourceKind::from(tag.to_string());
            assert_eq!(source.as_str(), tag);
        }
        assert_eq!(
            SourceKind::from("aws.guardduty".to_string()),
            SourceKind::GuardDuty
        );
    }

    #[test]
    fn test_severity_band_order() {
        assert!(SeverityBand::Low < SeverityBand::Medium);
        assert!(SeverityBand::Medium < SeverityBand::High);
        assert!(SeverityBand::High < SeverityBand::Critical);
    }

    #[test]
    fn test_severity_band_serde_uppercase() {
        let json = serde_json::to_string(&SeverityBand::Critical).unwrap();
        assert_eq!(json, "\"CRITICAL\"");
        let band: SeverityBand = serde_json::from_str("\"MEDIUM\"").unwrap();
        assert_eq!(band, SeverityBand::Medium);
    }

    #[test]
    fn test_status_combine_monotonic() {
        use AlertStatus::*;
        assert_eq!(AlertStatus::combine(Notified, StoredOnly), Notified);
        assert_eq!(AlertStatus::combine(StoredOnly, Remediated), Remediated);
        assert_eq!(AlertStatus::combine(Remediated, Notified), Remediated);
    }

    #[test]
    fn test_status_dead_lettered_is_sticky() {
        use AlertStatus::*;
        assert_eq!(AlertStatus::combine(DeadLettered, Remediated), DeadLettered);
        assert_eq!(AlertStatus::combine(Notified, DeadLettered), DeadLettered);
    }

    #[test]
    fn test_remediation_action_serde() {
        let json = serde_json::to_string(&RemediationAction::DisableCredential).unwrap();
        assert_eq!(json, "\"DISABLE_CREDENTIAL\"");
    }
}
