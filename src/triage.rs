//! Deterministic alert triage.
//!
//! Blends the ML threat score, severity band, and source context into a
//! priority in [0, 100]. The priority gates the expensive stages: strictly
//! above the warn threshold invokes deep analysis, strictly above the
//! remediate threshold invokes the effector.

use crate::event::{Event, MlVerdict, SeverityBand, TriageVerdict};
use chrono::Utc;

const THREAT_WEIGHT: f64 = 0.6;
const KIND_BOOST: f64 = 1.3;

/// Finding kinds containing any of these tokens rank above their score.
const BOOST_TOKENS: &[&str] = &["UnauthorizedAccess", "Recon", "Trojan", "Finding"];

/// Compute the triage verdict for a scored event.
pub fn triage(event: &Event, ml: &MlVerdict) -> TriageVerdict {
    let priority_score = priority_score(event, ml.threat_score);
    let priority_band = priority_band(priority_score);
    TriageVerdict {
        priority_score,
        priority_band,
        recommended_actions: recommended_actions(priority_band),
        triaged_at: Utc::now(),
    }
}

/// `clamp((threat * 0.6 + severity_weight) * source_mult * kind_boost)`.
pub fn priority_score(event: &Event, threat_score: f64) -> f64 {
    let base = threat_score * THREAT_WEIGHT + event.severity_band.priority_weight();
    let boost = if BOOST_TOKENS.iter().any(|t| event.kind.contains(t)) {
        KIND_BOOST
    } else {
        1.0
    };
    (base * event.source.priority_multiplier() * boost).clamp(0.0, 100.0)
}

pub fn priority_band(score: f64) -> SeverityBand {
    if score >= 90.0 {
        SeverityBand::Critical
    } else if score >= 70.0 {
        SeverityBand::High
    } else if score >= 40.0 {
        SeverityBand::Medium
    } else {
        SeverityBand::Low
    }
}

/// Fixed, ordered action list per priority band.
pub fn recommended_actions(band: SeverityBand) -> Vec<String> {
    let actions: &[&str] = match band {
        SeverityBand::Critical => &[
            "IMMEDIATE_ISOLATION",
            "DISABLE_CREDENTIALS",
            "NOTIFY_SECURITY_TEAM",
        ],
        SeverityBand::High => &["INVESTIGATE", "MONITOR_CLOSELY", "NOTIFY_SECURITY_TEAM"],
        SeverityBand::Medium => &["LOG_AND_MONITOR", "SCHEDULE_REVIEW"],
        SeverityBand::Low => &["LOG_ONLY"],
    };
    actions.iter().map(|s| s.to_string()).collect()
}
