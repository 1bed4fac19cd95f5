//! Deep-analysis gate.
//!
//! When triage ranks an alert strictly above the warn threshold, the event
//! is handed to the LLM oracle for a structured risk report. The oracle is
//! slow and fallible; everything here is built to degrade: fenced or
//! chatty responses are mined for the first balanced JSON object, a failed
//! call or parse gets one retry, and after that the report is filled with
//! neutral defaults and the error recorded.

use crate::config::ActionPolicy;
use crate::error::AnalysisError;
use crate::event::{Event, MlVerdict, RiskReport, TriageVerdict};
use crate::metrics;
use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tracing::warn;

const MAX_RAW_CHARS: usize = 3_000;
const ATTEMPTS: u32 = 2;

/// The LLM oracle seam. Receives the rendered prompt plus the event for
/// implementations that analyze locally; returns the raw response text.
#[async_trait]
pub trait AnalysisClient: Send + Sync {
    async fn analyze(&self, prompt: &str, event: &Event) -> Result<String, AnalysisError>;
}

/// Should the gate fire for this priority under the current policy?
/// Strict inequality: a score equal to the threshold does not fire.
pub fn should_fire(priority_score: f64, warn_threshold: u32, policy: ActionPolicy) -> bool {
    policy != ActionPolicy::Off && priority_score > f64::from(warn_threshold)
}

/// Render the fixed prompt template over the event and its enrichment.
pub fn render_prompt(event: &Event, ml: &MlVerdict, triage: &TriageVerdict) -> String {
    let mut raw = serde_json::to_string_pretty(&event.raw).unwrap_or_else(|_| "{}".to_string());
    truncate_on_boundary(&mut raw, MAX_RAW_CHARS);

    format!(
        r#"You are a cloud security analyst reviewing a triaged alert.

**Finding type:** {kind}
**Source:** {source}
**Severity band:** {band}
**ML threat score:** {threat:.2}/100 (confidence {conf:.2})
**Triage priority:** {priority:.2}/100

**Finding details:**
{raw}

Assess the risk and respond ONLY with valid JSON in this exact format:
{{
  "risk_score": <number 0-10>,
  "attack_vector": "<short description>",
  "recommended_actions": ["<action1>", "<action2>"],
  "business_impact": "<brief 1-2 sentence assessment>",
  "confidence": <number 0-1>
}}"#,
        kind = event.kind,
        source = event.source,
        band = event.severity_band.as_str(),
        threat = ml.threat_score,
        conf = ml.confidence,
        priority = triage.priority_score,
        raw = raw,
    )
}

fn truncate_on_boundary(s: &mut String, max: usize) {
    if s.len() <= max {
        return;
    }
    let mut end = max;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    s.truncate(end);
}

/// Extract the first balanced JSON object from free-form oracle output.
/// Handles markdown fences and surrounding prose: anything before the
/// first `{` and after its matching `}` is ignored.
pub fn extract_json_object(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let bytes = text.as_bytes();
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (offset, &b) in bytes[start..].iter().enumerate() {
        if in_string {
            if escaped {
                escaped = false;
            } else if b == b'\\' {
                escaped = true;
            } else if b == b'"' {
                in_string = false;
            }
            continue;
        }
        match b {
            b'"' => in_string = true,
            b'{' => depth += 1,
            b'}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(&text[start..=start + offset]);
                }
            }
            _ => {}
        }
    }
    None
}

fn parse_report(text: &str) -> Result<RiskReport, AnalysisError> {
    let span = extract_json_object(text)
        .ok_or_else(|| AnalysisError::Parse("no JSON object in response".to_string()))?;
    let value: Value =
        serde_json::from_str(span).map_err(|e| AnalysisError::Parse(e.to_string()))?;

    let actions = value
        .get("recommended_actions")
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default();

    Ok(RiskReport {
        risk_score: value
            .get("risk_score")
            .and_then(Value::as_f64)
            .unwrap_or(0.0)
            .clamp(0.0, 10.0),
        attack_vector: value
            .get("attack_vector")
            .and_then(Value::as_str)
            .unwrap_or("unknown")
            .to_string(),
        recommended_actions: actions,
        business_impact: value
            .get("business_impact")
            .and_then(Value::as_str)
            .unwrap_or("")
            .to_string(),
        confidence: value
            .get("confidence")
            .and_then(Value::as_f64)
            .unwrap_or(0.0)
            .clamp(0.0, 1.0),
        analyzed_at: Utc::now(),
        error: None,
    })
}

fn degraded_report(reason: &str) -> RiskReport {
    RiskReport {
        risk_score: 0.0,
        attack_vector: "unknown".to_string(),
        recommended_actions: Vec::new(),
        business_impact: String::new(),
        confidence: 0.0,
        analyzed_at: Utc::now(),
        error: Some(reason.to_string()),
    }
}

/// Drives the analysis oracle. Safe to re-execute: a retried event simply
/// overwrites its report.
pub struct DeepAnalysisGate {
    client: Arc<dyn AnalysisClient>,
    timeout: Duration,
    permits: Arc<Semaphore>,
}

impl DeepAnalysisGate {
    pub fn new(client: Arc<dyn AnalysisClient>, timeout: Duration, concurrency: usize) -> Self {
        Self {
            client,
            timeout,
            permits: Arc::new(Semaphore::new(concurrency)),
        }
    }

    /// Produce a risk report. Never fails: timeouts, transport errors, and
    /// unparseable responses all degrade after one retry.
    pub async fn analyze(
        &self,
        event: &Event,
        ml: &MlVerdict,
        triage: &TriageVerdict,
    ) -> RiskReport {
        let prompt = render_prompt(event, ml, triage);
        let mut last_error = "unavailable";

        for attempt in 1..=ATTEMPTS {
            let _permit = match self.permits.acquire().await {
                Ok(permit) => permit,
                Err(_) => break,
            };

            let call = self.client.analyze(&prompt, event);
            match tokio::time::timeout(self.timeout, call).await {
                Ok(Ok(text)) => match parse_report(&text) {
                    Ok(report) => return report,
                    Err(AnalysisError::Parse(message)) => {
                        warn!(
                            event_id = %event.event_id,
                            attempt,
                            error = %message,
                            "analysis response unparseable"
                        );
                        last_error = "parse_failed";
                    }
                    Err(_) => last_error = "unavailable",
                },
                Ok(Err(AnalysisError::Timeout)) | Err(_) => {
                    warn!(event_id = %event.event_id, attempt, "analysis call timed out");
                    last_error = "timeout";
                }
                Ok(Err(AnalysisError::Transport(message))) => {
                    warn!(
                        event_id = %event.event_id,
                        attempt,
                        error = %message,
                        "analysis transport failure"
                    );
                    last_error = "unavailable";
                }
                Ok(Err(AnalysisError::Parse(_))) => {
                    last_error = "parse_failed";
                }
            }

            if attempt < ATTEMPTS {
                metrics::ORACLE_RETRIES.with_label_values(&["analysis"]).inc();
            }
        }

        metrics::ORACLE_EXHAUSTED.with_label_values(&["analysis"]).inc();
        degraded_report(last_error)
    }
}

/// Local fallback analyst: scores from raw-event heuristics and emits the
/// same JSON shape an LLM would, so the parse path stays exercised.
#[derive(Debug, Default)]
pub struct HeuristicAnalysisClient;

const HIGH_RISK_ACTIONS: &[&str] = &[
    "DeleteBucket",
    "DeleteUser",
    "DeleteRole",
    "PutBucketPolicy",
    "CreateAccessKey",
    "UpdateAccessKey",
    "AttachUserPolicy",
    "PutUserPolicy",
    "AssumeRole",
    "GetSecretValue",
];

const CRITICAL_ACTIONS: &[&str] = &[
    "DeleteTrail",
    "StopLogging",
    "DeleteFlowLogs",
    "DisableSecurityHub",
    "DeleteDetector",
];

#[async_trait]
impl AnalysisClient for HeuristicAnalysisClient {
    async fn analyze(&self, _prompt: &str, event: &Event) -> Result<String, AnalysisError> {
        let raw = &event.raw;
        let event_name = raw
            .get("eventName")
            .and_then(Value::as_str)
            .unwrap_or_default();
        let error_code = raw.get("errorCode").and_then(Value::as_str);
        let is_root = raw
            .get("userIdentity")
            .and_then(|u| u.get("type"))
            .and_then(Value::as_str)
            == Some("Root");

        let mut score: f64 = 3.0;
        if is_root {
            score += 2.0;
        }
        if matches!(error_code, Some("AccessDenied") | Some("UnauthorizedOperation")) {
            score += 1.0;
        }
        if HIGH_RISK_ACTIONS.iter().any(|a| event_name.contains(a)) {
            score += 2.0;
        }
        if CRITICAL_ACTIONS.iter().any(|a| event_name.contains(a)) {
            score += 4.0;
        }

        let report = serde_json::json!({
            "risk_score": score.clamp(0.0, 10.0),
            "attack_vector": event.kind,
            "recommended_actions": ["REVIEW_ACTIVITY"],
            "business_impact": "Heuristic assessment; no analyst model configured.",
            "confidence": 0.3,
        });
        Ok(report.to_string())
    }
}
