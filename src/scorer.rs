//! ML scoring stage.
//!
//! Extracts a fixed, versioned feature vector from the event and asks the
//! model oracle for a threat score. The oracle being down never drops an
//! event: after the retry budget is spent the verdict degrades to a zero
//! score with the error recorded, and the event keeps moving.

use crate::error::MlError;
use crate::event::{Event, MlVerdict};
use crate::metrics;
use crate::retry::BackoffSchedule;
use async_trait::async_trait;
use chrono::{Timelike, Utc};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Semaphore;
use tracing::{debug, warn};

/// One named feature. The name list and order are part of the model
/// version contract.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Feature {
    pub name: &'static str,
    pub value: f64,
}

/// Model output.
#[derive(Debug, Clone, Copy)]
pub struct MlScore {
    pub threat_score: f64,
    pub confidence: f64,
}

/// The model oracle. Implementations must treat `Transient` failures as
/// retry-safe; `Permanent` means the feature schema itself was rejected.
#[async_trait]
pub trait MlClient: Send + Sync {
    async fn score(&self, model_version: &str, features: &[Feature]) -> Result<MlScore, MlError>;
}

/// Deterministic feature extraction. Unknown or absent raw fields fall
/// back to fixed priors so the vector shape never varies.
pub fn extract_features(event: &Event) -> Vec<Feature> {
    let raw = &event.raw;
    vec![
        Feature {
            name: "api_call_count",
            value: raw
                .get("apiCallCount")
                .and_then(serde_json::Value::as_f64)
                .unwrap_or(1.0),
        },
        Feature {
            name: "error_present",
            value: if raw.get("errorCode").map_or(false, |v| !v.is_null()) {
                1.0
            } else {
                0.0
            },
        },
        Feature {
            name: "source_ip_reputation",
            value: raw
                .get("ipReputation")
                .and_then(serde_json::Value::as_f64)
                .unwrap_or(0.5),
        },
        Feature {
            name: "hour_of_day",
            value: f64::from(event.observed_at.hour()),
        },
        Feature {
            name: "user_history_score",
            value: raw
                .get("userHistoryScore")
                .and_then(serde_json::Value::as_f64)
                .unwrap_or(0.7),
        },
    ]
}

/// Drives the model oracle with retries and degradation.
pub struct Scorer {
    client: Arc<dyn MlClient>,
    model_version: String,
    schedule: BackoffSchedule,
    permits: Arc<Semaphore>,
}

impl Scorer {
    pub fn new(
        client: Arc<dyn MlClient>,
        model_version: String,
        schedule: BackoffSchedule,
        concurrency: usize,
    ) -> Self {
        Self {
            client,
            model_version,
            schedule,
            permits: Arc::new(Semaphore::new(concurrency)),
        }
    }

    /// Score one event. `Err` is returned only for permanent schema
    /// failures, which dead-letter the event; everything else degrades.
    pub async fn score(&self, event: &Event) -> Result<MlVerdict, MlError> {
        let features = extract_features(event);
        let started = Instant::now();
        let mut last_error = String::from("unavailable");

        for attempt in 1..=self.schedule.max_attempts {
            let remaining = self.schedule.budget.saturating_sub(started.elapsed());
            if remaining.is_zero() {
                break;
            }

            let _permit = match self.permits.acquire().await {
                Ok(permit) => permit,
                Err(_) => break,
            };

            let call = self.client.score(&self.model_version, &features);
            match tokio::time::timeout(remaining, call).await {
                Ok(Ok(score)) => {
                    return Ok(MlVerdict {
                        threat_score: score.threat_score.clamp(0.0, 100.0),
                        confidence: score.confidence.clamp(0.0, 1.0),
                        model_version: self.model_version.clone(),
                        scored_at: Utc::now(),
                        error: None,
                    });
                }
                Ok(Err(MlError::Permanent(message))) => {
                    return Err(MlError::Permanent(message));
                }
                Ok(Err(MlError::Transient(message))) => {
                    debug!(
                        event_id = %event.event_id,
                        attempt,
                        error = %message,
                        "transient ml failure"
                    );
                    last_error = message;
                }
                Err(_) => {
                    last_error = "timeout".to_string();
                }
            }

            if let Some(delay) = self.schedule.delay_after(attempt) {
                metrics::ORACLE_RETRIES.with_label_values(&["ml"]).inc();
                let capped = delay.min(self.schedule.budget.saturating_sub(started.elapsed()));
                tokio::time::sleep(capped).await;
            }
        }

        metrics::ORACLE_EXHAUSTED.with_label_values(&["ml"]).inc();
        warn!(
            event_id = %event.event_id,
            error = %last_error,
            "ml oracle exhausted, degrading score"
        );
        Ok(MlVerdict {
            threat_score: 0.0,
            confidence: 0.0,
            model_version: self.model_version.clone(),
            scored_at: Utc::now(),
            error: Some(last_error),
        })
    }
}

/// Local fallback model: a fixed linear blend of the feature vector.
/// Stands in when no external model endpoint is wired up.
#[derive(Debug, Default)]
pub struct HeuristicMlClient;

#[async_trait]
impl MlClient for HeuristicMlClient {
    async fn score(&self, _model_version: &str, features: &[Feature]) -> Result<MlScore, MlError> {
        let get = |name: &str| {
            features
                .iter()
                .find(|f| f.name == name)
                .map(|f| f.value)
                .unwrap_or(0.0)
        };

        let mut score = 20.0;
        score += get("error_present") * 15.0;
        score += (1.0 - get("source_ip_reputation")) * 30.0;
        score += (1.0 - get("user_history_score")) * 20.0;
        score += (get("api_call_count").min(50.0) / 50.0) * 15.0;

        // Off-hours activity reads slightly riskier.
        let hour = get("hour_of_day");
        if !(7.0..=19.0).contains(&hour) {
            score += 5.0;
        }

        Ok(MlScore {
            threat_score: score.clamp(0.0, 100.0),
            confidence: 0.5,
        })
    }
}
