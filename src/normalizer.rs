//! Turns vendor-specific raw findings into canonical events.
//!
//! Pure apart from metric counters: the same raw finding always yields the
//! same event fields and the same severity band.

use crate::error::NormalizeError;
use crate::event::{Event, SeverityBand, SourceKind};
use crate::metrics;
use chrono::{DateTime, Utc};
use serde_json::Value;

/// Severity cuts per source family, expressed as the lower bounds of the
/// MEDIUM, HIGH, and CRITICAL bands on the source's native scale.
const GUARDDUTY_CUTS: [f64; 3] = [1.0, 4.0, 7.0];
const SECURITYHUB_CUTS: [f64; 3] = [1.0, 40.0, 70.0];

/// Normalize a raw finding declared to come from `source_tag`.
///
/// Required fields are `id`, `time`, `account`, `region`, and
/// `detail-type`; any of them missing or unparseable fails with
/// `MalformedSource`. A missing native severity does not fail: the band
/// defaults to MEDIUM and a warning counter is incremented.
pub fn normalize(source_tag: &str, raw: &Value) -> Result<Event, NormalizeError> {
    let source = SourceKind::from(source_tag.to_string());

    let event_id = required_str(&source, raw, "id")?.to_string();
    let observed_at = parse_time(&source, required_str(&source, raw, "time")?)?;
    let account = required_str(&source, raw, "account")?.to_string();
    let region = required_str(&source, raw, "region")?.to_string();
    let kind = required_str(&source, raw, "detail-type")?.to_string();

    let detail = raw
        .get("detail")
        .cloned()
        .unwrap_or_else(|| Value::Object(Default::default()));

    let (severity_band, defaulted) = severity_band(&source, &detail);
    if defaulted {
        metrics::SEVERITY_DEFAULTED.inc();
    }

    Ok(Event {
        event_id,
        observed_at,
        ingested_at: Utc::now(),
        source,
        account,
        region,
        kind,
        severity_band,
        raw: detail,
    })
}

fn required_str<'a>(
    source: &SourceKind,
    raw: &'a Value,
    field: &'static str,
) -> Result<&'a str, NormalizeError> {
    raw.get(field)
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| NormalizeError::MalformedSource {
            source_tag: source.as_str().to_string(),
            field,
        })
}

fn parse_time(source: &SourceKind, value: &str) -> Result<DateTime<Utc>, NormalizeError> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|_| NormalizeError::MalformedSource {
            source_tag: source.as_str().to_string(),
            field: "time",
        })
}

/// Derive the severity band from the source's native severity field.
///
/// Returns the band and whether it was defaulted because the field was
/// missing or unparseable.
pub fn severity_band(source: &SourceKind, detail: &Value) -> (SeverityBand, bool) {
    match source {
        SourceKind::GuardDuty => match detail.get("severity").and_then(Value::as_f64) {
            Some(score) => (band_from_cuts(score, GUARDDUTY_CUTS), false),
            None => (SeverityBand::Medium, true),
        },
        SourceKind::SecurityHub => {
            let normalized = detail
                .get("Severity")
                .and_then(|s| s.get("Normalized"))
                .and_then(Value::as_f64);
            match normalized {
                Some(score) => (band_from_cuts(score, SECURITYHUB_CUTS), false),
                None => (SeverityBand::Medium, true),
            }
        }
        SourceKind::Other(_) => (SeverityBand::Medium, false),
    }
}

fn band_from_cuts(score: f64, cuts: [f64; 3]) -> SeverityBand {
    if score >= cuts[2] {
        SeverityBand::Critical
    } else if score >= cuts[1] {
        SeverityBand::High
    } else if score >= cuts[0] {
        SeverityBand::Medium
    } else {
        SeverityBand::Low
    }
}
