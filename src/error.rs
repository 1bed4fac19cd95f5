//! Pipeline error taxonomy.
//!
//! Each variant family maps to one recovery policy: malformed input is
//! dead-lettered, backpressure is surfaced to the caller, oracle failures
//! degrade enrichment locally, and store failures spill to the persistent
//! dead-letter spool.

use std::path::PathBuf;
use thiserror::Error;

/// Raised when a raw finding cannot be turned into a canonical event.
/// Terminal: the finding is dead-lettered, never retried.
#[derive(Debug, Error)]
pub enum NormalizeError {
    #[error("malformed {source_tag} finding: missing or invalid `{field}`")]
    MalformedSource { source_tag: String, field: &'static str },
}

/// Enqueue failures on the event bus.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum EnqueueError {
    /// The target partition queue is full. Retryable by the caller.
    #[error("event bus full")]
    Backpressure,
    /// The consumer side has shut down.
    #[error("event bus closed")]
    Closed,
}

/// ML oracle failures.
#[derive(Debug, Error)]
pub enum MlError {
    /// Timeout, connection refused, 5xx-equivalent. Retried with backoff.
    #[error("transient ml failure: {0}")]
    Transient(String),
    /// Feature schema rejected by the model. Dead-letters the event.
    #[error("ml feature schema mismatch: {0}")]
    Permanent(String),
}

/// Deep-analysis oracle failures. All of them degrade the report rather
/// than failing the event.
#[derive(Debug, Error)]
pub enum AnalysisError {
    #[error("analysis call timed out")]
    Timeout,
    #[error("analysis transport failure: {0}")]
    Transport(String),
    #[error("analysis response not parseable: {0}")]
    Parse(String),
}

/// Remediation effector failure, recorded on the alert after one retry.
#[derive(Debug, Error)]
#[error("effector rejected {action}: {message}")]
pub struct EffectorError {
    pub action: String,
    pub message: String,
}

/// Alert store failures.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("alert store unavailable: {0}")]
    Unavailable(String),
}

/// Notification publish failure. Best-effort: logged, never fatal.
#[derive(Debug, Error)]
#[error("publish failed: {0}")]
pub struct PublishError(pub String);

/// Configuration errors. `PolicyViolation` is fatal at startup.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file at {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse TOML config at {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },

    #[error("invalid configuration: {0}")]
    PolicyViolation(String),
}
