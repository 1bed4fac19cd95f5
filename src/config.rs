//! TOML-based configuration for the pipeline.

use crate::error::ConfigError;
use crate::event::RemediationAction;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

const DEFAULT_WARN_THRESHOLD: u32 = 70;
const DEFAULT_REMEDIATE_THRESHOLD: u32 = 90;
const DEFAULT_BUS_CAPACITY: usize = 1_000;
const DEFAULT_BUS_PARTITIONS: usize = 4;
const DEFAULT_BUS_RETENTION_SECS: u64 = 86_400;
const DEFAULT_MAX_CONCURRENT_EVENTS: u32 = 64;
const DEFAULT_ORACLE_CONCURRENCY: usize = 16;
const DEFAULT_EVENT_DEADLINE_MS: u64 = 60_000;
const DEFAULT_ML_BACKOFF_MS: u64 = 200;
const DEFAULT_ML_MAX_ATTEMPTS: u32 = 4;
const DEFAULT_ML_BUDGET_MS: u64 = 5_000;
const DEFAULT_ANALYSIS_TIMEOUT_MS: u64 = 15_000;
const DEFAULT_EFFECTOR_TIMEOUT_MS: u64 = 10_000;
const DEFAULT_DEDUP_WINDOW_MS: u64 = 300_000;
const DEFAULT_DEDUP_CAPACITY: usize = 10_000;
const DEFAULT_STORE_TTL_SECONDS: u64 = 2_592_000;
const DEFAULT_STORE_BUDGET_MS: u64 = 5_000;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub general: GeneralConfig,
    #[serde(default)]
    pub triage: TriageConfig,
    #[serde(default)]
    pub bus: BusConfig,
    #[serde(default)]
    pub limits: LimitsConfig,
    #[serde(default)]
    pub ml: MlConfig,
    #[serde(default)]
    pub analysis: AnalysisConfig,
    #[serde(default)]
    pub remediation: RemediationConfig,
    #[serde(default)]
    pub notify: NotifyConfig,
    #[serde(default)]
    pub store: StoreConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralConfig {
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub log_format: LogFormat,
    /// Directory for on-disk state (the persistent dead-letter spool).
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("/var/lib/vigil")
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Json,
    Text,
}

/// Master switch for the optional stages.
///
/// `Off` disables both the analysis and remediation gates; `NotifyOnly`
/// disables remediation regardless of score; `Full` enables everything.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ActionPolicy {
    Off,
    NotifyOnly,
    #[default]
    Full,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TriageConfig {
    /// Priority strictly greater than this invokes deep analysis.
    #[serde(default = "default_warn_threshold")]
    pub warn_threshold: u32,
    /// Priority strictly greater than this invokes remediation.
    #[serde(default = "default_remediate_threshold")]
    pub remediate_threshold: u32,
    #[serde(default)]
    pub action_policy: ActionPolicy,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusConfig {
    /// Total in-flight messages before enqueue returns backpressure.
    #[serde(default = "default_bus_capacity")]
    pub capacity: usize,
    /// Partition count. Events hash to a partition by event_id; ordering
    /// holds within a partition only.
    #[serde(default = "default_bus_partitions")]
    pub partitions: usize,
    /// Messages older than this are dropped at the consumer.
    #[serde(default = "default_bus_retention")]
    pub retention_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    /// Maximum events owned by orchestrator tasks at once. Excess is
    /// backpressure at ingress.
    #[serde(default = "default_max_concurrent_events")]
    pub max_concurrent_events: u32,
    /// Concurrency cap per oracle (ML, analysis, effector each).
    #[serde(default = "default_oracle_concurrency")]
    pub oracle_concurrency: usize,
    /// End-to-end budget per event.
    #[serde(default = "default_event_deadline_ms")]
    pub event_deadline_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MlConfig {
    /// Names the feature schema contract with the oracle.
    #[serde(default = "default_model_version")]
    pub model_version: String,
    #[serde(default = "default_ml_backoff_ms")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_ml_max_attempts")]
    pub max_attempts: u32,
    /// Overall scoring budget including retries.
    #[serde(default = "default_ml_budget_ms")]
    pub budget_ms: u64,
}

fn default_model_version() -> String {
    "cloudtrail-xgb-1.2".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisConfig {
    /// Per-call budget for the analysis oracle.
    #[serde(default = "default_analysis_timeout_ms")]
    pub timeout_ms: u64,
}

/// Maps a finding to an effector action. First matching rule wins; no
/// match means no action.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RemediationRule {
    /// Source tag, e.g. "aws.guardduty".
    pub source: String,
    /// Substring matched against the finding kind.
    pub kind_token: String,
    pub action: RemediationAction,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemediationConfig {
    #[serde(default = "default_effector_timeout_ms")]
    pub effector_timeout_ms: u64,
    /// Operator-supplied policy table. Empty by default: unmapped findings
    /// are skipped, never remediated with a guessed action.
    #[serde(default)]
    pub rules: Vec<RemediationRule>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotifyConfig {
    #[serde(default = "default_dedup_window_ms")]
    pub dedup_window_ms: u64,
    #[serde(default = "default_dedup_capacity")]
    pub dedup_capacity: usize,
    #[serde(default)]
    pub webhook_url: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// TTL attached to every row at write time.
    #[serde(default = "default_store_ttl")]
    pub ttl_seconds: u64,
    /// Overall budget for one upsert including retries.
    #[serde(default = "default_store_budget_ms")]
    pub budget_ms: u64,
}

fn default_warn_threshold() -> u32 {
    DEFAULT_WARN_THRESHOLD
}
fn default_remediate_threshold() -> u32 {
    DEFAULT_REMEDIATE_THRESHOLD
}
fn default_bus_capacity() -> usize {
    DEFAULT_BUS_CAPACITY
}
fn default_bus_partitions() -> usize {
    DEFAULT_BUS_PARTITIONS
}
fn default_bus_retention() -> u64 {
    DEFAULT_BUS_RETENTION_SECS
}
fn default_max_concurrent_events() -> u32 {
    DEFAULT_MAX_CONCURRENT_EVENTS
}
fn default_oracle_concurrency() -> usize {
    DEFAULT_ORACLE_CONCURRENCY
}
fn default_event_deadline_ms() -> u64 {
    DEFAULT_EVENT_DEADLINE_MS
}
fn default_ml_backoff_ms() -> u64 {
    DEFAULT_ML_BACKOFF_MS
}
fn default_ml_max_attempts() -> u32 {
    DEFAULT_ML_MAX_ATTEMPTS
}
fn default_ml_budget_ms() -> u64 {
    DEFAULT_ML_BUDGET_MS
}
fn default_analysis_timeout_ms() -> u64 {
    DEFAULT_ANALYSIS_TIMEOUT_MS
}
fn default_effector_timeout_ms() -> u64 {
    DEFAULT_EFFECTOR_TIMEOUT_MS
}
fn default_dedup_window_ms() -> u64 {
    DEFAULT_DEDUP_WINDOW_MS
}
fn default_dedup_capacity() -> usize {
    DEFAULT_DEDUP_CAPACITY
}
fn default_store_ttl() -> u64 {
    DEFAULT_STORE_TTL_SECONDS
}
fn default_store_budget_ms() -> u64 {
    DEFAULT_STORE_BUDGET_MS
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_format: LogFormat::Json,
            data_dir: default_data_dir(),
        }
    }
}

impl Default for TriageConfig {
    fn default() -> Self {
        Self {
            warn_threshold: DEFAULT_WARN_THRESHOLD,
            remediate_threshold: DEFAULT_REMEDIATE_THRESHOLD,
            action_policy: ActionPolicy::Full,
        }
    }
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_BUS_CAPACITY,
            partitions: DEFAULT_BUS_PARTITIONS,
            retention_secs: DEFAULT_BUS_RETENTION_SECS,
        }
    }
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_concurrent_events: DEFAULT_MAX_CONCURRENT_EVENTS,
            oracle_concurrency: DEFAULT_ORACLE_CONCURRENCY,
            event_deadline_ms: DEFAULT_EVENT_DEADLINE_MS,
        }
    }
}

impl Default for MlConfig {
    fn default() -> Self {
        Self {
            model_version: default_model_version(),
            initial_backoff_ms: DEFAULT_ML_BACKOFF_MS,
            max_attempts: DEFAULT_ML_MAX_ATTEMPTS,
            budget_ms: DEFAULT_ML_BUDGET_MS,
        }
    }
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            timeout_ms: DEFAULT_ANALYSIS_TIMEOUT_MS,
        }
    }
}

impl Default for RemediationConfig {
    fn default() -> Self {
        Self {
            effector_timeout_ms: DEFAULT_EFFECTOR_TIMEOUT_MS,
            rules: Vec::new(),
        }
    }
}

impl Default for NotifyConfig {
    fn default() -> Self {
        Self {
            dedup_window_ms: DEFAULT_DEDUP_WINDOW_MS,
            dedup_capacity: DEFAULT_DEDUP_CAPACITY,
            webhook_url: None,
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            ttl_seconds: DEFAULT_STORE_TTL_SECONDS,
            budget_ms: DEFAULT_STORE_BUDGET_MS,
        }
    }
}

impl Config {
    pub fn load(path: &std::path::Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn load_or_default(path: &std::path::Path) -> Self {
        Self::load(path).unwrap_or_default()
    }

    /// Reject configurations the pipeline must not start with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.triage.warn_threshold > 100 {
            return Err(ConfigError::PolicyViolation(format!(
                "warn_threshold ({}) must be in 0..=100",
                self.triage.warn_threshold
            )));
        }
        if self.triage.remediate_threshold > 100 {
            return Err(ConfigError::PolicyViolation(format!(
                "remediate_threshold ({}) must be in 0..=100",
                self.triage.remediate_threshold
            )));
        }
        if self.triage.remediate_threshold <= self.triage.warn_threshold {
            return Err(ConfigError::PolicyViolation(format!(
                "remediate_threshold ({}) must be greater than warn_threshold ({})",
                self.triage.remediate_threshold, self.triage.warn_threshold
            )));
        }
        if self.bus.capacity == 0 {
            return Err(ConfigError::PolicyViolation(
                "bus.capacity must be greater than zero".to_string(),
            ));
        }
        if self.bus.partitions == 0 {
            return Err(ConfigError::PolicyViolation(
                "bus.partitions must be greater than zero".to_string(),
            ));
        }
        if self.limits.max_concurrent_events == 0 {
            return Err(ConfigError::PolicyViolation(
                "limits.max_concurrent_events must be greater than zero".to_string(),
            ));
        }
        if self.limits.oracle_concurrency == 0 {
            return Err(ConfigError::PolicyViolation(
                "limits.oracle_concurrency must be greater than zero".to_string(),
            ));
        }
        if self.limits.event_deadline_ms == 0 {
            return Err(ConfigError::PolicyViolation(
                "limits.event_deadline_ms must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}
