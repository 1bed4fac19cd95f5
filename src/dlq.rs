//! Dead-letter handling.
//!
//! Two distinct destinations: the in-memory [`DeadLetterQueue`] holds
//! events the pipeline refuses to retry (malformed input, permanent oracle
//! rejections) for operator inspection, and the [`DeadLetterSpool`] writes
//! alerts whose store write exhausted its retries to disk so they survive
//! a restart and can be replayed.

use crate::event::Alert;
use crate::metrics;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::VecDeque;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

const DEFAULT_DLQ_CAPACITY: usize = 1_000;

/// One dead-lettered item. Malformed input carries the raw finding; later
/// failures carry the partially enriched alert.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadLetter {
    pub at: DateTime<Utc>,
    pub stage: String,
    pub reason: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alert: Option<Alert>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw: Option<Value>,
}

/// Bounded in-memory queue of refused events.
pub struct DeadLetterQueue {
    entries: Mutex<VecDeque<DeadLetter>>,
    capacity: usize,
}

impl DeadLetterQueue {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_DLQ_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: Mutex::new(VecDeque::new()),
            capacity: capacity.max(1),
        }
    }

    pub fn push(&self, entry: DeadLetter) {
        metrics::DEAD_LETTERED.inc();
        let mut entries = match self.entries.lock() {
            Ok(guard) => guard,
            Err(_) => return,
        };
        while entries.len() >= self.capacity {
            entries.pop_front();
        }
        entries.push_back(entry);
        metrics::DLQ_DEPTH.set(entries.len() as i64);
    }

    pub fn len(&self) -> usize {
        self.entries.lock().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copy of the current entries, oldest first.
    pub fn snapshot(&self) -> Vec<DeadLetter> {
        self.entries
            .lock()
            .map(|e| e.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Remove and return all entries, e.g. for replay.
    pub fn drain(&self) -> Vec<DeadLetter> {
        let mut entries = match self.entries.lock() {
            Ok(guard) => guard,
            Err(_) => return Vec::new(),
        };
        let drained = entries.drain(..).collect();
        metrics::DLQ_DEPTH.set(0);
        drained
    }
}

impl Default for DeadLetterQueue {
    fn default() -> Self {
        Self::new()
    }
}

/// On-disk spool for alerts the store would not take.
///
/// One JSON file per alert, written atomically (temp file then rename) so
/// a crash never leaves a half-written record.
pub struct DeadLetterSpool {
    dir: PathBuf,
}

impl DeadLetterSpool {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Persist an alert for later replay. Returns the file written.
    pub fn spool(&self, alert: &Alert) -> Result<PathBuf> {
        fs::create_dir_all(&self.dir)
            .with_context(|| format!("failed to create spool dir {}", self.dir.display()))?;

        let name = format!(
            "{}-{}.json",
            sanitize(&alert.event.event_id),
            alert.event.observed_at.timestamp_millis()
        );
        let path = self.dir.join(name);
        let tmp = path.with_extension("json.tmp");

        let mut file = fs::File::create(&tmp)
            .with_context(|| format!("failed to create spool file {}", tmp.display()))?;
        serde_json::to_writer_pretty(&mut file, alert).context("failed to serialize alert")?;
        file.flush().context("failed to flush spool file")?;
        fs::rename(&tmp, &path)
            .with_context(|| format!("failed to finalize spool file {}", path.display()))?;

        Ok(path)
    }

    /// Load every spooled alert, skipping files that fail to parse.
    pub fn load_all(&self) -> Result<Vec<Alert>> {
        if !self.dir.exists() {
            return Ok(Vec::new());
        }
        let mut alerts = Vec::new();
        for entry in fs::read_dir(&self.dir)
            .with_context(|| format!("failed to read spool dir {}", self.dir.display()))?
        {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let content = fs::read_to_string(&path)?;
            match serde_json::from_str(&content) {
                Ok(alert) => alerts.push(alert),
                Err(_) => continue,
            }
        }
        Ok(alerts)
    }
}

fn sanitize(id: &str) -> String {
    id.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect()
}
