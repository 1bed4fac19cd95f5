//! Alert store.
//!
//! Writes are upserts keyed by `(alert_id, observed_at)`. The pipeline is
//! at-least-once, so the same alert may be written several times and
//! writes for one key may arrive out of order; the merge below makes the
//! final row order-independent: populated envelopes overwrite, absent ones
//! preserve, and status only moves forward.

use crate::error::StoreError;
use crate::event::{Alert, AlertKey, AlertStatus};
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use dashmap::DashMap;

#[async_trait]
pub trait AlertStore: Send + Sync {
    async fn put(&self, alert: Alert) -> Result<(), StoreError>;
    async fn get(&self, key: &AlertKey) -> Result<Option<Alert>, StoreError>;
}

/// Field-wise merge of an incoming write into the stored alert.
pub fn merge_alert(existing: &mut Alert, incoming: Alert) {
    let Alert {
        event: _,
        ml,
        triage,
        analysis,
        remediation,
        status,
    } = incoming;

    if ml.is_some() {
        existing.ml = ml;
    }
    if triage.is_some() {
        existing.triage = triage;
    }
    if analysis.is_some() {
        existing.analysis = analysis;
    }
    if remediation.is_some() {
        existing.remediation = remediation;
    }
    existing.status = AlertStatus::combine(existing.status, status);
}

struct StoredRow {
    alert: Alert,
    expires_at: DateTime<Utc>,
}

/// In-memory store backed by a concurrent map, with per-row TTL.
pub struct MemoryStore {
    rows: DashMap<AlertKey, StoredRow>,
    ttl: ChronoDuration,
}

impl MemoryStore {
    pub fn new(ttl_seconds: u64) -> Self {
        Self {
            rows: DashMap::new(),
            ttl: ChronoDuration::seconds(ttl_seconds as i64),
        }
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// All live alerts, for the ops surface. Expired rows are excluded.
    pub fn snapshot(&self) -> Vec<Alert> {
        let now = Utc::now();
        self.rows
            .iter()
            .filter(|row| row.expires_at > now)
            .map(|row| row.alert.clone())
            .collect()
    }

    /// Drop expired rows. Called periodically by the owner.
    pub fn sweep_expired(&self) {
        let now = Utc::now();
        self.rows.retain(|_, row| row.expires_at > now);
    }
}

#[async_trait]
impl AlertStore for MemoryStore {
    async fn put(&self, alert: Alert) -> Result<(), StoreError> {
        let key = alert.key();
        let expires_at = Utc::now() + self.ttl;
        match self.rows.entry(key) {
            dashmap::mapref::entry::Entry::Occupied(mut entry) => {
                let row = entry.get_mut();
                merge_alert(&mut row.alert, alert);
                row.expires_at = expires_at;
            }
            dashmap::mapref::entry::Entry::Vacant(entry) => {
                entry.insert(StoredRow { alert, expires_at });
            }
        }
        Ok(())
    }

    async fn get(&self, key: &AlertKey) -> Result<Option<Alert>, StoreError> {
        match self.rows.get(key) {
            Some(row) if row.expires_at > Utc::now() => Ok(Some(row.alert.clone())),
            _ => Ok(None),
        }
    }
}
