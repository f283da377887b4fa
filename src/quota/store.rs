//! Durable quota store interface.
//!
//! The remote side is a collaborator, specified only here: `load` a record
//! (creating the default full record for a first-seen owner) and `save` one
//! back. Store failures surface as [`StoreError::Unavailable`] and callers
//! fall back to the local cache rather than block.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use tokio::sync::Mutex;

use super::engine::QuotaEngine;
use super::QuotaRecord;
use crate::storage::{QuotaRow, Storage};

/// Errors returned by a quota store.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The store could not be reached or the row could not be read/written.
    /// Absorbed by the cache — surfaced only as a logged diagnostic.
    #[error("quota store unavailable: {0}")]
    Unavailable(#[source] anyhow::Error),
}

/// Durable per-owner quota persistence.
#[async_trait]
pub trait QuotaStore: Send + Sync {
    /// Load the record for `owner`, creating the default full record if the
    /// owner has never been observed.
    async fn load(&self, owner: &str) -> Result<QuotaRecord, StoreError>;

    /// Persist the record for `owner`. Last writer wins.
    async fn save(&self, owner: &str, record: &QuotaRecord) -> Result<(), StoreError>;
}

// ── SQLite-backed store ──────────────────────────────────────────────────────

/// [`QuotaStore`] over the daemon's SQLite [`Storage`].
pub struct SqliteQuotaStore {
    storage: Storage,
    engine: QuotaEngine,
}

impl SqliteQuotaStore {
    pub fn new(storage: Storage, engine: QuotaEngine) -> Self {
        Self { storage, engine }
    }
}

#[async_trait]
impl QuotaStore for SqliteQuotaStore {
    async fn load(&self, owner: &str) -> Result<QuotaRecord, StoreError> {
        let row = self
            .storage
            .get_quota(owner)
            .await
            .map_err(StoreError::Unavailable)?;
        match row {
            Some(row) => record_from_row(&row).map_err(StoreError::Unavailable),
            None => Ok(self.engine.fresh_record(Some(owner.to_string()))),
        }
    }

    async fn save(&self, owner: &str, record: &QuotaRecord) -> Result<(), StoreError> {
        let json = timestamps_to_json(&record.deducted_at);
        self.storage
            .upsert_quota(owner, record.count as i64, &json)
            .await
            .map_err(StoreError::Unavailable)
    }
}

/// Serialize deduction instants as a JSON array of epoch milliseconds —
/// the store's one consistently chosen encoding.
fn timestamps_to_json(instants: &[DateTime<Utc>]) -> String {
    let millis: Vec<i64> = instants.iter().map(|t| t.timestamp_millis()).collect();
    serde_json::to_string(&millis).unwrap_or_else(|_| "[]".to_string())
}

fn record_from_row(row: &QuotaRow) -> anyhow::Result<QuotaRecord> {
    let millis: Vec<i64> = serde_json::from_str(&row.deducted_at)
        .map_err(|e| anyhow::anyhow!("corrupt deducted_at for {}: {e}", row.owner_id))?;
    let deducted_at = millis
        .into_iter()
        .filter_map(DateTime::from_timestamp_millis)
        .collect();
    Ok(QuotaRecord {
        count: row.count.clamp(0, u8::MAX as i64) as u8,
        deducted_at,
        owner: Some(row.owner_id.clone()),
    })
}

// ── In-memory store ──────────────────────────────────────────────────────────

/// In-memory [`QuotaStore`] for tests and anonymous/local-only subjects.
pub struct MemoryQuotaStore {
    engine: QuotaEngine,
    records: Mutex<HashMap<String, QuotaRecord>>,
}

impl MemoryQuotaStore {
    pub fn new(engine: QuotaEngine) -> Self {
        Self {
            engine,
            records: Mutex::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl QuotaStore for MemoryQuotaStore {
    async fn load(&self, owner: &str) -> Result<QuotaRecord, StoreError> {
        let records = self.records.lock().await;
        Ok(records
            .get(owner)
            .cloned()
            .unwrap_or_else(|| self.engine.fresh_record(Some(owner.to_string()))))
    }

    async fn save(&self, owner: &str, record: &QuotaRecord) -> Result<(), StoreError> {
        self.records
            .lock()
            .await
            .insert(owner.to_string(), record.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timestamps_round_trip_through_epoch_millis() {
        let now = DateTime::from_timestamp_millis(Utc::now().timestamp_millis()).unwrap();
        let json = timestamps_to_json(&[now]);
        let row = QuotaRow {
            owner_id: "alice".into(),
            count: 2,
            deducted_at: json,
            updated_at: Utc::now().to_rfc3339(),
        };
        let record = record_from_row(&row).unwrap();
        assert_eq!(record.count, 2);
        assert_eq!(record.deducted_at, vec![now]);
        assert_eq!(record.owner.as_deref(), Some("alice"));
    }

    #[test]
    fn corrupt_json_is_an_error_not_a_panic() {
        let row = QuotaRow {
            owner_id: "bob".into(),
            count: 3,
            deducted_at: "not json".into(),
            updated_at: Utc::now().to_rfc3339(),
        };
        assert!(record_from_row(&row).is_err());
    }

    #[tokio::test]
    async fn memory_store_returns_fresh_record_for_unknown_owner() {
        let store = MemoryQuotaStore::new(QuotaEngine::default());
        let record = store.load("never-seen").await.unwrap();
        assert_eq!(record.count, 3);
        assert!(record.deducted_at.is_empty());
    }
}
