//! Persistent store boundary: the active collection keyed by entity id and
//! the append-only history collection.

pub mod memory;
pub mod persistence;

pub use memory::MemoryStore;
pub use persistence::{SnapshotManager, StoreSnapshot};

use crate::core::{DetailRecord, LiveEntity, Result, SummaryRecord};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// A record as kept in the history collection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArchivedEntity {
    pub entity: LiveEntity,
    pub archived_at: DateTime<Utc>,
}

/// Result of a fast-lane upsert.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Inserted,
    Updated,
}

/// Per-record result of a bulk history insert.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted,
    /// The id already exists in history (an earlier, possibly interrupted run).
    Duplicate,
    Failed(String),
}

impl InsertOutcome {
    /// True when the record is known to be durably present in history.
    pub fn is_durable(&self) -> bool {
        matches!(self, InsertOutcome::Inserted | InsertOutcome::Duplicate)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordInsert {
    pub id: String,
    pub outcome: InsertOutcome,
}

/// Storage operations the feed needs.
///
/// Every mutation is a per-id upsert or delete; no call spans a cross-entity
/// transaction.
#[async_trait]
pub trait EntityStore: Send + Sync {
    /// Startup capability check.
    async fn health_check(&self) -> Result<()>;

    /// Sets identity, participants and score; enrichment fields are only
    /// initialised when the record is created.
    async fn upsert_summary(
        &self,
        record: SummaryRecord,
        observed_at: DateTime<Utc>,
    ) -> Result<UpsertOutcome>;

    /// Attaches enrichment to an existing record without touching its score.
    /// Returns `false` when the id is no longer in the active collection.
    async fn merge_detail(
        &self,
        id: &str,
        detail: DetailRecord,
        refreshed_at: DateTime<Utc>,
    ) -> Result<bool>;

    async fn find_all(&self) -> Result<Vec<LiveEntity>>;

    async fn find_ids(&self) -> Result<HashSet<String>>;

    async fn find_by_ids(&self, ids: &[String]) -> Result<Vec<LiveEntity>>;

    /// Ids never enriched, or enriched before `refreshed_before`.
    async fn find_needing_enrichment(&self, refreshed_before: DateTime<Utc>)
    -> Result<Vec<String>>;

    /// Ids whose `last_observed_at` is older than `observed_before`.
    async fn find_stale(&self, observed_before: DateTime<Utc>) -> Result<Vec<String>>;

    async fn delete_ids(&self, ids: &[String]) -> Result<usize>;

    /// Unordered bulk insert into history with a per-record outcome.
    ///
    /// An `Err` means the call failed as a whole and nothing can be assumed
    /// about any record.
    async fn insert_history(
        &self,
        records: Vec<ArchivedEntity>,
    ) -> Result<Vec<RecordInsert>>;

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}
