use super::persistence::{SnapshotManager, StoreSnapshot};
use super::{ArchivedEntity, EntityStore, InsertOutcome, RecordInsert, UpsertOutcome};
use crate::core::{DetailRecord, FeedError, LiveEntity, Result, SummaryRecord};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use im::OrdMap;
use std::collections::HashSet;
use std::path::Path;
use std::sync::Mutex;
use tokio::sync::RwLock;
use tracing::{Level, event};

#[derive(Debug, Clone, Default)]
struct Collections {
    active: OrdMap<String, LiveEntity>,
    history: OrdMap<String, ArchivedEntity>,
}

/// Failure injection used to exercise partial-failure paths.
#[derive(Debug, Default)]
struct FaultPlan {
    unavailable: bool,
    fail_next_bulk_insert: Option<String>,
    failing_history_ids: HashSet<String>,
}

/// In-process entity store
///
/// Both collections are persistent maps, so `find_all` and checkpoints clone
/// them in constant time without holding the lock while serializing.
/// Optionally backed by a MessagePack snapshot on disk.
pub struct MemoryStore {
    collections: RwLock<Collections>,
    faults: Mutex<FaultPlan>,
    snapshots: Option<SnapshotManager>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    /// Create an empty, purely in-memory store
    pub fn new() -> Self {
        Self {
            collections: RwLock::new(Collections::default()),
            faults: Mutex::new(FaultPlan::default()),
            snapshots: None,
        }
    }

    /// Open a store backed by a snapshot file, loading it if present
    pub fn open<P: AsRef<Path>>(snapshot_path: P) -> Result<Self> {
        let manager = SnapshotManager::new(snapshot_path);
        let collections = match manager.load()? {
            Some(snapshot) => {
                event!(
                    Level::INFO,
                    active = snapshot.active.len(),
                    history = snapshot.history.len(),
                    "store snapshot loaded"
                );
                Collections {
                    active: snapshot.active,
                    history: snapshot.history,
                }
            }
            None => Collections::default(),
        };
        Ok(Self {
            collections: RwLock::new(collections),
            faults: Mutex::new(FaultPlan::default()),
            snapshots: Some(manager),
        })
    }

    /// Write the current collections to the snapshot file, if configured
    pub async fn checkpoint(&self) -> Result<()> {
        let Some(manager) = self.snapshots.as_ref() else {
            return Ok(());
        };
        let snapshot = {
            let guard = self.collections.read().await;
            StoreSnapshot::new(guard.active.clone(), guard.history.clone())
        };
        manager.save(&snapshot)?;
        event!(
            Level::DEBUG,
            active = snapshot.metadata.active_count,
            history = snapshot.metadata.history_count,
            "store checkpoint written"
        );
        Ok(())
    }

    pub async fn get(&self, id: &str) -> Option<LiveEntity> {
        self.collections.read().await.active.get(id).cloned()
    }

    pub async fn history_get(&self, id: &str) -> Option<ArchivedEntity> {
        self.collections.read().await.history.get(id).cloned()
    }

    pub async fn active_len(&self) -> usize {
        self.collections.read().await.active.len()
    }

    /// Put a record straight into the active collection.
    pub async fn seed_active(&self, entity: LiveEntity) {
        let mut guard = self.collections.write().await;
        guard.active.insert(entity.id.clone(), entity);
    }

    /// Put a record straight into history.
    pub async fn seed_history(&self, entity: LiveEntity, archived_at: DateTime<Utc>) {
        let mut guard = self.collections.write().await;
        guard.history.insert(
            entity.id.clone(),
            ArchivedEntity {
                entity,
                archived_at,
            },
        );
    }

    /// Make every call fail with `StoreUnavailable` until cleared.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.with_faults(|faults| faults.unavailable = unavailable);
    }

    /// Fail the next `insert_history` call as a whole.
    pub fn fail_next_bulk_insert(&self, reason: impl Into<String>) {
        let reason = reason.into();
        self.with_faults(|faults| faults.fail_next_bulk_insert = Some(reason));
    }

    /// Report a non-duplicate error for this id on every history insert.
    pub fn fail_history_insert_for(&self, id: impl Into<String>) {
        let id = id.into();
        self.with_faults(|faults| {
            faults.failing_history_ids.insert(id);
        });
    }

    pub fn clear_faults(&self) {
        self.with_faults(|faults| *faults = FaultPlan::default());
    }

    fn with_faults<T>(&self, f: impl FnOnce(&mut FaultPlan) -> T) -> T {
        let mut faults = self.faults.lock().unwrap_or_else(|e| e.into_inner());
        f(&mut faults)
    }

    fn ensure_available(&self) -> Result<()> {
        if self.with_faults(|faults| faults.unavailable) {
            return Err(FeedError::StoreUnavailable(
                "store is not reachable".to_string(),
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl EntityStore for MemoryStore {
    async fn health_check(&self) -> Result<()> {
        self.ensure_available()
    }

    async fn upsert_summary(
        &self,
        record: SummaryRecord,
        observed_at: DateTime<Utc>,
    ) -> Result<UpsertOutcome> {
        self.ensure_available()?;
        let mut guard = self.collections.write().await;
        let active = &mut guard.active;
        if let Some(existing) = active.get_mut(&record.id) {
            existing.apply_summary(record, observed_at);
            return Ok(UpsertOutcome::Updated);
        }
        let entity = LiveEntity::from_summary(record, observed_at);
        active.insert(entity.id.clone(), entity);
        Ok(UpsertOutcome::Inserted)
    }

    async fn merge_detail(
        &self,
        id: &str,
        detail: DetailRecord,
        refreshed_at: DateTime<Utc>,
    ) -> Result<bool> {
        self.ensure_available()?;
        let mut guard = self.collections.write().await;
        match guard.active.get_mut(id) {
            Some(existing) => {
                existing.apply_detail(detail, refreshed_at);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn find_all(&self) -> Result<Vec<LiveEntity>> {
        self.ensure_available()?;
        let active = self.collections.read().await.active.clone();
        Ok(active.values().cloned().collect())
    }

    async fn find_ids(&self) -> Result<HashSet<String>> {
        self.ensure_available()?;
        let guard = self.collections.read().await;
        Ok(guard.active.keys().cloned().collect())
    }

    async fn find_by_ids(&self, ids: &[String]) -> Result<Vec<LiveEntity>> {
        self.ensure_available()?;
        let guard = self.collections.read().await;
        Ok(ids
            .iter()
            .filter_map(|id| guard.active.get(id).cloned())
            .collect())
    }

    async fn find_needing_enrichment(
        &self,
        refreshed_before: DateTime<Utc>,
    ) -> Result<Vec<String>> {
        self.ensure_available()?;
        let guard = self.collections.read().await;
        Ok(guard
            .active
            .values()
            .filter(|entity| match entity.detail_refreshed_at {
                _ if !entity.has_detail => true,
                None => true,
                Some(refreshed) => refreshed < refreshed_before,
            })
            .map(|entity| entity.id.clone())
            .collect())
    }

    async fn find_stale(&self, observed_before: DateTime<Utc>) -> Result<Vec<String>> {
        self.ensure_available()?;
        let guard = self.collections.read().await;
        Ok(guard
            .active
            .values()
            .filter(|entity| entity.last_observed_at < observed_before)
            .map(|entity| entity.id.clone())
            .collect())
    }

    async fn delete_ids(&self, ids: &[String]) -> Result<usize> {
        self.ensure_available()?;
        let mut guard = self.collections.write().await;
        let mut deleted = 0;
        for id in ids {
            if guard.active.remove(id).is_some() {
                deleted += 1;
            }
        }
        Ok(deleted)
    }

    async fn insert_history(&self, records: Vec<ArchivedEntity>) -> Result<Vec<RecordInsert>> {
        self.ensure_available()?;
        let (bulk_failure, failing_ids) = self.with_faults(|faults| {
            (
                faults.fail_next_bulk_insert.take(),
                faults.failing_history_ids.clone(),
            )
        });
        if let Some(reason) = bulk_failure {
            return Err(FeedError::StoreUnavailable(reason));
        }

        let mut guard = self.collections.write().await;
        let mut results = Vec::with_capacity(records.len());
        for record in records {
            let id = record.entity.id.clone();
            let outcome = if failing_ids.contains(&id) {
                InsertOutcome::Failed(format!("write rejected for '{}'", id))
            } else if guard.history.contains_key(&id) {
                InsertOutcome::Duplicate
            } else {
                guard.history.insert(id.clone(), record);
                InsertOutcome::Inserted
            };
            results.push(RecordInsert { id, outcome });
        }
        Ok(results)
    }

    async fn close(&self) -> Result<()> {
        self.checkpoint().await
    }
}
