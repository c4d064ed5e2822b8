//! Read-optimized view of the active store, rebuilt at the end of each cycle.

use crate::core::LiveEntity;
use chrono::{DateTime, Utc};
use im::OrdMap;
use serde::Serialize;
use std::sync::{Arc, RwLock};
use thiserror::Error;

/// Immutable copy of the active store at `built_at`.
#[derive(Debug, Clone, PartialEq)]
pub struct LiveSnapshot {
    pub built_at: DateTime<Utc>,
    entities: OrdMap<String, LiveEntity>,
}

impl LiveSnapshot {
    pub fn new(built_at: DateTime<Utc>, entities: Vec<LiveEntity>) -> Self {
        Self {
            built_at,
            entities: entities.into_iter().map(|e| (e.id.clone(), e)).collect(),
        }
    }

    pub fn get(&self, id: &str) -> Option<&LiveEntity> {
        self.entities.get(id)
    }

    pub fn entities(&self) -> impl Iterator<Item = &LiveEntity> {
        self.entities.values()
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum QueryError {
    #[error("No snapshot has been built yet")]
    Unavailable,

    #[error("Entity '{0}' not found")]
    NotFound(String),
}

impl QueryError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::Unavailable => "unavailable",
            Self::NotFound(_) => "not_found",
        }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotView {
    pub built_at: DateTime<Utc>,
    pub age_seconds: i64,
    pub entity_count: usize,
    pub entities: Vec<LiveEntity>,
}

/// Shared slot holding the latest published snapshot.
///
/// Writers swap in a whole new `Arc`; readers clone the `Arc` and never see a
/// half-built snapshot.
#[derive(Debug, Clone, Default)]
pub struct SnapshotCell {
    slot: Arc<RwLock<Option<Arc<LiveSnapshot>>>>,
}

impl SnapshotCell {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn publish(&self, snapshot: LiveSnapshot) -> Arc<LiveSnapshot> {
        let snapshot = Arc::new(snapshot);
        *self.slot.write().unwrap_or_else(|e| e.into_inner()) = Some(snapshot.clone());
        snapshot
    }

    /// Forget the current snapshot; readers get `Unavailable` until the next
    /// publish.
    pub fn clear(&self) {
        *self.slot.write().unwrap_or_else(|e| e.into_inner()) = None;
    }

    pub fn current(&self) -> Option<Arc<LiveSnapshot>> {
        self.slot.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn reader(&self) -> SnapshotReader {
        SnapshotReader { cell: self.clone() }
    }
}

#[derive(Debug, Clone)]
pub struct SnapshotReader {
    cell: SnapshotCell,
}

impl SnapshotReader {
    pub fn read_all(&self, now: DateTime<Utc>) -> Result<SnapshotView, QueryError> {
        let snapshot = self.cell.current().ok_or(QueryError::Unavailable)?;
        Ok(SnapshotView {
            built_at: snapshot.built_at,
            age_seconds: (now - snapshot.built_at).num_seconds().max(0),
            entity_count: snapshot.len(),
            entities: snapshot.entities().cloned().collect(),
        })
    }

    pub fn read_one(&self, id: &str) -> Result<LiveEntity, QueryError> {
        let snapshot = self.cell.current().ok_or(QueryError::Unavailable)?;
        snapshot
            .get(id)
            .cloned()
            .ok_or_else(|| QueryError::NotFound(id.to_string()))
    }

    pub fn is_available(&self) -> bool {
        self.cell.current().is_some()
    }
}
