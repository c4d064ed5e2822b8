//! Snapshot persistence for the in-memory entity store

use super::ArchivedEntity;
use crate::core::{FeedError, LiveEntity, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use im::OrdMap;
use std::fs::{self, File};
use std::io::{BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;

/// Current on-disk snapshot format.
pub const SNAPSHOT_FORMAT_VERSION: u32 = 1;

// ============================================================================
// Store Snapshot
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreSnapshot {
    pub version: u32,
    pub active: OrdMap<String, LiveEntity>,
    pub history: OrdMap<String, ArchivedEntity>,
    pub metadata: SnapshotMetadata,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotMetadata {
    pub created_at: DateTime<Utc>,
    pub active_count: usize,
    pub history_count: usize,
}

impl StoreSnapshot {
    pub fn new(
        active: OrdMap<String, LiveEntity>,
        history: OrdMap<String, ArchivedEntity>,
    ) -> Self {
        let metadata = SnapshotMetadata {
            created_at: Utc::now(),
            active_count: active.len(),
            history_count: history.len(),
        };
        Self {
            version: SNAPSHOT_FORMAT_VERSION,
            active,
            history,
            metadata,
        }
    }
}

// ============================================================================
// Snapshot Manager
// ============================================================================

pub struct SnapshotManager {
    snapshot_path: PathBuf,
}

impl SnapshotManager {
    pub fn new<P: AsRef<Path>>(snapshot_path: P) -> Self {
        Self {
            snapshot_path: snapshot_path.as_ref().to_path_buf(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.snapshot_path
    }

    /// Writes the snapshot to a temp file in the same directory and renames
    /// it over the previous one, so a crash never leaves a torn snapshot.
    pub fn save(&self, snapshot: &StoreSnapshot) -> Result<()> {
        let dir = match self.snapshot_path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        fs::create_dir_all(&dir)
            .map_err(|e| FeedError::Io(format!("Failed to create snapshot directory: {}", e)))?;

        let serialized = rmp_serde::to_vec_named(snapshot).map_err(|e| {
            FeedError::Serialization(format!("Failed to serialize snapshot: {}", e))
        })?;

        let temp = NamedTempFile::new_in(&dir)
            .map_err(|e| FeedError::Io(format!("Failed to create temp file: {}", e)))?;
        {
            let mut writer = BufWriter::new(temp.as_file());
            writer
                .write_all(&serialized)
                .map_err(|e| FeedError::Io(format!("Failed to write snapshot: {}", e)))?;
            writer
                .flush()
                .map_err(|e| FeedError::Io(format!("Failed to flush snapshot: {}", e)))?;
        }
        temp.as_file()
            .sync_all()
            .map_err(|e| FeedError::Io(format!("Failed to sync snapshot: {}", e)))?;
        temp.persist(&self.snapshot_path)
            .map_err(|e| FeedError::Io(format!("Failed to rename snapshot: {}", e.error)))?;
        Ok(())
    }

    pub fn load(&self) -> Result<Option<StoreSnapshot>> {
        if !self.snapshot_path.exists() {
            return Ok(None);
        }
        let mut file = File::open(&self.snapshot_path)
            .map_err(|e| FeedError::Io(format!("Failed to open snapshot: {}", e)))?;
        let mut data = Vec::new();
        file.read_to_end(&mut data)
            .map_err(|e| FeedError::Io(format!("Failed to read snapshot: {}", e)))?;
        let snapshot: StoreSnapshot = rmp_serde::from_slice(&data).map_err(|e| {
            FeedError::Serialization(format!("Failed to deserialize snapshot: {}", e))
        })?;
        if snapshot.version != SNAPSHOT_FORMAT_VERSION {
            return Err(FeedError::Serialization(format!(
                "Unsupported snapshot version {} (expected {})",
                snapshot.version, SNAPSHOT_FORMAT_VERSION
            )));
        }
        Ok(Some(snapshot))
    }

    pub fn exists(&self) -> bool {
        self.snapshot_path.exists()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{Participant, ScoreState, SummaryRecord};
    use tempfile::TempDir;

    fn entity(id: &str) -> LiveEntity {
        LiveEntity::from_summary(
            SummaryRecord::new(
                id,
                "ITF M25",
                Participant::new("A"),
                Participant::new("B"),
                ScoreState::default(),
            ),
            Utc::now(),
        )
    }

    #[test]
    fn test_save_and_load() {
        let dir = TempDir::new().unwrap();
        let manager = SnapshotManager::new(dir.path().join("store.snapshot"));
        assert!(!manager.exists());

        let mut active = OrdMap::new();
        active.insert("a".to_string(), entity("a"));
        let mut history = OrdMap::new();
        history.insert(
            "h".to_string(),
            ArchivedEntity {
                entity: entity("h"),
                archived_at: Utc::now(),
            },
        );

        manager.save(&StoreSnapshot::new(active, history)).unwrap();
        assert!(manager.exists());

        let loaded = manager.load().unwrap().unwrap();
        assert_eq!(loaded.metadata.active_count, 1);
        assert_eq!(loaded.metadata.history_count, 1);
        assert!(loaded.active.contains_key("a"));
        assert_eq!(loaded.history.get("h").unwrap().entity.id, "h");
    }

    #[test]
    fn test_load_missing_is_none() {
        let dir = TempDir::new().unwrap();
        let manager = SnapshotManager::new(dir.path().join("absent.snapshot"));
        assert!(manager.load().unwrap().is_none());
    }

    #[test]
    fn test_save_overwrites_previous() {
        let dir = TempDir::new().unwrap();
        let manager = SnapshotManager::new(dir.path().join("store.snapshot"));

        let mut first = OrdMap::new();
        first.insert("a".to_string(), entity("a"));
        first.insert("b".to_string(), entity("b"));
        manager
            .save(&StoreSnapshot::new(first, OrdMap::new()))
            .unwrap();

        let mut second = OrdMap::new();
        second.insert("c".to_string(), entity("c"));
        manager
            .save(&StoreSnapshot::new(second, OrdMap::new()))
            .unwrap();

        let loaded = manager.load().unwrap().unwrap();
        assert_eq!(loaded.active.len(), 1);
        assert!(loaded.active.contains_key("c"));
    }
}
