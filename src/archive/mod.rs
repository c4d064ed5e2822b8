//! Moves finished entities from the active collection into history.
//!
//! The copy always happens before the delete, and a record is only deleted
//! once history is known to hold it. Retrying is always safe; losing a record
//! never is.

use crate::core::{LiveEntity, Result};
use crate::storage::{ArchivedEntity, EntityStore, InsertOutcome};
use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{Level, event};

/// What happened to each id of an archive batch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ArchiveReport {
    /// Copied into history by this call.
    pub inserted: Vec<String>,
    /// Already present in history.
    pub duplicates: Vec<String>,
    /// Rejected by history for another reason; left in the active store.
    pub failed: Vec<(String, String)>,
    /// Requested but no longer in the active store.
    pub missing: Vec<String>,
    /// Records removed from the active store.
    pub deleted: usize,
}

impl ArchiveReport {
    /// Ids that are no longer in the active store as a result of this call
    /// (or were already gone).
    pub fn settled_ids(&self) -> Vec<String> {
        self.inserted
            .iter()
            .chain(self.duplicates.iter())
            .chain(self.missing.iter())
            .cloned()
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.inserted.is_empty()
            && self.duplicates.is_empty()
            && self.failed.is_empty()
            && self.missing.is_empty()
    }
}

pub struct Archiver {
    store: Arc<dyn EntityStore>,
}

impl Archiver {
    pub fn new(store: Arc<dyn EntityStore>) -> Self {
        Self { store }
    }

    /// Copies the given active records into history, then deletes the ones
    /// history confirmed (inserted or duplicate).
    ///
    /// A failed read or a failed bulk insert returns an error and deletes
    /// nothing.
    pub async fn archive_by_ids(
        &self,
        ids: &[String],
        now: DateTime<Utc>,
    ) -> Result<ArchiveReport> {
        let mut report = ArchiveReport::default();
        if ids.is_empty() {
            return Ok(report);
        }

        let mut unique: Vec<String> = ids.to_vec();
        unique.sort();
        unique.dedup();

        let records: Vec<LiveEntity> = self.store.find_by_ids(&unique).await.map_err(|err| {
            event!(Level::ERROR, error = %err, "archiver could not read records");
            err
        })?;

        let found: HashSet<&str> = records.iter().map(|r| r.id.as_str()).collect();
        report.missing = unique
            .iter()
            .filter(|id| !found.contains(id.as_str()))
            .cloned()
            .collect();

        if records.is_empty() {
            return Ok(report);
        }

        let requested: Vec<String> = records.iter().map(|r| r.id.clone()).collect();
        let batch = records
            .into_iter()
            .map(|entity| ArchivedEntity {
                entity,
                archived_at: now,
            })
            .collect();

        let results = self.store.insert_history(batch).await.map_err(|err| {
            event!(
                Level::ERROR,
                error = %err,
                batch = requested.len(),
                "history insert failed; nothing deleted"
            );
            err
        })?;

        let mut outcomes: HashMap<String, InsertOutcome> = results
            .into_iter()
            .map(|result| (result.id, result.outcome))
            .collect();

        let mut safe = Vec::with_capacity(requested.len());
        for id in requested {
            let outcome = outcomes
                .remove(&id)
                .unwrap_or_else(|| InsertOutcome::Failed("no outcome reported by history".into()));
            if outcome.is_durable() {
                safe.push(id.clone());
            }
            match outcome {
                InsertOutcome::Inserted => report.inserted.push(id),
                InsertOutcome::Duplicate => report.duplicates.push(id),
                InsertOutcome::Failed(reason) => report.failed.push((id, reason)),
            }
        }

        if !report.duplicates.is_empty() || !report.failed.is_empty() {
            event!(
                Level::WARN,
                duplicates = report.duplicates.len(),
                failed = report.failed.len(),
                "history insert had per-record errors"
            );
        }

        if safe.is_empty() {
            event!(Level::INFO, "no records cleared from the active store");
            return Ok(report);
        }

        report.deleted = self.store.delete_ids(&safe).await?;
        event!(
            Level::INFO,
            inserted = report.inserted.len(),
            duplicates = report.duplicates.len(),
            deleted = report.deleted,
            "archived records"
        );
        Ok(report)
    }

    /// Safety net: archives every active record not observed since
    /// `observed_before`, whatever the reconciler thinks of it.
    pub async fn sweep_stale(
        &self,
        observed_before: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<ArchiveReport> {
        let stale = self.store.find_stale(observed_before).await?;
        if stale.is_empty() {
            return Ok(ArchiveReport::default());
        }
        event!(
            Level::WARN,
            count = stale.len(),
            "stale records found; archiving"
        );
        self.archive_by_ids(&stale, now).await
    }
}
