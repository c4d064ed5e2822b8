//! Disappearance / quarantine lifecycle.
//!
//! An entity that vanishes from the live summary is not assumed finished: it
//! is quarantined, and only archived once it has stayed absent for longer
//! than the grace period. Quarantine state lives in process memory only; a
//! restart rediscovers missing entities from the next set difference.

pub mod status;

pub use status::{
    CompletionKeywords, FirstCompleted, SetMajority, StatusStrategy, WinnerFlag, default_strategy,
};

use chrono::{DateTime, Duration, Utc};
use std::collections::{HashMap, HashSet};

/// Transient record of an entity missing from the live summary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuarantineRecord {
    pub entity_id: String,
    pub first_missing_at: DateTime<Utc>,
}

/// Transitions computed by one reconciliation pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileOutcome {
    /// Quarantined ids that reappeared.
    pub released: Vec<String>,
    /// Ids that went missing in this pass.
    pub quarantined: Vec<String>,
    /// Ids missing for longer than the grace period.
    pub due: Vec<String>,
    /// Ids whose summary already reports completion.
    pub completed: Vec<String>,
}

impl ReconcileOutcome {
    /// Everything that should be handed to the archiver this cycle.
    pub fn archive_batch(&self) -> Vec<String> {
        self.due
            .iter()
            .chain(self.completed.iter())
            .cloned()
            .collect()
    }

    pub fn is_quiet(&self) -> bool {
        self.released.is_empty()
            && self.quarantined.is_empty()
            && self.due.is_empty()
            && self.completed.is_empty()
    }
}

/// Quarantine state machine, keyed by entity id.
#[derive(Debug)]
pub struct Reconciler {
    grace_period: Duration,
    quarantine: HashMap<String, QuarantineRecord>,
}

impl Reconciler {
    pub fn new(grace_period: std::time::Duration) -> Self {
        Self {
            grace_period: Duration::from_std(grace_period).unwrap_or(Duration::MAX),
            quarantine: HashMap::new(),
        }
    }

    /// Runs one pass.
    ///
    /// `active_ids` are the ids in the active store after this cycle's
    /// upserts, `live_ids` every id in the latest trusted summary, and
    /// `completed_ids` the subset of `live_ids` whose content already says
    /// finished.
    ///
    /// Archive eligibility is decided before new ids enter quarantine, so an
    /// id is never due in the pass in which it first goes missing.
    pub fn reconcile(
        &mut self,
        active_ids: &HashSet<String>,
        live_ids: &HashSet<String>,
        completed_ids: &HashSet<String>,
        now: DateTime<Utc>,
    ) -> ReconcileOutcome {
        let mut outcome = ReconcileOutcome::default();

        // Records for ids that left the store by other means are stale.
        self.quarantine.retain(|id, _| active_ids.contains(id));

        let released: Vec<String> = self
            .quarantine
            .keys()
            .filter(|id| live_ids.contains(*id))
            .cloned()
            .collect();
        for id in &released {
            self.quarantine.remove(id);
        }
        outcome.released = released;

        outcome.due = self
            .quarantine
            .values()
            .filter(|record| now - record.first_missing_at > self.grace_period)
            .map(|record| record.entity_id.clone())
            .collect();

        for id in active_ids {
            if live_ids.contains(id) || self.quarantine.contains_key(id) {
                continue;
            }
            self.quarantine.insert(
                id.clone(),
                QuarantineRecord {
                    entity_id: id.clone(),
                    first_missing_at: now,
                },
            );
            outcome.quarantined.push(id.clone());
        }

        outcome.completed = completed_ids
            .iter()
            .filter(|id| active_ids.contains(*id))
            .cloned()
            .collect();

        outcome.released.sort();
        outcome.quarantined.sort();
        outcome.due.sort();
        outcome.completed.sort();
        outcome
    }

    /// Drops the records of ids the archiver confirmed.
    pub fn confirm_archived<'a, I>(&mut self, ids: I)
    where
        I: IntoIterator<Item = &'a String>,
    {
        for id in ids {
            self.quarantine.remove(id);
        }
    }

    pub fn is_quarantined(&self, id: &str) -> bool {
        self.quarantine.contains_key(id)
    }

    pub fn record(&self, id: &str) -> Option<&QuarantineRecord> {
        self.quarantine.get(id)
    }

    pub fn quarantined_count(&self) -> usize {
        self.quarantine.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn set(ids: &[&str]) -> HashSet<String> {
        ids.iter().map(|s| s.to_string()).collect()
    }

    fn t(secs: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap() + Duration::seconds(secs)
    }

    fn reconciler() -> Reconciler {
        Reconciler::new(std::time::Duration::from_secs(60))
    }

    #[test]
    fn test_missing_entity_is_quarantined_then_due() {
        let mut r = reconciler();
        let active = set(&["A", "B"]);
        let none = HashSet::new();

        let first = r.reconcile(&active, &set(&["A", "B"]), &none, t(-4));
        assert!(first.is_quiet());

        let second = r.reconcile(&active, &set(&["A"]), &none, t(0));
        assert_eq!(second.quarantined, vec!["B".to_string()]);
        assert!(second.due.is_empty());
        assert!(r.is_quarantined("B"));

        let within = r.reconcile(&active, &set(&["A"]), &none, t(60));
        assert!(within.due.is_empty());

        let after = r.reconcile(&active, &set(&["A"]), &none, t(61));
        assert_eq!(after.due, vec!["B".to_string()]);
        assert_eq!(after.archive_batch(), vec!["B".to_string()]);
    }

    #[test]
    fn test_never_due_on_first_absence() {
        let mut r = Reconciler::new(std::time::Duration::ZERO);
        let active = set(&["A"]);
        let outcome = r.reconcile(&active, &HashSet::new(), &HashSet::new(), t(0));
        assert_eq!(outcome.quarantined, vec!["A".to_string()]);
        assert!(outcome.due.is_empty());

        let next = r.reconcile(&active, &HashSet::new(), &HashSet::new(), t(1));
        assert_eq!(next.due, vec!["A".to_string()]);
    }

    #[test]
    fn test_reappearing_entity_is_released() {
        let mut r = reconciler();
        let active = set(&["A", "B"]);
        let none = HashSet::new();
        r.reconcile(&active, &set(&["A"]), &none, t(0));

        let back = r.reconcile(&active, &set(&["A", "B"]), &none, t(120));
        assert_eq!(back.released, vec!["B".to_string()]);
        assert!(back.due.is_empty());
        assert!(!r.is_quarantined("B"));

        // A fresh absence restarts the clock.
        r.reconcile(&active, &set(&["A"]), &none, t(130));
        assert_eq!(r.record("B").unwrap().first_missing_at, t(130));
        let early = r.reconcile(&active, &set(&["A"]), &none, t(150));
        assert!(early.due.is_empty());
    }

    #[test]
    fn test_due_entity_stays_quarantined_until_confirmed() {
        let mut r = reconciler();
        let active = set(&["B"]);
        let none = HashSet::new();
        r.reconcile(&active, &none, &none, t(0));

        assert_eq!(r.reconcile(&active, &none, &none, t(61)).due, vec!["B"]);
        // Archive failed: still due next cycle.
        assert_eq!(r.reconcile(&active, &none, &none, t(65)).due, vec!["B"]);

        r.confirm_archived(&["B".to_string()]);
        assert!(!r.is_quarantined("B"));
    }

    #[test]
    fn test_records_dropped_when_id_leaves_store() {
        let mut r = reconciler();
        let none = HashSet::new();
        r.reconcile(&set(&["B"]), &none, &none, t(0));
        assert_eq!(r.quarantined_count(), 1);

        let outcome = r.reconcile(&HashSet::new(), &none, &none, t(100));
        assert!(outcome.due.is_empty());
        assert_eq!(r.quarantined_count(), 0);
    }

    #[test]
    fn test_completed_status_skips_quarantine() {
        let mut r = reconciler();
        let active = set(&["A", "C"]);
        let outcome = r.reconcile(&active, &set(&["A", "C"]), &set(&["C", "unknown"]), t(0));
        assert_eq!(outcome.completed, vec!["C".to_string()]);
        assert!(outcome.quarantined.is_empty());
        assert_eq!(outcome.archive_batch(), vec!["C".to_string()]);
    }

    #[test]
    fn test_unknown_live_ids_are_ignored() {
        let mut r = reconciler();
        let outcome = r.reconcile(&HashSet::new(), &set(&["X"]), &HashSet::new(), t(0));
        assert!(outcome.is_quiet());
    }
}
