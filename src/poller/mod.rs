//! Two-speed feed poller.
//!
//! The fast lane polls the live summary and upserts the score projection.
//! The slow lane enriches records through the detail worker pool. After
//! either lane has written to the store, the same pipeline runs:
//! reconcile, archive, sweep, rebuild the snapshot, check for stalls.
//!
//! An untrusted summary (call failed, or `ok == false`) skips the whole fast
//! cycle. Nothing is ever pruned on uncertain data.

pub mod snapshot;

pub use snapshot::{LiveSnapshot, QueryError, SnapshotCell, SnapshotReader, SnapshotView};

use crate::archive::Archiver;
use crate::config::FeedConfig;
use crate::core::{Clock, EntityStatus, FeedError, Result};
use crate::lifecycle::{ReconcileOutcome, Reconciler};
use crate::notify::NotificationSink;
use crate::pool::{DetailWorkerPool, PoolStats};
use crate::source::{SourceAdapter, SourceAdapterFactory};
use crate::stall::{StallAlert, StallDetector};
use crate::storage::EntityStore;
use chrono::{DateTime, Utc};
use std::collections::HashSet;
use std::fmt;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{Instrument, Level, event, info_span};

/// Upper bound on how long shutdown waits for busy detail workers.
const POOL_SHUTDOWN_WAIT: Duration = Duration::from_secs(10);

/// Collaborators the poller is built from.
#[derive(Clone)]
pub struct FeedComponents {
    /// Summary adapter used by the fast lane.
    pub source: Arc<dyn SourceAdapter>,
    /// Builds one adapter per detail worker.
    pub detail_factory: Arc<dyn SourceAdapterFactory>,
    pub store: Arc<dyn EntityStore>,
    pub notifier: Arc<dyn NotificationSink>,
    pub clock: Arc<dyn Clock>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lane {
    Fast,
    Slow,
}

impl fmt::Display for Lane {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Lane::Fast => write!(f, "fast"),
            Lane::Slow => write!(f, "slow"),
        }
    }
}

/// What one cycle did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleReport {
    /// The summary was untrusted and nothing was touched.
    pub skipped: bool,
    pub upserted: usize,
    pub enriched: usize,
    pub enrich_failed: usize,
    /// `None` when no trusted summary exists yet.
    pub reconcile: Option<ReconcileOutcome>,
    /// Ids removed from the active store by archival this cycle.
    pub archived: Vec<String>,
    /// Ids removed by the stale sweep this cycle.
    pub swept: Vec<String>,
    pub alerts: usize,
}

impl CycleReport {
    fn skipped() -> Self {
        Self {
            skipped: true,
            ..Self::default()
        }
    }
}

/// Ids of the latest trusted summary.
#[derive(Debug, Clone, Default)]
struct LiveSet {
    ids: HashSet<String>,
    completed: HashSet<String>,
}

/// State owned by the post-update pipeline. The mutex around it keeps the
/// fast and slow lanes from interleaving their pipeline runs.
struct Pipeline {
    reconciler: Reconciler,
    stall: StallDetector,
    live: Option<LiveSet>,
}

struct Shared {
    config: FeedConfig,
    parts: FeedComponents,
    archiver: Archiver,
    snapshots: SnapshotCell,
    pool: RwLock<Option<Arc<DetailWorkerPool>>>,
    pool_init: Mutex<()>,
    pipeline: Mutex<Pipeline>,
}

#[derive(Clone)]
pub struct FeedPoller {
    shared: Arc<Shared>,
}

impl FeedPoller {
    pub fn new(config: FeedConfig, parts: FeedComponents, snapshots: SnapshotCell) -> Self {
        let pipeline = Pipeline {
            reconciler: Reconciler::new(config.grace_period),
            stall: StallDetector::new(config.stall_threshold),
            live: None,
        };
        Self {
            shared: Arc::new(Shared {
                archiver: Archiver::new(parts.store.clone()),
                config,
                parts,
                snapshots,
                pool: RwLock::new(None),
                pool_init: Mutex::new(()),
                pipeline: Mutex::new(pipeline),
            }),
        }
    }

    pub fn snapshots(&self) -> &SnapshotCell {
        &self.shared.snapshots
    }

    /// `None` until the pool has been built.
    pub fn pool_stats(&self) -> Option<PoolStats> {
        self.shared.current_pool().map(|pool| pool.stats())
    }

    pub async fn is_quarantined(&self, id: &str) -> bool {
        self.shared.pipeline.lock().await.reconciler.is_quarantined(id)
    }

    /// One fast-lane cycle.
    pub async fn run_fast_cycle(&self) -> Result<CycleReport> {
        let shared = self.shared.clone();
        shared
            .fast_cycle()
            .instrument(info_span!("feed_cycle", lane = %Lane::Fast))
            .await
    }

    /// One slow-lane cycle.
    pub async fn run_slow_cycle(&self) -> Result<CycleReport> {
        let shared = self.shared.clone();
        shared
            .slow_cycle()
            .instrument(info_span!("feed_cycle", lane = %Lane::Slow))
            .await
    }

    /// Check the source and the store, then spawn both lanes.
    ///
    /// A source that cannot start is the one unrecoverable condition: the
    /// error is returned and nothing is spawned.
    pub async fn start(&self) -> Result<PollerHandle> {
        let parts = &self.shared.parts;
        if let Err(err) = parts.source.start().await {
            event!(Level::ERROR, error = %err, "source adapter failed to start");
            return Err(err);
        }
        if let Err(err) = parts.store.health_check().await {
            event!(Level::ERROR, error = %err, "store health check failed");
            if let Err(close_err) = parts.source.close().await {
                event!(Level::WARN, error = %close_err, "source close failed");
            }
            return Err(err);
        }

        let (stop_tx, stop_rx) = watch::channel(false);
        let fast = tokio::spawn(fast_loop(self.clone(), stop_rx.clone()));
        let slow = tokio::spawn(slow_loop(self.clone(), stop_rx));
        event!(
            Level::INFO,
            fast_ms = millis(self.shared.config.fast_interval),
            slow_ms = millis(self.shared.config.slow_interval),
            "feed poller started"
        );

        Ok(PollerHandle {
            shared: self.shared.clone(),
            stop_tx: Some(stop_tx),
            tasks: vec![fast, slow],
        })
    }
}

impl Shared {
    fn current_pool(&self) -> Option<Arc<DetailWorkerPool>> {
        self.pool.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn take_pool(&self) -> Option<Arc<DetailWorkerPool>> {
        self.pool.write().unwrap_or_else(|e| e.into_inner()).take()
    }

    async fn fast_cycle(&self) -> Result<CycleReport> {
        // Held from the fetch until the snapshot is published. The slow lane
        // then always reconciles against the newest summary fetched, never
        // against one that a pending fast cycle has already superseded.
        let mut pipeline = self.pipeline.lock().await;
        let fetch = match self.parts.source.fetch_live_summary().await {
            Ok(fetch) if fetch.ok => fetch,
            Ok(_) => {
                event!(Level::WARN, "summary flagged as failed; skipping cycle");
                return Ok(CycleReport::skipped());
            }
            Err(err) => {
                event!(Level::WARN, error = %err, "summary fetch failed; skipping cycle");
                return Ok(CycleReport::skipped());
            }
        };

        let now = self.parts.clock.now();
        let mut live = LiveSet::default();
        let mut report = CycleReport::default();
        for record in fetch.records {
            live.ids.insert(record.id.clone());
            if record.score.status == EntityStatus::Completed {
                live.completed.insert(record.id.clone());
            }
            self.parts.store.upsert_summary(record, now).await?;
            report.upserted += 1;
        }

        if !live.ids.is_empty() {
            self.ensure_pool().await;
        }

        pipeline.live = Some(live);
        self.post_update(pipeline, now, &mut report).await?;
        Ok(report)
    }

    async fn slow_cycle(&self) -> Result<CycleReport> {
        let mut report = CycleReport::default();

        match self.current_pool() {
            Some(pool) => {
                let now = self.parts.clock.now();
                let cutoff = age_cutoff(now, self.config.enrichment_staleness);
                let ids = self.parts.store.find_needing_enrichment(cutoff).await?;
                if !ids.is_empty() {
                    event!(Level::DEBUG, count = ids.len(), "dispatching enrichment");
                    let results =
                        futures::future::join_all(ids.iter().map(|id| self.enrich_one(&pool, id)))
                            .await;
                    for (id, result) in ids.iter().zip(results) {
                        match result {
                            Ok(true) => report.enriched += 1,
                            Ok(false) => {}
                            Err(err) => {
                                report.enrich_failed += 1;
                                event!(Level::WARN, id = %id, error = %err, "enrichment failed");
                            }
                        }
                    }
                }
            }
            None => event!(Level::DEBUG, "worker pool not ready; enrichment skipped"),
        }

        let now = self.parts.clock.now();
        let pipeline = self.pipeline.lock().await;
        self.post_update(pipeline, now, &mut report).await?;
        Ok(report)
    }

    /// Fetch and merge one detail record. `Ok(false)` when the source had
    /// nothing or the record left the store meanwhile.
    async fn enrich_one(&self, pool: &DetailWorkerPool, id: &str) -> Result<bool> {
        let detail = {
            let guard = pool.acquire().await?;
            guard.worker().fetch_detail(id).await?
        };
        let Some(detail) = detail else {
            return Ok(false);
        };
        self.parts
            .store
            .merge_detail(id, detail, self.parts.clock.now())
            .await
    }

    /// Build the pool if it does not exist yet. Failures leave it unbuilt for
    /// the next cycle.
    async fn ensure_pool(&self) {
        if self.current_pool().is_some() {
            return;
        }
        let _init = self.pool_init.lock().await;
        if self.current_pool().is_some() {
            return;
        }
        match DetailWorkerPool::build(
            self.parts.detail_factory.as_ref(),
            self.config.worker_pool_size,
        )
        .await
        {
            Ok(pool) => {
                *self.pool.write().unwrap_or_else(|e| e.into_inner()) = Some(Arc::new(pool));
            }
            Err(err) => {
                event!(Level::ERROR, error = %err, "worker pool construction failed; will retry");
            }
        }
    }

    async fn post_update(
        &self,
        mut guard: tokio::sync::MutexGuard<'_, Pipeline>,
        now: DateTime<Utc>,
        report: &mut CycleReport,
    ) -> Result<()> {
        let pipeline = &mut *guard;
        let active_ids = self.parts.store.find_ids().await?;

        if let Some(live) = &pipeline.live {
            let outcome = pipeline
                .reconciler
                .reconcile(&active_ids, &live.ids, &live.completed, now);
            if !outcome.is_quiet() {
                event!(
                    Level::INFO,
                    released = outcome.released.len(),
                    quarantined = outcome.quarantined.len(),
                    due = outcome.due.len(),
                    completed = outcome.completed.len(),
                    "lifecycle transitions"
                );
            }

            let batch = outcome.archive_batch();
            if !batch.is_empty() {
                match self.archiver.archive_by_ids(&batch, now).await {
                    Ok(archive) => {
                        pipeline.reconciler.confirm_archived(&archive.settled_ids());
                        report.archived.extend(archive.inserted);
                        report.archived.extend(archive.duplicates);
                    }
                    Err(err) => {
                        event!(Level::WARN, error = %err, "archival failed; retrying next cycle");
                    }
                }
            }
            report.reconcile = Some(outcome);
        }

        let observed_before = age_cutoff(now, self.config.stale_sweep_after);
        match self.archiver.sweep_stale(observed_before, now).await {
            Ok(sweep) => {
                pipeline.reconciler.confirm_archived(&sweep.settled_ids());
                report.swept.extend(sweep.inserted);
                report.swept.extend(sweep.duplicates);
            }
            Err(err) => event!(Level::WARN, error = %err, "stale sweep failed"),
        }

        let entities = self.parts.store.find_all().await?;
        let snapshot = self.snapshots.publish(LiveSnapshot::new(now, entities));
        let alerts = pipeline.stall.check(snapshot.entities(), now);
        drop(guard);

        report.alerts = alerts.len();
        self.send_alerts(alerts).await;
        Ok(())
    }

    async fn send_alerts(&self, alerts: Vec<StallAlert>) {
        for alert in alerts {
            if let Err(err) = self.parts.notifier.send_alert(&alert.message).await {
                event!(Level::WARN, id = %alert.entity_id, error = %err, "stall alert not delivered");
            }
        }
    }
}

/// `now - age`, saturating at the earliest representable instant.
fn age_cutoff(now: DateTime<Utc>, age: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(age)
        .ok()
        .and_then(|age| now.checked_sub_signed(age))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

fn stop_requested(stop: &watch::Receiver<bool>) -> bool {
    *stop.borrow()
}

async fn fast_loop(poller: FeedPoller, mut stop: watch::Receiver<bool>) {
    let interval = poller.shared.config.fast_interval;
    while !stop_requested(&stop) {
        tokio::select! {
            _ = stop.changed() => break,
            result = poller.run_fast_cycle() => log_cycle(Lane::Fast, result),
        }
        tokio::select! {
            _ = stop.changed() => break,
            _ = sleep(interval) => {}
        }
    }
    event!(Level::DEBUG, "fast lane stopped");
}

async fn slow_loop(poller: FeedPoller, mut stop: watch::Receiver<bool>) {
    let interval = poller.shared.config.slow_interval;
    tokio::select! {
        _ = stop.changed() => return,
        _ = sleep(poller.shared.config.slow_warmup) => {}
    }
    while !stop_requested(&stop) {
        tokio::select! {
            _ = stop.changed() => break,
            result = poller.run_slow_cycle() => log_cycle(Lane::Slow, result),
        }
        tokio::select! {
            _ = stop.changed() => break,
            _ = sleep(interval) => {}
        }
    }
    event!(Level::DEBUG, "slow lane stopped");
}

fn log_cycle(lane: Lane, result: Result<CycleReport>) {
    match result {
        Ok(report) if report.skipped => {}
        Ok(report) => event!(
            Level::DEBUG,
            %lane,
            upserted = report.upserted,
            enriched = report.enriched,
            archived = report.archived.len(),
            swept = report.swept.len(),
            alerts = report.alerts,
            "cycle complete"
        ),
        Err(err) if err.is_transient() => {
            event!(Level::WARN, %lane, error = %err, "cycle aborted; retrying next interval")
        }
        Err(err) => event!(Level::ERROR, %lane, error = %err, "cycle aborted"),
    }
}

/// Running poller.
pub struct PollerHandle {
    shared: Arc<Shared>,
    stop_tx: Option<watch::Sender<bool>>,
    tasks: Vec<JoinHandle<()>>,
}

impl PollerHandle {
    pub fn is_running(&self) -> bool {
        self.tasks.iter().any(|task| !task.is_finished())
    }

    /// Bounded shutdown: cancel both lanes, wait for them, drain and close
    /// the worker pool, close the source, close the store.
    ///
    /// Every step runs even if an earlier one failed; the first error is
    /// returned.
    pub async fn stop(mut self) -> Result<()> {
        if let Some(stop_tx) = self.stop_tx.take() {
            let _ = stop_tx.send(true);
        }

        let mut first_error: Option<FeedError> = None;
        for task in self.tasks.drain(..) {
            if let Err(err) = task.await {
                event!(Level::ERROR, error = %err, "poller lane panicked");
                first_error.get_or_insert(FeedError::Io(format!("poller lane join: {err}")));
            }
        }

        if let Some(pool) = self.shared.take_pool() {
            pool.shutdown(POOL_SHUTDOWN_WAIT).await;
        }

        if let Err(err) = self.shared.parts.source.close().await {
            event!(Level::ERROR, error = %err, "source close failed");
            first_error.get_or_insert(err);
        }
        if let Err(err) = self.shared.parts.store.close().await {
            event!(Level::ERROR, error = %err, "store close failed");
            first_error.get_or_insert(err);
        }

        event!(Level::INFO, "feed poller stopped");
        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

impl Drop for PollerHandle {
    fn drop(&mut self) {
        if let Some(stop_tx) = self.stop_tx.take() {
            let _ = stop_tx.send(true);
        }
        for task in &self.tasks {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_age_cutoff_saturates() {
        let now = Utc::now();
        assert_eq!(
            age_cutoff(now, Duration::from_secs(60)),
            now - chrono::Duration::seconds(60)
        );
        assert_eq!(age_cutoff(now, Duration::MAX), DateTime::<Utc>::MIN_UTC);
    }

    #[test]
    fn test_millis_saturates() {
        assert_eq!(millis(Duration::from_millis(4_000)), 4_000);
        assert_eq!(millis(Duration::MAX), u64::MAX);
    }

    #[test]
    fn test_lane_names() {
        assert_eq!(Lane::Fast.to_string(), "fast");
        assert_eq!(Lane::Slow.to_string(), "slow");
    }
}
