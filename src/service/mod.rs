//! The feed as a leader-only duty.

use crate::config::FeedConfig;
use crate::core::Result;
use crate::leader::LeaderDuty;
use crate::poller::{FeedComponents, FeedPoller, PollerHandle, SnapshotCell, SnapshotReader};
use crate::pool::PoolStats;
use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::{Level, event};

struct Running {
    poller: FeedPoller,
    handle: PollerHandle,
}

/// Starts a fresh poller on election and stops it on demotion.
///
/// Quarantine and stall state belong to the poller and start empty on every
/// election. The published snapshot is cleared on demotion so a follower
/// reports itself unavailable instead of serving a frozen view.
pub struct FeedService {
    config: FeedConfig,
    parts: FeedComponents,
    snapshots: SnapshotCell,
    running: Mutex<Option<Running>>,
}

impl FeedService {
    pub fn new(config: FeedConfig, parts: FeedComponents) -> Self {
        Self {
            config,
            parts,
            snapshots: SnapshotCell::new(),
            running: Mutex::new(None),
        }
    }

    pub fn snapshots(&self) -> &SnapshotCell {
        &self.snapshots
    }

    pub fn reader(&self) -> SnapshotReader {
        self.snapshots.reader()
    }

    pub async fn is_running(&self) -> bool {
        self.running.lock().await.is_some()
    }

    pub async fn pool_stats(&self) -> Option<PoolStats> {
        self.running
            .lock()
            .await
            .as_ref()
            .and_then(|running| running.poller.pool_stats())
    }
}

#[async_trait]
impl LeaderDuty for FeedService {
    async fn on_elected(&self) -> Result<()> {
        let mut running = self.running.lock().await;
        if running.is_some() {
            return Ok(());
        }
        let poller = FeedPoller::new(
            self.config.clone(),
            self.parts.clone(),
            self.snapshots.clone(),
        );
        let handle = poller.start().await?;
        *running = Some(Running { poller, handle });
        Ok(())
    }

    async fn on_demoted(&self) {
        let Some(running) = self.running.lock().await.take() else {
            return;
        };
        if let Err(err) = running.handle.stop().await {
            event!(Level::WARN, error = %err, "poller stopped with errors");
        }
        self.snapshots.clear();
    }
}
