//! Entry points grouped by use.
//!
//! `service` is what an application wiring the feed needs. `testing` adds
//! the in-memory collaborators and deterministic clock used to drive the
//! feed without a network.

pub mod service {
    pub use crate::config::{FeedConfig, LeaderConfig};
    pub use crate::core::{Clock, FeedError, Result, SystemClock};
    pub use crate::leader::{CoordinatorHandle, LeaderCoordinator, Role};
    pub use crate::lock::{LockService, RedisLockService};
    pub use crate::notify::{LogNotifier, NotificationSink, WebhookNotifier};
    pub use crate::poller::FeedComponents;
    pub use crate::service::FeedService;
    pub use crate::source::{HttpSourceAdapter, HttpSourceConfig, HttpSourceFactory};
    pub use crate::storage::{EntityStore, MemoryStore};
    pub use crate::web::{AppState, router};
}

pub mod testing {
    pub use crate::core::ManualClock;
    pub use crate::lock::MemoryLockService;
    pub use crate::notify::RecordingNotifier;
    pub use crate::poller::{CycleReport, FeedPoller, SnapshotCell};
    pub use crate::source::{SourceAdapter, SourceAdapterFactory, SummaryFetch};
}
