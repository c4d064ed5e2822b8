// ============================================================================
// Livefeed Library
// ============================================================================

pub mod archive;
pub mod config;
pub mod core;
pub mod leader;
pub mod lifecycle;
pub mod lock;
pub mod notify;
pub mod poller;
pub mod pool;
pub mod prelude;
pub mod service;
pub mod source;
pub mod stall;
pub mod storage;
pub mod web;

// Re-export main types for convenience
pub use core::{Clock, FeedError, LiveEntity, ManualClock, Result, SystemClock};
pub use config::{FeedConfig, LeaderConfig};

pub use archive::{ArchiveReport, Archiver};
pub use leader::{CoordinatorHandle, LeaderCoordinator, LeaderDuty, Role};
pub use lifecycle::{ReconcileOutcome, Reconciler};
pub use lock::{LockService, MemoryLockService, RedisLockService};
pub use notify::{LogNotifier, NotificationSink, WebhookNotifier};
pub use poller::{FeedComponents, FeedPoller, PollerHandle, QueryError, SnapshotReader};
pub use pool::{DetailWorkerPool, PoolStats, WorkerGuard};
pub use service::FeedService;
pub use source::{SourceAdapter, SourceAdapterFactory, SummaryFetch};
pub use stall::StallDetector;
pub use storage::{EntityStore, MemoryStore};
