use anyhow::{Context, Result, anyhow};
use clap::Parser;
use livefeed::prelude::service::*;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{Level, event};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "livefeed")]
#[command(about = "Tracks live entities from a polled feed and archives them when they finish")]
struct Args {
    /// Live summary feed URL
    #[arg(long, env = "LIVEFEED_SUMMARY_URL")]
    summary_url: String,

    /// Detail document URL; `{id}` is replaced by the entity id
    #[arg(long, env = "LIVEFEED_DETAIL_URL")]
    detail_url: String,

    /// Only track groups whose name contains this text
    #[arg(long, env = "LIVEFEED_GROUP_FILTER")]
    group_filter: Option<String>,

    #[arg(long, env = "LIVEFEED_LISTEN", default_value = "0.0.0.0:8080")]
    listen: SocketAddr,

    /// Store snapshot file; without it the store is memory-only
    #[arg(long, env = "LIVEFEED_SNAPSHOT_PATH")]
    snapshot_path: Option<PathBuf>,

    #[arg(long, env = "LIVEFEED_FAST_INTERVAL_SECS", default_value_t = 4)]
    fast_interval_secs: u64,

    #[arg(long, env = "LIVEFEED_SLOW_INTERVAL_SECS", default_value_t = 45)]
    slow_interval_secs: u64,

    #[arg(long, env = "LIVEFEED_SLOW_WARMUP_SECS", default_value_t = 10)]
    slow_warmup_secs: u64,

    #[arg(long, env = "LIVEFEED_WORKERS", default_value_t = 5)]
    workers: usize,

    #[arg(long, env = "LIVEFEED_GRACE_SECS", default_value_t = 60)]
    grace_secs: u64,

    #[arg(long, env = "LIVEFEED_ENRICHMENT_STALENESS_SECS", default_value_t = 180)]
    enrichment_staleness_secs: u64,

    #[arg(long, env = "LIVEFEED_STALE_SWEEP_SECS", default_value_t = 900)]
    stale_sweep_secs: u64,

    #[arg(long, env = "LIVEFEED_STALL_SECS", default_value_t = 300)]
    stall_secs: u64,

    /// Redis server holding the shared leader lease
    #[arg(long, env = "LIVEFEED_REDIS_URL", hide_env_values = true)]
    redis_url: Option<String>,

    /// Number of replicas deployed; more than one requires --redis-url
    #[arg(long, env = "LIVEFEED_REPLICAS", default_value_t = 1)]
    replicas: usize,

    #[arg(long, env = "LIVEFEED_LEASE_KEY", default_value = "livefeed:leader")]
    lease_key: String,

    #[arg(long, env = "LIVEFEED_LEASE_TTL_SECS", default_value_t = 30)]
    lease_ttl_secs: u64,

    #[arg(long, env = "LIVEFEED_LEADER_RETRY_SECS", default_value_t = 15)]
    leader_retry_secs: u64,

    #[arg(long, env = "LIVEFEED_WEBHOOK_TOKEN", hide_env_values = true)]
    webhook_token: Option<String>,

    #[arg(long, env = "LIVEFEED_WEBHOOK_CHAT_ID")]
    webhook_chat_id: Option<String>,
}

impl Args {
    fn feed_config(&self) -> FeedConfig {
        FeedConfig::new()
            .fast_interval(Duration::from_secs(self.fast_interval_secs))
            .slow_interval(Duration::from_secs(self.slow_interval_secs))
            .slow_warmup(Duration::from_secs(self.slow_warmup_secs))
            .worker_pool_size(self.workers)
            .grace_period(Duration::from_secs(self.grace_secs))
            .enrichment_staleness(Duration::from_secs(self.enrichment_staleness_secs))
            .stale_sweep_after(Duration::from_secs(self.stale_sweep_secs))
            .stall_threshold(Duration::from_secs(self.stall_secs))
    }

    fn leader_config(&self) -> LeaderConfig {
        LeaderConfig::new()
            .lease_key(&self.lease_key)
            .lease_ttl(Duration::from_secs(self.lease_ttl_secs))
            .retry_interval(Duration::from_secs(self.leader_retry_secs))
    }

    fn notifier(&self) -> Arc<dyn NotificationSink> {
        if self.webhook_token.is_none() && self.webhook_chat_id.is_none() {
            return Arc::new(LogNotifier);
        }
        Arc::new(WebhookNotifier::new(
            self.webhook_token.clone(),
            self.webhook_chat_id.clone(),
        ))
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let feed_config = args.feed_config();
    feed_config
        .validate()
        .map_err(|e| anyhow!("invalid feed configuration: {e}"))?;
    let leader_config = args.leader_config();
    leader_config
        .validate()
        .map_err(|e| anyhow!("invalid leader configuration: {e}"))?;

    let store = Arc::new(match &args.snapshot_path {
        Some(path) => MemoryStore::open(path)
            .with_context(|| format!("failed to open store snapshot {}", path.display()))?,
        None => MemoryStore::new(),
    });

    let mut source_config = HttpSourceConfig::new(&args.summary_url, &args.detail_url);
    if let Some(filter) = &args.group_filter {
        source_config = source_config.group_filter(filter);
    }
    let source = HttpSourceAdapter::new(source_config.clone())
        .context("failed to build the summary adapter")?;

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let service = Arc::new(FeedService::new(
        feed_config,
        FeedComponents {
            source: Arc::new(source),
            detail_factory: Arc::new(HttpSourceFactory::new(source_config)),
            store,
            notifier: args.notifier(),
            clock: clock.clone(),
        },
    ));

    let locks = livefeed::lock::connect(args.redis_url.as_deref(), args.replicas)
        .await
        .context("failed to set up the leader lock service")?;
    let coordinator = LeaderCoordinator::new(locks, service.clone(), leader_config);
    let role = coordinator.role_state();
    let coordinator = coordinator.spawn();

    let app = router(AppState::new(service, role, clock));
    let listener = tokio::net::TcpListener::bind(args.listen)
        .await
        .with_context(|| format!("failed to bind {}", args.listen))?;
    event!(Level::INFO, addr = %args.listen, "query surface listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("http server failed")?;

    // Demotion stops the poller, which checkpoints and closes the store.
    event!(Level::INFO, "shutting down");
    coordinator
        .shutdown()
        .await
        .context("leader coordinator did not stop cleanly")?;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        event!(Level::ERROR, error = %err, "failed to listen for ctrl-c");
    }
}
