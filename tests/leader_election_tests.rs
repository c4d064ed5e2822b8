
use async_trait::async_trait;
use feed_support::*;
use livefeed::lock::LockService;
use livefeed::prelude::testing::MemoryLockService;
use livefeed::RedisLockService;
use livefeed::{FeedConfig, FeedService, LeaderConfig, LeaderCoordinator, LeaderDuty, Result};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

const KEY: &str = "test:leader";

#[derive(Default)]
struct CountingDuty {
    elected: AtomicUsize,
    demoted: AtomicUsize,
}

#[async_trait]
impl LeaderDuty for CountingDuty {
    async fn on_elected(&self) -> Result<()> {
        self.elected.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn on_demoted(&self) {
        self.demoted.fetch_add(1, Ordering::SeqCst);
    }
}

fn leader_config(ttl_ms: u64, retry_ms: u64) -> LeaderConfig {
    LeaderConfig::new()
        .lease_key(KEY)
        .lease_ttl(Duration::from_millis(ttl_ms))
        .retry_interval(Duration::from_millis(retry_ms))
}

#[tokio::test]
async fn test_at_most_one_leader_among_racing_replicas() {
    let locks = Arc::new(MemoryLockService::new());
    let handles: Vec<_> = (0..5)
        .map(|_| {
            LeaderCoordinator::new(
                locks.clone(),
                Arc::new(CountingDuty::default()),
                leader_config(200, 20),
            )
            .spawn()
        })
        .collect();

    let mut saw_leader = false;
    for _ in 0..100 {
        let leaders = handles.iter().filter(|h| h.is_leader()).count();
        assert!(leaders <= 1, "{leaders} leaders at once");
        saw_leader |= leaders == 1;
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert!(saw_leader);

    for handle in handles {
        handle.shutdown().await.unwrap();
    }
    assert_eq!(locks.get(KEY).await.unwrap(), None);
}

#[tokio::test]
async fn test_external_lease_deletion_demotes_leader() {
    let locks = Arc::new(MemoryLockService::new());
    let duty = Arc::new(CountingDuty::default());
    // Long retry interval so the demoted replica does not immediately win again.
    let handle = LeaderCoordinator::new(locks.clone(), duty.clone(), leader_config(200, 5_000))
        .spawn();
    assert!(wait_until(|| handle.is_leader()).await);

    locks.delete(KEY).await.unwrap();

    // Renewal runs every 100ms; demotion follows within one interval.
    tokio::time::sleep(Duration::from_millis(250)).await;
    assert!(!handle.is_leader());
    assert_eq!(duty.demoted.load(Ordering::SeqCst), 1);

    handle.shutdown().await.unwrap();
    assert_eq!(duty.demoted.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_takeover_by_another_holder_is_not_released() {
    let locks = Arc::new(MemoryLockService::new());
    let duty = Arc::new(CountingDuty::default());
    let handle = LeaderCoordinator::new(locks.clone(), duty.clone(), leader_config(200, 5_000))
        .spawn();
    assert!(wait_until(|| handle.is_leader()).await);

    locks.delete(KEY).await.unwrap();
    locks
        .set_if_absent(KEY, "someone-else", Duration::from_secs(30))
        .await
        .unwrap();
    assert!(wait_until(|| !handle.is_leader()).await);

    handle.shutdown().await.unwrap();
    assert_eq!(locks.get(KEY).await.unwrap().as_deref(), Some("someone-else"));
}

#[tokio::test]
async fn test_failover_after_graceful_shutdown() {
    let locks = Arc::new(MemoryLockService::new());
    let first = LeaderCoordinator::new(
        locks.clone(),
        Arc::new(CountingDuty::default()),
        leader_config(500, 30),
    )
    .spawn();
    assert!(wait_until(|| first.is_leader()).await);

    let second = LeaderCoordinator::new(
        locks.clone(),
        Arc::new(CountingDuty::default()),
        leader_config(500, 30),
    )
    .spawn();
    tokio::time::sleep(Duration::from_millis(60)).await;
    assert!(!second.is_leader());

    first.shutdown().await.unwrap();
    assert!(wait_until(|| second.is_leader()).await);
    assert_eq!(
        locks.get(KEY).await.unwrap().as_deref(),
        Some(second.holder_id())
    );
    second.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_failover_after_crash_waits_for_expiry() {
    let locks = Arc::new(MemoryLockService::new());
    let first = LeaderCoordinator::new(
        locks.clone(),
        Arc::new(CountingDuty::default()),
        leader_config(300, 20),
    )
    .spawn();
    assert!(wait_until(|| first.is_leader()).await);
    let crashed_holder = first.holder_id().to_string();

    let second = LeaderCoordinator::new(
        locks.clone(),
        Arc::new(CountingDuty::default()),
        leader_config(300, 20),
    )
    .spawn();
    first.abort();

    // The abandoned lease is still in place for a while.
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(locks.get(KEY).await.unwrap(), Some(crashed_holder));
    assert!(!second.is_leader());

    assert!(wait_until(|| second.is_leader()).await);
    second.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_feed_service_runs_only_while_leader() {
    let h = Harness::new();
    h.source.set_live(vec![summary("A", "15")]);
    let config = FeedConfig::new()
        .worker_pool_size(1)
        .fast_interval(Duration::from_millis(10))
        .slow_interval(Duration::from_millis(10))
        .slow_warmup(Duration::ZERO);
    let service = Arc::new(FeedService::new(config, h.components()));
    let locks = Arc::new(MemoryLockService::new());

    let handle =
        LeaderCoordinator::new(locks.clone(), service.clone(), leader_config(200, 5_000)).spawn();
    assert!(wait_until(|| handle.is_leader()).await);

    let reader = service.reader();
    assert!(wait_until(|| reader.is_available()).await);
    assert!(service.is_running().await);
    assert_eq!(reader.read_one("A").unwrap().id, "A");

    locks.delete(KEY).await.unwrap();
    assert!(wait_until(|| !handle.is_leader()).await);
    // on_demoted has stopped the poller and dropped the snapshot.
    handle.shutdown().await.unwrap();
    assert!(!service.is_running().await);
    assert!(!reader.is_available());
    assert_eq!(h.source.closed.load(Ordering::SeqCst), 1);
    assert_eq!(h.factory.closed.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_replica_whose_source_fails_leaves_leadership_to_others() {
    let broken = Harness::new();
    broken.source.fail_start(true);
    let healthy = Harness::new();
    healthy.source.set_live(Vec::new());

    let locks = Arc::new(MemoryLockService::new());
    let broken_service = Arc::new(FeedService::new(test_config(), broken.components()));
    let healthy_service = Arc::new(FeedService::new(test_config(), healthy.components()));

    let a = LeaderCoordinator::new(locks.clone(), broken_service.clone(), leader_config(200, 20))
        .spawn();
    let b = LeaderCoordinator::new(locks.clone(), healthy_service.clone(), leader_config(200, 20))
        .spawn();

    assert!(wait_until(|| b.is_leader()).await);
    assert!(!a.is_leader());
    assert!(!broken_service.is_running().await);

    a.shutdown().await.unwrap();
    b.shutdown().await.unwrap();
}

fn redis_url() -> String {
    std::env::var("LIVEFEED_TEST_REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1/".to_string())
}

#[tokio::test]
#[ignore] // Needs a running Redis server (LIVEFEED_TEST_REDIS_URL)
async fn test_redis_lease_is_shared_between_separate_connections() {
    let key = format!("livefeed:test:{}", uuid::Uuid::new_v4());
    let first = Arc::new(RedisLockService::connect(&redis_url()).await.unwrap());
    let second = Arc::new(RedisLockService::connect(&redis_url()).await.unwrap());
    let config = || {
        LeaderConfig::new()
            .lease_key(&key)
            .lease_ttl(Duration::from_millis(500))
            .retry_interval(Duration::from_millis(30))
    };

    let a = LeaderCoordinator::new(first.clone(), Arc::new(CountingDuty::default()), config())
        .spawn();
    let b = LeaderCoordinator::new(second.clone(), Arc::new(CountingDuty::default()), config())
        .spawn();

    assert!(wait_until(|| a.is_leader() || b.is_leader()).await);
    for _ in 0..40 {
        assert!(!(a.is_leader() && b.is_leader()));
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    let (leader, follower) = if a.is_leader() { (a, b) } else { (b, a) };
    assert!(!second.release_if_holder(&key, "intruder").await.unwrap());
    leader.shutdown().await.unwrap();
    assert!(wait_until(|| follower.is_leader()).await);

    let holder = follower.holder_id().to_string();
    assert_eq!(first.get(&key).await.unwrap(), Some(holder));
    follower.shutdown().await.unwrap();
    assert_eq!(first.get(&key).await.unwrap(), None);
}
