use std::time::Duration;

/// Default key under which the leader lease is stored.
pub const DEFAULT_LEASE_KEY: &str = "livefeed:leader";

/// Feed poller configuration
///
/// Every timing value of the two-speed poller lives here. None of the
/// defaults are load-bearing; they are starting points meant to be tuned.
#[derive(Debug, Clone)]
pub struct FeedConfig {
    /// Fast lane: interval between live summary polls
    pub fast_interval: Duration,

    /// Slow lane: interval between enrichment passes
    pub slow_interval: Duration,

    /// Delay before the first slow-lane pass, so the fast lane has a baseline
    pub slow_warmup: Duration,

    /// Number of detail workers in the pool
    pub worker_pool_size: usize,

    /// How long an entity may stay absent from the summary before archival
    pub grace_period: Duration,

    /// Age after which enrichment data is refreshed
    pub enrichment_staleness: Duration,

    /// Age of `last_observed_at` after which the safety sweep archives a record
    pub stale_sweep_after: Duration,

    /// Time without a score change before a stall alert is raised
    pub stall_threshold: Duration,
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl FeedConfig {
    /// Create a configuration with default values
    pub fn new() -> Self {
        Self {
            fast_interval: Duration::from_secs(4),
            slow_interval: Duration::from_secs(45),
            slow_warmup: Duration::from_secs(10),
            worker_pool_size: 5,
            grace_period: Duration::from_secs(60),
            enrichment_staleness: Duration::from_secs(180),
            stale_sweep_after: Duration::from_secs(15 * 60),
            stall_threshold: Duration::from_secs(300),
        }
    }

    /// Set fast-lane interval
    pub fn fast_interval(mut self, interval: Duration) -> Self {
        self.fast_interval = interval;
        self
    }

    /// Set slow-lane interval
    pub fn slow_interval(mut self, interval: Duration) -> Self {
        self.slow_interval = interval;
        self
    }

    /// Set slow-lane warm-up delay
    pub fn slow_warmup(mut self, delay: Duration) -> Self {
        self.slow_warmup = delay;
        self
    }

    /// Set worker pool size
    pub fn worker_pool_size(mut self, size: usize) -> Self {
        self.worker_pool_size = size;
        self
    }

    /// Set quarantine grace period
    pub fn grace_period(mut self, grace: Duration) -> Self {
        self.grace_period = grace;
        self
    }

    /// Set enrichment staleness threshold
    pub fn enrichment_staleness(mut self, staleness: Duration) -> Self {
        self.enrichment_staleness = staleness;
        self
    }

    /// Set stale sweep threshold
    pub fn stale_sweep_after(mut self, after: Duration) -> Self {
        self.stale_sweep_after = after;
        self
    }

    /// Set stall threshold
    pub fn stall_threshold(mut self, threshold: Duration) -> Self {
        self.stall_threshold = threshold;
        self
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), String> {
        if self.fast_interval.is_zero() {
            return Err("fast_interval must be greater than 0".to_string());
        }

        if self.slow_interval.is_zero() {
            return Err("slow_interval must be greater than 0".to_string());
        }

        if self.worker_pool_size == 0 {
            return Err("worker_pool_size must be greater than 0".to_string());
        }

        if self.grace_period.is_zero() {
            return Err("grace_period must be greater than 0".to_string());
        }

        if self.stall_threshold.is_zero() {
            return Err("stall_threshold must be greater than 0".to_string());
        }

        if self.stale_sweep_after <= self.grace_period {
            return Err("stale_sweep_after must be longer than grace_period".to_string());
        }

        Ok(())
    }
}

/// Leader election configuration
#[derive(Debug, Clone)]
pub struct LeaderConfig {
    /// Key of the lease in the lock service
    pub lease_key: String,

    /// Lease time-to-live
    pub lease_ttl: Duration,

    /// How often a follower retries acquisition
    pub retry_interval: Duration,
}

impl Default for LeaderConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl LeaderConfig {
    pub fn new() -> Self {
        Self {
            lease_key: DEFAULT_LEASE_KEY.to_string(),
            lease_ttl: Duration::from_secs(30),
            retry_interval: Duration::from_secs(15),
        }
    }

    pub fn lease_key(mut self, key: &str) -> Self {
        self.lease_key = key.to_string();
        self
    }

    pub fn lease_ttl(mut self, ttl: Duration) -> Self {
        self.lease_ttl = ttl;
        self
    }

    pub fn retry_interval(mut self, interval: Duration) -> Self {
        self.retry_interval = interval;
        self
    }

    /// Renewal cadence: half the lease TTL.
    pub fn renew_interval(&self) -> Duration {
        self.lease_ttl / 2
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.lease_key.trim().is_empty() {
            return Err("lease_key must not be empty".to_string());
        }

        if self.lease_ttl < Duration::from_millis(2) {
            return Err("lease_ttl must be at least 2ms".to_string());
        }

        if self.retry_interval.is_zero() {
            return Err("retry_interval must be greater than 0".to_string());
        }

        Ok(())
    }
}
