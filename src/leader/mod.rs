//! Lease-based leader election.
//!
//! Every replica runs one coordinator loop under a random holder id. The
//! replica that creates the lease runs the leader duty and renews the lease
//! at half its TTL; everyone else retries on a fixed interval. A failed
//! renewal demotes the leader. A crashed leader's lease simply expires.

use crate::config::LeaderConfig;
use crate::core::{FeedError, Result};
use crate::lock::LockService;
use async_trait::async_trait;
use serde::Serialize;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{Level, event};
use uuid::Uuid;

/// Work that only the leader performs.
#[async_trait]
pub trait LeaderDuty: Send + Sync {
    /// Called after the lease was acquired. An error gives the lease back.
    async fn on_elected(&self) -> Result<()>;

    /// Called when leadership ends, by loss or by shutdown, before the lease
    /// is released.
    async fn on_demoted(&self);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Leader,
    Follower,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Leader => "leader",
            Role::Follower => "follower",
        }
    }
}

/// Shared view of one coordinator's role.
#[derive(Debug, Clone, Default)]
pub struct RoleState {
    leader: Arc<AtomicBool>,
}

impl RoleState {
    pub fn role(&self) -> Role {
        if self.leader.load(Ordering::SeqCst) {
            Role::Leader
        } else {
            Role::Follower
        }
    }

    pub fn is_leader(&self) -> bool {
        self.role() == Role::Leader
    }

    fn set(&self, leader: bool) {
        self.leader.store(leader, Ordering::SeqCst);
    }
}

enum LeadExit {
    Shutdown,
    Lost,
}

pub struct LeaderCoordinator {
    locks: Arc<dyn LockService>,
    duty: Arc<dyn LeaderDuty>,
    config: LeaderConfig,
    holder_id: String,
    role: RoleState,
}

impl LeaderCoordinator {
    pub fn new(
        locks: Arc<dyn LockService>,
        duty: Arc<dyn LeaderDuty>,
        config: LeaderConfig,
    ) -> Self {
        Self {
            locks,
            duty,
            config,
            holder_id: Uuid::new_v4().to_string(),
            role: RoleState::default(),
        }
    }

    pub fn holder_id(&self) -> &str {
        &self.holder_id
    }

    pub fn role_state(&self) -> RoleState {
        self.role.clone()
    }

    /// Start the election loop in the background.
    pub fn spawn(self) -> CoordinatorHandle {
        let (stop_tx, stop_rx) = watch::channel(false);
        let holder_id = self.holder_id.clone();
        let role = self.role.clone();
        let join_handle = tokio::spawn(self.run(stop_rx));
        CoordinatorHandle {
            holder_id,
            role,
            stop_tx: Some(stop_tx),
            join_handle: Some(join_handle),
        }
    }

    async fn run(self, mut stop: watch::Receiver<bool>) {
        event!(Level::INFO, holder = %self.holder_id, key = %self.config.lease_key, "leader coordinator started");
        while !*stop.borrow() {
            match self
                .locks
                .set_if_absent(&self.config.lease_key, &self.holder_id, self.config.lease_ttl)
                .await
            {
                Ok(true) => {
                    event!(Level::INFO, holder = %self.holder_id, "lease acquired; becoming leader");
                    if let Err(err) = self.duty.on_elected().await {
                        event!(Level::ERROR, error = %err, "leader duty failed to start; giving the lease back");
                        self.release().await;
                    } else {
                        self.role.set(true);
                        let exit = self.lead(&mut stop).await;
                        self.role.set(false);
                        self.duty.on_demoted().await;
                        if let LeadExit::Shutdown = exit {
                            self.release().await;
                            break;
                        }
                    }
                }
                Ok(false) => {
                    event!(Level::DEBUG, holder = %self.holder_id, "lease held elsewhere");
                }
                Err(err) => {
                    event!(Level::WARN, error = %err, "lease acquisition attempt failed");
                }
            }

            tokio::select! {
                _ = stop.changed() => break,
                _ = sleep(self.config.retry_interval) => {}
            }
        }
        event!(Level::INFO, holder = %self.holder_id, "leader coordinator stopped");
    }

    /// Renewal loop. Returns when the lease is lost or shutdown is requested.
    async fn lead(&self, stop: &mut watch::Receiver<bool>) -> LeadExit {
        let interval = self.config.renew_interval();
        loop {
            tokio::select! {
                _ = stop.changed() => return LeadExit::Shutdown,
                _ = sleep(interval) => {}
            }
            match self
                .locks
                .renew_if_holder(&self.config.lease_key, &self.holder_id, self.config.lease_ttl)
                .await
            {
                Ok(true) => event!(Level::DEBUG, "lease renewed"),
                Ok(false) => {
                    let err = FeedError::LeaseLost(format!(
                        "'{}' no longer held by {}",
                        self.config.lease_key, self.holder_id
                    ));
                    event!(Level::WARN, error = %err, "demoting");
                    return LeadExit::Lost;
                }
                Err(err) => {
                    event!(Level::ERROR, error = %err, "lease renewal failed; demoting");
                    return LeadExit::Lost;
                }
            }
        }
    }

    async fn release(&self) {
        match self
            .locks
            .release_if_holder(&self.config.lease_key, &self.holder_id)
            .await
        {
            Ok(true) => event!(Level::INFO, "lease released"),
            Ok(false) => event!(Level::DEBUG, "lease already gone or taken over"),
            Err(err) => event!(Level::WARN, error = %err, "lease release failed; it will expire"),
        }
    }
}

/// Handle to a running coordinator.
pub struct CoordinatorHandle {
    holder_id: String,
    role: RoleState,
    stop_tx: Option<watch::Sender<bool>>,
    join_handle: Option<JoinHandle<()>>,
}

impl CoordinatorHandle {
    pub fn holder_id(&self) -> &str {
        &self.holder_id
    }

    pub fn role(&self) -> Role {
        self.role.role()
    }

    pub fn is_leader(&self) -> bool {
        self.role.is_leader()
    }

    pub fn role_state(&self) -> RoleState {
        self.role.clone()
    }

    /// Graceful stop: the leader duty is stopped first, then the lease is
    /// released if this replica still holds it.
    pub async fn shutdown(mut self) -> Result<()> {
        if let Some(stop_tx) = self.stop_tx.take() {
            let _ = stop_tx.send(true);
        }
        if let Some(join_handle) = self.join_handle.take() {
            join_handle
                .await
                .map_err(|err| FeedError::LockService(format!("coordinator join: {}", err)))?;
        }
        Ok(())
    }

    /// Stop without demotion or release, as a crash would. The lease is
    /// left to expire.
    pub fn abort(mut self) {
        self.stop_tx.take();
        if let Some(join_handle) = self.join_handle.take() {
            join_handle.abort();
        }
        self.role.set(false);
    }
}

impl Drop for CoordinatorHandle {
    fn drop(&mut self) {
        if let Some(stop_tx) = self.stop_tx.take() {
            let _ = stop_tx.send(true);
        }
        if let Some(join_handle) = self.join_handle.take() {
            join_handle.abort();
        }
    }
}
