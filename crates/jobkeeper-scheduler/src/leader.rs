//! Lease-based leader election.
//!
//! Every instance runs one [`LeaderElector`]. As a follower it periodically
//! tries to claim the shared lease; as leader it periodically renews it. Only
//! one of the two timers is ever armed, chosen by the current
//! [`LeaderState`]. State changes are published on a `watch` channel so the
//! dispatch loop and the HTTP gate follow along without shared flags.
//!
//! This is a lease, not consensus: if the store cannot perform the
//! read-modify-write atomically, two instances may briefly both act as
//! leader. The loser notices on its next heartbeat and steps down.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use jobkeeper_core::config::SchedulerConfig;
use serde::Serialize;
use tokio::sync::watch;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::repository::JobRepository;
use crate::types::LeaseRecord;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LeaderState {
    Follower,
    Leader,
}

impl std::fmt::Display for LeaderState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LeaderState::Follower => write!(f, "follower"),
            LeaderState::Leader => write!(f, "leader"),
        }
    }
}

pub struct LeaderElector {
    repo: Arc<dyn JobRepository>,
    lease_id: String,
    /// Random per process; identifies our claim in the lease record.
    token: String,
    leader_check_interval: Duration,
    heartbeat_interval: Duration,
    heartbeat_expiration: TimeDelta,
    state: watch::Sender<LeaderState>,
    /// Last lease we successfully wrote.
    lease: Option<LeaseRecord>,
}

impl LeaderElector {
    pub fn new(repo: Arc<dyn JobRepository>, config: &SchedulerConfig) -> Self {
        let (state, _) = watch::channel(LeaderState::Follower);
        Self {
            repo,
            lease_id: config.lease_id.clone(),
            token: Uuid::new_v4().to_string(),
            leader_check_interval: Duration::from_secs(config.leader_check_interval_secs.max(1)),
            heartbeat_interval: Duration::from_secs(config.heartbeat_interval_secs.max(1)),
            heartbeat_expiration: expiration(config.heartbeat_expiration_secs),
            state,
            lease: None,
        }
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    pub fn state(&self) -> LeaderState {
        *self.state.borrow()
    }

    pub fn is_leader(&self) -> bool {
        self.state() == LeaderState::Leader
    }

    /// Receiver that observes every leadership change of this elector.
    pub fn subscribe(&self) -> watch::Receiver<LeaderState> {
        self.state.subscribe()
    }

    pub fn lease(&self) -> Option<&LeaseRecord> {
        self.lease.as_ref()
    }

    /// Claim the lease if it is free, ours, or stale; step down otherwise.
    ///
    /// Repository errors are logged and leave the state unchanged; the next
    /// leader-check tick simply tries again.
    pub async fn try_become_leader(&mut self, now: DateTime<Utc>) -> LeaderState {
        let token = self.token.as_str();
        let lease_id = self.lease_id.as_str();
        let expiration = self.heartbeat_expiration;
        let claim = |current: Option<LeaseRecord>| {
            let claimable = match &current {
                None => true,
                Some(lease) => {
                    lease.token.is_none()
                        || lease.is_held_by(token)
                        || lease.is_expired(now, expiration)
                }
            };
            claimable.then(|| LeaseRecord {
                id: lease_id.to_string(),
                token: Some(token.to_string()),
                last_heartbeat: Some(now),
            })
        };

        let claimed = self.repo.get_and_update_lease(&self.lease_id, &claim).await;
        match claimed {
            Ok(Some(lease)) => {
                self.lease = Some(lease);
                self.promote();
            }
            Ok(None) => self.demote("lease held by another instance"),
            Err(e) => warn!(lease_id = %self.lease_id, error = %e, "leader check failed"),
        }
        self.state()
    }

    /// Renew our claim.
    ///
    /// A lease that now belongs to someone else demotes this instance. If
    /// renewal keeps failing until our own claim would have expired, we step
    /// down as well, since another instance may already have taken over.
    pub async fn heartbeat(&mut self, now: DateTime<Utc>) -> LeaderState {
        let renewed = self.repo.heartbeat(&self.lease_id, &self.token, now).await;
        match renewed {
            Ok(Some(lease)) => {
                debug!(lease_id = %self.lease_id, "lease renewed");
                self.lease = Some(lease);
            }
            Ok(None) => self.demote("lease lost to another instance"),
            Err(e) => {
                warn!(lease_id = %self.lease_id, error = %e, "heartbeat failed");
                let expired = self
                    .lease
                    .as_ref()
                    .map_or(true, |lease| lease.is_expired(now, self.heartbeat_expiration));
                if expired {
                    self.demote("lease expired while heartbeats were failing");
                }
            }
        }
        self.state()
    }

    /// Give up leadership on graceful shutdown so a follower can take over
    /// without waiting for the lease to expire.
    pub async fn release(&mut self) {
        let token = self.token.as_str();
        let clear = |current: Option<LeaseRecord>| {
            current
                .filter(|lease| lease.is_held_by(token))
                .map(|lease| LeaseRecord {
                    token: None,
                    last_heartbeat: None,
                    ..lease
                })
        };
        let cleared = self.repo.get_and_update_lease(&self.lease_id, &clear).await;
        match cleared {
            Ok(Some(_)) => info!(lease_id = %self.lease_id, "released leader lease"),
            Ok(None) => debug!(lease_id = %self.lease_id, "no lease of ours to release"),
            Err(e) => warn!(lease_id = %self.lease_id, error = %e, "failed to release lease"),
        }
        self.demote("released");
    }

    /// Election loop. Until `shutdown` broadcasts `true`, runs the
    /// leader-check tick while following and the heartbeat tick while leading.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!(token = %self.token, lease_id = %self.lease_id, "leader elector started");
        self.try_become_leader(Utc::now()).await;

        loop {
            let wait = match self.state() {
                LeaderState::Follower => self.leader_check_interval,
                LeaderState::Leader => self.heartbeat_interval,
            };
            tokio::select! {
                _ = tokio::time::sleep(wait) => {
                    let now = Utc::now();
                    match self.state() {
                        LeaderState::Follower => self.try_become_leader(now).await,
                        LeaderState::Leader => self.heartbeat(now).await,
                    };
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("leader elector shutting down");
                        break;
                    }
                }
            }
        }

        self.release().await;
    }

    fn promote(&mut self) {
        if self.state() != LeaderState::Leader {
            info!(token = %self.token, lease_id = %self.lease_id, "became leader");
            self.state.send_replace(LeaderState::Leader);
        }
    }

    fn demote(&mut self, reason: &str) {
        if self.state() == LeaderState::Leader {
            warn!(token = %self.token, lease_id = %self.lease_id, reason, "stepping down");
            self.state.send_replace(LeaderState::Follower);
        }
        self.lease = None;
    }
}

/// Lease lifetime, saturating for values beyond what `TimeDelta` can hold.
fn expiration(secs: u64) -> TimeDelta {
    i64::try_from(secs)
        .ok()
        .and_then(TimeDelta::try_seconds)
        .unwrap_or(TimeDelta::MAX)
}
