//! Leader lease for one channel.
//!
//! ```text
//! NONE -> CANDIDATE -> LEADER
//! NONE -> CANDIDATE -> FOLLOWER
//! LEADER / FOLLOWER -> NONE      (leave, lease lost, cache unreachable)
//! ```
//!
//! The lease key is the only source of truth. It is only ever written with
//! set-if-absent, renewed with expire-if-equals and removed with
//! compare-and-delete. Local state is a cache of the last observation and is
//! re-derived from the lease after every reconnect.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, info, warn};

use kirc_net::{CacheError, CoordinationCache};
use kirc_shared::types::{ChannelName, Username};

/// Attempts when the lease vanishes between a failed set and the read.
const CLAIM_ATTEMPTS: usize = 3;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum LeaseRole {
    None,
    Candidate,
    Leader,
    Follower { leader: Username },
}

impl LeaseRole {
    pub fn is_leader(&self) -> bool {
        matches!(self, Self::Leader)
    }

    pub fn leader(&self) -> Option<&Username> {
        match self {
            Self::Follower { leader } => Some(leader),
            _ => None,
        }
    }
}

/// Proof that the caller holds the channel's coordination lock.
///
/// `try_claim`, `release` and key rotation take one, so they can never race
/// each other on the local node.
pub type CoordinationGuard<'a> = MutexGuard<'a, ()>;

pub struct LeadershipCoordinator {
    channel: ChannelName,
    me: Username,
    cache: Arc<dyn CoordinationCache>,
    ttl: Duration,
    role: RwLock<LeaseRole>,
    lock: Mutex<()>,
}

impl LeadershipCoordinator {
    pub fn new(
        channel: ChannelName,
        me: Username,
        cache: Arc<dyn CoordinationCache>,
        ttl: Duration,
    ) -> Self {
        Self {
            channel,
            me,
            cache,
            ttl,
            role: RwLock::new(LeaseRole::None),
            lock: Mutex::new(()),
        }
    }

    pub async fn lock(&self) -> CoordinationGuard<'_> {
        self.lock.lock().await
    }

    pub fn role(&self) -> LeaseRole {
        self.role.read().clone()
    }

    pub fn is_leader(&self) -> bool {
        self.role.read().is_leader()
    }

    fn set_role(&self, role: LeaseRole) {
        *self.role.write() = role;
    }

    /// Drop back to `NONE` without touching the lease.
    pub fn reset(&self) {
        self.set_role(LeaseRole::None);
    }

    /// Race for the lease. Exactly one concurrent caller across all nodes wins.
    pub async fn try_claim(&self, _guard: &CoordinationGuard<'_>) -> Result<LeaseRole, CacheError> {
        self.set_role(LeaseRole::Candidate);
        let key = self.channel.leader_key();

        for _ in 0..CLAIM_ATTEMPTS {
            let claimed = match self.cache.set_if_absent(&key, self.me.as_str(), self.ttl).await {
                Ok(claimed) => claimed,
                Err(e) => {
                    self.set_role(LeaseRole::None);
                    return Err(e);
                }
            };
            if claimed {
                info!(channel = %self.channel, "Lease claimed, now leader");
                self.set_role(LeaseRole::Leader);
                return Ok(LeaseRole::Leader);
            }

            match self.read_holder().await {
                Ok(Some(holder)) if holder == self.me => {
                    // Our own lease from before a reconnect; keep it alive.
                    match self.cache.expire_if_equals(&key, self.me.as_str(), self.ttl).await {
                        Ok(true) => {
                            self.set_role(LeaseRole::Leader);
                            return Ok(LeaseRole::Leader);
                        }
                        Ok(false) => continue,
                        Err(e) => {
                            self.set_role(LeaseRole::None);
                            return Err(e);
                        }
                    }
                }
                Ok(Some(holder)) => {
                    debug!(channel = %self.channel, leader = %holder, "Lease held, following");
                    let role = LeaseRole::Follower { leader: holder };
                    self.set_role(role.clone());
                    return Ok(role);
                }
                // Expired between our set and our read; race again.
                Ok(None) => continue,
                Err(e) => {
                    self.set_role(LeaseRole::None);
                    return Err(e);
                }
            }
        }

        Ok(LeaseRole::Candidate)
    }

    /// Refresh the TTL. `Ok(false)` means the lease is no longer ours.
    pub async fn renew(&self) -> Result<bool, CacheError> {
        let renewed = self
            .cache
            .expire_if_equals(&self.channel.leader_key(), self.me.as_str(), self.ttl)
            .await?;
        if !renewed {
            warn!(channel = %self.channel, "Lease lost before renewal");
            self.set_role(LeaseRole::None);
        }
        Ok(renewed)
    }

    /// Give the lease up if, and only if, it is still ours.
    pub async fn release(&self, _guard: &CoordinationGuard<'_>) -> Result<bool, CacheError> {
        let released = self
            .cache
            .delete_if_equals(&self.channel.leader_key(), self.me.as_str())
            .await?;
        if released {
            info!(channel = %self.channel, "Lease released");
        }
        self.set_role(LeaseRole::None);
        Ok(released)
    }

    pub async fn read_holder(&self) -> Result<Option<Username>, CacheError> {
        let holder = self.cache.get(&self.channel.leader_key()).await?;
        Ok(holder.and_then(|h| Username::new(h).ok()))
    }

    /// Confirm leadership against the lease itself before a leader-only action.
    pub async fn verify_leader(&self) -> Result<bool, CacheError> {
        let holder = self.read_holder().await?;
        let leading = holder.as_ref() == Some(&self.me);
        if !leading && self.is_leader() {
            warn!(channel = %self.channel, holder = ?holder, "Local leader state was stale");
            self.set_role(match holder {
                Some(leader) => LeaseRole::Follower { leader },
                None => LeaseRole::None,
            });
        }
        Ok(leading)
    }

    /// Follower-side check. Returns the holder now recorded, re-racing if the
    /// lease disappeared.
    pub async fn observe(&self, guard: &CoordinationGuard<'_>) -> Result<LeaseRole, CacheError> {
        match self.read_holder().await? {
            None => {
                info!(channel = %self.channel, "Lease vacant, racing for it");
                self.try_claim(guard).await
            }
            Some(holder) if holder == self.me => {
                self.set_role(LeaseRole::Leader);
                Ok(LeaseRole::Leader)
            }
            Some(holder) => {
                let role = LeaseRole::Follower { leader: holder };
                self.set_role(role.clone());
                Ok(role)
            }
        }
    }
}
