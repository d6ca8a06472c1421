//! Channel membership: the cache set is authoritative, each node keeps an
//! eventually consistent mirror fed by `channel:{name}:events`.

use std::collections::BTreeSet;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, info};

use kirc_net::{CacheError, CoordinationCache};
use kirc_shared::protocol::MembershipEvent;
use kirc_shared::types::{ChannelName, Username};

use crate::error::CoreError;

#[derive(Debug, Default)]
pub struct MembershipMirror {
    members: RwLock<BTreeSet<Username>>,
}

impl MembershipMirror {
    pub fn contains(&self, username: &Username) -> bool {
        self.members.read().contains(username)
    }

    pub fn snapshot(&self) -> BTreeSet<Username> {
        self.members.read().clone()
    }

    pub fn insert(&self, username: Username) -> bool {
        self.members.write().insert(username)
    }

    pub fn remove(&self, username: &Username) -> bool {
        self.members.write().remove(username)
    }

    pub fn replace(&self, members: BTreeSet<Username>) {
        *self.members.write() = members;
    }

    pub fn apply(&self, event: &MembershipEvent) {
        match event {
            MembershipEvent::Join { username } => {
                self.insert(username.clone());
            }
            MembershipEvent::Leave { username } => {
                self.remove(username);
            }
            MembershipEvent::Kick { target, .. } => {
                self.remove(target);
            }
        }
    }
}

pub struct MembershipManager {
    channel: ChannelName,
    me: Username,
    cache: Arc<dyn CoordinationCache>,
    mirror: MembershipMirror,
}

impl MembershipManager {
    pub fn new(channel: ChannelName, me: Username, cache: Arc<dyn CoordinationCache>) -> Self {
        Self {
            channel,
            me,
            cache,
            mirror: MembershipMirror::default(),
        }
    }

    pub fn mirror(&self) -> &MembershipMirror {
        &self.mirror
    }

    /// Add ourselves to the member set and announce it.
    pub async fn join(&self) -> Result<(), CoreError> {
        self.cache
            .set_add(&self.channel.members_key(), self.me.as_str())
            .await?;
        self.refresh().await?;
        self.publish(&MembershipEvent::Join {
            username: self.me.clone(),
        })
        .await?;
        info!(channel = %self.channel, "Joined member set");
        Ok(())
    }

    /// Re-add ourselves after a cache outage and rebuild the mirror. Nothing
    /// is announced; the other members never saw us leave.
    pub async fn rejoin(&self) -> Result<BTreeSet<Username>, CacheError> {
        self.cache
            .set_add(&self.channel.members_key(), self.me.as_str())
            .await?;
        self.refresh().await
    }

    /// Remove ourselves. Announcing is a separate step so the lease can be
    /// released in between.
    pub async fn leave(&self) -> Result<(), CoreError> {
        self.cache
            .set_remove(&self.channel.members_key(), self.me.as_str())
            .await?;
        self.mirror.remove(&self.me);
        Ok(())
    }

    pub async fn announce_leave(&self) -> Result<(), CoreError> {
        self.publish(&MembershipEvent::Leave {
            username: self.me.clone(),
        })
        .await
    }

    /// Leader-side removal of `target`.
    pub async fn kick(&self, target: &Username) -> Result<bool, CoreError> {
        let removed = self
            .cache
            .set_remove(&self.channel.members_key(), target.as_str())
            .await?;
        self.mirror.remove(target);
        self.publish(&MembershipEvent::Kick {
            target: target.clone(),
            by: self.me.clone(),
        })
        .await?;
        Ok(removed)
    }

    /// Replace the mirror with the authoritative set.
    pub async fn refresh(&self) -> Result<BTreeSet<Username>, CacheError> {
        let members = self.members().await?;
        self.mirror.replace(members.clone());
        Ok(members)
    }

    /// Members straight from the cache.
    pub async fn members(&self) -> Result<BTreeSet<Username>, CacheError> {
        let raw = self.cache.set_members(&self.channel.members_key()).await?;
        Ok(raw.into_iter().filter_map(|m| Username::new(m).ok()).collect())
    }

    /// Mirror first; on a miss ask the cache, since the mirror may lag a join.
    pub async fn is_member(&self, username: &Username) -> Result<bool, CacheError> {
        if self.mirror.contains(username) {
            return Ok(true);
        }
        let member = self
            .cache
            .set_contains(&self.channel.members_key(), username.as_str())
            .await?;
        if member {
            debug!(channel = %self.channel, user = %username, "Mirror was behind the member set");
            self.mirror.insert(username.clone());
        }
        Ok(member)
    }

    async fn publish(&self, event: &MembershipEvent) -> Result<(), CoreError> {
        self.cache
            .publish(&self.channel.events_topic(), event.to_json()?)
            .await?;
        Ok(())
    }
}
