//! Channel key epochs: generation, per-member distribution, rotation and
//! lookup by key id.
//!
//! Every epoch a node learns is retained for the life of the process and
//! persisted sealed to the local identity. Only the leader mints keys; members
//! only install what the current lease holder, or the leader that announced
//! the rotation, sends them. An epoch that was replaced never becomes current
//! again.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, info, warn};

use kirc_net::MailboxChannel;
use kirc_shared::crypto::{self, SymmetricKey};
use kirc_shared::protocol::{RotationSignal, RpcMessage};
use kirc_shared::types::{ChannelName, KeyId, Username};

use crate::context::NodeContext;
use crate::error::CoreError;
use crate::leadership::CoordinationGuard;

/// Status hash fields naming the latest epoch and the leader that minted it
const EPOCH_FIELD: &str = "key_id";
const EPOCH_BY_FIELD: &str = "key_by";

#[derive(Default)]
struct ChannelEpochs {
    current: Option<KeyId>,
    epochs: HashMap<KeyId, SymmetricKey>,
    superseded: HashSet<KeyId>,
    announced: HashMap<KeyId, Username>,
}

/// What [`KeyRing::install`] did with an epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Installed {
    /// The epoch was not known before
    pub new: bool,
    /// The epoch is now the one to encrypt with
    pub current: bool,
}

/// In-memory view of every epoch this node holds.
#[derive(Default)]
pub struct KeyRing {
    channels: RwLock<HashMap<ChannelName, ChannelEpochs>>,
}

impl KeyRing {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store an epoch, promoting it when `make_current` is set unless it was
    /// already replaced once.
    pub fn install(
        &self,
        channel: &ChannelName,
        key_id: KeyId,
        key: SymmetricKey,
        make_current: bool,
    ) -> Installed {
        let mut channels = self.channels.write();
        let entry = channels.entry(channel.clone()).or_default();

        let promote = make_current && !entry.superseded.contains(&key_id);
        if promote && entry.current.as_ref() != Some(&key_id) {
            if let Some(previous) = entry.current.replace(key_id.clone()) {
                entry.superseded.insert(previous);
            }
        }
        let new = entry.epochs.insert(key_id.clone(), key).is_none();
        Installed {
            new,
            current: entry.current.as_ref() == Some(&key_id) && !entry.superseded.contains(&key_id),
        }
    }

    /// A rotation to `key_id` was announced by `leader`. Whatever we held as
    /// current is retired, even before the new epoch reaches us.
    pub fn announce(&self, channel: &ChannelName, key_id: KeyId, leader: Username) {
        let mut channels = self.channels.write();
        let entry = channels.entry(channel.clone()).or_default();
        // A late signal for an epoch that was already replaced changes nothing
        if entry.superseded.contains(&key_id) {
            return;
        }
        if let Some(current) = entry.current.as_ref().filter(|c| **c != key_id) {
            entry.superseded.insert(current.clone());
        }
        entry.announced.insert(key_id, leader);
    }

    pub fn announced_by(&self, channel: &ChannelName, key_id: &KeyId) -> Option<Username> {
        self.channels
            .read()
            .get(channel)
            .and_then(|c| c.announced.get(key_id).cloned())
    }

    pub fn is_superseded(&self, channel: &ChannelName, key_id: &KeyId) -> bool {
        self.channels
            .read()
            .get(channel)
            .is_some_and(|c| c.superseded.contains(key_id))
    }

    /// `None` is the expected answer for an epoch we were excluded from.
    pub fn resolve(&self, channel: &ChannelName, key_id: &KeyId) -> Option<SymmetricKey> {
        self.channels
            .read()
            .get(channel)
            .and_then(|c| c.epochs.get(key_id).copied())
    }

    /// The epoch to encrypt with. `None` while the last known one is retired
    /// and its successor has not arrived yet.
    pub fn current(&self, channel: &ChannelName) -> Option<(KeyId, SymmetricKey)> {
        let channels = self.channels.read();
        let entry = channels.get(channel)?;
        let key_id = entry.current.as_ref()?;
        if entry.superseded.contains(key_id) {
            return None;
        }
        entry.epochs.get(key_id).map(|key| (key_id.clone(), *key))
    }

    pub fn epoch_count(&self, channel: &ChannelName) -> usize {
        self.channels
            .read()
            .get(channel)
            .map(|c| c.epochs.len())
            .unwrap_or(0)
    }
}

/// Outcome of a fan-out
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Distribution {
    pub delivered: Vec<Username>,
    /// Members without a contact record; they cannot be sent a sealed key
    pub skipped: Vec<Username>,
    /// Members we blocked
    pub blocked: Vec<Username>,
}

/// A freshly minted epoch and where it went.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rotation {
    pub key_id: KeyId,
    pub distribution: Distribution,
}

#[derive(Clone)]
pub struct KeyLifecycleManager {
    ctx: NodeContext,
    ring: Arc<KeyRing>,
}

impl KeyLifecycleManager {
    pub fn new(ctx: NodeContext, ring: Arc<KeyRing>) -> Self {
        Self { ctx, ring }
    }

    pub fn ring(&self) -> &KeyRing {
        &self.ring
    }

    pub fn resolve(&self, channel: &ChannelName, key_id: &KeyId) -> Option<SymmetricKey> {
        self.ring.resolve(channel, key_id)
    }

    pub fn current(&self, channel: &ChannelName) -> Option<(KeyId, SymmetricKey)> {
        self.ring.current(channel)
    }

    /// Mint a fresh epoch and make it current. Leader-only by convention;
    /// callers hold the coordination lock.
    pub fn generate_key(
        &self,
        channel: &ChannelName,
        _guard: &CoordinationGuard<'_>,
    ) -> Result<(SymmetricKey, KeyId), CoreError> {
        let key = crypto::generate_symmetric_key();
        let key_id = KeyId::generate();
        self.install(channel, &key_id, key, true)?;
        self.ring
            .announce(channel, key_id.clone(), self.ctx.me().clone());
        info!(channel = %channel, key_id = %key_id.short(), "Generated channel key");
        Ok((key, key_id))
    }

    /// Seal `key` to each recipient and unicast it as a key update.
    ///
    /// One message per recipient; the key never travels in a form a
    /// non-recipient could open. The local node is skipped.
    pub async fn distribute(
        &self,
        channel: &ChannelName,
        key: &SymmetricKey,
        key_id: &KeyId,
        recipients: &BTreeSet<Username>,
    ) -> Result<Distribution, CoreError> {
        self.send_key(MailboxChannel::RpcIn, channel, key, key_id, recipients)
            .await
    }

    /// Answer a key request on the response channel.
    pub async fn answer(
        &self,
        channel: &ChannelName,
        key_id: &KeyId,
        requester: &Username,
    ) -> Result<bool, CoreError> {
        let Some(key) = self.ring.resolve(channel, key_id) else {
            return Ok(false);
        };
        let recipients = BTreeSet::from([requester.clone()]);
        let sent = self
            .send_key(MailboxChannel::RpcOut, channel, &key, key_id, &recipients)
            .await?;
        Ok(!sent.delivered.is_empty())
    }

    async fn send_key(
        &self,
        route: MailboxChannel,
        channel: &ChannelName,
        key: &SymmetricKey,
        key_id: &KeyId,
        recipients: &BTreeSet<Username>,
    ) -> Result<Distribution, CoreError> {
        let mut report = Distribution::default();

        for recipient in recipients.iter().filter(|r| *r != self.ctx.me()) {
            let contact = match self.ctx.contact(recipient) {
                Ok(contact) => contact,
                Err(CoreError::UnknownContact(_)) => {
                    warn!(
                        channel = %channel,
                        member = %recipient,
                        "No contact record, cannot seal key for member"
                    );
                    report.skipped.push(recipient.clone());
                    continue;
                }
                Err(e) => return Err(e),
            };

            if contact.is_blocked {
                debug!(channel = %channel, member = %recipient, "Member is blocked, key withheld");
                report.blocked.push(recipient.clone());
                continue;
            }

            let encrypted_key = crypto::seal(&contact.public_key.encryption, key)?;
            self.ctx
                .send_rpc(
                    route,
                    recipient,
                    RpcMessage::KeyUpdate {
                        channel: channel.clone(),
                        key_id: key_id.clone(),
                        encrypted_key,
                    },
                )
                .await?;
            report.delivered.push(recipient.clone());
        }

        debug!(
            channel = %channel,
            key_id = %key_id.short(),
            delivered = report.delivered.len(),
            skipped = report.skipped.len(),
            blocked = report.blocked.len(),
            "Key distributed"
        );
        Ok(report)
    }

    /// Replace the current epoch. The new key goes to `members` minus
    /// `excluded`; the previous epochs stay resolvable for traffic already
    /// in flight.
    ///
    /// The epoch is recorded in the channel status and announced on the
    /// rotation topic before any member is sent the key, so members accept it
    /// from us even if our lease lapses mid-fan-out.
    pub async fn rotate(
        &self,
        channel: &ChannelName,
        members: &BTreeSet<Username>,
        excluded: &BTreeSet<Username>,
        guard: &CoordinationGuard<'_>,
    ) -> Result<Rotation, CoreError> {
        let (key, key_id) = self.generate_key(channel, guard)?;
        let recipients: BTreeSet<Username> = members.difference(excluded).cloned().collect();

        self.record_epoch(channel, &key_id).await?;
        let signal = RotationSignal::new(key_id.clone(), self.ctx.me().clone());
        self.ctx
            .cache
            .publish(&channel.rotation_topic(), signal.to_json()?)
            .await?;

        let distribution = self.distribute(channel, &key, &key_id, &recipients).await?;
        info!(
            channel = %channel,
            key_id = %key_id.short(),
            recipients = recipients.len(),
            excluded = excluded.len(),
            "Channel key rotated"
        );
        Ok(Rotation {
            key_id,
            distribution,
        })
    }

    async fn record_epoch(&self, channel: &ChannelName, key_id: &KeyId) -> Result<(), CoreError> {
        let status = channel.status_key();
        self.ctx
            .cache
            .hash_set(&status, EPOCH_FIELD, key_id.as_str())
            .await?;
        self.ctx
            .cache
            .hash_set(&status, EPOCH_BY_FIELD, self.ctx.me().as_str())
            .await?;
        Ok(())
    }

    /// Latest epoch minted for the channel and the leader that minted it.
    pub async fn latest_epoch(
        &self,
        channel: &ChannelName,
    ) -> Result<Option<(KeyId, Username)>, CoreError> {
        let status = self.ctx.cache.hash_get_all(&channel.status_key()).await?;
        let (Some(key_id), Some(by)) = (status.get(EPOCH_FIELD), status.get(EPOCH_BY_FIELD)) else {
            return Ok(None);
        };
        Ok(Username::new(by.as_str())
            .ok()
            .map(|by| (KeyId::from_string(key_id.as_str()), by)))
    }

    /// Install a key update received from `sender`.
    ///
    /// Keys are taken from the current lease holder, or from the leader that
    /// minted that epoch. Returns whether the epoch was new to this node.
    pub async fn accept_update(
        &self,
        sender: &Username,
        channel: &ChannelName,
        key_id: KeyId,
        encrypted_key: &[u8],
        make_current: bool,
    ) -> Result<bool, CoreError> {
        if !self.may_issue(sender, channel, &key_id).await? {
            warn!(
                channel = %channel,
                sender = %sender,
                key_id = %key_id.short(),
                "Ignoring key update from a non-leader"
            );
            return Ok(false);
        }

        let plaintext = crypto::open(self.ctx.identity.encryption_secret(), encrypted_key)?;
        let key: SymmetricKey = plaintext
            .as_slice()
            .try_into()
            .map_err(|_| kirc_shared::error::CryptoError::InvalidKeyLength)?;

        let installed = self.install(channel, &key_id, key, make_current)?;
        if make_current && !installed.current {
            warn!(
                channel = %channel,
                key_id = %key_id.short(),
                from = %sender,
                "Pushed epoch was already replaced, kept as history only"
            );
        }
        if installed.new {
            info!(channel = %channel, key_id = %key_id.short(), from = %sender, "Installed channel key");
        }
        Ok(installed.new)
    }

    async fn may_issue(
        &self,
        sender: &Username,
        channel: &ChannelName,
        key_id: &KeyId,
    ) -> Result<bool, CoreError> {
        if self.ring.announced_by(channel, key_id).as_ref() == Some(sender) {
            return Ok(true);
        }
        if self.ctx.leader_of(channel).await?.as_ref() == Some(sender) {
            return Ok(true);
        }
        let minted = self.latest_epoch(channel).await?;
        Ok(minted.is_some_and(|(id, by)| &id == key_id && &by == sender))
    }

    fn install(
        &self,
        channel: &ChannelName,
        key_id: &KeyId,
        key: SymmetricKey,
        make_current: bool,
    ) -> Result<Installed, CoreError> {
        let installed = self.ring.install(channel, key_id.clone(), key, make_current);
        let sealed = crypto::seal(&self.ctx.identity.public_key().encryption, &key)?;
        self.ctx
            .store
            .lock()
            .put_channel_key(channel, key_id, &sealed, installed.current)?;
        Ok(installed)
    }

    /// Reload every persisted epoch into the ring. Returns how many were restored.
    pub fn restore(&self) -> Result<usize, CoreError> {
        let stored = self.ctx.store.lock().list_all_channel_keys()?;
        let mut restored = 0;
        for entry in stored {
            match crypto::open(self.ctx.identity.encryption_secret(), &entry.encrypted_key) {
                Ok(plaintext) => {
                    let Ok(key) = SymmetricKey::try_from(plaintext.as_slice()) else {
                        warn!(channel = %entry.channel, key_id = %entry.key_id.short(), "Stored key has the wrong length");
                        continue;
                    };
                    self.ring
                        .install(&entry.channel, entry.key_id, key, entry.is_current);
                    restored += 1;
                }
                Err(e) => {
                    warn!(
                        channel = %entry.channel,
                        key_id = %entry.key_id.short(),
                        error = %e,
                        "Stored key is not sealed to this identity"
                    );
                }
            }
        }
        Ok(restored)
    }
}
