//! The running actor.
//!
//! A [`Node`] owns four mailbox consumers (one per logical channel) and a
//! single dispatcher task that handles everything they deliver, plus one
//! [`ChannelSession`] per joined channel. Front ends talk to it through the
//! async methods below and observe it through [`Node::subscribe`].

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use kirc_net::{spawn_consumer, ConsumerHandle, MailboxChannel, MailboxEvent};
use kirc_shared::crypto::SymmetricKey;
use kirc_shared::protocol::{Envelope, MessageKind, PresenceStatus, RpcFrame, RpcMessage};
use kirc_shared::types::{ChannelName, KeyId, MessageId, Username};
use kirc_store::StoredMessage;

use crate::context::NodeContext;
use crate::error::CoreError;
use crate::events::NodeEvent;
use crate::keys::{KeyLifecycleManager, KeyRing};
use crate::leadership::LeaseRole;
use crate::relay::{self, DedupWindow, RelayVerdict};
use crate::session::{ChannelSession, SessionCommand, SessionDeps};

const EVENT_BUFFER: usize = 1024;

/// Snapshot returned by [`Node::status`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChannelStatus {
    pub channel: ChannelName,
    pub role: LeaseRole,
    pub leader: Option<Username>,
    pub members: BTreeSet<Username>,
    pub metadata: BTreeMap<String, String>,
    pub current_key: Option<KeyId>,
}

#[derive(Clone)]
pub struct Node {
    inner: Arc<NodeInner>,
}

struct NodeInner {
    deps: SessionDeps,
    sessions: RwLock<HashMap<ChannelName, Arc<ChannelSession>>>,
    // Envelopes this node already relayed as leader
    relayed: Mutex<DedupWindow>,
    // Envelopes already delivered (or sent) locally
    delivered: Mutex<DedupWindow>,
    rpc_seen: Mutex<DedupWindow>,
    consumers: Mutex<Vec<ConsumerHandle>>,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
    stop_tx: watch::Sender<bool>,
}

struct Inboxes {
    data_in: mpsc::Receiver<MailboxEvent<Envelope>>,
    data_out: mpsc::Receiver<MailboxEvent<Envelope>>,
    rpc_in: mpsc::Receiver<MailboxEvent<RpcFrame>>,
    rpc_out: mpsc::Receiver<MailboxEvent<RpcFrame>>,
}

impl Node {
    /// Register the consumer groups and start the dispatcher.
    pub async fn start(ctx: NodeContext) -> Result<Self, CoreError> {
        ctx.config.validate()?;

        let (events, _) = broadcast::channel(EVENT_BUFFER);
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (stop_tx, stop_rx) = watch::channel(false);
        let window = ctx.config.dedup_window;

        let topics = ctx.config.topics.clone();
        let group = |channel: MailboxChannel| format!("kirc-{}-{}", ctx.me(), topics.name(channel));
        let consumer = ctx.config.consumer.clone();

        let (data_in_handle, data_in) = spawn_consumer(
            ctx.mailbox.clone(),
            MailboxChannel::DataIn,
            group(MailboxChannel::DataIn),
            consumer.clone(),
            Envelope::from_bytes,
        )
        .await?;
        let (data_out_handle, data_out) = spawn_consumer(
            ctx.mailbox.clone(),
            MailboxChannel::DataOut,
            group(MailboxChannel::DataOut),
            consumer.clone(),
            Envelope::from_bytes,
        )
        .await?;
        let (rpc_in_handle, rpc_in) = spawn_consumer(
            ctx.mailbox.clone(),
            MailboxChannel::RpcIn,
            group(MailboxChannel::RpcIn),
            consumer.clone(),
            RpcFrame::from_bytes,
        )
        .await?;
        let (rpc_out_handle, rpc_out) = spawn_consumer(
            ctx.mailbox.clone(),
            MailboxChannel::RpcOut,
            group(MailboxChannel::RpcOut),
            consumer,
            RpcFrame::from_bytes,
        )
        .await?;

        let keys = KeyLifecycleManager::new(ctx.clone(), Arc::new(KeyRing::new()));
        let me = ctx.me().clone();
        let inner = Arc::new(NodeInner {
            deps: SessionDeps {
                ctx,
                keys,
                events,
                commands: commands_tx,
            },
            sessions: RwLock::new(HashMap::new()),
            relayed: Mutex::new(DedupWindow::new(window)),
            delivered: Mutex::new(DedupWindow::new(window)),
            rpc_seen: Mutex::new(DedupWindow::new(window)),
            consumers: Mutex::new(vec![
                data_in_handle,
                data_out_handle,
                rpc_in_handle,
                rpc_out_handle,
            ]),
            dispatcher: Mutex::new(None),
            stop_tx,
        });

        let inboxes = Inboxes {
            data_in,
            data_out,
            rpc_in,
            rpc_out,
        };
        let task = tokio::spawn(dispatch(inner.clone(), inboxes, commands_rx, stop_rx));
        *inner.dispatcher.lock() = Some(task);

        info!(user = %me, "Node started");
        Ok(Self { inner })
    }

    pub fn me(&self) -> &Username {
        self.inner.ctx().me()
    }

    pub fn context(&self) -> &NodeContext {
        self.inner.ctx()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<NodeEvent> {
        self.inner.deps.events.subscribe()
    }

    /// Join a channel: enter the member set, race for the lease and start the
    /// session loops. Joining twice returns the current role.
    pub async fn join(&self, channel: &ChannelName) -> Result<LeaseRole, CoreError> {
        if let Some(session) = self.inner.session(channel) {
            return Ok(session.leadership.role());
        }

        let ctx = self.inner.ctx();
        // Subscribe before announcing so our own join is not the first thing missed
        let events = ctx.cache.subscribe(&channel.events_topic()).await?;
        let rotations = ctx.cache.subscribe(&channel.rotation_topic()).await?;

        let session = Arc::new(ChannelSession::new(channel.clone(), ctx));
        self.inner
            .sessions
            .write()
            .insert(channel.clone(), session.clone());

        let role = match self.inner.enter(&session).await {
            Ok(role) => role,
            Err(e) => {
                self.inner.sessions.write().remove(channel);
                return Err(e);
            }
        };

        session.spawn_loops(self.inner.deps.clone(), events, rotations);
        ctx.store.lock().save_channel(channel)?;

        self.inner.deps.emit(NodeEvent::LeadershipChanged {
            channel: channel.clone(),
            role: role.clone(),
        });
        info!(channel = %channel, role = ?role, "Joined channel");
        Ok(role)
    }

    /// Leave a channel: leave the member set, release the lease if still
    /// ours, then stop the loops and announce the departure.
    ///
    /// If the cache rejects either mutation the channel stays joined and the
    /// call can be retried.
    pub async fn leave(&self, channel: &ChannelName) -> Result<(), CoreError> {
        let session = self.inner.require(channel)?;
        let ctx = self.inner.ctx();
        let following = session.leadership.role().leader().cloned();

        // The lease loop must not re-claim what we are about to release
        session.set_leaving(true);
        let departed = async {
            let guard = session.leadership.lock().await;
            session.membership.leave().await?;
            session.leadership.release(&guard).await?;
            Ok::<_, CoreError>(())
        }
        .await;
        if let Err(e) = departed {
            session.set_leaving(false);
            warn!(channel = %channel, error = %e, "Leave failed, still joined");
            return Err(e);
        }

        self.inner.sessions.write().remove(channel);
        session.stop().await;

        if let Err(e) = session.membership.announce_leave().await {
            warn!(channel = %channel, error = %e, "Leave announcement lost");
        }
        if let Some(leader) = following {
            let notice = RpcMessage::Leave {
                channel: channel.clone(),
            };
            if let Err(e) = ctx.send_rpc(MailboxChannel::RpcIn, &leader, notice).await {
                warn!(channel = %channel, leader = %leader, error = %e, "Could not notify the leader");
            }
        }
        ctx.store.lock().remove_channel(channel)?;

        info!(channel = %channel, "Left channel");
        Ok(())
    }

    /// Remove `target` and rotate the channel key so it cannot read anything
    /// sent afterwards. Returns the new key id.
    pub async fn kick(&self, channel: &ChannelName, target: &Username) -> Result<KeyId, CoreError> {
        let session = self.inner.require(channel)?;
        let ctx = self.inner.ctx();
        if target == ctx.me() {
            return Err(CoreError::CannotKickSelf(channel.clone()));
        }

        let guard = session.leadership.lock().await;
        if !session.leadership.verify_leader().await? {
            return Err(CoreError::NotLeader(channel.clone()));
        }

        session.membership.kick(target).await?;
        ctx.send_rpc(
            MailboxChannel::RpcIn,
            target,
            RpcMessage::Kick {
                channel: channel.clone(),
                target: target.clone(),
            },
        )
        .await?;

        let members = session.membership.refresh().await?;
        let excluded = BTreeSet::from([target.clone()]);
        let rotation = self
            .inner
            .deps
            .keys
            .rotate(channel, &members, &excluded, &guard)
            .await?;
        drop(guard);

        let key_id = rotation.key_id;
        self.inner.deps.emit(NodeEvent::KeyInstalled {
            channel: channel.clone(),
            key_id: key_id.clone(),
        });
        self.inner
            .deps
            .report_undelivered(channel, &key_id, &rotation.distribution);
        info!(channel = %channel, target = %target, key_id = %key_id.short(), "Member kicked");
        Ok(key_id)
    }

    /// Encrypt under the current epoch and hand the envelope to the leader.
    pub async fn send(&self, channel: &ChannelName, text: &str) -> Result<MessageId, CoreError> {
        self.inner.require(channel)?;
        let ctx = self.inner.ctx();

        // Read per send: after a failover the next message goes to the new leader
        let leader = ctx
            .leader_of(channel)
            .await?
            .ok_or_else(|| CoreError::NoLeader(channel.clone()))?;
        let (key_id, key) = self
            .inner
            .deps
            .keys
            .current(channel)
            .ok_or_else(|| CoreError::NoKey(channel.clone()))?;

        let envelope = relay::seal_chat(ctx.me(), channel, &leader, &key_id, &key, text)?;
        self.inner.delivered.lock().first_seen(envelope.message_id);
        ctx.mailbox
            .produce(MailboxChannel::DataIn, channel.as_str(), envelope.to_bytes()?)
            .await?;
        ctx.store.lock().append_message(&envelope)?;

        debug!(channel = %channel, leader = %leader, key_id = %key_id.short(), "Message sent");
        Ok(envelope.message_id)
    }

    /// Direct message under the pairwise key; no leader involved.
    pub async fn send_direct(&self, peer: &Username, text: &str) -> Result<MessageId, CoreError> {
        let ctx = self.inner.ctx();
        let contact = ctx.contact(peer)?;
        if contact.is_blocked {
            return Err(CoreError::Blocked(peer.clone()));
        }
        let envelope = relay::seal_direct(&ctx.identity, &contact, text)?;

        ctx.mailbox
            .produce(MailboxChannel::DataIn, peer.as_str(), envelope.to_bytes()?)
            .await?;
        ctx.store.lock().append_message(&envelope)?;

        debug!(to = %peer, "Direct message sent");
        Ok(envelope.message_id)
    }

    /// Leader-only: set the channel topic in the status hash.
    pub async fn set_topic(&self, channel: &ChannelName, topic: &str) -> Result<(), CoreError> {
        let session = self.inner.require(channel)?;
        if !session.leadership.verify_leader().await? {
            return Err(CoreError::NotLeader(channel.clone()));
        }
        let ctx = self.inner.ctx();
        let key = channel.status_key();
        ctx.cache.hash_set(&key, "topic", topic).await?;
        ctx.cache.hash_set(&key, "set_by", ctx.me().as_str()).await?;
        Ok(())
    }

    pub async fn status(&self, channel: &ChannelName) -> Result<ChannelStatus, CoreError> {
        let session = self.inner.require(channel)?;
        let ctx = self.inner.ctx();
        Ok(ChannelStatus {
            channel: channel.clone(),
            role: session.leadership.role(),
            leader: ctx.leader_of(channel).await?,
            members: session.membership.members().await?,
            metadata: ctx.cache.hash_get_all(&channel.status_key()).await?,
            current_key: self.inner.deps.keys.current(channel).map(|(id, _)| id),
        })
    }

    /// Publish our presence under `presence:{user}` and tell every contact
    /// we have not blocked. Returns how many were notified.
    pub async fn set_presence(&self, status: PresenceStatus) -> Result<usize, CoreError> {
        let ctx = self.inner.ctx();
        ctx.cache
            .set_with_ttl(&ctx.me().presence_key(), status.as_str(), ctx.config.presence_ttl)
            .await?;

        let contacts = ctx.store.lock().list_contacts()?;
        let mut notified = 0;
        for contact in contacts.iter().filter(|c| !c.is_blocked) {
            ctx.send_rpc(
                MailboxChannel::RpcIn,
                &contact.username,
                RpcMessage::Presence { status },
            )
            .await?;
            notified += 1;
        }
        Ok(notified)
    }

    /// Push our presence entry's expiry back. `false` if it already lapsed.
    pub async fn refresh_presence(&self) -> Result<bool, CoreError> {
        let ctx = self.inner.ctx();
        let key = ctx.me().presence_key();
        let Some(status) = ctx.cache.get(&key).await? else {
            return Ok(false);
        };
        Ok(ctx
            .cache
            .expire_if_equals(&key, &status, ctx.config.presence_ttl)
            .await?)
    }

    /// Anyone without a live presence entry is offline.
    pub async fn presence(&self, user: &Username) -> Result<PresenceStatus, CoreError> {
        let stored = self.inner.ctx().cache.get(&user.presence_key()).await?;
        Ok(match stored {
            None => PresenceStatus::Offline,
            Some(raw) => raw.parse().unwrap_or_else(|e| {
                warn!(user = %user, error = %e, "Unreadable presence entry");
                PresenceStatus::Offline
            }),
        })
    }

    /// Set or clear our typing indicator and tell the other members.
    pub async fn set_typing(&self, channel: &ChannelName, is_typing: bool) -> Result<(), CoreError> {
        let session = self.inner.require(channel)?;
        let ctx = self.inner.ctx();
        let key = channel.typing_key(ctx.me());
        if is_typing {
            ctx.cache.set_with_ttl(&key, "1", ctx.config.typing_ttl).await?;
        } else {
            ctx.cache.delete(&key).await?;
        }

        for member in session.membership.mirror().snapshot() {
            if &member == ctx.me() {
                continue;
            }
            ctx.send_rpc(
                MailboxChannel::RpcIn,
                &member,
                RpcMessage::Typing {
                    channel: channel.clone(),
                    is_typing,
                },
            )
            .await?;
        }
        Ok(())
    }

    /// Members whose typing indicator has not expired.
    pub async fn typing_users(&self, channel: &ChannelName) -> Result<BTreeSet<Username>, CoreError> {
        let prefix = channel.typing_prefix();
        let keys = self.inner.ctx().cache.keys_with_prefix(&prefix).await?;
        Ok(keys
            .iter()
            .filter_map(|key| key.strip_prefix(prefix.as_str()))
            .filter_map(|name| Username::new(name).ok())
            .collect())
    }

    /// Stop exchanging anything with `user`: no direct messages either way,
    /// no channel keys from us, no presence.
    pub fn block(&self, user: &Username) -> Result<(), CoreError> {
        self.set_blocked(user, true)
    }

    pub fn unblock(&self, user: &Username) -> Result<(), CoreError> {
        self.set_blocked(user, false)
    }

    fn set_blocked(&self, user: &Username, blocked: bool) -> Result<(), CoreError> {
        if !self.inner.ctx().store.lock().set_blocked(user, blocked)? {
            return Err(CoreError::UnknownContact(user.clone()));
        }
        info!(user = %user, blocked, "Contact block updated");
        Ok(())
    }

    /// Load persisted epochs into memory. Call before rejoining channels.
    pub fn restore_keys(&self) -> Result<usize, CoreError> {
        let restored = self.inner.deps.keys.restore()?;
        info!(count = restored, "Channel keys restored");
        Ok(restored)
    }

    /// Rejoin every channel recorded locally. Channels that fail are logged
    /// and skipped.
    pub async fn rejoin_saved_channels(&self) -> Result<Vec<ChannelName>, CoreError> {
        let saved = self.inner.ctx().store.lock().list_joined_channels()?;
        let mut joined = Vec::with_capacity(saved.len());
        for entry in saved {
            match self.join(&entry.name).await {
                Ok(_) => joined.push(entry.name),
                Err(e) => warn!(channel = %entry.name, error = %e, "Could not rejoin channel"),
            }
        }
        Ok(joined)
    }

    pub fn role(&self, channel: &ChannelName) -> Option<LeaseRole> {
        self.inner.session(channel).map(|s| s.leadership.role())
    }

    pub fn joined_channels(&self) -> Vec<ChannelName> {
        let mut channels: Vec<_> = self.inner.sessions.read().keys().cloned().collect();
        channels.sort();
        channels
    }

    /// `None` when this node was never given the epoch.
    pub fn resolve_key(&self, channel: &ChannelName, key_id: &KeyId) -> Option<SymmetricKey> {
        self.inner.deps.keys.resolve(channel, key_id)
    }

    pub fn current_key_id(&self, channel: &ChannelName) -> Option<KeyId> {
        self.inner.deps.keys.current(channel).map(|(id, _)| id)
    }

    pub fn history(&self, channel: &ChannelName, limit: u32) -> Result<Vec<StoredMessage>, CoreError> {
        Ok(self.inner.ctx().store.lock().recent_messages(channel, limit)?)
    }

    /// Stop everything at once without leaving or releasing anything, the
    /// way a crash would. The lease is left to expire.
    pub fn halt(&self) {
        let _ = self.inner.stop_tx.send(true);
        if let Some(task) = self.inner.dispatcher.lock().take() {
            task.abort();
        }
        for consumer in self.inner.consumers.lock().drain(..) {
            consumer.abort();
        }
        for (_, session) in self.inner.sessions.write().drain() {
            session.abort();
        }
        warn!(user = %self.me(), "Node halted");
    }

    /// Leave every channel, then stop the consumers and the dispatcher.
    pub async fn shutdown(&self) {
        for channel in self.joined_channels() {
            if let Err(e) = self.leave(&channel).await {
                warn!(channel = %channel, error = %e, "Leave failed during shutdown");
            }
        }

        let consumers: Vec<_> = std::mem::take(&mut *self.inner.consumers.lock());
        for consumer in consumers {
            consumer.shutdown().await;
        }

        let _ = self.inner.stop_tx.send(true);
        let dispatcher = self.inner.dispatcher.lock().take();
        if let Some(task) = dispatcher {
            if let Err(e) = task.await {
                if !e.is_cancelled() {
                    warn!(error = %e, "Dispatcher panicked");
                }
            }
        }
        info!(user = %self.me(), "Node stopped");
    }
}

impl NodeInner {
    fn ctx(&self) -> &NodeContext {
        &self.deps.ctx
    }

    fn session(&self, channel: &ChannelName) -> Option<Arc<ChannelSession>> {
        self.sessions.read().get(channel).cloned()
    }

    fn require(&self, channel: &ChannelName) -> Result<Arc<ChannelSession>, CoreError> {
        self.session(channel)
            .ok_or_else(|| CoreError::NotJoined(channel.clone()))
    }

    async fn enter(&self, session: &ChannelSession) -> Result<LeaseRole, CoreError> {
        session.membership.join().await?;

        let guard = session.leadership.lock().await;
        let role = session.leadership.try_claim(&guard).await?;
        match &role {
            LeaseRole::Leader => session.on_elected(&self.deps, &guard).await?,
            LeaseRole::Follower { leader } => {
                // The leader answers with the current epoch
                self.ctx()
                    .send_rpc(
                        MailboxChannel::RpcIn,
                        leader,
                        RpcMessage::Join {
                            channel: session.channel().clone(),
                        },
                    )
                    .await?;
            }
            // Lost every race to an expiring lease; the lease loop retries
            _ => {}
        }
        Ok(role)
    }

    /// Drop a channel after being kicked. Keys are kept, the lease and the
    /// member set are the leader's business.
    async fn teardown(&self, channel: &ChannelName, by: Username) {
        let Some(session) = self.sessions.write().remove(channel) else {
            return;
        };
        session.stop().await;
        if let Err(e) = self.ctx().store.lock().remove_channel(channel) {
            warn!(channel = %channel, error = %e, "Could not forget channel");
        }
        warn!(channel = %channel, by = %by, "Removed from channel");
        self.deps.emit(NodeEvent::Kicked {
            channel: channel.clone(),
            by,
        });
    }

    async fn on_data_in(&self, envelope: Envelope) -> Result<(), CoreError> {
        if envelope.recipient.as_ref() != Some(self.ctx().me()) {
            return Ok(());
        }
        match envelope.kind {
            MessageKind::Chat => self.relay(envelope).await,
            MessageKind::Direct => self.receive_direct(envelope),
        }
    }

    async fn relay(&self, envelope: Envelope) -> Result<(), CoreError> {
        if !self.relayed.lock().first_seen(envelope.message_id) {
            return Ok(());
        }
        let Some(channel) = envelope.channel.clone() else {
            return Ok(());
        };
        let Some(session) = self.session(&channel) else {
            warn!(channel = %channel, sender = %envelope.sender, "Relay request for a channel we left");
            return Ok(());
        };

        match relay::admit(&envelope, session.leadership.is_leader(), &session.membership).await? {
            RelayVerdict::Forward => {
                self.ctx()
                    .mailbox
                    .produce(MailboxChannel::DataOut, channel.as_str(), envelope.to_bytes()?)
                    .await?;
                debug!(channel = %channel, sender = %envelope.sender, "Relayed");
            }
            RelayVerdict::Rejected => {
                self.deps.emit(NodeEvent::RelayRejected {
                    channel,
                    sender: envelope.sender,
                });
            }
            RelayVerdict::Malformed(reason) => {
                warn!(channel = %channel, sender = %envelope.sender, reason = %reason, "Malformed relay request");
            }
            RelayVerdict::NotLeader => {}
        }
        Ok(())
    }

    fn receive_direct(&self, envelope: Envelope) -> Result<(), CoreError> {
        if !self.delivered.lock().first_seen(envelope.message_id) {
            return Ok(());
        }
        let contact = match self.ctx().contact(&envelope.sender) {
            Ok(contact) => contact,
            Err(CoreError::UnknownContact(sender)) => {
                warn!(sender = %sender, "Direct message from an unknown sender dropped");
                return Ok(());
            }
            Err(e) => return Err(e),
        };
        if contact.is_blocked {
            debug!(sender = %contact.username, "Direct message from a blocked contact dropped");
            return Ok(());
        }

        let text = relay::open_direct(&self.ctx().identity, &contact, &envelope)?;
        self.ctx().store.lock().append_message(&envelope)?;
        self.deps.emit(NodeEvent::DirectMessage {
            sender: envelope.sender,
            text,
            message_id: envelope.message_id,
            timestamp: envelope.timestamp,
        });
        Ok(())
    }

    async fn on_data_out(&self, envelope: Envelope) -> Result<(), CoreError> {
        if envelope.kind != MessageKind::Chat {
            return Ok(());
        }
        let Some(session) = envelope.channel.as_ref().and_then(|c| self.session(c)) else {
            return Ok(());
        };
        if !self.delivered.lock().first_seen(envelope.message_id) {
            return Ok(());
        }
        self.deliver(&session, envelope, 0).await
    }

    /// Decrypt and hand out a relayed envelope, or park it until its epoch
    /// arrives.
    async fn deliver(
        &self,
        session: &ChannelSession,
        envelope: Envelope,
        attempts: u32,
    ) -> Result<(), CoreError> {
        let channel = session.channel();
        let Some(key_id) = envelope.key_id.clone() else {
            return Ok(());
        };

        if let Some(key) = self.deps.keys.resolve(channel, &key_id) {
            match relay::open_chat(&envelope, &key) {
                Ok(text) => {
                    self.ctx().store.lock().append_message(&envelope)?;
                    self.deps.emit(NodeEvent::Message {
                        channel: channel.clone(),
                        sender: envelope.sender,
                        text,
                        message_id: envelope.message_id,
                        timestamp: envelope.timestamp,
                    });
                }
                Err(e) => {
                    warn!(channel = %channel, sender = %envelope.sender, error = %e, "Relayed envelope failed to decrypt");
                }
            }
            return Ok(());
        }

        let first_request = {
            let mut pending = session.pending.lock();
            if let Some(evicted) = pending.push_entry(relay::PendingEnvelope { envelope, attempts }) {
                debug!(channel = %channel, message_id = %evicted.message_id, "Pending queue full, oldest dropped");
            }
            pending.mark_requested(&key_id)
        };
        if first_request {
            self.request_key(channel, &key_id).await?;
        }
        Ok(())
    }

    async fn request_key(&self, channel: &ChannelName, key_id: &KeyId) -> Result<(), CoreError> {
        let ctx = self.ctx();
        match ctx.leader_of(channel).await? {
            Some(leader) if &leader != ctx.me() => {
                debug!(channel = %channel, key_id = %key_id.short(), leader = %leader, "Requesting key");
                ctx.send_rpc(
                    MailboxChannel::RpcIn,
                    &leader,
                    RpcMessage::KeyRequest {
                        channel: channel.clone(),
                        key_id: key_id.clone(),
                    },
                )
                .await
            }
            _ => Ok(()),
        }
    }

    /// Re-run pending envelopes. With `count` set each failure uses up one of
    /// the resolution attempts.
    async fn retry_pending(&self, session: &ChannelSession, count: bool) -> Result<(), CoreError> {
        let entries = session.pending.lock().drain();
        if entries.is_empty() {
            return Ok(());
        }
        let limit = self.ctx().config.key_resolve_retries;
        let channel = session.channel();

        for entry in entries {
            let key_id = entry.envelope.key_id.clone();
            let resolvable = key_id
                .as_ref()
                .is_some_and(|id| self.deps.keys.resolve(channel, id).is_some());
            let attempts = if count && !resolvable {
                entry.attempts + 1
            } else {
                entry.attempts
            };

            if !resolvable && attempts >= limit {
                let Some(key_id) = key_id else { continue };
                // Expected after being excluded from an epoch
                debug!(
                    channel = %channel,
                    key_id = %key_id.short(),
                    sender = %entry.envelope.sender,
                    "Dropping undecryptable envelope"
                );
                session.pending.lock().forget_request(&key_id);
                self.deps.emit(NodeEvent::Undecryptable {
                    channel: channel.clone(),
                    key_id,
                    sender: entry.envelope.sender,
                });
                continue;
            }
            self.deliver(session, entry.envelope, attempts).await?;
        }
        Ok(())
    }

    async fn retry_all_pending(&self) {
        let sessions: Vec<_> = self.sessions.read().values().cloned().collect();
        for session in sessions {
            if let Err(e) = self.retry_pending(&session, true).await {
                warn!(channel = %session.channel(), error = %e, "Pending retry failed");
            }
        }
    }

    async fn on_rpc(&self, frame: RpcFrame, route: MailboxChannel) -> Result<(), CoreError> {
        if &frame.recipient != self.ctx().me() {
            return Ok(());
        }
        if !self.rpc_seen.lock().first_seen(frame.message_id) {
            return Ok(());
        }
        debug!(from = %frame.sender, kind = frame.message.kind(), route = ?route, "RPC received");

        let sender = frame.sender;
        match frame.message {
            RpcMessage::KeyUpdate {
                channel,
                key_id,
                encrypted_key,
            } => {
                let Some(session) = self.session(&channel) else {
                    debug!(channel = %channel, "Key update for a channel we are not in");
                    return Ok(());
                };
                // Answers to a key request are old epochs; only pushes become current
                let make_current = route == MailboxChannel::RpcIn;
                let installed = self
                    .deps
                    .keys
                    .accept_update(&sender, &channel, key_id.clone(), &encrypted_key, make_current)
                    .await?;
                if installed {
                    session.pending.lock().forget_request(&key_id);
                    self.deps.emit(NodeEvent::KeyInstalled { channel, key_id });
                    self.retry_pending(&session, false).await?;
                }
            }

            RpcMessage::KeyRequest { channel, key_id } => {
                let Some(session) = self.session(&channel) else {
                    return Ok(());
                };
                if !session.leadership.is_leader() {
                    debug!(channel = %channel, from = %sender, "Key request while not leading, ignored");
                    return Ok(());
                }
                if !session.membership.is_member(&sender).await? {
                    warn!(channel = %channel, from = %sender, "Key request from a non-member refused");
                    return Ok(());
                }
                if !self.deps.keys.answer(&channel, &key_id, &sender).await? {
                    debug!(channel = %channel, key_id = %key_id.short(), "Requested epoch not retained");
                }
            }

            RpcMessage::Join { channel } => {
                let Some(session) = self.session(&channel) else {
                    return Ok(());
                };
                if !session.leadership.is_leader() {
                    return Ok(());
                }
                if !session.membership.is_member(&sender).await? {
                    warn!(channel = %channel, from = %sender, "Join request from outside the member set");
                    return Ok(());
                }
                if let Some((key_id, key)) = self.deps.keys.current(&channel) {
                    let joiner = BTreeSet::from([sender]);
                    let report = self
                        .deps
                        .keys
                        .distribute(&channel, &key, &key_id, &joiner)
                        .await?;
                    self.deps.report_undelivered(&channel, &key_id, &report);
                }
            }

            RpcMessage::Leave { channel } => {
                if let Some(session) = self.session(&channel) {
                    session.membership.mirror().remove(&sender);
                }
            }

            RpcMessage::Kick { channel, target } => {
                if &target != self.ctx().me() {
                    return Ok(());
                }
                let holder = self.ctx().leader_of(&channel).await?;
                if holder.as_ref() != Some(&sender) {
                    warn!(channel = %channel, from = %sender, "Kick from a non-leader ignored");
                    return Ok(());
                }
                self.teardown(&channel, sender).await;
            }

            RpcMessage::Presence { status } => {
                if self.ctx().store.lock().is_blocked(&sender)? {
                    return Ok(());
                }
                self.deps.emit(NodeEvent::Presence {
                    username: sender,
                    status,
                });
            }

            RpcMessage::Typing { channel, is_typing } => {
                if self.session(&channel).is_some() {
                    self.deps.emit(NodeEvent::Typing {
                        channel,
                        username: sender,
                        is_typing,
                    });
                }
            }
        }
        Ok(())
    }

    async fn on_command(&self, command: SessionCommand) {
        match command {
            SessionCommand::Kicked { channel, by } => self.teardown(&channel, by).await,
            SessionCommand::RetryPending { channel } => {
                if let Some(session) = self.session(&channel) {
                    if let Err(e) = self.retry_pending(&session, false).await {
                        warn!(channel = %channel, error = %e, "Pending retry failed");
                    }
                }
            }
        }
    }

    fn on_connectivity<T>(&self, event: &MailboxEvent<T>) -> bool {
        match event {
            MailboxEvent::ConnectivityLost(e) => {
                warn!(error = %e, "Mailbox connectivity lost");
                self.deps.emit(NodeEvent::ConnectivityLost {
                    component: "mailbox".to_string(),
                });
                true
            }
            MailboxEvent::ConnectivityRestored => {
                self.deps.emit(NodeEvent::ConnectivityRestored {
                    component: "mailbox".to_string(),
                });
                true
            }
            MailboxEvent::Message(_) => false,
        }
    }
}

fn report(result: Result<(), CoreError>, what: &str) {
    match result {
        Ok(()) => {}
        Err(e) if e.is_connectivity() => warn!(error = %e, what, "Connectivity lost while handling"),
        Err(e) => warn!(error = %e, what, "Handler failed"),
    }
}

async fn dispatch(
    inner: Arc<NodeInner>,
    mut inboxes: Inboxes,
    mut commands: mpsc::UnboundedReceiver<SessionCommand>,
    mut stop: watch::Receiver<bool>,
) {
    let mut retry = tokio::time::interval(inner.ctx().config.key_resolve_delay);
    retry.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = stop.changed() => break,
            Some(event) = inboxes.data_in.recv() => {
                if !inner.on_connectivity(&event) {
                    if let MailboxEvent::Message(envelope) = event {
                        report(inner.on_data_in(envelope).await, "data-in");
                    }
                }
            }
            Some(event) = inboxes.data_out.recv() => {
                if !inner.on_connectivity(&event) {
                    if let MailboxEvent::Message(envelope) = event {
                        report(inner.on_data_out(envelope).await, "data-out");
                    }
                }
            }
            Some(event) = inboxes.rpc_in.recv() => {
                if !inner.on_connectivity(&event) {
                    if let MailboxEvent::Message(frame) = event {
                        report(inner.on_rpc(frame, MailboxChannel::RpcIn).await, "rpc-in");
                    }
                }
            }
            Some(event) = inboxes.rpc_out.recv() => {
                if !inner.on_connectivity(&event) {
                    if let MailboxEvent::Message(frame) = event {
                        report(inner.on_rpc(frame, MailboxChannel::RpcOut).await, "rpc-out");
                    }
                }
            }
            Some(command) = commands.recv() => inner.on_command(command).await,
            _ = retry.tick() => inner.retry_all_pending().await,
        }
    }
    debug!("Dispatcher exited");
}
