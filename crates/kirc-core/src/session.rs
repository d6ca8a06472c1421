//! One joined channel: its lease, its member mirror, its pending envelopes
//! and the two background loops that keep them current.
//!
//! The lease loop runs on its own timer so slow mailbox handling can never
//! delay a renewal. The signal loop consumes the channel's membership events
//! and rotation signals.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures::future::join_all;
use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use kirc_net::Subscription;
use kirc_shared::protocol::{MembershipEvent, RotationSignal};
use kirc_shared::types::{ChannelName, KeyId, Username};

use crate::context::NodeContext;
use crate::error::CoreError;
use crate::events::NodeEvent;
use crate::keys::{Distribution, KeyLifecycleManager};
use crate::leadership::{CoordinationGuard, LeadershipCoordinator, LeaseRole};
use crate::membership::MembershipManager;
use crate::relay::PendingQueue;

/// Work a session hands back to the node's dispatcher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionCommand {
    /// The leader removed us; tear the session down
    Kicked { channel: ChannelName, by: Username },
    /// A new epoch was announced; try the pending envelopes again
    RetryPending { channel: ChannelName },
}

/// What the background loops need from the node.
#[derive(Clone)]
pub struct SessionDeps {
    pub ctx: NodeContext,
    pub keys: KeyLifecycleManager,
    pub events: broadcast::Sender<NodeEvent>,
    pub commands: mpsc::UnboundedSender<SessionCommand>,
}

impl SessionDeps {
    pub fn emit(&self, event: NodeEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    /// Surface members a fan-out could not reach.
    pub fn report_undelivered(&self, channel: &ChannelName, key_id: &KeyId, report: &Distribution) {
        if report.skipped.is_empty() {
            return;
        }
        warn!(
            channel = %channel,
            key_id = %key_id.short(),
            members = ?report.skipped,
            "Members left without the current key"
        );
        self.emit(NodeEvent::KeyUndelivered {
            channel: channel.clone(),
            key_id: key_id.clone(),
            members: report.skipped.clone(),
        });
    }
}

pub struct ChannelSession {
    channel: ChannelName,
    me: Username,
    pub leadership: LeadershipCoordinator,
    pub membership: MembershipManager,
    pub pending: Mutex<PendingQueue>,
    leaving: AtomicBool,
    shutdown_tx: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl ChannelSession {
    pub fn new(channel: ChannelName, ctx: &NodeContext) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            leadership: LeadershipCoordinator::new(
                channel.clone(),
                ctx.me().clone(),
                ctx.cache.clone(),
                ctx.config.lease_ttl,
            ),
            membership: MembershipManager::new(channel.clone(), ctx.me().clone(), ctx.cache.clone()),
            pending: Mutex::new(PendingQueue::new(ctx.config.pending_limit)),
            leaving: AtomicBool::new(false),
            me: ctx.me().clone(),
            channel,
            shutdown_tx,
            tasks: Mutex::new(Vec::new()),
        }
    }

    pub fn channel(&self) -> &ChannelName {
        &self.channel
    }

    /// While set, the lease loop neither renews nor claims.
    pub fn set_leaving(&self, leaving: bool) {
        self.leaving.store(leaving, Ordering::SeqCst);
    }

    fn is_leaving(&self) -> bool {
        self.leaving.load(Ordering::SeqCst)
    }

    /// Freshly elected: make sure every member holds the latest epoch.
    ///
    /// Members may have missed the previous leader's distribution, so a
    /// current epoch is always redistributed. If our own view is behind the
    /// latest epoch minted for the channel (or we hold none), we rotate
    /// instead: the epoch we would hand out may predate a kick.
    pub async fn on_elected(
        &self,
        deps: &SessionDeps,
        guard: &CoordinationGuard<'_>,
    ) -> Result<(), CoreError> {
        let members = self.membership.refresh().await?;
        let latest = deps.keys.latest_epoch(&self.channel).await?;

        match deps.keys.current(&self.channel) {
            Some((key_id, key)) if latest.as_ref().map_or(true, |(id, _)| *id == key_id) => {
                let report = deps
                    .keys
                    .distribute(&self.channel, &key, &key_id, &members)
                    .await?;
                deps.report_undelivered(&self.channel, &key_id, &report);
                info!(
                    channel = %self.channel,
                    key_id = %key_id.short(),
                    members = members.len(),
                    "Leading channel, current key redistributed"
                );
            }
            held => {
                if let Some((stale, _)) = held {
                    warn!(
                        channel = %self.channel,
                        held = %stale.short(),
                        latest = ?latest.as_ref().map(|(id, _)| id.short()),
                        "Local epoch is behind the channel, rotating"
                    );
                }
                let rotation = deps
                    .keys
                    .rotate(&self.channel, &members, &BTreeSet::new(), guard)
                    .await?;
                deps.emit(NodeEvent::KeyInstalled {
                    channel: self.channel.clone(),
                    key_id: rotation.key_id.clone(),
                });
                deps.report_undelivered(&self.channel, &rotation.key_id, &rotation.distribution);
            }
        }
        Ok(())
    }

    pub fn spawn_loops(
        self: &Arc<Self>,
        deps: SessionDeps,
        events: Subscription,
        rotations: Subscription,
    ) {
        let lease = tokio::spawn(lease_loop(
            self.clone(),
            deps.clone(),
            self.shutdown_tx.subscribe(),
        ));
        let signals = tokio::spawn(signal_loop(
            self.clone(),
            deps,
            events,
            rotations,
            self.shutdown_tx.subscribe(),
        ));
        self.tasks.lock().extend([lease, signals]);
    }

    /// Cancel both loops and wait until they have exited.
    pub async fn stop(&self) {
        let _ = self.shutdown_tx.send(true);
        let tasks: Vec<_> = std::mem::take(&mut *self.tasks.lock());
        for result in join_all(tasks).await {
            if let Err(e) = result {
                if !e.is_cancelled() {
                    warn!(channel = %self.channel, error = %e, "Session task panicked");
                }
            }
        }
        debug!(channel = %self.channel, "Session loops stopped");
    }

    /// Kill the loops without waiting. Used to simulate a crash.
    pub fn abort(&self) {
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
    }

    async fn lease_tick(&self, deps: &SessionDeps, recovering: bool) -> Result<(), CoreError> {
        if self.is_leaving() {
            return Ok(());
        }
        let before = self.leadership.role();
        if !recovering && before.is_leader() && self.leadership.renew().await? {
            return Ok(());
        }

        let guard = self.leadership.lock().await;
        if self.is_leaving() {
            return Ok(());
        }
        if recovering {
            // Nothing from before the outage is trusted
            self.membership.rejoin().await?;
        }
        let role = if recovering || before.is_leader() {
            self.leadership.try_claim(&guard).await?
        } else {
            self.leadership.observe(&guard).await?
        };

        if role != before {
            info!(channel = %self.channel, role = ?role, "Channel role changed");
            deps.emit(NodeEvent::LeadershipChanged {
                channel: self.channel.clone(),
                role: role.clone(),
            });
            if role.is_leader() {
                self.on_elected(deps, &guard).await?;
            }
        }
        Ok(())
    }

    fn handle_membership(&self, deps: &SessionDeps, event: MembershipEvent) -> bool {
        self.membership.mirror().apply(&event);
        let channel = self.channel.clone();

        match event {
            MembershipEvent::Join { username } if username != self.me => {
                deps.emit(NodeEvent::MemberJoined { channel, username });
            }
            MembershipEvent::Leave { username } if username != self.me => {
                deps.emit(NodeEvent::MemberLeft { channel, username });
            }
            MembershipEvent::Kick { target, by } if target == self.me => {
                warn!(channel = %self.channel, by = %by, "Kicked from channel");
                let command = SessionCommand::Kicked { channel, by };
                return deps.commands.send(command).is_ok();
            }
            MembershipEvent::Kick { target, .. } => {
                deps.emit(NodeEvent::MemberKicked { channel, target });
            }
            _ => {}
        }
        true
    }

    fn handle_rotation(&self, deps: &SessionDeps, signal: RotationSignal) -> bool {
        debug!(
            channel = %self.channel,
            key_id = %signal.key_id.short(),
            leader = %signal.leader,
            "Rotation announced"
        );
        deps.keys
            .ring()
            .announce(&self.channel, signal.key_id.clone(), signal.leader);
        deps.emit(NodeEvent::KeyRotated {
            channel: self.channel.clone(),
            key_id: signal.key_id,
        });
        let command = SessionCommand::RetryPending {
            channel: self.channel.clone(),
        };
        deps.commands.send(command).is_ok()
    }
}

async fn lease_loop(
    session: Arc<ChannelSession>,
    deps: SessionDeps,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut tick = tokio::time::interval(deps.ctx.config.renew_interval);
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick fires immediately; the claim on join already covered it
    tick.tick().await;

    let mut connected = true;
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = tick.tick() => {}
        }

        match session.lease_tick(&deps, !connected).await {
            Ok(()) => {
                if !connected {
                    connected = true;
                    info!(channel = %session.channel, "Coordination cache connectivity restored");
                    deps.emit(NodeEvent::ConnectivityRestored {
                        component: "cache".to_string(),
                    });
                }
            }
            Err(e) if e.is_connectivity() => {
                if connected {
                    connected = false;
                    warn!(channel = %session.channel, error = %e, "Coordination cache connectivity lost");
                    session.leadership.reset();
                    deps.emit(NodeEvent::ConnectivityLost {
                        component: "cache".to_string(),
                    });
                    deps.emit(NodeEvent::LeadershipChanged {
                        channel: session.channel.clone(),
                        role: LeaseRole::None,
                    });
                }
            }
            Err(e) => {
                warn!(channel = %session.channel, error = %e, "Lease check failed");
            }
        }
    }
    debug!(channel = %session.channel, "Lease loop exited");
}

async fn signal_loop(
    session: Arc<ChannelSession>,
    deps: SessionDeps,
    mut events: Subscription,
    mut rotations: Subscription,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let keep_going = tokio::select! {
            _ = shutdown.changed() => break,
            raw = events.recv() => match raw {
                Some(raw) => match MembershipEvent::from_json(&raw) {
                    Ok(event) => session.handle_membership(&deps, event),
                    Err(e) => {
                        warn!(channel = %session.channel, error = %e, "Undecodable membership event");
                        true
                    }
                },
                None => false,
            },
            raw = rotations.recv() => match raw {
                Some(raw) => match RotationSignal::from_json(&raw) {
                    Ok(signal) => session.handle_rotation(&deps, signal),
                    Err(e) => {
                        warn!(channel = %session.channel, error = %e, "Undecodable rotation signal");
                        true
                    }
                },
                None => false,
            },
        };
        if !keep_going {
            break;
        }
    }
    debug!(channel = %session.channel, "Signal loop exited");
}
