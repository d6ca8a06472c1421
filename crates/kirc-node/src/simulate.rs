//! In-process run of the `#NET_RUNNERS` scenario.
//!
//! Three actors share one [`MemoryBroker`] and one [`MemoryCache`]. Alice
//! leads, Bob and Carol follow, Alice kicks Bob, then Alice crashes and the
//! lease moves to Carol. Every node event is printed as one JSON line.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::info;

use kirc_core::{handshake, CoreConfig, LeaseRole, Node, NodeContext};
use kirc_net::{CoordinationCache, MemoryBroker, MemoryCache};
use kirc_shared::identity::Identity;
use kirc_shared::invite::ServiceConfig;
use kirc_shared::types::{ChannelName, Username};
use kirc_store::Database;

const STEP_TIMEOUT: Duration = Duration::from_secs(10);

pub struct Simulation {
    channel: ChannelName,
    config: CoreConfig,
    broker: MemoryBroker,
    cache: MemoryCache,
    printers: Vec<JoinHandle<()>>,
}

impl Simulation {
    /// `base` contributes the retry budget; the lease comes from `lease`.
    pub fn new(channel: &str, lease: Duration, base: &CoreConfig) -> anyhow::Result<Self> {
        let config = CoreConfig {
            key_resolve_retries: base.key_resolve_retries.max(5),
            key_resolve_delay: Duration::from_millis(50),
            ..CoreConfig::with_lease_ttl(lease)
        };
        config.validate()?;
        Ok(Self {
            channel: ChannelName::new(channel)?,
            config,
            broker: MemoryBroker::new(),
            cache: MemoryCache::new(),
            printers: Vec::new(),
        })
    }

    async fn spawn_node(&mut self, name: &str) -> anyhow::Result<Node> {
        let username = Username::new(name)?;
        let identity = Identity::generate(username, capitalize(name));
        let ctx = NodeContext::new(
            identity,
            Arc::new(self.cache.clone()),
            Arc::new(self.broker.clone()),
            Database::open_in_memory()?,
            self.config.clone(),
        );
        let node = Node::start(ctx).await?;

        let mut events = node.subscribe();
        let label = name.to_string();
        self.printers.push(tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(event) => {
                        if let Ok(line) = serde_json::to_string(&event) {
                            println!("{label:<6} {line}");
                        }
                    }
                    Err(RecvError::Lagged(_)) => continue,
                    Err(RecvError::Closed) => break,
                }
            }
        }));
        Ok(node)
    }

    async fn leader(&self) -> anyhow::Result<Option<String>> {
        Ok(self.cache.get(&self.channel.leader_key()).await?)
    }

    pub async fn run(mut self) -> anyhow::Result<()> {
        let ch = self.channel.clone();
        let alice = self.spawn_node("alice").await?;
        let bob = self.spawn_node("bob").await?;
        let carol = self.spawn_node("carol").await?;
        introduce(&[&alice, &bob, &carol])?;

        banner("alice opens the channel");
        let role = alice.join(&ch).await?;
        if role != LeaseRole::Leader {
            bail!("alice should lead an empty channel, got {role:?}");
        }
        let id1 = alice.current_key_id(&ch).context("leader holds no key")?;

        banner("bob and carol join");
        bob.join(&ch).await?;
        carol.join(&ch).await?;
        let (b, c, chr) = (&bob, &carol, &ch);
        let first = &id1;
        within("the followers receive the first key", move || async move {
            b.resolve_key(chr, first).is_some() && c.resolve_key(chr, first).is_some()
        })
        .await?;

        banner("alice says hello through her own relay");
        alice.send(&ch, "hello").await?;
        bob.send(&ch, "hi alice").await?;
        tokio::time::sleep(self.config.renew_interval).await;

        banner("alice kicks bob");
        let id2 = alice.kick(&ch, &Username::new("bob")?).await?;
        let rotated = &id2;
        within("carol receives the rotated key", move || async move {
            c.resolve_key(chr, rotated).is_some()
        })
        .await?;
        if bob.resolve_key(&ch, &id2).is_some() {
            bail!("kicked member obtained the rotated key");
        }
        alice.send(&ch, "bob cannot read this").await?;
        tokio::time::sleep(self.config.renew_interval).await;

        banner("alice crashes without releasing the lease");
        alice.halt();
        let sim = &self;
        within("carol takes the lease", move || async move {
            matches!(sim.leader().await, Ok(Some(holder)) if holder == "carol")
        })
        .await?;
        carol.send(&ch, "carol relaying now").await?;
        tokio::time::sleep(self.config.renew_interval).await;

        let status = carol.status(&ch).await?;
        info!(
            channel = %ch,
            leader = ?status.leader,
            members = status.members.len(),
            "Simulation finished"
        );

        bob.shutdown().await;
        carol.shutdown().await;
        for printer in self.printers {
            printer.abort();
        }
        Ok(())
    }
}

/// Full mutual handshake between every pair of nodes.
fn introduce(nodes: &[&Node]) -> anyhow::Result<()> {
    let service = ServiceConfig {
        bootstrap_servers: "in-process".to_string(),
        topics: Vec::new(),
        cache_uri: None,
    };
    for inviter in nodes {
        for acceptor in nodes {
            if inviter.me() == acceptor.me() {
                continue;
            }
            let bundle = handshake::create_invite(
                &acceptor.context().identity.public_key(),
                &inviter.context().identity,
                &service,
            )?;
            let db = acceptor.context().store.lock();
            handshake::accept_invite(&db, &acceptor.context().identity, &bundle)?;
        }
    }
    Ok(())
}

async fn within<F, Fut>(what: &str, mut check: F) -> anyhow::Result<()>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let polled = tokio::time::timeout(STEP_TIMEOUT, async {
        while !check().await {
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
    })
    .await;
    polled.with_context(|| format!("timed out waiting until {what}"))
}

fn banner(step: &str) {
    println!("-- {step}");
}

fn capitalize(name: &str) -> String {
    let mut chars = name.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}
