#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;

use kirc_core::handshake;
use kirc_core::{CoreConfig, Node, NodeContext, NodeEvent};
use kirc_net::{ConsumerConfig, CoordinationCache, MemoryBroker, MemoryCache};
use kirc_shared::identity::Identity;
use kirc_shared::invite::ServiceConfig;
use kirc_shared::types::{ChannelName, Username};
use kirc_store::Database;

pub const WAIT: Duration = Duration::from_secs(5);

pub fn config() -> CoreConfig {
    CoreConfig {
        lease_ttl: Duration::from_millis(400),
        renew_interval: Duration::from_millis(100),
        key_resolve_retries: 10,
        key_resolve_delay: Duration::from_millis(50),
        presence_ttl: Duration::from_millis(600),
        typing_ttl: Duration::from_millis(300),
        consumer: ConsumerConfig {
            poll_wait: Duration::from_millis(50),
            retry_backoff: Duration::from_millis(50),
            ..ConsumerConfig::default()
        },
        ..CoreConfig::default()
    }
}

pub fn user(name: &str) -> Username {
    Username::new(name).unwrap()
}

pub fn channel(name: &str) -> ChannelName {
    ChannelName::new(name).unwrap()
}

pub fn service() -> ServiceConfig {
    ServiceConfig {
        bootstrap_servers: "localhost:9092".to_string(),
        topics: vec!["data-in".to_string(), "rpc-in".to_string()],
        cache_uri: None,
    }
}

/// One broker and one cache shared by every node of a test.
#[derive(Clone, Default)]
pub struct Cluster {
    pub broker: MemoryBroker,
    pub cache: MemoryCache,
}

impl Cluster {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn context(&self, identity: Identity, db: Database) -> NodeContext {
        NodeContext::new(
            identity,
            Arc::new(self.cache.clone()),
            Arc::new(self.broker.clone()),
            db,
            config(),
        )
    }

    pub async fn node(&self, name: &str) -> Node {
        let identity = Identity::generate(user(name), name.to_uppercase());
        let db = Database::open_in_memory().unwrap();
        Node::start(self.context(identity, db)).await.unwrap()
    }

    pub async fn leader(&self, channel: &ChannelName) -> Option<String> {
        self.cache.get(&channel.leader_key()).await.unwrap()
    }

    /// Wait until the lease holder satisfies `pred` and return it.
    pub async fn wait_for_leader<F>(&self, channel: &ChannelName, pred: F) -> String
    where
        F: Fn(&str) -> bool,
    {
        tokio::time::timeout(WAIT, async {
            loop {
                if let Some(holder) = self.leader(channel).await {
                    if pred(&holder) {
                        return holder;
                    }
                }
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .expect("lease never reached the expected holder")
    }
}

/// Full mutual handshake between every pair of nodes.
pub fn introduce(nodes: &[&Node]) {
    for inviter in nodes {
        for acceptor in nodes {
            if inviter.me() == acceptor.me() {
                continue;
            }
            let bundle = handshake::create_invite(
                &acceptor.context().identity.public_key(),
                &inviter.context().identity,
                &service(),
            )
            .unwrap();
            let db = acceptor.context().store.lock();
            handshake::accept_invite(&db, &acceptor.context().identity, &bundle).unwrap();
        }
    }
}

/// Next event matching `pred`, failing the test after [`WAIT`].
pub async fn wait_for<F>(rx: &mut broadcast::Receiver<NodeEvent>, mut pred: F) -> NodeEvent
where
    F: FnMut(&NodeEvent) -> bool,
{
    tokio::time::timeout(WAIT, async {
        loop {
            match rx.recv().await {
                Ok(event) if pred(&event) => return event,
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => panic!("event stream closed"),
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}

/// `true` if no event matching `pred` shows up within `window`.
pub async fn none_within<F>(
    rx: &mut broadcast::Receiver<NodeEvent>,
    window: Duration,
    mut pred: F,
) -> bool
where
    F: FnMut(&NodeEvent) -> bool,
{
    tokio::time::timeout(window, async {
        loop {
            match rx.recv().await {
                Ok(event) if pred(&event) => return,
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => std::future::pending::<()>().await,
            }
        }
    })
    .await
    .is_err()
}

/// Poll `check` until it holds, failing the test after [`WAIT`].
pub async fn eventually<F>(mut check: F)
where
    F: FnMut() -> bool,
{
    tokio::time::timeout(WAIT, async {
        while !check() {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("condition never held");
}
