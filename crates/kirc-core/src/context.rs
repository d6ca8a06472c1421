use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use kirc_net::{CoordinationCache, Mailbox, MailboxChannel};
use kirc_shared::identity::Identity;
use kirc_shared::protocol::{RpcFrame, RpcMessage};
use kirc_shared::types::{ChannelName, Username};
use kirc_store::{Contact, Database};

use crate::config::CoreConfig;
use crate::error::CoreError;

/// Everything a node's components share.
///
/// The identity is created once at startup and injected here; nothing else
/// holds key material for the local actor.
#[derive(Clone)]
pub struct NodeContext {
    pub identity: Arc<Identity>,
    pub cache: Arc<dyn CoordinationCache>,
    pub mailbox: Arc<dyn Mailbox>,
    pub store: Arc<Mutex<Database>>,
    pub config: CoreConfig,
}

impl NodeContext {
    pub fn new(
        identity: Identity,
        cache: Arc<dyn CoordinationCache>,
        mailbox: Arc<dyn Mailbox>,
        store: Database,
        config: CoreConfig,
    ) -> Self {
        Self {
            identity: Arc::new(identity),
            cache,
            mailbox,
            store: Arc::new(Mutex::new(store)),
            config,
        }
    }

    pub fn me(&self) -> &Username {
        self.identity.username()
    }

    pub fn contact(&self, username: &Username) -> Result<Contact, CoreError> {
        self.store
            .lock()
            .get_contact(username)?
            .ok_or_else(|| CoreError::UnknownContact(username.clone()))
    }

    /// Current lease holder, read straight from the cache.
    pub async fn leader_of(&self, channel: &ChannelName) -> Result<Option<Username>, CoreError> {
        let holder = self.cache.get(&channel.leader_key()).await?;
        Ok(holder.and_then(|h| Username::new(h).ok()))
    }

    /// Unicast one control message. Requests and notifications go on
    /// `rpc-in`, answers to a request on `rpc-out`.
    pub async fn send_rpc(
        &self,
        route: MailboxChannel,
        recipient: &Username,
        message: RpcMessage,
    ) -> Result<(), CoreError> {
        let kind = message.kind();
        let frame = RpcFrame::new(self.me().clone(), recipient.clone(), message);
        self.mailbox
            .produce(route, recipient.as_str(), frame.to_bytes()?)
            .await?;
        debug!(to = %recipient, kind, route = ?route, "RPC sent");
        Ok(())
    }
}
