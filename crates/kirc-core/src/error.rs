use thiserror::Error;

use kirc_net::{CacheError, TransportError};
use kirc_shared::error::{CryptoError, IdentityError, ProtocolError};
use kirc_shared::invite::InviteError;
use kirc_shared::types::{ChannelName, Username};
use kirc_store::StoreError;

#[derive(Error, Debug)]
pub enum CoreError {
    /// A leader-only operation was attempted by a follower.
    #[error("Not the leader of {0}")]
    NotLeader(ChannelName),

    #[error("Not joined to {0}")]
    NotJoined(ChannelName),

    #[error("No leader currently holds {0}")]
    NoLeader(ChannelName),

    /// No current key epoch to encrypt with yet.
    #[error("No key for {0} yet")]
    NoKey(ChannelName),

    #[error("Cannot kick yourself from {0}")]
    CannotKickSelf(ChannelName),

    #[error("Unknown contact '{0}'")]
    UnknownContact(Username),

    #[error("Contact '{0}' is blocked")]
    Blocked(Username),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Cache error: {0}")]
    Cache(#[from] CacheError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Crypto error: {0}")]
    Crypto(#[from] CryptoError),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Identity error: {0}")]
    Identity(#[from] IdentityError),

    #[error("Invite error: {0}")]
    Invite(#[from] InviteError),
}

impl CoreError {
    /// Transport faults are reported as connectivity loss, not as failures
    /// of the operation the user asked for.
    pub fn is_connectivity(&self) -> bool {
        matches!(self, Self::Transport(_) | Self::Cache(_))
    }
}
