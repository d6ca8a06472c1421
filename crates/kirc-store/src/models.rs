//! Rows persisted in the local database.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use kirc_shared::identity::PublicKey;
use kirc_shared::invite::{InvitePayload, ServiceConfig};
use kirc_shared::protocol::MessageKind;
use kirc_shared::types::{ChannelName, KeyId, MessageId, Username};

// ---------------------------------------------------------------------------
// Contact
// ---------------------------------------------------------------------------

/// A remote actor this node trusts. Keyed by username.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Contact {
    pub username: Username,
    pub display_name: String,
    pub public_key: PublicKey,
    /// Where the contact's mailbox lives
    pub service: ServiceConfig,
    #[serde(default)]
    pub is_blocked: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<InvitePayload> for Contact {
    fn from(payload: InvitePayload) -> Self {
        let now = Utc::now();
        Self {
            username: payload.username,
            display_name: payload.display_name,
            public_key: payload.public_key,
            service: payload.service,
            is_blocked: false,
            created_at: now,
            updated_at: now,
        }
    }
}

// ---------------------------------------------------------------------------
// Channel key epoch
// ---------------------------------------------------------------------------

/// One retained epoch. `encrypted_key` is sealed to the local identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredChannelKey {
    pub channel: ChannelName,
    pub key_id: KeyId,
    pub encrypted_key: Vec<u8>,
    pub is_current: bool,
    pub created_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Joined channel
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinedChannel {
    pub name: ChannelName,
    pub joined_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Message
// ---------------------------------------------------------------------------

/// A sent or received envelope, exactly as it was on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredMessage {
    pub message_id: MessageId,
    pub channel: Option<ChannelName>,
    pub sender: Username,
    pub recipient: Option<Username>,
    pub kind: MessageKind,
    pub key_id: Option<KeyId>,
    pub ciphertext: Vec<u8>,
    pub timestamp: DateTime<Utc>,
}
