use chrono::{DateTime, Utc};
use serde::Serialize;

use kirc_shared::protocol::PresenceStatus;
use kirc_shared::types::{ChannelName, KeyId, MessageId, Username};

use crate::leadership::LeaseRole;

/// Everything a front end can observe about a running node.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum NodeEvent {
    Message {
        channel: ChannelName,
        sender: Username,
        text: String,
        message_id: MessageId,
        timestamp: DateTime<Utc>,
    },
    DirectMessage {
        sender: Username,
        text: String,
        message_id: MessageId,
        timestamp: DateTime<Utc>,
    },
    MemberJoined {
        channel: ChannelName,
        username: Username,
    },
    MemberLeft {
        channel: ChannelName,
        username: Username,
    },
    MemberKicked {
        channel: ChannelName,
        target: Username,
    },
    /// We were removed from the channel
    Kicked {
        channel: ChannelName,
        by: Username,
    },
    LeadershipChanged {
        channel: ChannelName,
        role: LeaseRole,
    },
    KeyInstalled {
        channel: ChannelName,
        key_id: KeyId,
    },
    KeyRotated {
        channel: ChannelName,
        key_id: KeyId,
    },
    /// Members the leader could not send an epoch to (no contact record)
    KeyUndelivered {
        channel: ChannelName,
        key_id: KeyId,
        members: Vec<Username>,
    },
    /// Dropped after the key-resolution retries ran out
    Undecryptable {
        channel: ChannelName,
        key_id: KeyId,
        sender: Username,
    },
    /// The leader refused to relay for a non-member
    RelayRejected {
        channel: ChannelName,
        sender: Username,
    },
    Presence {
        username: Username,
        status: PresenceStatus,
    },
    Typing {
        channel: ChannelName,
        username: Username,
        is_typing: bool,
    },
    ConnectivityLost {
        component: String,
    },
    ConnectivityRestored {
        component: String,
    },
}
