use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::constants::{MAX_MESSAGE_SIZE, NONCE_SIZE};
use crate::error::ProtocolError;
use crate::types::{ChannelName, KeyId, MessageId, Username};

// Nonce plus Poly1305 tag on top of the plaintext bound.
const MAX_CIPHERTEXT_SIZE: usize = MAX_MESSAGE_SIZE + NONCE_SIZE + 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageKind {
    /// Channel traffic, encrypted under a channel key epoch and relayed by the leader
    Chat,
    /// One-to-one traffic under the pairwise key, never relayed
    Direct,
}

/// Unit carried on the `data-in` / `data-out` mailbox channels.
///
/// Immutable once sent. The leader re-broadcasts the exact bytes it received.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    pub sender: Username,
    pub recipient: Option<Username>,
    pub channel: Option<ChannelName>,
    pub kind: MessageKind,
    /// Present iff the ciphertext is under a channel key
    pub key_id: Option<KeyId>,
    /// XChaCha20-Poly1305: nonce || ciphertext
    pub ciphertext: Vec<u8>,
    pub timestamp: DateTime<Utc>,
    pub message_id: MessageId,
}

impl Envelope {
    pub fn chat(sender: Username, channel: ChannelName, key_id: KeyId, ciphertext: Vec<u8>) -> Self {
        Self {
            sender,
            recipient: None,
            channel: Some(channel),
            kind: MessageKind::Chat,
            key_id: Some(key_id),
            ciphertext,
            timestamp: Utc::now(),
            message_id: MessageId::new(),
        }
    }

    pub fn direct(sender: Username, recipient: Username, ciphertext: Vec<u8>) -> Self {
        Self {
            sender,
            recipient: Some(recipient),
            channel: None,
            kind: MessageKind::Direct,
            key_id: None,
            ciphertext,
            timestamp: Utc::now(),
            message_id: MessageId::new(),
        }
    }

    /// Check the addressing rules before sending or after receiving.
    pub fn validate(&self) -> Result<(), ProtocolError> {
        if self.ciphertext.len() > MAX_CIPHERTEXT_SIZE {
            return Err(ProtocolError::TooLarge {
                size: self.ciphertext.len(),
                max: MAX_CIPHERTEXT_SIZE,
            });
        }
        match self.kind {
            MessageKind::Chat => {
                let channel = self.channel.as_ref().ok_or(ProtocolError::Unaddressed)?;
                if self.key_id.is_none() {
                    return Err(ProtocolError::MissingKeyId(channel.to_string()));
                }
            }
            MessageKind::Direct => {
                if self.recipient.is_none() {
                    return Err(ProtocolError::Unaddressed);
                }
            }
        }
        Ok(())
    }

    /// Associated data the ciphertext is bound to
    pub fn aad(&self) -> Vec<u8> {
        match (&self.channel, &self.key_id, &self.recipient) {
            (Some(channel), Some(key_id), _) => channel_aad(channel, key_id),
            (_, _, Some(recipient)) => direct_aad(&self.sender, recipient),
            _ => Vec::new(),
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, ProtocolError> {
        bincode::serialize(self).map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, ProtocolError> {
        bincode::deserialize(data).map_err(|e| ProtocolError::Serialization(e.to_string()))
    }
}

/// `channel || 0x00 || key_id`
pub fn channel_aad(channel: &ChannelName, key_id: &KeyId) -> Vec<u8> {
    let mut aad = Vec::with_capacity(channel.as_str().len() + 1 + key_id.as_str().len());
    aad.extend_from_slice(channel.as_str().as_bytes());
    aad.push(0);
    aad.extend_from_slice(key_id.as_str().as_bytes());
    aad
}

/// `sender || 0x00 || recipient`
pub fn direct_aad(sender: &Username, recipient: &Username) -> Vec<u8> {
    let mut aad = Vec::with_capacity(sender.as_str().len() + 1 + recipient.as_str().len());
    aad.extend_from_slice(sender.as_str().as_bytes());
    aad.push(0);
    aad.extend_from_slice(recipient.as_str().as_bytes());
    aad
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PresenceStatus {
    Online,
    Away,
    Offline,
}

impl PresenceStatus {
    /// Value stored under `presence:{user}`
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Online => "online",
            Self::Away => "away",
            Self::Offline => "offline",
        }
    }
}

impl std::str::FromStr for PresenceStatus {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "online" => Ok(Self::Online),
            "away" => Ok(Self::Away),
            "offline" => Ok(Self::Offline),
            other => Err(ProtocolError::Serialization(format!(
                "unknown presence status '{other}'"
            ))),
        }
    }
}

/// Control payloads carried on the RPC mailbox channels
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RpcMessage {
    /// A channel key sealed to the recipient's public key
    KeyUpdate {
        channel: ChannelName,
        key_id: KeyId,
        encrypted_key: Vec<u8>,
    },

    /// Ask the leader for an epoch this node has not learned yet
    KeyRequest { channel: ChannelName, key_id: KeyId },

    Join { channel: ChannelName },

    Leave { channel: ChannelName },

    Kick {
        channel: ChannelName,
        target: Username,
    },

    Presence { status: PresenceStatus },

    Typing {
        channel: ChannelName,
        is_typing: bool,
    },
}

impl RpcMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::KeyUpdate { .. } => "key-update",
            Self::KeyRequest { .. } => "key-request",
            Self::Join { .. } => "join",
            Self::Leave { .. } => "leave",
            Self::Kick { .. } => "kick",
            Self::Presence { .. } => "presence",
            Self::Typing { .. } => "typing",
        }
    }

    pub fn channel(&self) -> Option<&ChannelName> {
        match self {
            Self::KeyUpdate { channel, .. }
            | Self::KeyRequest { channel, .. }
            | Self::Join { channel }
            | Self::Leave { channel }
            | Self::Kick { channel, .. }
            | Self::Typing { channel, .. } => Some(channel),
            Self::Presence { .. } => None,
        }
    }
}

/// An [`RpcMessage`] addressed to exactly one recipient
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RpcFrame {
    pub sender: Username,
    pub recipient: Username,
    pub message_id: MessageId,
    pub timestamp: DateTime<Utc>,
    pub message: RpcMessage,
}

impl RpcFrame {
    pub fn new(sender: Username, recipient: Username, message: RpcMessage) -> Self {
        Self {
            sender,
            recipient,
            message_id: MessageId::new(),
            timestamp: Utc::now(),
            message,
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, ProtocolError> {
        bincode::serialize(self).map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, ProtocolError> {
        bincode::deserialize(data).map_err(|e| ProtocolError::Serialization(e.to_string()))
    }
}

/// Published on `channel:{name}:events`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MembershipEvent {
    Join { username: Username },
    Leave { username: Username },
    Kick { target: Username, by: Username },
}

impl MembershipEvent {
    pub fn to_json(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    pub fn from_json(raw: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(raw).map_err(|e| ProtocolError::Serialization(e.to_string()))
    }
}

/// Published on `rotation:{name}` once a new epoch has been distributed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RotationSignal {
    pub key_id: KeyId,
    pub leader: Username,
    pub timestamp: DateTime<Utc>,
}

impl RotationSignal {
    pub fn new(key_id: KeyId, leader: Username) -> Self {
        Self {
            key_id,
            leader,
            timestamp: Utc::now(),
        }
    }

    pub fn to_json(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    pub fn from_json(raw: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(raw).map_err(|e| ProtocolError::Serialization(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn user(name: &str) -> Username {
        Username::new(name).unwrap()
    }

    fn channel() -> ChannelName {
        ChannelName::new("#NET_RUNNERS").unwrap()
    }

    #[test]
    fn test_envelope_wire_roundtrip() {
        let env = Envelope::chat(user("alice"), channel(), KeyId::generate(), vec![1, 2, 3, 4, 5]);
        let bytes = env.to_bytes().unwrap();
        let decoded = Envelope::from_bytes(&bytes).unwrap();
        assert_eq!(decoded, env);
    }

    #[test]
    fn test_chat_requires_key_id() {
        let mut env = Envelope::chat(user("alice"), channel(), KeyId::generate(), vec![0; 48]);
        assert!(env.validate().is_ok());

        env.key_id = None;
        assert_eq!(
            env.validate(),
            Err(ProtocolError::MissingKeyId("#NET_RUNNERS".to_string()))
        );
    }

    #[test]
    fn test_direct_requires_recipient() {
        let mut env = Envelope::direct(user("alice"), user("bob"), vec![0; 48]);
        assert!(env.validate().is_ok());

        env.recipient = None;
        assert_eq!(env.validate(), Err(ProtocolError::Unaddressed));
    }

    #[test]
    fn test_oversized_envelope_rejected() {
        let env = Envelope::direct(user("alice"), user("bob"), vec![0; MAX_CIPHERTEXT_SIZE + 1]);
        assert!(matches!(env.validate(), Err(ProtocolError::TooLarge { .. })));
    }

    #[test]
    fn test_aad_binds_channel_and_key() {
        let key_id = KeyId::from_string("k1");
        let env = Envelope::chat(user("alice"), channel(), key_id.clone(), vec![]);
        assert_eq!(env.aad(), b"#NET_RUNNERS\0k1".to_vec());
        assert_eq!(env.aad(), channel_aad(&channel(), &key_id));

        let dm = Envelope::direct(user("alice"), user("bob"), vec![]);
        assert_eq!(dm.aad(), b"alice\0bob".to_vec());
    }

    #[test]
    fn test_garbage_frame_is_serialization_error() {
        assert!(matches!(
            RpcFrame::from_bytes(&[0xff; 3]),
            Err(ProtocolError::Serialization(_))
        ));
    }

    #[test]
    fn test_membership_event_json_shape() {
        let event = MembershipEvent::Kick {
            target: user("bob"),
            by: user("alice"),
        };
        let json = event.to_json().unwrap();
        assert_eq!(json, r#"{"type":"kick","target":"bob","by":"alice"}"#);
        assert_eq!(MembershipEvent::from_json(&json).unwrap(), event);
    }

    #[test]
    fn test_rpc_message_channel() {
        let typing = RpcMessage::Typing {
            channel: channel(),
            is_typing: true,
        };
        assert_eq!(typing.channel(), Some(&channel()));
        assert_eq!(typing.kind(), "typing");

        let presence = RpcMessage::Presence {
            status: PresenceStatus::Away,
        };
        assert_eq!(presence.channel(), None);
    }
}
