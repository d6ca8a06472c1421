use rand::RngCore;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::constants::{KEY_ID_SIZE, MAX_NAME_LEN};
use crate::error::ProtocolError;

fn validate_name(s: &str) -> Result<(), ProtocolError> {
    let ok = !s.is_empty()
        && s.len() <= MAX_NAME_LEN
        && !s.contains(':')
        && !s.chars().any(char::is_whitespace);
    if ok {
        Ok(())
    } else {
        Err(ProtocolError::InvalidName(s.to_string()))
    }
}

// Human-chosen actor name, unique across the network
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(try_from = "String", into = "String")]
pub struct Username(String);

impl Username {
    pub fn new(s: impl Into<String>) -> Result<Self, ProtocolError> {
        let s = s.into();
        validate_name(&s)?;
        Ok(Self(s))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// `presence:{user}` (string, TTL)
    pub fn presence_key(&self) -> String {
        format!("presence:{}", self.0)
    }
}

impl TryFrom<String> for Username {
    type Error = ProtocolError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::new(s)
    }
}

impl From<Username> for String {
    fn from(u: Username) -> Self {
        u.0
    }
}

impl std::fmt::Display for Username {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::str::FromStr for Username {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

/// A channel name such as `#NET_RUNNERS`.
///
/// Channels only exist as cache entries; the name is the whole identity and
/// every coordination key is derived from it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(try_from = "String", into = "String")]
pub struct ChannelName(String);

impl ChannelName {
    pub fn new(s: impl Into<String>) -> Result<Self, ProtocolError> {
        let s = s.into();
        validate_name(&s)?;
        Ok(Self(s))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// `channel:{name}:leader` (string, TTL)
    pub fn leader_key(&self) -> String {
        format!("channel:{}:leader", self.0)
    }

    /// `channel:{name}:members` (set)
    pub fn members_key(&self) -> String {
        format!("channel:{}:members", self.0)
    }

    /// `channel:{name}:status` (hash)
    pub fn status_key(&self) -> String {
        format!("channel:{}:status", self.0)
    }

    /// `channel:{name}:events` (pub/sub)
    pub fn events_topic(&self) -> String {
        format!("channel:{}:events", self.0)
    }

    /// `rotation:{name}` (pub/sub)
    pub fn rotation_topic(&self) -> String {
        format!("rotation:{}", self.0)
    }

    /// `typing:{name}:{user}` (string, TTL)
    pub fn typing_key(&self, user: &Username) -> String {
        format!("{}{}", self.typing_prefix(), user.0)
    }

    /// Prefix shared by every typing indicator of the channel
    pub fn typing_prefix(&self) -> String {
        format!("typing:{}:", self.0)
    }
}

impl TryFrom<String> for ChannelName {
    type Error = ProtocolError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::new(s)
    }
}

impl From<ChannelName> for String {
    fn from(c: ChannelName) -> Self {
        c.0
    }
}

impl std::fmt::Display for ChannelName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::str::FromStr for ChannelName {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

// Random token minted at rotation time. Unique within a channel, not ordered.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct KeyId(String);

impl KeyId {
    pub fn generate() -> Self {
        let mut bytes = [0u8; KEY_ID_SIZE];
        rand::rngs::OsRng.fill_bytes(&mut bytes);
        Self(hex::encode(bytes))
    }

    pub fn from_string(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn short(&self) -> &str {
        &self.0[..self.0.len().min(8)]
    }
}

impl std::fmt::Display for KeyId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct MessageId(pub Uuid);

impl MessageId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for MessageId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for MessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}
