//! Encrypted relay pipeline.
//!
//! ```text
//! sender:  COMPOSED -> ENCRYPTED -> SENT            (data-in, addressed to the leader)
//! leader:  RECEIVED -> VALIDATED -> re-broadcast    (data-out, same bytes)
//!                   -> REJECTED                     (sender not a member)
//! member:  RECEIVED -> DECRYPTED
//!                   -> PENDING -> DECRYPTED | dropped after retries
//! ```
//!
//! The leader never decrypts. Channel envelopes are bound to
//! `channel || 0 || key_id`, direct envelopes to `sender || 0 || recipient`.

use std::collections::{HashSet, VecDeque};

use tracing::{debug, warn};

use kirc_shared::crypto::{self, SymmetricKey};
use kirc_shared::identity::Identity;
use kirc_shared::protocol::{channel_aad, direct_aad, Envelope, MessageKind};
use kirc_shared::types::{ChannelName, KeyId, MessageId, Username};
use kirc_store::Contact;

use crate::error::CoreError;
use crate::membership::MembershipManager;

/// Bounded set of recently seen message ids. Absorbs at-least-once redelivery.
#[derive(Debug)]
pub struct DedupWindow {
    capacity: usize,
    order: VecDeque<MessageId>,
    seen: HashSet<MessageId>,
}

impl DedupWindow {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            order: VecDeque::new(),
            seen: HashSet::new(),
        }
    }

    /// `true` the first time an id is offered, `false` for every repeat
    /// still inside the window.
    pub fn first_seen(&mut self, id: MessageId) -> bool {
        if !self.seen.insert(id) {
            return false;
        }
        self.order.push_back(id);
        if self.order.len() > self.capacity {
            if let Some(evicted) = self.order.pop_front() {
                self.seen.remove(&evicted);
            }
        }
        true
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct PendingEnvelope {
    pub envelope: Envelope,
    pub attempts: u32,
}

/// Envelopes of one channel waiting for their key epoch.
#[derive(Debug)]
pub struct PendingQueue {
    limit: usize,
    entries: VecDeque<PendingEnvelope>,
    // Key ids we already asked the leader for
    requested: HashSet<KeyId>,
}

impl PendingQueue {
    pub fn new(limit: usize) -> Self {
        Self {
            limit: limit.max(1),
            entries: VecDeque::new(),
            requested: HashSet::new(),
        }
    }

    /// Queue an envelope, evicting the oldest when full.
    pub fn push(&mut self, envelope: Envelope) -> Option<Envelope> {
        self.push_entry(PendingEnvelope {
            envelope,
            attempts: 0,
        })
    }

    pub fn push_entry(&mut self, entry: PendingEnvelope) -> Option<Envelope> {
        let evicted = if self.entries.len() >= self.limit {
            self.entries.pop_front().map(|e| e.envelope)
        } else {
            None
        };
        self.entries.push_back(entry);
        evicted
    }

    pub fn drain(&mut self) -> Vec<PendingEnvelope> {
        self.entries.drain(..).collect()
    }

    /// Record a key request; `false` if one was already sent for this id.
    pub fn mark_requested(&mut self, key_id: &KeyId) -> bool {
        self.requested.insert(key_id.clone())
    }

    pub fn forget_request(&mut self, key_id: &KeyId) {
        self.requested.remove(key_id);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Encrypt `text` under the channel's current epoch and address it to `leader`.
pub fn seal_chat(
    sender: &Username,
    channel: &ChannelName,
    leader: &Username,
    key_id: &KeyId,
    key: &SymmetricKey,
    text: &str,
) -> Result<Envelope, CoreError> {
    let ciphertext =
        crypto::encrypt_with_aad(key, text.as_bytes(), &channel_aad(channel, key_id))?;
    let mut envelope = Envelope::chat(sender.clone(), channel.clone(), key_id.clone(), ciphertext);
    envelope.recipient = Some(leader.clone());
    envelope.validate()?;
    Ok(envelope)
}

/// Decrypt a relayed channel envelope with the epoch it names.
pub fn open_chat(envelope: &Envelope, key: &SymmetricKey) -> Result<String, CoreError> {
    let plaintext = crypto::decrypt_with_aad(key, &envelope.ciphertext, &envelope.aad())?;
    Ok(String::from_utf8_lossy(&plaintext).into_owned())
}

/// Encrypt a direct message under the pairwise key shared with `peer`.
pub fn seal_direct(identity: &Identity, peer: &Contact, text: &str) -> Result<Envelope, CoreError> {
    let key = crypto::derive_pairwise_key(identity.encryption_secret(), &peer.public_key.encryption);
    let ciphertext = crypto::encrypt_with_aad(
        &key,
        text.as_bytes(),
        &direct_aad(identity.username(), &peer.username),
    )?;
    let envelope = Envelope::direct(identity.username().clone(), peer.username.clone(), ciphertext);
    envelope.validate()?;
    Ok(envelope)
}

pub fn open_direct(
    identity: &Identity,
    sender: &Contact,
    envelope: &Envelope,
) -> Result<String, CoreError> {
    let key =
        crypto::derive_pairwise_key(identity.encryption_secret(), &sender.public_key.encryption);
    let plaintext = crypto::decrypt_with_aad(
        &key,
        &envelope.ciphertext,
        &direct_aad(&sender.username, identity.username()),
    )?;
    Ok(String::from_utf8_lossy(&plaintext).into_owned())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayVerdict {
    /// Re-broadcast the envelope as received
    Forward,
    /// We no longer hold the lease; the envelope is dropped
    NotLeader,
    /// Sender is not in the member set
    Rejected,
    Malformed(String),
}

/// Leader-side admission check for an envelope arriving on `data-in`.
pub async fn admit(
    envelope: &Envelope,
    is_leader: bool,
    membership: &MembershipManager,
) -> Result<RelayVerdict, CoreError> {
    if let Err(e) = envelope.validate() {
        return Ok(RelayVerdict::Malformed(e.to_string()));
    }
    if envelope.kind != MessageKind::Chat {
        return Ok(RelayVerdict::Malformed("direct envelope sent for relay".to_string()));
    }
    if !is_leader {
        warn!(
            channel = ?envelope.channel.as_ref().map(ChannelName::as_str),
            sender = %envelope.sender,
            message_id = %envelope.message_id,
            "Relay request reached a non-leader, dropping"
        );
        return Ok(RelayVerdict::NotLeader);
    }
    if !membership.is_member(&envelope.sender).await? {
        warn!(
            channel = ?envelope.channel.as_ref().map(ChannelName::as_str),
            sender = %envelope.sender,
            "Moderation: relay refused for non-member"
        );
        return Ok(RelayVerdict::Rejected);
    }
    debug!(sender = %envelope.sender, message_id = %envelope.message_id, "Relay admitted");
    Ok(RelayVerdict::Forward)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use chrono::Utc;
    use kirc_net::{CoordinationCache, MemoryCache};
    use kirc_shared::invite::ServiceConfig;

    fn user(name: &str) -> Username {
        Username::new(name).unwrap()
    }

    fn channel() -> ChannelName {
        ChannelName::new("#NET_RUNNERS").unwrap()
    }

    fn contact_of(identity: &Identity) -> Contact {
        Contact {
            username: identity.username().clone(),
            display_name: identity.display_name().to_string(),
            public_key: identity.public_key(),
            service: ServiceConfig {
                bootstrap_servers: "localhost:9092".to_string(),
                topics: Vec::new(),
                cache_uri: None,
            },
            is_blocked: false,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn dedup_window_evicts_oldest() {
        let mut window = DedupWindow::new(2);
        let (a, b, c) = (MessageId::new(), MessageId::new(), MessageId::new());

        assert!(window.first_seen(a));
        assert!(!window.first_seen(a));
        assert!(window.first_seen(b));
        assert!(window.first_seen(c));
        assert_eq!(window.len(), 2);
        // `a` fell out of the window
        assert!(window.first_seen(a));
        assert!(!window.first_seen(c));
    }

    #[test]
    fn pending_queue_is_bounded() {
        let mut queue = PendingQueue::new(2);
        let key_id = KeyId::from_string("k1");
        let make = || Envelope::chat(user("alice"), channel(), key_id.clone(), vec![0; 40]);

        let first = make();
        assert!(queue.push(first.clone()).is_none());
        assert!(queue.push(make()).is_none());
        let evicted = queue.push(make()).unwrap();
        assert_eq!(evicted.message_id, first.message_id);
        assert_eq!(queue.len(), 2);

        assert!(queue.mark_requested(&key_id));
        assert!(!queue.mark_requested(&key_id));
        assert_eq!(queue.drain().len(), 2);
        assert!(queue.is_empty());
    }

    #[test]
    fn chat_roundtrip_and_wrong_epoch() {
        let k1 = crypto::generate_symmetric_key();
        let k2 = crypto::generate_symmetric_key();
        let id1 = KeyId::from_string("id1");

        let envelope = seal_chat(&user("alice"), &channel(), &user("alice"), &id1, &k1, "hello").unwrap();
        assert_eq!(envelope.recipient, Some(user("alice")));
        assert_eq!(open_chat(&envelope, &k1).unwrap(), "hello");
        assert!(matches!(open_chat(&envelope, &k2), Err(CoreError::Crypto(_))));
    }

    #[test]
    fn chat_ciphertext_is_bound_to_key_id() {
        let key = crypto::generate_symmetric_key();
        let mut envelope = seal_chat(
            &user("alice"),
            &channel(),
            &user("alice"),
            &KeyId::from_string("id1"),
            &key,
            "hello",
        )
        .unwrap();
        envelope.key_id = Some(KeyId::from_string("id2"));
        assert!(open_chat(&envelope, &key).is_err());
    }

    #[test]
    fn direct_roundtrip() {
        let alice = Identity::generate(user("alice"), "Alice");
        let bob = Identity::generate(user("bob"), "Bob");
        let eve = Identity::generate(user("eve"), "Eve");

        let envelope = seal_direct(&alice, &contact_of(&bob), "psst").unwrap();
        assert_eq!(envelope.kind, MessageKind::Direct);
        assert_eq!(open_direct(&bob, &contact_of(&alice), &envelope).unwrap(), "psst");
        assert!(open_direct(&eve, &contact_of(&alice), &envelope).is_err());
    }

    #[tokio::test]
    async fn admit_checks_leadership_and_membership() {
        let cache = MemoryCache::new();
        cache.set_add("channel:#NET_RUNNERS:members", "alice").await.unwrap();
        cache.set_add("channel:#NET_RUNNERS:members", "bob").await.unwrap();
        let membership = MembershipManager::new(channel(), user("alice"), Arc::new(cache.clone()));

        let key = crypto::generate_symmetric_key();
        let id = KeyId::from_string("id1");
        let from_bob = seal_chat(&user("bob"), &channel(), &user("alice"), &id, &key, "hi").unwrap();
        let from_eve = seal_chat(&user("eve"), &channel(), &user("alice"), &id, &key, "hi").unwrap();

        assert_eq!(admit(&from_bob, true, &membership).await.unwrap(), RelayVerdict::Forward);
        assert_eq!(admit(&from_eve, true, &membership).await.unwrap(), RelayVerdict::Rejected);
        assert_eq!(admit(&from_bob, false, &membership).await.unwrap(), RelayVerdict::NotLeader);

        let mut unkeyed = from_bob.clone();
        unkeyed.key_id = None;
        assert!(matches!(
            admit(&unkeyed, true, &membership).await.unwrap(),
            RelayVerdict::Malformed(_)
        ));
    }
}
