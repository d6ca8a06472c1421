//! Shared coordination cache.
//!
//! Strings with TTL hold leader leases, presence and typing indicators, sets
//! hold channel members, hashes hold channel status, and pub/sub carries
//! rotation and membership signals.
//! Lease mutations only go through the atomic primitives
//! (`set_if_absent`, `expire_if_equals`, `delete_if_equals`).

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::error::CacheError;

const PUBSUB_CAPACITY: usize = 256;

#[async_trait]
pub trait CoordinationCache: Send + Sync + 'static {
    /// `SET key value NX PX ttl`. Returns whether the key was set.
    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration)
        -> Result<bool, CacheError>;

    async fn get(&self, key: &str) -> Result<Option<String>, CacheError>;

    /// `SET key value PX ttl`, overwriting whatever was there.
    async fn set_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> Result<(), CacheError>;

    /// Returns whether the key existed.
    async fn delete(&self, key: &str) -> Result<bool, CacheError>;

    /// Live keys starting with `prefix`, sorted.
    async fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>, CacheError>;

    /// Refresh the TTL only if the key still holds `expected`.
    async fn expire_if_equals(
        &self,
        key: &str,
        expected: &str,
        ttl: Duration,
    ) -> Result<bool, CacheError>;

    /// Delete the key only if it still holds `expected`.
    async fn delete_if_equals(&self, key: &str, expected: &str) -> Result<bool, CacheError>;

    async fn set_add(&self, key: &str, member: &str) -> Result<bool, CacheError>;

    async fn set_remove(&self, key: &str, member: &str) -> Result<bool, CacheError>;

    async fn set_members(&self, key: &str) -> Result<BTreeSet<String>, CacheError>;

    async fn set_contains(&self, key: &str, member: &str) -> Result<bool, CacheError>;

    async fn hash_set(&self, key: &str, field: &str, value: &str) -> Result<(), CacheError>;

    async fn hash_get_all(&self, key: &str) -> Result<BTreeMap<String, String>, CacheError>;

    /// Returns the number of subscribers that received the message.
    async fn publish(&self, topic: &str, payload: String) -> Result<usize, CacheError>;

    async fn subscribe(&self, topic: &str) -> Result<Subscription, CacheError>;
}

/// A live pub/sub subscription. Dropping it unsubscribes.
pub struct Subscription {
    topic: String,
    rx: broadcast::Receiver<String>,
}

impl Subscription {
    pub fn new(topic: impl Into<String>, rx: broadcast::Receiver<String>) -> Self {
        Self {
            topic: topic.into(),
            rx,
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Next message, or `None` once the publisher side is gone.
    ///
    /// Pub/sub is fire-and-forget: a slow subscriber loses messages rather
    /// than blocking publishers.
    pub async fn recv(&mut self) -> Option<String> {
        loop {
            match self.rx.recv().await {
                Ok(msg) => return Some(msg),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(topic = %self.topic, skipped, "Subscriber lagged, signals dropped");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

// ---------------------------------------------------------------------------
// In-process cache
// ---------------------------------------------------------------------------

enum Value {
    Str(String),
    Set(BTreeSet<String>),
    Hash(BTreeMap<String, String>),
}

struct Entry {
    value: Value,
    expires_at: Option<Instant>,
}

impl Entry {
    fn live(&self, now: Instant) -> bool {
        self.expires_at.map_or(true, |at| at > now)
    }
}

#[derive(Default)]
struct Keyspace {
    entries: HashMap<String, Entry>,
}

impl Keyspace {
    // Lazy expiry, the way the real server does it on access.
    fn live_entry(&mut self, key: &str) -> Option<&mut Entry> {
        let now = Instant::now();
        if self.entries.get(key).is_some_and(|e| !e.live(now)) {
            self.entries.remove(key);
            debug!(key, "Key expired");
        }
        self.entries.get_mut(key)
    }

    fn set_mut(&mut self, key: &str) -> Result<&mut BTreeSet<String>, CacheError> {
        if self.live_entry(key).is_none() {
            self.entries.insert(
                key.to_string(),
                Entry {
                    value: Value::Set(BTreeSet::new()),
                    expires_at: None,
                },
            );
        }
        match self.entries.get_mut(key).map(|e| &mut e.value) {
            Some(Value::Set(set)) => Ok(set),
            _ => Err(CacheError::WrongType(key.to_string())),
        }
    }
}

struct CacheInner {
    keyspace: Mutex<Keyspace>,
    channels: Mutex<HashMap<String, broadcast::Sender<String>>>,
    available: AtomicBool,
    refuse_expiry: AtomicBool,
}

/// In-memory stand-in for the shared cache. Clones share state.
#[derive(Clone)]
pub struct MemoryCache {
    inner: Arc<CacheInner>,
}

impl Default for MemoryCache {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryCache {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(CacheInner {
                keyspace: Mutex::new(Keyspace::default()),
                channels: Mutex::new(HashMap::new()),
                available: AtomicBool::new(true),
                refuse_expiry: AtomicBool::new(false),
            }),
        }
    }

    /// Simulate losing (or regaining) the connection to the cache
    pub fn set_available(&self, available: bool) {
        self.inner.available.store(available, Ordering::SeqCst);
    }

    /// Make `expire_if_equals` fail while every other command still works
    pub fn set_refuse_expiry(&self, refuse: bool) {
        self.inner.refuse_expiry.store(refuse, Ordering::SeqCst);
    }

    fn check_available(&self) -> Result<(), CacheError> {
        if self.inner.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(CacheError::Unavailable("cache unreachable".to_string()))
        }
    }
}

#[async_trait]
impl CoordinationCache for MemoryCache {
    async fn set_if_absent(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<bool, CacheError> {
        self.check_available()?;
        let mut ks = self.inner.keyspace.lock();
        if ks.live_entry(key).is_some() {
            return Ok(false);
        }
        ks.entries.insert(
            key.to_string(),
            Entry {
                value: Value::Str(value.to_string()),
                expires_at: Some(Instant::now() + ttl),
            },
        );
        Ok(true)
    }

    async fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
        self.check_available()?;
        let mut ks = self.inner.keyspace.lock();
        match ks.live_entry(key).map(|e| &e.value) {
            None => Ok(None),
            Some(Value::Str(s)) => Ok(Some(s.clone())),
            Some(_) => Err(CacheError::WrongType(key.to_string())),
        }
    }

    async fn set_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> Result<(), CacheError> {
        self.check_available()?;
        self.inner.keyspace.lock().entries.insert(
            key.to_string(),
            Entry {
                value: Value::Str(value.to_string()),
                expires_at: Some(Instant::now() + ttl),
            },
        );
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool, CacheError> {
        self.check_available()?;
        let mut ks = self.inner.keyspace.lock();
        let existed = ks.live_entry(key).is_some();
        ks.entries.remove(key);
        Ok(existed)
    }

    async fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>, CacheError> {
        self.check_available()?;
        let now = Instant::now();
        let ks = self.inner.keyspace.lock();
        let mut keys: Vec<String> = ks
            .entries
            .iter()
            .filter(|(key, entry)| key.starts_with(prefix) && entry.live(now))
            .map(|(key, _)| key.clone())
            .collect();
        keys.sort();
        Ok(keys)
    }

    async fn expire_if_equals(
        &self,
        key: &str,
        expected: &str,
        ttl: Duration,
    ) -> Result<bool, CacheError> {
        self.check_available()?;
        if self.inner.refuse_expiry.load(Ordering::SeqCst) {
            return Err(CacheError::Unavailable("expire refused".to_string()));
        }
        let mut ks = self.inner.keyspace.lock();
        match ks.live_entry(key) {
            Some(entry) if matches!(&entry.value, Value::Str(s) if s == expected) => {
                entry.expires_at = Some(Instant::now() + ttl);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn delete_if_equals(&self, key: &str, expected: &str) -> Result<bool, CacheError> {
        self.check_available()?;
        let mut ks = self.inner.keyspace.lock();
        let matches = ks
            .live_entry(key)
            .is_some_and(|e| matches!(&e.value, Value::Str(s) if s == expected));
        if matches {
            ks.entries.remove(key);
        }
        Ok(matches)
    }

    async fn set_add(&self, key: &str, member: &str) -> Result<bool, CacheError> {
        self.check_available()?;
        let mut ks = self.inner.keyspace.lock();
        Ok(ks.set_mut(key)?.insert(member.to_string()))
    }

    async fn set_remove(&self, key: &str, member: &str) -> Result<bool, CacheError> {
        self.check_available()?;
        let mut ks = self.inner.keyspace.lock();
        Ok(ks.set_mut(key)?.remove(member))
    }

    async fn set_members(&self, key: &str) -> Result<BTreeSet<String>, CacheError> {
        self.check_available()?;
        let mut ks = self.inner.keyspace.lock();
        match ks.live_entry(key).map(|e| &e.value) {
            None => Ok(BTreeSet::new()),
            Some(Value::Set(set)) => Ok(set.clone()),
            Some(_) => Err(CacheError::WrongType(key.to_string())),
        }
    }

    async fn set_contains(&self, key: &str, member: &str) -> Result<bool, CacheError> {
        self.check_available()?;
        let mut ks = self.inner.keyspace.lock();
        match ks.live_entry(key).map(|e| &e.value) {
            None => Ok(false),
            Some(Value::Set(set)) => Ok(set.contains(member)),
            Some(_) => Err(CacheError::WrongType(key.to_string())),
        }
    }

    async fn hash_set(&self, key: &str, field: &str, value: &str) -> Result<(), CacheError> {
        self.check_available()?;
        let mut ks = self.inner.keyspace.lock();
        let entry = ks.live_entry(key).is_some();
        if !entry {
            ks.entries.insert(
                key.to_string(),
                Entry {
                    value: Value::Hash(BTreeMap::new()),
                    expires_at: None,
                },
            );
        }
        match ks.entries.get_mut(key).map(|e| &mut e.value) {
            Some(Value::Hash(hash)) => {
                hash.insert(field.to_string(), value.to_string());
                Ok(())
            }
            _ => Err(CacheError::WrongType(key.to_string())),
        }
    }

    async fn hash_get_all(&self, key: &str) -> Result<BTreeMap<String, String>, CacheError> {
        self.check_available()?;
        let mut ks = self.inner.keyspace.lock();
        match ks.live_entry(key).map(|e| &e.value) {
            None => Ok(BTreeMap::new()),
            Some(Value::Hash(hash)) => Ok(hash.clone()),
            Some(_) => Err(CacheError::WrongType(key.to_string())),
        }
    }

    async fn publish(&self, topic: &str, payload: String) -> Result<usize, CacheError> {
        self.check_available()?;
        let channels = self.inner.channels.lock();
        // No subscribers is not an error, the signal is simply lost.
        let delivered = channels
            .get(topic)
            .and_then(|tx| tx.send(payload).ok())
            .unwrap_or(0);
        debug!(topic, delivered, "Published");
        Ok(delivered)
    }

    async fn subscribe(&self, topic: &str) -> Result<Subscription, CacheError> {
        self.check_available()?;
        let mut channels = self.inner.channels.lock();
        let tx = channels
            .entry(topic.to_string())
            .or_insert_with(|| broadcast::channel(PUBSUB_CAPACITY).0);
        Ok(Subscription::new(topic, tx.subscribe()))
    }
}
