//! Broker-backed mailbox with four logical channels.
//!
//! Addressing lives in the records themselves (sender, recipient, channel)
//! rather than in per-user topics, so a deployment only ever needs four
//! topics. Every actor reads with its own consumer group; a group starts at
//! the end of the log the first time it is seen and only moves forward when
//! the consumer commits, which gives at-least-once delivery.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::debug;

use kirc_shared::constants::{
    MAX_MESSAGE_SIZE, TOPIC_DATA_IN, TOPIC_DATA_OUT, TOPIC_RPC_IN, TOPIC_RPC_OUT,
};

use crate::error::TransportError;

// Envelope framing on top of the largest plaintext.
const MAX_RECORD_SIZE: usize = MAX_MESSAGE_SIZE + 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MailboxChannel {
    DataIn,
    DataOut,
    RpcIn,
    RpcOut,
}

impl MailboxChannel {
    pub const ALL: [MailboxChannel; 4] = [Self::DataIn, Self::DataOut, Self::RpcIn, Self::RpcOut];
}

/// Topic names behind the four logical channels
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MailboxTopics {
    pub data_in: String,
    pub data_out: String,
    pub rpc_in: String,
    pub rpc_out: String,
}

impl Default for MailboxTopics {
    fn default() -> Self {
        Self {
            data_in: TOPIC_DATA_IN.to_string(),
            data_out: TOPIC_DATA_OUT.to_string(),
            rpc_in: TOPIC_RPC_IN.to_string(),
            rpc_out: TOPIC_RPC_OUT.to_string(),
        }
    }
}

impl MailboxTopics {
    pub fn name(&self, channel: MailboxChannel) -> &str {
        match channel {
            MailboxChannel::DataIn => &self.data_in,
            MailboxChannel::DataOut => &self.data_out,
            MailboxChannel::RpcIn => &self.rpc_in,
            MailboxChannel::RpcOut => &self.rpc_out,
        }
    }

    pub fn all(&self) -> Vec<String> {
        MailboxChannel::ALL
            .iter()
            .map(|c| self.name(*c).to_string())
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub channel: MailboxChannel,
    pub partition_key: String,
    pub offset: u64,
    pub payload: Vec<u8>,
}

#[async_trait]
pub trait Mailbox: Send + Sync + 'static {
    /// Append a record; returns its offset.
    async fn produce(
        &self,
        channel: MailboxChannel,
        partition_key: &str,
        payload: Vec<u8>,
    ) -> Result<u64, TransportError>;

    /// Register `group` at the current end of `channel` if it is new.
    async fn subscribe(&self, channel: MailboxChannel, group: &str) -> Result<(), TransportError>;

    /// Fetch up to `max` uncommitted records, waiting at most `wait` for the first one.
    async fn poll(
        &self,
        channel: MailboxChannel,
        group: &str,
        max: usize,
        wait: Duration,
    ) -> Result<Vec<Record>, TransportError>;

    /// Mark every record below `next_offset` as consumed for `group`.
    async fn commit(
        &self,
        channel: MailboxChannel,
        group: &str,
        next_offset: u64,
    ) -> Result<(), TransportError>;
}

// ---------------------------------------------------------------------------
// In-process broker
// ---------------------------------------------------------------------------

struct Log {
    records: Vec<Record>,
    // Log length, observed by waiting consumers.
    len_tx: watch::Sender<u64>,
}

impl Log {
    fn new() -> Self {
        let (len_tx, _) = watch::channel(0);
        Self {
            records: Vec::new(),
            len_tx,
        }
    }
}

struct BrokerInner {
    logs: Mutex<HashMap<MailboxChannel, Log>>,
    offsets: Mutex<HashMap<(MailboxChannel, String), u64>>,
    available: AtomicBool,
}

/// Single-partition, in-memory broker shared by every actor of a process.
///
/// Cloning is cheap and every clone sees the same logs.
#[derive(Clone)]
pub struct MemoryBroker {
    inner: Arc<BrokerInner>,
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBroker {
    pub fn new() -> Self {
        let logs = MailboxChannel::ALL.iter().map(|c| (*c, Log::new())).collect();
        Self {
            inner: Arc::new(BrokerInner {
                logs: Mutex::new(logs),
                offsets: Mutex::new(HashMap::new()),
                available: AtomicBool::new(true),
            }),
        }
    }

    /// Simulate the broker going away (or coming back)
    pub fn set_available(&self, available: bool) {
        self.inner.available.store(available, Ordering::SeqCst);
    }

    /// Number of records ever produced on `channel`
    pub fn len(&self, channel: MailboxChannel) -> usize {
        self.inner
            .logs
            .lock()
            .get(&channel)
            .map(|l| l.records.len())
            .unwrap_or(0)
    }

    fn check_available(&self) -> Result<(), TransportError> {
        if self.inner.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(TransportError::Unavailable("broker unreachable".to_string()))
        }
    }

    fn log_end(&self, channel: MailboxChannel) -> u64 {
        self.inner
            .logs
            .lock()
            .get(&channel)
            .map(|l| l.records.len() as u64)
            .unwrap_or(0)
    }

    fn position(&self, channel: MailboxChannel, group: &str) -> u64 {
        let end = self.log_end(channel);
        *self
            .inner
            .offsets
            .lock()
            .entry((channel, group.to_string()))
            .or_insert(end)
    }

    fn fetch(&self, channel: MailboxChannel, from: u64, max: usize) -> Vec<Record> {
        let logs = self.inner.logs.lock();
        logs.get(&channel)
            .map(|l| {
                l.records
                    .iter()
                    .skip(from as usize)
                    .take(max)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    fn watch_len(&self, channel: MailboxChannel) -> Option<watch::Receiver<u64>> {
        self.inner
            .logs
            .lock()
            .get(&channel)
            .map(|l| l.len_tx.subscribe())
    }
}

#[async_trait]
impl Mailbox for MemoryBroker {
    async fn produce(
        &self,
        channel: MailboxChannel,
        partition_key: &str,
        payload: Vec<u8>,
    ) -> Result<u64, TransportError> {
        self.check_available()?;
        if payload.len() > MAX_RECORD_SIZE {
            return Err(TransportError::RecordTooLarge {
                size: payload.len(),
                max: MAX_RECORD_SIZE,
            });
        }

        let mut logs = self.inner.logs.lock();
        let log = logs.entry(channel).or_insert_with(Log::new);
        let offset = log.records.len() as u64;
        log.records.push(Record {
            channel,
            partition_key: partition_key.to_string(),
            offset,
            payload,
        });
        log.len_tx.send_replace(offset + 1);

        debug!(channel = ?channel, key = partition_key, offset, "Record produced");
        Ok(offset)
    }

    async fn subscribe(&self, channel: MailboxChannel, group: &str) -> Result<(), TransportError> {
        self.check_available()?;
        let offset = self.position(channel, group);
        debug!(channel = ?channel, group, offset, "Consumer group registered");
        Ok(())
    }

    async fn poll(
        &self,
        channel: MailboxChannel,
        group: &str,
        max: usize,
        wait: Duration,
    ) -> Result<Vec<Record>, TransportError> {
        self.check_available()?;

        let mut len_rx = self.watch_len(channel).ok_or(TransportError::Closed)?;
        let deadline = tokio::time::Instant::now() + wait;

        loop {
            let from = self.position(channel, group);
            let records = self.fetch(channel, from, max);
            if !records.is_empty() {
                return Ok(records);
            }

            match tokio::time::timeout_at(deadline, len_rx.changed()).await {
                Ok(Ok(())) => continue,
                Ok(Err(_)) => return Err(TransportError::Closed),
                Err(_) => return Ok(Vec::new()),
            }
        }
    }

    async fn commit(
        &self,
        channel: MailboxChannel,
        group: &str,
        next_offset: u64,
    ) -> Result<(), TransportError> {
        self.check_available()?;
        let mut offsets = self.inner.offsets.lock();
        let current = offsets.entry((channel, group.to_string())).or_insert(0);
        // Commits never move a group backwards.
        if next_offset > *current {
            *current = next_offset;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const WAIT: Duration = Duration::from_millis(50);

    #[tokio::test]
    async fn test_new_group_starts_at_latest() {
        let broker = MemoryBroker::new();
        broker
            .produce(MailboxChannel::DataIn, "#a", b"old".to_vec())
            .await
            .unwrap();

        broker.subscribe(MailboxChannel::DataIn, "kirc-bob-data").await.unwrap();
        broker
            .produce(MailboxChannel::DataIn, "#a", b"new".to_vec())
            .await
            .unwrap();

        let records = broker
            .poll(MailboxChannel::DataIn, "kirc-bob-data", 10, WAIT)
            .await
            .unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].payload, b"new");
        assert_eq!(records[0].offset, 1);
    }

    #[tokio::test]
    async fn test_uncommitted_records_are_redelivered() {
        let broker = MemoryBroker::new();
        broker.subscribe(MailboxChannel::RpcIn, "g").await.unwrap();
        broker.produce(MailboxChannel::RpcIn, "bob", vec![1]).await.unwrap();

        let first = broker.poll(MailboxChannel::RpcIn, "g", 10, WAIT).await.unwrap();
        let again = broker.poll(MailboxChannel::RpcIn, "g", 10, WAIT).await.unwrap();
        assert_eq!(first, again);

        broker.commit(MailboxChannel::RpcIn, "g", first[0].offset + 1).await.unwrap();
        let empty = broker.poll(MailboxChannel::RpcIn, "g", 10, WAIT).await.unwrap();
        assert!(empty.is_empty());
    }

    #[tokio::test]
    async fn test_groups_are_independent() {
        let broker = MemoryBroker::new();
        broker.subscribe(MailboxChannel::DataOut, "alice").await.unwrap();
        broker.subscribe(MailboxChannel::DataOut, "bob").await.unwrap();
        broker.produce(MailboxChannel::DataOut, "#a", vec![7]).await.unwrap();

        broker.commit(MailboxChannel::DataOut, "alice", 1).await.unwrap();

        let alice = broker.poll(MailboxChannel::DataOut, "alice", 10, WAIT).await.unwrap();
        let bob = broker.poll(MailboxChannel::DataOut, "bob", 10, WAIT).await.unwrap();
        assert!(alice.is_empty());
        assert_eq!(bob.len(), 1);
    }

    #[tokio::test]
    async fn test_poll_wakes_on_produce() {
        let broker = MemoryBroker::new();
        broker.subscribe(MailboxChannel::DataIn, "g").await.unwrap();

        let producer = broker.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            producer.produce(MailboxChannel::DataIn, "k", vec![9]).await.unwrap();
        });

        let records = broker
            .poll(MailboxChannel::DataIn, "g", 10, Duration::from_secs(2))
            .await
            .unwrap();
        assert_eq!(records.len(), 1);
    }

    #[tokio::test]
    async fn test_unavailable_broker_fails() {
        let broker = MemoryBroker::new();
        broker.set_available(false);
        assert!(matches!(
            broker.produce(MailboxChannel::DataIn, "k", vec![]).await,
            Err(TransportError::Unavailable(_))
        ));

        broker.set_available(true);
        assert!(broker.produce(MailboxChannel::DataIn, "k", vec![]).await.is_ok());
    }

    #[test]
    fn test_topic_names() {
        let topics = MailboxTopics::default();
        assert_eq!(topics.name(MailboxChannel::RpcOut), "rpc-out");
        assert_eq!(topics.all(), vec!["data-in", "data-out", "rpc-in", "rpc-out"]);
    }
}
