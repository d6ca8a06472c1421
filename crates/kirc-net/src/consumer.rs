//! Typed mailbox consumer tasks.
//!
//! Each consumer runs in its own tokio task, polls one logical channel with
//! one consumer group, decodes records and forwards them over an mpsc
//! channel. Records are committed only after they have been handed to the
//! receiver. Downstream code never registers callbacks; it owns the receiver
//! and the task stops when the handle is shut down or the receiver is dropped.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use kirc_shared::error::ProtocolError;

use crate::error::TransportError;
use crate::mailbox::{Mailbox, MailboxChannel};

#[derive(Debug, Clone)]
pub struct ConsumerConfig {
    /// Upper bound of a single poll; keeps shutdown responsive
    pub poll_wait: Duration,
    /// Sleep between attempts while the broker is unreachable
    pub retry_backoff: Duration,
    pub batch_size: usize,
    pub buffer: usize,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            poll_wait: Duration::from_millis(500),
            retry_backoff: Duration::from_millis(500),
            batch_size: 64,
            buffer: 256,
        }
    }
}

/// What a consumer hands downstream
#[derive(Debug, Clone, PartialEq)]
pub enum MailboxEvent<T> {
    Message(T),
    ConnectivityLost(TransportError),
    ConnectivityRestored,
}

pub struct ConsumerHandle {
    channel: MailboxChannel,
    shutdown_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl ConsumerHandle {
    pub fn channel(&self) -> MailboxChannel {
        self.channel
    }

    /// Stop polling and wait for the task to finish.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(true);
        if let Err(e) = self.task.await {
            if !e.is_cancelled() {
                warn!(channel = ?self.channel, error = %e, "Consumer task panicked");
            }
        }
    }

    /// Stop immediately without draining.
    pub fn abort(&self) {
        self.task.abort();
    }
}

/// Register `group` on `channel` and spawn a task that decodes every record.
///
/// Registration happens before this returns, so nothing produced afterwards
/// is missed. Records that fail to decode are logged and skipped.
pub async fn spawn_consumer<T, F>(
    mailbox: Arc<dyn Mailbox>,
    channel: MailboxChannel,
    group: String,
    config: ConsumerConfig,
    decode: F,
) -> Result<(ConsumerHandle, mpsc::Receiver<MailboxEvent<T>>), TransportError>
where
    T: Send + 'static,
    F: Fn(&[u8]) -> Result<T, ProtocolError> + Send + 'static,
{
    mailbox.subscribe(channel, &group).await?;

    let (event_tx, event_rx) = mpsc::channel(config.buffer);
    let (shutdown_tx, mut shutdown_rx) = watch::channel(false);

    info!(channel = ?channel, group = %group, "Mailbox consumer started");

    let task = tokio::spawn(async move {
        let mut connected = true;

        loop {
            let polled = tokio::select! {
                _ = shutdown_rx.changed() => break,
                polled = mailbox.poll(channel, &group, config.batch_size, config.poll_wait) => polled,
            };

            let records = match polled {
                Ok(records) => {
                    if !connected {
                        connected = true;
                        info!(channel = ?channel, "Mailbox connectivity restored");
                        if event_tx.send(MailboxEvent::ConnectivityRestored).await.is_err() {
                            break;
                        }
                    }
                    records
                }
                Err(e) => {
                    if connected {
                        connected = false;
                        warn!(channel = ?channel, error = %e, "Mailbox connectivity lost");
                        if event_tx.send(MailboxEvent::ConnectivityLost(e)).await.is_err() {
                            break;
                        }
                    }
                    tokio::select! {
                        _ = shutdown_rx.changed() => break,
                        _ = tokio::time::sleep(config.retry_backoff) => continue,
                    }
                }
            };

            let mut next_offset = None;
            for record in records {
                match decode(&record.payload) {
                    Ok(item) => {
                        if event_tx.send(MailboxEvent::Message(item)).await.is_err() {
                            debug!(channel = ?channel, "Receiver dropped, consumer exiting");
                            return;
                        }
                    }
                    Err(e) => {
                        warn!(
                            channel = ?channel,
                            offset = record.offset,
                            error = %e,
                            "Skipping undecodable record"
                        );
                    }
                }
                next_offset = Some(record.offset + 1);
            }

            if let Some(offset) = next_offset {
                if let Err(e) = mailbox.commit(channel, &group, offset).await {
                    // Not fatal: the batch is redelivered and deduplicated downstream.
                    warn!(channel = ?channel, offset, error = %e, "Commit failed");
                }
            }
        }

        debug!(channel = ?channel, group = %group, "Mailbox consumer stopped");
    });

    Ok((
        ConsumerHandle {
            channel,
            shutdown_tx,
            task,
        },
        event_rx,
    ))
}
