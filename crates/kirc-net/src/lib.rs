// Mailbox transport and coordination cache seams, with in-process backends.

pub mod cache;
pub mod consumer;
pub mod error;
pub mod mailbox;

pub use cache::{CoordinationCache, MemoryCache, Subscription};
pub use consumer::{spawn_consumer, ConsumerConfig, ConsumerHandle, MailboxEvent};
pub use error::{CacheError, TransportError};
pub use mailbox::{Mailbox, MailboxChannel, MailboxTopics, MemoryBroker, Record};
