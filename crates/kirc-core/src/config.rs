use std::time::Duration;

use kirc_net::{ConsumerConfig, MailboxTopics};
use kirc_shared::constants::{
    KEY_RESOLVE_DELAY_MS, KEY_RESOLVE_RETRIES, LEASE_RENEW_SECS, LEASE_TTL_SECS,
    PRESENCE_TTL_SECS, TYPING_TTL_SECS,
};

use crate::error::CoreError;

/// Timing and sizing knobs of the coordination core.
#[derive(Debug, Clone)]
pub struct CoreConfig {
    /// TTL of the `channel:{name}:leader` lease
    pub lease_ttl: Duration,
    /// Leader renewal and follower re-check period, strictly shorter than the TTL
    pub renew_interval: Duration,
    /// Resolution attempts for an envelope whose key id is unknown
    pub key_resolve_retries: u32,
    pub key_resolve_delay: Duration,
    /// Undecryptable envelopes buffered per channel
    pub pending_limit: usize,
    /// Message ids remembered for deduplication
    pub dedup_window: usize,
    /// A presence entry reads as offline once this passes without a refresh
    pub presence_ttl: Duration,
    pub typing_ttl: Duration,
    pub consumer: ConsumerConfig,
    /// Consumer groups are named after these topics
    pub topics: MailboxTopics,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            lease_ttl: Duration::from_secs(LEASE_TTL_SECS),
            renew_interval: Duration::from_secs(LEASE_RENEW_SECS),
            key_resolve_retries: KEY_RESOLVE_RETRIES,
            key_resolve_delay: Duration::from_millis(KEY_RESOLVE_DELAY_MS),
            pending_limit: 256,
            dedup_window: 4096,
            presence_ttl: Duration::from_secs(PRESENCE_TTL_SECS),
            typing_ttl: Duration::from_secs(TYPING_TTL_SECS),
            consumer: ConsumerConfig::default(),
            topics: MailboxTopics::default(),
        }
    }
}

impl CoreConfig {
    /// Same defaults with a different lease; renewal at a third of the TTL.
    pub fn with_lease_ttl(ttl: Duration) -> Self {
        Self {
            lease_ttl: ttl,
            renew_interval: ttl / 3,
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<(), CoreError> {
        if self.lease_ttl.is_zero() {
            return Err(CoreError::Config("lease TTL must be positive".to_string()));
        }
        if self.renew_interval.is_zero() || self.renew_interval >= self.lease_ttl {
            return Err(CoreError::Config(format!(
                "renew interval {:?} must be shorter than the lease TTL {:?}",
                self.renew_interval, self.lease_ttl
            )));
        }
        if self.presence_ttl.is_zero() || self.typing_ttl.is_zero() {
            return Err(CoreError::Config(
                "presence and typing TTLs must be positive".to_string(),
            ));
        }
        if self.pending_limit == 0 || self.dedup_window == 0 {
            return Err(CoreError::Config(
                "pending limit and dedup window must be non-zero".to_string(),
            ));
        }
        Ok(())
    }
}
