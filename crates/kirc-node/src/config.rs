//! Node configuration loaded from environment variables.
//!
//! Everything except the username has a default, so a local node starts with
//! nothing more than `KIRC_USERNAME` set.

use std::path::PathBuf;
use std::time::Duration;

use kirc_core::CoreConfig;
use kirc_net::MailboxTopics;
use kirc_shared::invite::ServiceConfig;

/// Node configuration.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// Local actor name.
    /// Env: `KIRC_USERNAME`
    pub username: Option<String>,

    /// Env: `KIRC_DISPLAY_NAME`
    /// Default: the username.
    pub display_name: Option<String>,

    /// Identity file and SQLite database live here.
    /// Env: `KIRC_DATA_DIR`
    /// Default: the platform data directory, else `./kirc-data`.
    pub data_dir: PathBuf,

    /// Env: `KAFKA_BOOTSTRAP_SERVERS`
    /// Default: `localhost:9092`
    pub bootstrap_servers: String,

    /// Env: `KAFKA_TOPIC_DATA_IN`, `KAFKA_TOPIC_DATA_OUT`,
    /// `KAFKA_TOPIC_RPC_IN`, `KAFKA_TOPIC_RPC_OUT`
    pub topics: MailboxTopics,

    /// Env: `VALKEY_URI`
    pub cache_uri: Option<String>,

    /// Lease and retry timings.
    /// Env: `KIRC_LEASE_TTL_SECS`, `KIRC_RENEW_SECS`, `KIRC_KEY_RETRIES`
    pub core: CoreConfig,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            username: None,
            display_name: None,
            data_dir: kirc_store::database::default_data_dir()
                .unwrap_or_else(|_| PathBuf::from("./kirc-data")),
            bootstrap_servers: "localhost:9092".to_string(),
            topics: MailboxTopics::default(),
            cache_uri: None,
            core: CoreConfig::default(),
        }
    }
}

impl NodeConfig {
    /// Load configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`NodeConfig::from_env`] with an arbitrary variable source.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();
        let var = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        config.username = var("KIRC_USERNAME");
        config.display_name = var("KIRC_DISPLAY_NAME");

        if let Some(dir) = var("KIRC_DATA_DIR") {
            config.data_dir = PathBuf::from(dir);
        }

        if let Some(servers) = var("KAFKA_BOOTSTRAP_SERVERS") {
            config.bootstrap_servers = servers;
        }

        // -- Mailbox topics --

        if let Some(topic) = var("KAFKA_TOPIC_DATA_IN") {
            config.topics.data_in = topic;
        }
        if let Some(topic) = var("KAFKA_TOPIC_DATA_OUT") {
            config.topics.data_out = topic;
        }
        if let Some(topic) = var("KAFKA_TOPIC_RPC_IN") {
            config.topics.rpc_in = topic;
        }
        if let Some(topic) = var("KAFKA_TOPIC_RPC_OUT") {
            config.topics.rpc_out = topic;
        }

        config.cache_uri = var("VALKEY_URI");

        // -- Coordination timings --

        let mut core = config.core.clone();
        if let Some(val) = var("KIRC_LEASE_TTL_SECS") {
            match parse_secs(&val) {
                Some(ttl) => core = CoreConfig::with_lease_ttl(ttl),
                None => tracing::warn!(value = %val, "Invalid KIRC_LEASE_TTL_SECS, using default"),
            }
        }
        if let Some(val) = var("KIRC_RENEW_SECS") {
            match parse_secs(&val) {
                Some(renew) => core.renew_interval = renew,
                None => tracing::warn!(value = %val, "Invalid KIRC_RENEW_SECS, using default"),
            }
        }
        if let Some(val) = var("KIRC_KEY_RETRIES") {
            match val.trim().parse::<u32>() {
                Ok(n) => core.key_resolve_retries = n,
                Err(_) => tracing::warn!(value = %val, "Invalid KIRC_KEY_RETRIES, using default"),
            }
        }

        match core.validate() {
            Ok(()) => config.core = core,
            Err(e) => tracing::warn!(error = %e, "Inconsistent lease timings, using defaults"),
        }
        config.core.topics = config.topics.clone();

        config
    }

    /// Mailbox addressing handed out in invites.
    pub fn service_config(&self) -> ServiceConfig {
        ServiceConfig {
            bootstrap_servers: self.bootstrap_servers.clone(),
            topics: vec![self.topics.data_in.clone(), self.topics.rpc_in.clone()],
            cache_uri: self.cache_uri.clone(),
        }
    }

    pub fn identity_path(&self) -> PathBuf {
        self.data_dir.join("identity.json")
    }
}

fn parse_secs(val: &str) -> Option<Duration> {
    match val.trim().parse::<u64>() {
        Ok(0) | Err(_) => None,
        Ok(secs) => Some(Duration::from_secs(secs)),
    }
}
