/// Protocol version carried in invite bundles
pub const PROTOCOL_VERSION: &str = "kirc/1";

/// XChaCha20-Poly1305 nonce size in bytes
pub const NONCE_SIZE: usize = 24;

/// X25519 / Ed25519 public key size in bytes
pub const PUBKEY_SIZE: usize = 32;

/// Symmetric key size in bytes (for XChaCha20-Poly1305)
pub const SYMMETRIC_KEY_SIZE: usize = 32;

/// Random bytes behind a channel key identifier
pub const KEY_ID_SIZE: usize = 16;

/// Maximum serialized invite payload in bytes (4 KiB).
/// Bundles travel out of band and end up on a free-tier broker, keep them small.
pub const MAX_INVITE_PAYLOAD: usize = 4096;

/// Maximum plaintext message size in bytes (64 KiB)
pub const MAX_MESSAGE_SIZE: usize = 65_536;

/// Maximum length of a username or channel name
pub const MAX_NAME_LEN: usize = 64;

/// Leader lease TTL in seconds
pub const LEASE_TTL_SECS: u64 = 30;

/// Leader lease renewal period in seconds (TTL / 3)
pub const LEASE_RENEW_SECS: u64 = 10;

/// How many times an envelope with an unknown key id is re-resolved before it is dropped
pub const KEY_RESOLVE_RETRIES: u32 = 5;

/// Delay between two resolution attempts in milliseconds
pub const KEY_RESOLVE_DELAY_MS: u64 = 250;

/// Lifetime of a `presence:{user}` entry without a refresh, in seconds
pub const PRESENCE_TTL_SECS: u64 = 300;

/// Lifetime of a typing indicator, in seconds
pub const TYPING_TTL_SECS: u64 = 5;

/// Default mailbox topic names
pub const TOPIC_DATA_IN: &str = "data-in";
pub const TOPIC_DATA_OUT: &str = "data-out";
pub const TOPIC_RPC_IN: &str = "rpc-in";
pub const TOPIC_RPC_OUT: &str = "rpc-out";

/// Key derivation contexts (BLAKE3)
pub const KDF_CONTEXT_SEAL: &str = "kirc-seal-v1";
pub const KDF_CONTEXT_PAIRWISE: &str = "kirc-pairwise-v1";
