//! # kirc-core
//!
//! Channel coordination and the encrypted relay protocol.
//!
//! Every joined channel gets a [`session`] running its own lease and signal
//! loops. Leadership comes from a TTL lease in the shared cache, membership
//! from a cache set mirrored locally, and channel keys are sealed per member
//! and delivered over the RPC mailbox. Chat traffic goes to the leader, which
//! checks the sender and re-broadcasts the ciphertext untouched.

pub mod config;
pub mod context;
pub mod error;
pub mod events;
pub mod handshake;
pub mod keys;
pub mod leadership;
pub mod membership;
pub mod node;
pub mod relay;
pub mod session;

pub use config::CoreConfig;
pub use context::NodeContext;
pub use error::CoreError;
pub use events::NodeEvent;
pub use keys::{KeyLifecycleManager, KeyRing};
pub use leadership::{LeadershipCoordinator, LeaseRole};
pub use membership::{MembershipManager, MembershipMirror};
pub use node::{ChannelStatus, Node};
