// Identity, crypto and wire types shared by every K-IRC crate.

pub mod constants;
pub mod crypto;
pub mod error;
pub mod identity;
pub mod invite;
pub mod protocol;
pub mod types;

pub use error::{CryptoError, IdentityError, ProtocolError};
pub use identity::{generate_identity, Identity, PublicKey};
pub use invite::{InviteBundle, InviteError, InvitePayload, ServiceConfig};
pub use protocol::{
    Envelope, MembershipEvent, MessageKind, PresenceStatus, RotationSignal, RpcFrame, RpcMessage,
};
pub use types::{ChannelName, KeyId, MessageId, Username};
