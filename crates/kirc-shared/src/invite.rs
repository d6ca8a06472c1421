//! Out-of-band trust bootstrap between two actors.
//!
//! The inviter serializes its username, public key and mailbox addressing,
//! signs the payload with its Ed25519 key and seals the whole thing to the
//! peer's X25519 key. Only the intended peer can open the bundle, and the
//! signature ties the payload to the public key it advertises.
//!
//! Trust is one-directional: accepting Alice's bundle makes Alice a contact
//! of Bob, nothing more. Alice needs Bob's bundle to trust Bob.

use chrono::{DateTime, Utc};
use ed25519_dalek::Signature;
use serde::{Deserialize, Serialize};

use crate::constants::{MAX_INVITE_PAYLOAD, PROTOCOL_VERSION};
use crate::crypto;
use crate::identity::{Identity, PublicKey};
use crate::types::Username;

/// Mailbox addressing and optional cache endpoint shared with a peer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceConfig {
    pub bootstrap_servers: String,
    pub topics: Vec<String>,
    pub cache_uri: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvitePayload {
    pub version: String,
    pub username: Username,
    pub display_name: String,
    pub public_key: PublicKey,
    pub service: ServiceConfig,
    pub created_at: DateTime<Utc>,
}

// The signature covers the exact JSON bytes, so they travel as a string.
#[derive(Serialize, Deserialize)]
struct SignedInvite {
    payload: String,
    signature: String,
}

/// A sealed invite, base64url encoded so it can be pasted anywhere.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InviteBundle(String);

impl InviteBundle {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for InviteBundle {
    fn from(s: String) -> Self {
        Self(s.trim().to_string())
    }
}

impl std::fmt::Display for InviteBundle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum InviteError {
    #[error("Invite encoding failed: {0}")]
    Encoding(String),

    #[error("Invite was not sealed for this identity")]
    Decryption,

    #[error("Malformed invite bundle: {0}")]
    MalformedBundle(String),

    #[error("Invalid signature")]
    InvalidSignature,

    #[error("Base64 decode error")]
    Base64Decode,
}

/// Build a bundle that only the holder of `peer`'s secret key can open.
pub fn create_invite(
    peer: &PublicKey,
    identity: &Identity,
    service: &ServiceConfig,
) -> Result<InviteBundle, InviteError> {
    let payload = InvitePayload {
        version: PROTOCOL_VERSION.to_string(),
        username: identity.username().clone(),
        display_name: identity.display_name().to_string(),
        public_key: identity.public_key(),
        service: service.clone(),
        created_at: Utc::now(),
    };

    let payload_json =
        serde_json::to_string(&payload).map_err(|e| InviteError::Encoding(e.to_string()))?;
    let signature = identity.sign(payload_json.as_bytes());

    let signed = SignedInvite {
        payload: payload_json,
        signature: hex::encode(signature.to_bytes()),
    };
    let bytes = serde_json::to_vec(&signed).map_err(|e| InviteError::Encoding(e.to_string()))?;

    if bytes.len() > MAX_INVITE_PAYLOAD {
        return Err(InviteError::Encoding(format!(
            "payload is {} bytes (max {MAX_INVITE_PAYLOAD})",
            bytes.len()
        )));
    }

    let sealed = crypto::seal(&peer.encryption, &bytes)
        .map_err(|e| InviteError::Encoding(e.to_string()))?;
    Ok(InviteBundle(base64_url_encode(&sealed)))
}

/// Open a bundle with the local identity and validate what is inside.
///
/// Storing the result as a contact is the caller's job.
pub fn accept_invite(bundle: &InviteBundle, identity: &Identity) -> Result<InvitePayload, InviteError> {
    let sealed = base64_url_decode(bundle.as_str())?;
    let bytes = crypto::open(identity.encryption_secret(), &sealed)
        .map_err(|_| InviteError::Decryption)?;

    let signed: SignedInvite = serde_json::from_slice(&bytes)
        .map_err(|e| InviteError::MalformedBundle(e.to_string()))?;
    let payload: InvitePayload = serde_json::from_str(&signed.payload)
        .map_err(|e| InviteError::MalformedBundle(e.to_string()))?;

    validate_payload(&payload, identity)?;

    let signature_bytes = hex::decode(&signed.signature)
        .map_err(|_| InviteError::MalformedBundle("signature is not hex".to_string()))?;
    let signature =
        Signature::from_slice(&signature_bytes).map_err(|_| InviteError::InvalidSignature)?;
    payload
        .public_key
        .verify(signed.payload.as_bytes(), &signature)
        .map_err(|_| InviteError::InvalidSignature)?;

    Ok(payload)
}

fn validate_payload(payload: &InvitePayload, identity: &Identity) -> Result<(), InviteError> {
    if payload.version != PROTOCOL_VERSION {
        return Err(InviteError::MalformedBundle(format!(
            "unsupported version '{}'",
            payload.version
        )));
    }
    if payload.service.bootstrap_servers.trim().is_empty() {
        return Err(InviteError::MalformedBundle(
            "missing mailbox bootstrap servers".to_string(),
        ));
    }
    if &payload.username == identity.username() {
        return Err(InviteError::MalformedBundle(
            "bundle names the local identity".to_string(),
        ));
    }
    Ok(())
}

fn base64_url_encode(data: &[u8]) -> String {
    use base64::engine::general_purpose::URL_SAFE_NO_PAD;
    use base64::Engine;
    URL_SAFE_NO_PAD.encode(data)
}

fn base64_url_decode(s: &str) -> Result<Vec<u8>, InviteError> {
    use base64::engine::general_purpose::URL_SAFE_NO_PAD;
    use base64::Engine;
    URL_SAFE_NO_PAD
        .decode(s.trim())
        .map_err(|_| InviteError::Base64Decode)
}
