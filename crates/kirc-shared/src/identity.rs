use std::path::Path;

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use tracing::info;
use x25519_dalek::{PublicKey as X25519PublicKey, StaticSecret};

use crate::error::IdentityError;
use crate::types::Username;

/// The local actor's identity.
///
/// Created once at first run and injected into every component that needs to
/// decrypt or sign. The secret halves never leave this struct except through
/// [`Identity::to_export`] for the local identity file.
#[derive(Clone)]
pub struct Identity {
    username: Username,
    display_name: String,
    signing_key: SigningKey,
    encryption_key: StaticSecret,
}

/// The shareable half of an identity: an X25519 key for encryption and an
/// Ed25519 key for signature checks. Rendered as 128 hex chars.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PublicKey {
    pub encryption: [u8; 32],
    pub verifying: [u8; 32],
}

/// Serializable format for the local identity file
#[derive(Serialize, Deserialize)]
pub struct IdentityExport {
    pub username: Username,
    pub display_name: String,
    pub signing_secret: String,
    pub encryption_secret: String,
}

impl Identity {
    /// Generate a new random identity
    pub fn generate(username: Username, display_name: impl Into<String>) -> Self {
        Self {
            username,
            display_name: display_name.into(),
            signing_key: SigningKey::generate(&mut OsRng),
            encryption_key: StaticSecret::random_from_rng(OsRng),
        }
    }

    /// Restore identity from a serialized export
    pub fn from_export(export: IdentityExport) -> Result<Self, IdentityError> {
        let signing = decode_secret(&export.signing_secret)?;
        let encryption = decode_secret(&export.encryption_secret)?;
        Ok(Self {
            username: export.username,
            display_name: export.display_name,
            signing_key: SigningKey::from_bytes(&signing),
            encryption_key: StaticSecret::from(encryption),
        })
    }

    pub fn to_export(&self) -> IdentityExport {
        IdentityExport {
            username: self.username.clone(),
            display_name: self.display_name.clone(),
            signing_secret: hex::encode(self.signing_key.as_bytes()),
            encryption_secret: hex::encode(self.encryption_key.to_bytes()),
        }
    }

    pub fn username(&self) -> &Username {
        &self.username
    }

    pub fn display_name(&self) -> &str {
        &self.display_name
    }

    pub fn public_key(&self) -> PublicKey {
        PublicKey {
            encryption: X25519PublicKey::from(&self.encryption_key).to_bytes(),
            verifying: self.signing_key.verifying_key().to_bytes(),
        }
    }

    /// X25519 secret used to open sealed boxes and derive pairwise keys
    pub fn encryption_secret(&self) -> &StaticSecret {
        &self.encryption_key
    }

    /// Sign a message
    pub fn sign(&self, message: &[u8]) -> Signature {
        self.signing_key.sign(message)
    }

    /// Load from a JSON identity file
    pub fn load(path: &Path) -> Result<Self, IdentityError> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| IdentityError::KeyFile(format!("{}: {e}", path.display())))?;
        let export: IdentityExport = serde_json::from_str(&raw)
            .map_err(|e| IdentityError::KeyFile(format!("{}: {e}", path.display())))?;
        Self::from_export(export)
    }

    /// Write the identity file, creating parent directories as needed
    pub fn save(&self, path: &Path) -> Result<(), IdentityError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| IdentityError::KeyFile(format!("{}: {e}", parent.display())))?;
        }
        let raw = serde_json::to_string_pretty(&self.to_export())
            .map_err(|e| IdentityError::KeyFile(e.to_string()))?;
        std::fs::write(path, raw)
            .map_err(|e| IdentityError::KeyFile(format!("{}: {e}", path.display())))
    }
}

/// Create the local identity once.
///
/// If `path` already holds an identity it is loaded and returned untouched;
/// a new keypair is only minted over an existing file when `overwrite` is set.
/// The boolean is `true` when a new identity was generated.
pub fn generate_identity(
    path: &Path,
    username: &Username,
    display_name: &str,
    overwrite: bool,
) -> Result<(Identity, bool), IdentityError> {
    if path.exists() && !overwrite {
        let existing = Identity::load(path)?;
        if existing.username() != username {
            return Err(IdentityError::UsernameMismatch {
                found: existing.username().to_string(),
                requested: username.to_string(),
            });
        }
        return Ok((existing, false));
    }

    let identity = Identity::generate(username.clone(), display_name);
    identity.save(path)?;
    info!(
        username = %username,
        path = %path.display(),
        overwrite,
        "Generated new identity"
    );
    Ok((identity, true))
}

impl PublicKey {
    pub fn to_hex(&self) -> String {
        let mut bytes = [0u8; 64];
        bytes[..32].copy_from_slice(&self.encryption);
        bytes[32..].copy_from_slice(&self.verifying);
        hex::encode(bytes)
    }

    pub fn from_hex(s: &str) -> Result<Self, IdentityError> {
        let bytes = hex::decode(s.trim()).map_err(|_| IdentityError::InvalidKeyBytes)?;
        if bytes.len() != 64 {
            return Err(IdentityError::InvalidKeyBytes);
        }
        let mut encryption = [0u8; 32];
        let mut verifying = [0u8; 32];
        encryption.copy_from_slice(&bytes[..32]);
        verifying.copy_from_slice(&bytes[32..]);

        VerifyingKey::from_bytes(&verifying).map_err(|_| IdentityError::InvalidKeyBytes)?;
        Ok(Self {
            encryption,
            verifying,
        })
    }

    /// Verify a signature made by the matching identity
    pub fn verify(&self, message: &[u8], signature: &Signature) -> Result<(), IdentityError> {
        let verifying_key =
            VerifyingKey::from_bytes(&self.verifying).map_err(|_| IdentityError::InvalidKeyBytes)?;
        verifying_key
            .verify(message, signature)
            .map_err(|_| IdentityError::InvalidKeyBytes)
    }
}

impl std::fmt::Display for PublicKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl TryFrom<String> for PublicKey {
    type Error = IdentityError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::from_hex(&s)
    }
}

impl From<PublicKey> for String {
    fn from(key: PublicKey) -> Self {
        key.to_hex()
    }
}

fn decode_secret(s: &str) -> Result<[u8; 32], IdentityError> {
    let bytes = hex::decode(s).map_err(|_| IdentityError::InvalidKeyBytes)?;
    bytes.try_into().map_err(|_| IdentityError::InvalidKeyBytes)
}
