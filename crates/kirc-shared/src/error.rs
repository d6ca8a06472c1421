use thiserror::Error;

#[derive(Error, Debug)]
pub enum CryptoError {
    #[error("Encryption failed")]
    EncryptionFailed,

    #[error("Decryption failed: invalid ciphertext or wrong key")]
    DecryptionFailed,

    #[error("Invalid key length")]
    InvalidKeyLength,
}

#[derive(Error, Debug)]
pub enum IdentityError {
    #[error("Invalid key bytes")]
    InvalidKeyBytes,

    #[error("Key file error: {0}")]
    KeyFile(String),

    #[error("Identity file belongs to '{found}', refusing to load it as '{requested}'")]
    UsernameMismatch { found: String, requested: String },

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("Invalid name '{0}': must be 1-64 characters without whitespace or ':'")]
    InvalidName(String),

    #[error("Envelope for channel '{0}' is missing its key id")]
    MissingKeyId(String),

    #[error("Envelope is missing both channel and recipient")]
    Unaddressed,

    #[error("Message too large: {size} bytes (max {max})")]
    TooLarge { size: usize, max: usize },

    #[error("Serialization error: {0}")]
    Serialization(String),
}
