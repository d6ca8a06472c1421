use chacha20poly1305::{
    aead::{Aead, KeyInit, Payload},
    XChaCha20Poly1305, XNonce,
};
use rand::RngCore;
use x25519_dalek::{EphemeralSecret, PublicKey as X25519PublicKey, StaticSecret};

use crate::constants::{
    KDF_CONTEXT_PAIRWISE, KDF_CONTEXT_SEAL, NONCE_SIZE, PUBKEY_SIZE, SYMMETRIC_KEY_SIZE,
};
use crate::error::CryptoError;

pub type SymmetricKey = [u8; SYMMETRIC_KEY_SIZE];

pub fn generate_symmetric_key() -> SymmetricKey {
    let mut key = [0u8; SYMMETRIC_KEY_SIZE];
    rand::rngs::OsRng.fill_bytes(&mut key);
    key
}

fn random_nonce() -> [u8; NONCE_SIZE] {
    let mut nonce = [0u8; NONCE_SIZE];
    rand::rngs::OsRng.fill_bytes(&mut nonce);
    nonce
}

/// Encrypt and bind the ciphertext to `aad` (authenticated, not encrypted).
///
/// Output is `nonce(24) || ciphertext || tag(16)`.
pub fn encrypt_with_aad(
    key: &SymmetricKey,
    plaintext: &[u8],
    aad: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    let nonce = random_nonce();
    let sealed = XChaCha20Poly1305::new(key.into())
        .encrypt(XNonce::from_slice(&nonce), Payload { msg: plaintext, aad })
        .map_err(|_| CryptoError::EncryptionFailed)?;

    Ok([nonce.as_slice(), sealed.as_slice()].concat())
}

pub fn decrypt_with_aad(
    key: &SymmetricKey,
    data: &[u8],
    aad: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    if data.len() < NONCE_SIZE {
        return Err(CryptoError::DecryptionFailed);
    }
    let (nonce, sealed) = data.split_at(NONCE_SIZE);
    XChaCha20Poly1305::new(key.into())
        .decrypt(XNonce::from_slice(nonce), Payload { msg: sealed, aad })
        .map_err(|_| CryptoError::DecryptionFailed)
}

/// Public-key encryption to `recipient`.
///
/// An ephemeral X25519 key agrees a one-shot secret with the recipient's
/// static key; BLAKE3 turns it into an XChaCha20-Poly1305 key that also
/// commits to both public keys.
///
/// Layout: `ephemeral_pub(32) || nonce(24) || ciphertext`, with the
/// ephemeral key also bound as associated data.
pub fn seal(recipient: &[u8; PUBKEY_SIZE], plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let ephemeral = EphemeralSecret::random_from_rng(rand::rngs::OsRng);
    let ephemeral_public = X25519PublicKey::from(&ephemeral);
    let shared = ephemeral.diffie_hellman(&X25519PublicKey::from(*recipient));

    let key = seal_key(shared.as_bytes(), ephemeral_public.as_bytes(), recipient);
    let sealed = encrypt_with_aad(&key, plaintext, ephemeral_public.as_bytes())?;

    Ok([ephemeral_public.as_bytes().as_slice(), sealed.as_slice()].concat())
}

/// Reverse of [`seal`] using the recipient's static secret.
pub fn open(secret: &StaticSecret, data: &[u8]) -> Result<Vec<u8>, CryptoError> {
    if data.len() < PUBKEY_SIZE + NONCE_SIZE {
        return Err(CryptoError::DecryptionFailed);
    }

    let (ephemeral_bytes, sealed) = data.split_at(PUBKEY_SIZE);
    let mut ephemeral = [0u8; PUBKEY_SIZE];
    ephemeral.copy_from_slice(ephemeral_bytes);

    let shared = secret.diffie_hellman(&X25519PublicKey::from(ephemeral));
    let recipient = X25519PublicKey::from(secret);
    let key = seal_key(shared.as_bytes(), &ephemeral, recipient.as_bytes());

    decrypt_with_aad(&key, sealed, &ephemeral)
}

fn seal_key(shared: &[u8; 32], ephemeral: &[u8; 32], recipient: &[u8; 32]) -> SymmetricKey {
    let mut hasher = blake3::Hasher::new_derive_key(KDF_CONTEXT_SEAL);
    hasher.update(shared);
    hasher.update(ephemeral);
    hasher.update(recipient);
    *hasher.finalize().as_bytes()
}

// Static-static X25519 + BLAKE3 KDF. Both sides derive the same key; the
// public keys are hashed in sorted order so the result is symmetric.
pub fn derive_pairwise_key(secret: &StaticSecret, peer: &[u8; PUBKEY_SIZE]) -> SymmetricKey {
    let shared = secret.diffie_hellman(&X25519PublicKey::from(*peer));
    let own = X25519PublicKey::from(secret);

    let (lo, hi) = if own.as_bytes() <= peer {
        (own.to_bytes(), *peer)
    } else {
        (*peer, own.to_bytes())
    };

    let mut hasher = blake3::Hasher::new_derive_key(KDF_CONTEXT_PAIRWISE);
    hasher.update(shared.as_bytes());
    hasher.update(&lo);
    hasher.update(&hi);
    *hasher.finalize().as_bytes()
}
