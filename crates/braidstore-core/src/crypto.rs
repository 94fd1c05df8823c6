//! Log encryption and key derivation
//!
//! Entries of a log opened with an encryption key are sealed at rest with
//! ChaCha20-Poly1305. Named local logs get a deterministic ed25519 keypair
//! derived from the store's primary key, so reopening a store by name yields
//! the same writer key.

use chacha20poly1305::{
    aead::{Aead, KeyInit},
    ChaCha20Poly1305, Nonce,
};
use ed25519_dalek::SigningKey;
use rand::RngCore;

use crate::error::{StoreError, StoreResult};
use crate::types::LogKey;

/// Nonce size for ChaCha20-Poly1305 (12 bytes)
pub const NONCE_SIZE: usize = 12;

/// Context string for blake3 keypair derivation
const KEYPAIR_CONTEXT: &str = "braidstore 2024-06 log keypair";

/// Encryption for log entries using ChaCha20-Poly1305 AEAD.
///
/// # Wire Format
///
/// Encrypted data format: `[nonce (12 bytes)] + [ciphertext + auth_tag (16 bytes)]`
///
/// # Example
///
/// ```
/// use braidstore_core::crypto::LogCrypto;
///
/// let key = LogCrypto::generate_key();
/// let crypto = LogCrypto::new(&key);
///
/// let sealed = crypto.encrypt(b"entry").unwrap();
/// assert_eq!(crypto.decrypt(&sealed).unwrap(), b"entry");
/// ```
pub struct LogCrypto {
    cipher: ChaCha20Poly1305,
}

impl LogCrypto {
    /// Create a new LogCrypto instance with the given 32-byte key.
    pub fn new(key: &[u8; 32]) -> Self {
        Self {
            cipher: ChaCha20Poly1305::new(key.into()),
        }
    }

    /// Generate a new random 32-byte encryption key.
    pub fn generate_key() -> [u8; 32] {
        let mut key = [0u8; 32];
        rand::rng().fill_bytes(&mut key);
        key
    }

    /// Encrypt with a fresh random nonce, prepended to the output.
    pub fn encrypt(&self, plaintext: &[u8]) -> StoreResult<Vec<u8>> {
        let mut nonce_bytes = [0u8; NONCE_SIZE];
        rand::rng().fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = self
            .cipher
            .encrypt(nonce, plaintext)
            .map_err(|e| StoreError::Crypto(format!("Encryption failed: {}", e)))?;

        let mut result = nonce_bytes.to_vec();
        result.extend_from_slice(&ciphertext);
        Ok(result)
    }

    /// Decrypt `[nonce] + [ciphertext + tag]`.
    ///
    /// Fails on a wrong key, tampered data, or input too short to hold a nonce.
    pub fn decrypt(&self, sealed: &[u8]) -> StoreResult<Vec<u8>> {
        if sealed.len() < NONCE_SIZE {
            return Err(StoreError::Crypto(
                "Data too short to contain nonce".to_string(),
            ));
        }

        let nonce = Nonce::from_slice(&sealed[..NONCE_SIZE]);
        self.cipher
            .decrypt(nonce, &sealed[NONCE_SIZE..])
            .map_err(|e| StoreError::Crypto(format!("Decryption failed: {}", e)))
    }
}

/// Generate a random primary key for a new store
pub fn generate_primary_key() -> [u8; 32] {
    LogCrypto::generate_key()
}

/// Derive the signing key of a named log from the store's primary key.
pub fn derive_signing_key(primary_key: &[u8; 32], name: &str) -> SigningKey {
    let mut material = Vec::with_capacity(32 + name.len());
    material.extend_from_slice(primary_key);
    material.extend_from_slice(name.as_bytes());
    let seed = blake3::derive_key(KEYPAIR_CONTEXT, &material);
    SigningKey::from_bytes(&seed)
}

/// The public LogKey for a signing key
pub fn log_key_for(signing_key: &SigningKey) -> LogKey {
    LogKey::from_bytes(signing_key.verifying_key().to_bytes())
}
