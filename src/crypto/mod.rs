//! Cryptographic primitives
//!
//! Key generation, passphrase-based key derivation (Argon2id), and
//! master-key wrapping with AES-256-GCM. Everything else in the crate
//! builds on these operations.

mod kdf;

pub use kdf::key_from_passphrase;

use crate::error::{Error, Result};
use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use rand::rngs::OsRng;
use rand::RngCore;
use zeroize::Zeroizing;

/// Size of all symmetric keys in bytes
pub const KEY_SIZE: usize = 32;

/// Size of KDF salts in bytes
pub const SALT_SIZE: usize = 16;

/// Size of AES-GCM nonces in bytes
pub const NONCE_SIZE: usize = 12;

/// Size of AES-GCM authentication tags in bytes
pub const TAG_SIZE: usize = 16;

/// Size of a wrapped key: nonce + key + tag
pub const WRAPPED_KEY_SIZE: usize = NONCE_SIZE + KEY_SIZE + TAG_SIZE;

/// The repository master key
///
/// Exists only in process memory after unlock; all per-file data keys are
/// wrapped under it. Zeroized on drop.
#[derive(Clone)]
pub struct MasterKey(Zeroizing<[u8; KEY_SIZE]>);

impl MasterKey {
    /// Wrap existing key material
    pub fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        MasterKey(Zeroizing::new(bytes))
    }

    /// Generate a fresh random master key
    pub fn generate() -> Result<Self> {
        Ok(MasterKey(new_key()?))
    }

    /// Get the raw key bytes
    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.0
    }
}

impl std::fmt::Debug for MasterKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("MasterKey([REDACTED])")
    }
}

/// Generate a random 32-byte key from the OS CSPRNG
pub fn new_key() -> Result<Zeroizing<[u8; KEY_SIZE]>> {
    let mut key = Zeroizing::new([0u8; KEY_SIZE]);
    OsRng
        .try_fill_bytes(key.as_mut())
        .map_err(|e| Error::Crypto(format!("CSPRNG failure: {}", e)))?;
    Ok(key)
}

/// Generate a random 16-byte salt
pub fn new_salt() -> Result<[u8; SALT_SIZE]> {
    let mut salt = [0u8; SALT_SIZE];
    OsRng
        .try_fill_bytes(&mut salt)
        .map_err(|e| Error::Crypto(format!("CSPRNG failure: {}", e)))?;
    Ok(salt)
}

/// Wrap a key with AES-256-GCM under the wrapping key
///
/// Output is `nonce(12) | ciphertext(32) | tag(16)`, 60 bytes total.
pub fn wrap_key(wrapping_key: &[u8; KEY_SIZE], key: &[u8; KEY_SIZE]) -> Result<Vec<u8>> {
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(wrapping_key));

    let mut nonce = [0u8; NONCE_SIZE];
    OsRng
        .try_fill_bytes(&mut nonce)
        .map_err(|e| Error::Crypto(format!("CSPRNG failure: {}", e)))?;

    let sealed = cipher
        .encrypt(Nonce::from_slice(&nonce), key.as_ref())
        .map_err(|_| Error::Crypto("key wrap failed".to_string()))?;

    let mut out = Vec::with_capacity(WRAPPED_KEY_SIZE);
    out.extend_from_slice(&nonce);
    out.extend_from_slice(&sealed);
    Ok(out)
}

/// Unwrap a key previously wrapped with [`wrap_key`]
pub fn unwrap_key(wrapping_key: &[u8; KEY_SIZE], wrapped: &[u8]) -> Result<Zeroizing<[u8; KEY_SIZE]>> {
    if wrapped.len() != WRAPPED_KEY_SIZE {
        return Err(Error::Crypto("wrapped key has invalid length".to_string()));
    }

    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(wrapping_key));
    let (nonce, sealed) = wrapped.split_at(NONCE_SIZE);

    let plain = cipher
        .decrypt(Nonce::from_slice(nonce), sealed)
        .map_err(|_| Error::Crypto("key unwrap failed".to_string()))?;

    let mut key = Zeroizing::new([0u8; KEY_SIZE]);
    key.copy_from_slice(&plain);
    Ok(key)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_key_is_random() {
        let k1 = new_key().unwrap();
        let k2 = new_key().unwrap();
        assert_ne!(*k1, *k2);
    }

    #[test]
    fn test_wrap_unwrap_roundtrip() {
        let wrapping = new_key().unwrap();
        let key = new_key().unwrap();

        let wrapped = wrap_key(&wrapping, &key).unwrap();
        assert_eq!(wrapped.len(), WRAPPED_KEY_SIZE);

        let unwrapped = unwrap_key(&wrapping, &wrapped).unwrap();
        assert_eq!(*unwrapped, *key);
    }

    #[test]
    fn test_unwrap_wrong_key_fails() {
        let wrapping = new_key().unwrap();
        let other = new_key().unwrap();
        let key = new_key().unwrap();

        let wrapped = wrap_key(&wrapping, &key).unwrap();
        assert!(unwrap_key(&other, &wrapped).is_err());
    }

    #[test]
    fn test_unwrap_short_input_fails() {
        let wrapping = new_key().unwrap();
        assert!(unwrap_key(&wrapping, &[0u8; 10]).is_err());
    }

    #[test]
    fn test_wrap_is_randomized() {
        let wrapping = new_key().unwrap();
        let key = new_key().unwrap();

        let w1 = wrap_key(&wrapping, &key).unwrap();
        let w2 = wrap_key(&wrapping, &key).unwrap();
        assert_ne!(w1, w2);
    }
}
