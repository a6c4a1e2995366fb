//! Passphrase key derivation using Argon2id
//!
//! Argon2id is the recommended algorithm for password hashing and key
//! derivation. A single 64-byte derivation produces both the wrapping key
//! and a confirmation hash, so a wrong passphrase can be detected without
//! revealing anything about the key itself.

use crate::crypto::{KEY_SIZE, SALT_SIZE};
use crate::error::{Error, Result};
use argon2::{Algorithm, Argon2, Params, Version};
use zeroize::Zeroizing;

/// Argon2id memory cost in KiB
#[cfg(not(test))]
const ARGON2_MEMORY_KIB: u32 = 64 * 1024;
#[cfg(test)]
const ARGON2_MEMORY_KIB: u32 = 1024; // low for testing

/// Argon2id time cost (iterations)
#[cfg(not(test))]
const ARGON2_ITERATIONS: u32 = 4;
#[cfg(test)]
const ARGON2_ITERATIONS: u32 = 1;

/// Argon2id parallelism
const ARGON2_PARALLELISM: u32 = 1;

/// Derive a wrapping key and a confirmation hash from a passphrase
///
/// The 64-byte Argon2id output is split in half: the first 32 bytes are the
/// wrapping key, the last 32 bytes are the confirmation hash that is stored
/// in the info file to detect wrong passphrases.
pub fn key_from_passphrase(
    passphrase: &str,
    salt: &[u8],
) -> Result<(Zeroizing<[u8; KEY_SIZE]>, [u8; KEY_SIZE])> {
    if passphrase.is_empty() {
        return Err(Error::Crypto("passphrase must not be empty".to_string()));
    }
    if salt.len() != SALT_SIZE {
        return Err(Error::Crypto(format!(
            "salt must be {} bytes, got {}",
            SALT_SIZE,
            salt.len()
        )));
    }

    let params = Params::new(
        ARGON2_MEMORY_KIB,
        ARGON2_ITERATIONS,
        ARGON2_PARALLELISM,
        Some(KEY_SIZE * 2),
    )
    .map_err(|e| Error::Crypto(format!("invalid Argon2 parameters: {}", e)))?;

    let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, params);

    let mut output = Zeroizing::new([0u8; KEY_SIZE * 2]);
    argon2
        .hash_password_into(passphrase.as_bytes(), salt, output.as_mut())
        .map_err(|e| Error::Crypto(format!("key derivation failed: {}", e)))?;

    let mut wrapping_key = Zeroizing::new([0u8; KEY_SIZE]);
    wrapping_key.copy_from_slice(&output[..KEY_SIZE]);

    let mut confirmation_hash = [0u8; KEY_SIZE];
    confirmation_hash.copy_from_slice(&output[KEY_SIZE..]);

    Ok((wrapping_key, confirmation_hash))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::new_salt;

    #[test]
    fn test_derivation_is_deterministic() {
        let salt = new_salt().unwrap();

        let (key1, hash1) = key_from_passphrase("hunter2", &salt).unwrap();
        let (key2, hash2) = key_from_passphrase("hunter2", &salt).unwrap();

        assert_eq!(*key1, *key2);
        assert_eq!(hash1, hash2);
    }

    #[test]
    fn test_different_passphrases_different_output() {
        let salt = new_salt().unwrap();

        let (key1, hash1) = key_from_passphrase("hunter2", &salt).unwrap();
        let (key2, hash2) = key_from_passphrase("hunter3", &salt).unwrap();

        assert_ne!(*key1, *key2);
        assert_ne!(hash1, hash2);
    }

    #[test]
    fn test_different_salts_different_output() {
        let (key1, _) = key_from_passphrase("hunter2", &new_salt().unwrap()).unwrap();
        let (key2, _) = key_from_passphrase("hunter2", &new_salt().unwrap()).unwrap();

        assert_ne!(*key1, *key2);
    }

    #[test]
    fn test_key_and_hash_are_independent_halves() {
        let salt = new_salt().unwrap();
        let (key, hash) = key_from_passphrase("hunter2", &salt).unwrap();

        assert_ne!(*key, hash);
    }

    #[test]
    fn test_rejects_bad_salt() {
        assert!(key_from_passphrase("hunter2", &[0u8; 8]).is_err());
    }

    #[test]
    fn test_rejects_empty_passphrase() {
        let salt = new_salt().unwrap();
        assert!(key_from_passphrase("", &salt).is_err());
    }
}
