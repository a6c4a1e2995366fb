//! The encrypted file envelope
//!
//! Every object stored in a backend uses the same streaming format:
//!
//! ```text
//! [ version(2B BE) | wrappedKeyLen(2B BE) | wrappedKey ]
//! [ metadataLen(4B BE) | nonce(12B) | ciphertext | tag(16B) ]
//! [ tag(16B) | ciphertext ] ... one per 64 KiB plaintext chunk
//! ```
//!
//! A fresh data key is generated per file and wrapped with the master key;
//! the wrapped key travels in the header. Chunk `i` is sealed with nonce
//! `prefix(8B) ‖ i(4B BE)` where the prefix is derived from the wrapped key,
//! so ranged reads can reconstruct any chunk nonce from the header alone.
//! The metadata block is chunk 0; data chunks start at 1. Every full data
//! chunk is exactly 64 KiB + 16 bytes on disk, which makes the byte offset
//! of any chunk a constant-time computation.

mod decrypt;
mod encrypt;
mod range;

pub use decrypt::{decrypt_file, decrypt_packages, DecryptOutcome, FileHeader};
pub use encrypt::encrypt_file;
pub use range::RequestRange;

use crate::crypto::{NONCE_SIZE, TAG_SIZE};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt};

/// Envelope format version
pub const ENVELOPE_VERSION: u16 = 2;

/// Plaintext chunk size
pub const CHUNK_SIZE: usize = 64 * 1024;

/// On-disk size of one full encrypted chunk (tag + ciphertext)
pub const CHUNK_DISK_SIZE: usize = CHUNK_SIZE + TAG_SIZE;

/// Maximum length of the wrapped key field in the header
pub const MAX_WRAPPED_KEY_LEN: usize = 256;

/// Upper bound on header + metadata block, used to size the first fetch of
/// a ranged read
pub const HEADER_FETCH_SIZE: usize = 64 * 1024 + 288;

/// Maximum serialized metadata size; keeps header + metadata within
/// [`HEADER_FETCH_SIZE`]
pub const MAX_METADATA_SIZE: usize =
    HEADER_FETCH_SIZE - 4 - MAX_WRAPPED_KEY_LEN - 4 - NONCE_SIZE - TAG_SIZE;

/// Length of the per-file nonce prefix
pub const NONCE_PREFIX_SIZE: usize = 8;

/// File metadata stored encrypted inside the envelope
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Metadata {
    /// Original file name
    pub name: String,
    /// MIME type
    pub content_type: String,
    /// Plaintext size in bytes
    pub size: i64,
}

/// Derive the per-file nonce prefix from the wrapped key
///
/// The wrapped key contains a random nonce and the ciphertext of a random
/// key, so the prefix is unique per file, and anyone holding the header can
/// recompute it without touching the metadata block.
pub(crate) fn nonce_prefix(wrapped_key: &[u8]) -> [u8; NONCE_PREFIX_SIZE] {
    let hash = blake3::hash(wrapped_key);
    let mut prefix = [0u8; NONCE_PREFIX_SIZE];
    prefix.copy_from_slice(&hash.as_bytes()[..NONCE_PREFIX_SIZE]);
    prefix
}

/// Build the nonce for chunk `counter` (0 is the metadata block)
pub(crate) fn chunk_nonce(prefix: &[u8; NONCE_PREFIX_SIZE], counter: u32) -> [u8; NONCE_SIZE] {
    let mut nonce = [0u8; NONCE_SIZE];
    nonce[..NONCE_PREFIX_SIZE].copy_from_slice(prefix);
    nonce[NONCE_PREFIX_SIZE..].copy_from_slice(&counter.to_be_bytes());
    nonce
}

/// Read until `buf` is full or EOF; returns the number of bytes read
pub(crate) async fn read_full<R>(reader: &mut R, buf: &mut [u8]) -> std::io::Result<usize>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut total = 0;
    while total < buf.len() {
        let n = reader.read(&mut buf[total..]).await?;
        if n == 0 {
            break;
        }
        total += n;
    }
    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_nonce_prefix_is_stable() {
        let wrapped = vec![7u8; 60];
        assert_eq!(nonce_prefix(&wrapped), nonce_prefix(&wrapped));
    }

    #[test]
    fn test_nonce_prefix_differs_per_key() {
        assert_ne!(nonce_prefix(&[1u8; 60]), nonce_prefix(&[2u8; 60]));
    }

    #[test]
    fn test_chunk_nonce_layout() {
        let prefix = [0xAAu8; NONCE_PREFIX_SIZE];
        let nonce = chunk_nonce(&prefix, 0x01020304);

        assert_eq!(&nonce[..8], &prefix);
        assert_eq!(&nonce[8..], &[0x01, 0x02, 0x03, 0x04]);
    }

    #[test]
    fn test_chunk_nonces_are_unique() {
        let prefix = [1u8; NONCE_PREFIX_SIZE];
        let mut seen = std::collections::HashSet::new();
        for i in 0..1000 {
            assert!(seen.insert(chunk_nonce(&prefix, i)));
        }
    }
}
