//! Streaming envelope encryption

use crate::crypto::{self, MasterKey};
use crate::envelope::{
    chunk_nonce, nonce_prefix, read_full, Metadata, CHUNK_SIZE, ENVELOPE_VERSION,
    MAX_METADATA_SIZE,
};
use crate::error::{Error, Result};
use aes_gcm::aead::{Aead, AeadInPlace, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};

/// Encrypt a stream of plaintext into the envelope format
///
/// Generates a fresh per-file data key, wraps it with the master key, then
/// seals the metadata block and each 64 KiB plaintext chunk in sequence.
/// Memory usage is bounded to a single chunk buffer regardless of input
/// size.
pub async fn encrypt_file<R, W>(
    out: &mut W,
    reader: &mut R,
    master_key: &MasterKey,
    metadata: &Metadata,
) -> Result<()>
where
    R: AsyncRead + Unpin + ?Sized,
    W: AsyncWrite + Unpin + ?Sized,
{
    // Per-file data key, wrapped under the master key
    let file_key = crypto::new_key()?;
    let wrapped = crypto::wrap_key(master_key.as_bytes(), &file_key)?;
    let prefix = nonce_prefix(&wrapped);
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(file_key.as_ref()));

    // Header
    out.write_all(&ENVELOPE_VERSION.to_be_bytes()).await?;
    out.write_all(&(wrapped.len() as u16).to_be_bytes()).await?;
    out.write_all(&wrapped).await?;

    // Metadata block, sealed as chunk 0
    let metadata_json = serde_json::to_vec(metadata)
        .map_err(|e| Error::Serialization(format!("metadata encoding failed: {}", e)))?;
    if metadata_json.len() > MAX_METADATA_SIZE {
        return Err(Error::Crypto("metadata too large".to_string()));
    }

    let nonce = chunk_nonce(&prefix, 0);
    let sealed = cipher
        .encrypt(Nonce::from_slice(&nonce), metadata_json.as_slice())
        .map_err(|_| Error::Crypto("metadata encryption failed".to_string()))?;

    let block_len = (nonce.len() + sealed.len()) as u32;
    out.write_all(&block_len.to_be_bytes()).await?;
    out.write_all(&nonce).await?;
    out.write_all(&sealed).await?;

    // Data chunks, counter starting at 1
    let mut buf = vec![0u8; CHUNK_SIZE];
    let mut counter: u32 = 1;
    loop {
        let n = read_full(reader, &mut buf).await?;
        if n == 0 {
            break;
        }
        if counter == u32::MAX {
            return Err(Error::Crypto("file too large for envelope".to_string()));
        }

        let nonce = chunk_nonce(&prefix, counter);
        let chunk = &mut buf[..n];
        let tag = cipher
            .encrypt_in_place_detached(Nonce::from_slice(&nonce), b"", chunk)
            .map_err(|_| Error::Crypto("chunk encryption failed".to_string()))?;

        out.write_all(tag.as_slice()).await?;
        out.write_all(chunk).await?;
        counter += 1;

        if n < CHUNK_SIZE {
            break;
        }
    }

    out.flush().await?;
    Ok(())
}
