//! Streaming envelope decryption, full and random-access

use crate::crypto::{self, MasterKey, NONCE_SIZE, TAG_SIZE};
use crate::envelope::{
    chunk_nonce, nonce_prefix, read_full, Metadata, CHUNK_SIZE, ENVELOPE_VERSION,
    MAX_WRAPPED_KEY_LEN, NONCE_PREFIX_SIZE,
};
use crate::error::{Error, Result};
use aes_gcm::aead::{Aead, AeadInPlace, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce, Tag};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Parsed envelope header and metadata block
#[derive(Debug, Clone)]
pub struct FileHeader {
    /// Envelope format version
    pub version: u16,
    /// Length of the header in bytes (4 + wrapped key length)
    pub header_length: u32,
    /// The wrapped per-file data key
    pub wrapped_key: Vec<u8>,
    /// Decrypted file metadata
    pub metadata: Metadata,
    /// Length of the encrypted metadata block (nonce + ciphertext + tag)
    pub metadata_length: u32,
}

/// What a [`decrypt_file`] call produced
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecryptOutcome {
    /// The caller stopped after the metadata block; no chunk was read
    MetadataOnly,
    /// The whole file was decrypted
    Full {
        /// Plaintext bytes written to the output
        bytes_written: u64,
    },
}

/// Decrypt a complete envelope stream
///
/// Parses the header, unwraps the data key, decrypts the metadata block and
/// invokes `metadata_cb(metadata, metadata_length)`. If the callback returns
/// false, or `out` is `None`, decryption stops with
/// [`DecryptOutcome::MetadataOnly`]; otherwise every chunk is verified and
/// the plaintext is streamed to `out`.
pub async fn decrypt_file<R, W>(
    out: Option<&mut W>,
    reader: &mut R,
    master_key: &MasterKey,
    mut metadata_cb: impl FnMut(&Metadata, u32) -> bool,
) -> Result<(FileHeader, DecryptOutcome)>
where
    R: AsyncRead + Unpin + ?Sized,
    W: AsyncWrite + Unpin + ?Sized,
{
    // Header
    let mut fixed = [0u8; 4];
    reader
        .read_exact(&mut fixed)
        .await
        .map_err(|_| Error::Crypto("file header is truncated".to_string()))?;

    let version = u16::from_be_bytes([fixed[0], fixed[1]]);
    if version != ENVELOPE_VERSION {
        return Err(Error::Crypto(format!(
            "unsupported envelope version {}",
            version
        )));
    }

    let wrapped_len = u16::from_be_bytes([fixed[2], fixed[3]]) as usize;
    if wrapped_len == 0 || wrapped_len > MAX_WRAPPED_KEY_LEN {
        return Err(Error::Crypto("invalid wrapped key length".to_string()));
    }

    let mut wrapped_key = vec![0u8; wrapped_len];
    reader
        .read_exact(&mut wrapped_key)
        .await
        .map_err(|_| Error::Crypto("file header is truncated".to_string()))?;

    let file_key = crypto::unwrap_key(master_key.as_bytes(), &wrapped_key)?;
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(file_key.as_ref()));
    let prefix = nonce_prefix(&wrapped_key);

    // Metadata block
    let mut len_buf = [0u8; 4];
    reader
        .read_exact(&mut len_buf)
        .await
        .map_err(|_| Error::Crypto("metadata block is truncated".to_string()))?;
    let metadata_length = u32::from_be_bytes(len_buf);
    if (metadata_length as usize) < NONCE_SIZE + TAG_SIZE
        || metadata_length as usize > CHUNK_SIZE + NONCE_SIZE + TAG_SIZE
    {
        return Err(Error::Crypto("invalid metadata length".to_string()));
    }

    let mut block = vec![0u8; metadata_length as usize];
    reader
        .read_exact(&mut block)
        .await
        .map_err(|_| Error::Crypto("metadata block is truncated".to_string()))?;

    let (nonce, sealed) = block.split_at(NONCE_SIZE);
    let expected_nonce = chunk_nonce(&prefix, 0);
    if nonce != expected_nonce.as_slice() {
        return Err(Error::Crypto("invalid metadata nonce".to_string()));
    }

    let metadata_json = cipher
        .decrypt(Nonce::from_slice(nonce), sealed)
        .map_err(|_| Error::Crypto("metadata decryption failed".to_string()))?;
    let metadata: Metadata = serde_json::from_slice(&metadata_json)
        .map_err(|e| Error::Serialization(format!("metadata decoding failed: {}", e)))?;

    let header = FileHeader {
        version,
        header_length: 4 + wrapped_len as u32,
        wrapped_key,
        metadata,
        metadata_length,
    };

    let proceed = metadata_cb(&header.metadata, metadata_length);
    let writer = match (proceed, out) {
        (true, Some(w)) => w,
        _ => return Ok((header, DecryptOutcome::MetadataOnly)),
    };

    // Data chunks
    let mut bytes_written: u64 = 0;
    let mut counter: u32 = 1;
    let mut buf = vec![0u8; TAG_SIZE + CHUNK_SIZE];
    loop {
        let n = read_full(reader, &mut buf).await?;
        if n == 0 {
            break;
        }
        if n <= TAG_SIZE {
            return Err(Error::Crypto("encrypted chunk is truncated".to_string()));
        }

        let plaintext = decrypt_chunk(&cipher, &prefix, counter, &mut buf[..n])?;
        writer.write_all(plaintext).await?;
        bytes_written += plaintext.len() as u64;
        counter += 1;

        if n < buf.len() {
            break;
        }
    }

    writer.flush().await?;
    Ok((header, DecryptOutcome::Full { bytes_written }))
}

/// Decrypt a window of chunks fetched with a byte-range request
///
/// The stream must begin exactly at chunk `start_package` (chunk 0 is the
/// metadata block, so `start_package >= 1`). `skip_beginning` bytes of the
/// first chunk's plaintext are discarded and exactly `length` plaintext
/// bytes are written to `out`.
pub async fn decrypt_packages<R, W>(
    out: &mut W,
    reader: &mut R,
    header_version: u16,
    wrapped_key: &[u8],
    master_key: &MasterKey,
    start_package: u32,
    skip_beginning: u32,
    length: u64,
) -> Result<u64>
where
    R: AsyncRead + Unpin + ?Sized,
    W: AsyncWrite + Unpin + ?Sized,
{
    if header_version != ENVELOPE_VERSION {
        return Err(Error::Crypto(format!(
            "unsupported envelope version {}",
            header_version
        )));
    }
    if start_package < 1 {
        return Err(Error::Crypto("start package must be at least 1".to_string()));
    }
    if skip_beginning as usize >= CHUNK_SIZE {
        return Err(Error::Crypto("skip offset exceeds chunk size".to_string()));
    }

    let file_key = crypto::unwrap_key(master_key.as_bytes(), wrapped_key)?;
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(file_key.as_ref()));
    let prefix = nonce_prefix(wrapped_key);

    let mut remaining = length;
    let mut skip = skip_beginning as usize;
    let mut counter = start_package;
    let mut buf = vec![0u8; TAG_SIZE + CHUNK_SIZE];

    while remaining > 0 {
        let n = read_full(reader, &mut buf).await?;
        if n <= TAG_SIZE {
            return Err(Error::Crypto("encrypted chunk is truncated".to_string()));
        }

        let plaintext = decrypt_chunk(&cipher, &prefix, counter, &mut buf[..n])?;
        if skip >= plaintext.len() {
            return Err(Error::Crypto("range begins past end of file".to_string()));
        }

        let end = plaintext.len().min(skip + remaining as usize);
        let window = &plaintext[skip..end];
        out.write_all(window).await?;
        remaining -= window.len() as u64;
        skip = 0;
        counter += 1;
    }

    out.flush().await?;
    Ok(length)
}

/// Verify and decrypt one `tag ‖ ciphertext` chunk in place, returning the
/// plaintext slice
fn decrypt_chunk<'a>(
    cipher: &Aes256Gcm,
    prefix: &[u8; NONCE_PREFIX_SIZE],
    counter: u32,
    chunk: &'a mut [u8],
) -> Result<&'a [u8]> {
    let nonce = chunk_nonce(prefix, counter);
    let (tag, ciphertext) = chunk.split_at_mut(TAG_SIZE);
    cipher
        .decrypt_in_place_detached(
            Nonce::from_slice(&nonce),
            b"",
            ciphertext,
            Tag::from_slice(tag),
        )
        .map_err(|_| Error::Crypto("chunk decryption failed".to_string()))?;
    Ok(ciphertext)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::encrypt_file;

    fn test_metadata(size: i64) -> Metadata {
        Metadata {
            name: "readme.md".to_string(),
            content_type: "text/markdown".to_string(),
            size,
        }
    }

    async fn encrypt_to_vec(plaintext: &[u8], key: &MasterKey, metadata: &Metadata) -> Vec<u8> {
        let mut out = Vec::new();
        encrypt_file(&mut out, &mut &plaintext[..], key, metadata)
            .await
            .unwrap();
        out
    }

    #[tokio::test]
    async fn test_roundtrip_small() {
        let key = MasterKey::generate().unwrap();
        let metadata = test_metadata(13);
        let encrypted = encrypt_to_vec(b"Hello, World!", &key, &metadata).await;

        let mut out = Vec::new();
        let (header, outcome) =
            decrypt_file(Some(&mut out), &mut encrypted.as_slice(), &key, |_, _| true)
                .await
                .unwrap();

        assert_eq!(out, b"Hello, World!");
        assert_eq!(header.metadata, metadata);
        assert_eq!(outcome, DecryptOutcome::Full { bytes_written: 13 });
    }

    #[tokio::test]
    async fn test_roundtrip_empty_file() {
        let key = MasterKey::generate().unwrap();
        let metadata = test_metadata(0);
        let encrypted = encrypt_to_vec(b"", &key, &metadata).await;

        let mut out = Vec::new();
        let (header, outcome) =
            decrypt_file(Some(&mut out), &mut encrypted.as_slice(), &key, |_, _| true)
                .await
                .unwrap();

        assert!(out.is_empty());
        assert_eq!(outcome, DecryptOutcome::Full { bytes_written: 0 });
        // Header + metadata block only, zero data chunks
        assert_eq!(
            encrypted.len() as u64,
            header.header_length as u64 + 4 + header.metadata_length as u64
        );
    }

    #[tokio::test]
    async fn test_roundtrip_multi_chunk() {
        let key = MasterKey::generate().unwrap();
        let plaintext = vec![0x41u8; 1024 * 1024];
        let metadata = test_metadata(plaintext.len() as i64);
        let encrypted = encrypt_to_vec(&plaintext, &key, &metadata).await;

        let mut out = Vec::new();
        decrypt_file(Some(&mut out), &mut encrypted.as_slice(), &key, |_, _| true)
            .await
            .unwrap();

        assert_eq!(out, plaintext);
    }

    #[tokio::test]
    async fn test_chunk_size_on_disk() {
        let key = MasterKey::generate().unwrap();
        let plaintext = vec![0u8; CHUNK_SIZE * 2 + 100];
        let metadata = test_metadata(plaintext.len() as i64);
        let encrypted = encrypt_to_vec(&plaintext, &key, &metadata).await;

        let mut header_only = Vec::new();
        let (header, _) = decrypt_file(
            Some(&mut header_only),
            &mut encrypted.as_slice(),
            &key,
            |_, _| false,
        )
        .await
        .unwrap();

        // Two full chunks of exactly CHUNK_SIZE + TAG_SIZE plus a short one
        let data_len = encrypted.len() as u64
            - header.header_length as u64
            - 4
            - header.metadata_length as u64;
        assert_eq!(data_len, 2 * (CHUNK_SIZE + TAG_SIZE) as u64 + 100 + TAG_SIZE as u64);
    }

    #[tokio::test]
    async fn test_metadata_only_stops_early() {
        let key = MasterKey::generate().unwrap();
        let metadata = test_metadata(5);
        let encrypted = encrypt_to_vec(b"abcde", &key, &metadata).await;

        let mut seen = None;
        let mut out = Vec::new();
        let (_, outcome) = decrypt_file(
            Some(&mut out),
            &mut encrypted.as_slice(),
            &key,
            |md, len| {
                seen = Some((md.clone(), len));
                false
            },
        )
        .await
        .unwrap();

        assert_eq!(outcome, DecryptOutcome::MetadataOnly);
        assert!(out.is_empty());
        let (md, len) = seen.unwrap();
        assert_eq!(md, metadata);
        assert!(len > 0);
    }

    #[tokio::test]
    async fn test_wrong_master_key_fails() {
        let key = MasterKey::generate().unwrap();
        let other = MasterKey::generate().unwrap();
        let encrypted = encrypt_to_vec(b"secret", &key, &test_metadata(6)).await;

        let mut out = Vec::new();
        let err = decrypt_file(Some(&mut out), &mut encrypted.as_slice(), &other, |_, _| true)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Crypto(_)));
    }

    #[tokio::test]
    async fn test_tampered_chunk_fails() {
        let key = MasterKey::generate().unwrap();
        let encrypted = encrypt_to_vec(&[0x42u8; 4096], &key, &test_metadata(4096)).await;

        let mut tampered = encrypted.clone();
        let last = tampered.len() - 1;
        tampered[last] ^= 0xFF;

        let mut out = Vec::new();
        let err = decrypt_file(Some(&mut out), &mut tampered.as_slice(), &key, |_, _| true)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Crypto(_)));
    }

    #[tokio::test]
    async fn test_truncated_stream_fails() {
        let key = MasterKey::generate().unwrap();
        let encrypted = encrypt_to_vec(&[0x42u8; 4096], &key, &test_metadata(4096)).await;
        let truncated = &encrypted[..encrypted.len() - 10];

        let mut out = Vec::new();
        let err = decrypt_file(Some(&mut out), &mut &truncated[..], &key, |_, _| true)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Crypto(_)));
    }

    #[tokio::test]
    async fn test_ranged_decrypt_across_chunk_boundary() {
        let key = MasterKey::generate().unwrap();
        let mut plaintext = vec![0u8; CHUNK_SIZE * 3];
        for (i, b) in plaintext.iter_mut().enumerate() {
            *b = (i % 251) as u8;
        }
        let metadata = test_metadata(plaintext.len() as i64);
        let encrypted = encrypt_to_vec(&plaintext, &key, &metadata).await;

        // Parse the header to find where the data region starts
        let mut sink = Vec::new();
        let (header, _) = decrypt_file(
            Some(&mut sink),
            &mut encrypted.as_slice(),
            &key,
            |_, _| false,
        )
        .await
        .unwrap();
        let data_offset = header.header_length as usize + 4 + header.metadata_length as usize;

        // Range crossing the first chunk boundary: [CHUNK_SIZE - 1, CHUNK_SIZE + 1)
        let start = CHUNK_SIZE as u64 - 1;
        let length = 2u64;
        let range = crate::envelope::RequestRange::resolved(
            start,
            Some(length),
            header.header_length,
            header.metadata_length,
            plaintext.len() as u64,
        );

        let window = &encrypted
            [data_offset + (range.start_package() - 1) as usize * (CHUNK_SIZE + TAG_SIZE)..];
        let mut out = Vec::new();
        decrypt_packages(
            &mut out,
            &mut &window[..],
            header.version,
            &header.wrapped_key,
            &key,
            range.start_package(),
            range.skip_beginning(),
            range.length,
        )
        .await
        .unwrap();

        assert_eq!(out, &plaintext[start as usize..(start + length) as usize]);
    }

    #[tokio::test]
    async fn test_ranged_decrypt_every_offset_in_small_file() {
        let key = MasterKey::generate().unwrap();
        let plaintext: Vec<u8> = (0..200u32).map(|i| (i % 256) as u8).collect();
        let metadata = test_metadata(plaintext.len() as i64);
        let encrypted = encrypt_to_vec(&plaintext, &key, &metadata).await;

        let mut sink = Vec::new();
        let (header, _) = decrypt_file(
            Some(&mut sink),
            &mut encrypted.as_slice(),
            &key,
            |_, _| false,
        )
        .await
        .unwrap();
        let data_offset = header.header_length as usize + 4 + header.metadata_length as usize;

        for start in [0u64, 1, 50, 199] {
            let length = (plaintext.len() as u64 - start).min(97);
            let mut out = Vec::new();
            decrypt_packages(
                &mut out,
                &mut &encrypted[data_offset..],
                header.version,
                &header.wrapped_key,
                &key,
                1,
                start as u32,
                length,
            )
            .await
            .unwrap();
            assert_eq!(out, &plaintext[start as usize..(start + length) as usize]);
        }
    }

    #[tokio::test]
    async fn test_decrypt_packages_rejects_bad_window() {
        let key = MasterKey::generate().unwrap();
        let wrapped = crate::crypto::wrap_key(key.as_bytes(), &[1u8; 32]).unwrap();
        let empty: &[u8] = &[];

        let mut out = Vec::new();
        let err = decrypt_packages(
            &mut out,
            &mut { empty },
            ENVELOPE_VERSION,
            &wrapped,
            &key,
            0,
            0,
            10,
        )
        .await
        .unwrap_err();
        assert!(matches!(err, Error::Crypto(_)));

        let err = decrypt_packages(
            &mut out,
            &mut { empty },
            ENVELOPE_VERSION,
            &wrapped,
            &key,
            1,
            CHUNK_SIZE as u32,
            10,
        )
        .await
        .unwrap_err();
        assert!(matches!(err, Error::Crypto(_)));
    }
}
