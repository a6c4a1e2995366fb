//! Encrypted object store
//!
//! Couples a raw [`Backend`] with the envelope codec and the metadata
//! cache: `set` encrypts while uploading through a bounded in-memory pipe,
//! `get` decrypts while downloading, and `get_with_range` uses cached
//! header geometry to fetch and decrypt only the chunks covering the
//! requested window. Object keys are sharded as
//! `<dataPath>/<first-2-chars>/<objectId>`; names starting with `_` are
//! bookkeeping blobs stored at the root.

use crate::backend::{Backend, ByteRange, VersionTag, WriteCondition};
use crate::cache::{CacheEntry, MetadataCache};
use crate::crypto::MasterKey;
use crate::envelope::{
    decrypt_file, decrypt_packages, encrypt_file, Metadata, RequestRange, CHUNK_DISK_SIZE,
    HEADER_FETCH_SIZE,
};
use crate::error::{Error, Result};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::Mutex;
use tracing::{debug, warn};
use uuid::Uuid;

/// Buffer size of the encrypt/decrypt pipes; bounds memory to two chunks
/// per transfer
const PIPE_BUFFER: usize = 2 * CHUNK_DISK_SIZE;

/// A backend plus the crypto and caching layers above it
pub struct ObjectStore {
    backend: Arc<dyn Backend>,
    master_key: MasterKey,
    data_path: String,
    /// Single lock around lookups and inserts so an entry being used by a
    /// ranged read is not evicted mid-flight
    cache: Mutex<MetadataCache>,
}

impl ObjectStore {
    pub fn new(backend: Arc<dyn Backend>, master_key: MasterKey, data_path: String) -> Self {
        ObjectStore {
            backend,
            master_key,
            data_path,
            cache: Mutex::new(MetadataCache::new()),
        }
    }

    /// The raw backend underneath
    pub fn backend(&self) -> &Arc<dyn Backend> {
        &self.backend
    }

    /// Backend key for a data object
    pub fn object_key(&self, id: &Uuid) -> String {
        let id = id.to_string();
        format!("{}/{}/{}", self.data_path, &id[..2], id)
    }

    /// Download and decrypt a whole object
    ///
    /// `metadata_cb` runs once the metadata block is decrypted, before any
    /// data; returning false stops the transfer after the header. Returns
    /// the object's version tag, or `None` when it does not exist. The
    /// header is cached either way.
    pub async fn get<W>(
        &self,
        name: &str,
        out: &mut W,
        metadata_cb: impl FnMut(&Metadata, u32) -> bool + Send,
    ) -> Result<Option<VersionTag>>
    where
        W: AsyncWrite + Unpin + Send + ?Sized,
    {
        let (mut pipe_w, mut pipe_r) = tokio::io::duplex(PIPE_BUFFER);

        let backend = self.backend.clone();
        let object = name.to_string();
        let download =
            tokio::spawn(async move { backend.raw_get(&object, &mut pipe_w, None).await });

        let decrypted = decrypt_file(Some(out), &mut pipe_r, &self.master_key, metadata_cb).await;
        drop(pipe_r);

        let tag = match download
            .await
            .map_err(|e| Error::Internal(format!("download task failed: {}", e)))?
        {
            Ok(None) => return Ok(None),
            Ok(Some(tag)) => Some(tag),
            // The pipe collapses when decryption stops early; the decrypt
            // result is authoritative then
            Err(Error::Io(ref e)) if e.kind() == std::io::ErrorKind::BrokenPipe => None,
            Err(e) => return Err(e),
        };

        let (header, _) = decrypted?;
        let mut cache = self.cache.lock().await;
        cache.add(
            name,
            CacheEntry {
                header_version: header.version,
                header_length: header.header_length,
                wrapped_key: header.wrapped_key,
                metadata_length: header.metadata_length,
                metadata: header.metadata,
            },
        );

        Ok(tag.or_else(|| Some(VersionTag(String::new()))))
    }

    /// Download and decrypt a plaintext byte range of an object
    ///
    /// On a cache miss the header region (at most [`HEADER_FETCH_SIZE`]
    /// bytes) is fetched and parsed first; the data fetch then covers only
    /// the chunks holding the window. Returns false when the object does
    /// not exist.
    pub async fn get_with_range<W>(
        &self,
        name: &str,
        out: &mut W,
        mut range: RequestRange,
        metadata_cb: impl FnOnce(&Metadata, u32),
    ) -> Result<bool>
    where
        W: AsyncWrite + Unpin + Send + ?Sized,
    {
        // Cache lookup and fill stay under one lock
        let entry = {
            let mut cache = self.cache.lock().await;
            let cached = cache.get(name).cloned();
            match cached {
                Some(entry) => entry,
                None => {
                    let mut head = Vec::with_capacity(HEADER_FETCH_SIZE);
                    let found = self
                        .backend
                        .raw_get(
                            name,
                            &mut head,
                            Some(ByteRange {
                                start: 0,
                                count: Some(HEADER_FETCH_SIZE as u64),
                            }),
                        )
                        .await?;
                    if found.is_none() {
                        return Ok(false);
                    }

                    let no_body: Option<&mut Vec<u8>> = None;
                    let (header, _) =
                        decrypt_file(no_body, &mut head.as_slice(), &self.master_key, |_, _| {
                            false
                        })
                        .await?;

                    let entry = CacheEntry {
                        header_version: header.version,
                        header_length: header.header_length,
                        wrapped_key: header.wrapped_key,
                        metadata_length: header.metadata_length,
                        metadata: header.metadata,
                    };
                    cache.add(name, entry.clone());
                    entry
                }
            }
        };

        range.resolve(
            entry.header_length,
            entry.metadata_length,
            entry.metadata.size.max(0) as u64,
        );
        metadata_cb(&entry.metadata, entry.metadata_length);

        // Nothing to fetch for an empty window
        if range.is_empty() {
            return Ok(true);
        }

        let (mut pipe_w, mut pipe_r) = tokio::io::duplex(PIPE_BUFFER);
        let backend = self.backend.clone();
        let object = name.to_string();
        let byte_range = ByteRange {
            start: range.start_bytes(),
            count: Some(range.length_bytes()),
        };
        let download = tokio::spawn(async move {
            backend.raw_get(&object, &mut pipe_w, Some(byte_range)).await
        });

        let decrypted = decrypt_packages(
            out,
            &mut pipe_r,
            entry.header_version,
            &entry.wrapped_key,
            &self.master_key,
            range.start_package(),
            range.skip_beginning(),
            range.length,
        )
        .await;
        drop(pipe_r);

        match download
            .await
            .map_err(|e| Error::Internal(format!("download task failed: {}", e)))?
        {
            Ok(None) => return Ok(false),
            Ok(Some(_)) => {}
            Err(Error::Io(ref e)) if e.kind() == std::io::ErrorKind::BrokenPipe => {}
            Err(e) => return Err(e),
        }

        decrypted?;
        Ok(true)
    }

    /// Encrypt a plaintext stream and conditionally upload it
    ///
    /// The producer task encrypts into a bounded pipe while the upload
    /// consumes it, so at most two chunks are in memory at a time.
    pub async fn set<R>(
        &self,
        name: &str,
        mut reader: R,
        condition: WriteCondition,
        metadata: &Metadata,
    ) -> Result<VersionTag>
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let (mut pipe_w, mut pipe_r) = tokio::io::duplex(PIPE_BUFFER);

        let master_key = self.master_key.clone();
        let metadata = metadata.clone();
        let encrypt = tokio::spawn(async move {
            encrypt_file(&mut pipe_w, &mut reader, &master_key, &metadata).await
        });

        let upload = self.backend.raw_set(name, &mut pipe_r, condition).await;
        let encrypted = encrypt
            .await
            .map_err(|e| Error::Internal(format!("encrypt task failed: {}", e)))?;

        let tag = match upload {
            Ok(tag) => tag,
            Err(upload_err) => {
                // A rejected upload collapses the pipe under the encryptor;
                // only a real crypto failure outranks the upload error
                return Err(match encrypted {
                    Err(e @ (Error::Crypto(_) | Error::Serialization(_))) => e,
                    _ => upload_err,
                });
            }
        };

        if let Err(e) = encrypted {
            // The upload stored a truncated envelope; remove it
            warn!(name, "encryption failed mid-upload, removing partial object");
            let _ = self.backend.delete(name, None).await;
            return Err(e);
        }

        debug!(name, "stored encrypted object");
        Ok(tag)
    }

    /// Delete an object
    pub async fn delete(&self, name: &str, tag: Option<&VersionTag>) -> Result<()> {
        self.backend.delete(name, tag).await
    }
}
