//! Repository facade
//!
//! Orchestrates the index, the encrypted object store, and the backend:
//! adding a file streams it into a fresh object and then commits the index;
//! reads resolve the path through the index tree; removals commit the index
//! first and then delete backend objects best-effort.

use crate::backend::{Backend, WriteCondition};
use crate::crypto::MasterKey;
use crate::envelope::{Metadata, RequestRange};
use crate::error::{Error, Result};
use crate::index::{validate_file_path, Index, TreeEntry};
use crate::store::ObjectStore;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::mpsc;
use tracing::{info, warn};
use uuid::Uuid;

/// Outcome of removing one path
#[derive(Debug)]
pub struct PathResult {
    pub path: String,
    pub status: PathStatus,
}

/// Status of one removed path
#[derive(Debug)]
pub enum PathStatus {
    /// Index entry and backend object are gone
    Ok,
    /// Nothing matched the path
    NotFound,
    /// The backend delete (or the index update) failed
    InternalError(Error),
}

/// An unlocked repository
pub struct Repository {
    store: Arc<ObjectStore>,
    index: Index,
}

impl Repository {
    /// Assemble a repository from an unlocked master key
    pub fn open(backend: Arc<dyn Backend>, master_key: MasterKey, data_path: String) -> Self {
        let store = Arc::new(ObjectStore::new(backend, master_key, data_path));
        let index = Index::new(store.clone());
        Repository { store, index }
    }

    /// The encrypted object store (used by the HTTP server for by-id reads)
    pub fn store(&self) -> &Arc<ObjectStore> {
        &self.store
    }

    /// Encrypt and store a file at a logical path
    ///
    /// A fresh object id is allocated, the plaintext is stream-encrypted
    /// into the backend, and the index is committed afterwards. If the
    /// index commit fails the object is removed again. Fails with
    /// [`Error::Exists`] when the path is already taken.
    pub async fn add_file<R>(
        &self,
        path: &str,
        content_type: &str,
        reader: R,
        size: i64,
    ) -> Result<Uuid>
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        validate_file_path(path)?;
        if self.index.lookup(path).await?.is_some() {
            return Err(Error::Exists(path.to_string()));
        }

        let object_id = Uuid::new_v4();
        let file_name = path.rsplit('/').next().unwrap_or_default();
        let metadata = Metadata {
            name: file_name.to_string(),
            content_type: content_type.to_string(),
            size,
        };

        let hasher = Arc::new(parking_lot::Mutex::new(blake3::Hasher::new()));
        let reader = DigestReader {
            inner: reader,
            hasher: hasher.clone(),
        };

        let key = self.store.object_key(&object_id);
        self.store
            .set(&key, reader, WriteCondition::IfNotExists, &metadata)
            .await?;

        let digest = *hasher.lock().finalize().as_bytes();
        if let Err(e) = self.index.add_file(path, object_id, Some(digest)).await {
            warn!(path, "index commit failed after upload, removing object");
            let _ = self.store.delete(&key, None).await;
            return Err(e);
        }

        info!(path, %object_id, "added file");
        Ok(object_id)
    }

    /// Decrypt a file to `out`; the metadata callback runs before any data
    pub async fn get_file<W>(
        &self,
        path: &str,
        out: &mut W,
        metadata_cb: impl FnMut(&Metadata, u32) -> bool + Send,
    ) -> Result<()>
    where
        W: AsyncWrite + Unpin + Send + ?Sized,
    {
        let object_id = self
            .index
            .lookup(path)
            .await?
            .ok_or(Error::BackendNotFound)?;

        let key = self.store.object_key(&object_id);
        match self.store.get(&key, out, metadata_cb).await? {
            Some(_) => Ok(()),
            None => Err(Error::BackendNotFound),
        }
    }

    /// Decrypt a plaintext byte range of a file to `out`
    pub async fn get_file_range<W>(
        &self,
        path: &str,
        out: &mut W,
        start: u64,
        length: Option<u64>,
    ) -> Result<()>
    where
        W: AsyncWrite + Unpin + Send + ?Sized,
    {
        let object_id = self
            .index
            .lookup(path)
            .await?
            .ok_or(Error::BackendNotFound)?;

        let key = self.store.object_key(&object_id);
        let range = RequestRange::new(start, length);
        match self.store.get_with_range(&key, out, range, |_, _| {}).await? {
            true => Ok(()),
            false => Err(Error::BackendNotFound),
        }
    }

    /// Decrypt an object by id (bypasses the index; used for `/file/:id`)
    pub async fn get_object<W>(
        &self,
        object_id: &Uuid,
        out: &mut W,
        metadata_cb: impl FnMut(&Metadata, u32) -> bool + Send,
    ) -> Result<()>
    where
        W: AsyncWrite + Unpin + Send + ?Sized,
    {
        let key = self.store.object_key(object_id);
        match self.store.get(&key, out, metadata_cb).await? {
            Some(_) => Ok(()),
            None => Err(Error::BackendNotFound),
        }
    }

    /// Remove a path (or everything below a prefix), reporting one
    /// [`PathResult`] per affected path
    ///
    /// The index is committed first; backend deletes afterwards are
    /// best-effort, so a failed delete leaves an orphaned object but never
    /// a dangling index entry.
    pub async fn remove_path(&self, path: &str, results: &mpsc::Sender<PathResult>) {
        let (objects, paths) = match self.index.delete_file(path).await {
            Ok(r) => r,
            Err(e) => {
                let _ = results
                    .send(PathResult {
                        path: path.to_string(),
                        status: PathStatus::InternalError(e),
                    })
                    .await;
                return;
            }
        };

        if objects.is_empty() {
            let _ = results
                .send(PathResult {
                    path: path.to_string(),
                    status: PathStatus::NotFound,
                })
                .await;
            return;
        }

        for (object_id, object_path) in objects.iter().zip(paths) {
            let key = self.store.object_key(object_id);
            let status = match self.store.delete(&key, None).await {
                Ok(()) => PathStatus::Ok,
                Err(e) => {
                    warn!(path = %object_path, "failed to delete backend object");
                    PathStatus::InternalError(e)
                }
            };
            let _ = results
                .send(PathResult {
                    path: object_path,
                    status,
                })
                .await;
        }
    }

    /// List the entries below a directory path
    pub async fn list(&self, path: &str) -> Result<Option<Vec<TreeEntry>>> {
        self.index.list(path).await
    }
}

/// Reader adapter that hashes everything passing through it
struct DigestReader<R> {
    inner: R,
    hasher: Arc<parking_lot::Mutex<blake3::Hasher>>,
}

impl<R: AsyncRead + Unpin> AsyncRead for DigestReader<R> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        let this = self.get_mut();
        let before = buf.filled().len();
        let result = Pin::new(&mut this.inner).poll_read(cx, buf);
        if let Poll::Ready(Ok(())) = &result {
            let new = &buf.filled()[before..];
            if !new.is_empty() {
                this.hasher.lock().update(new);
            }
        }
        result
    }
}
