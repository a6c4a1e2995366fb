//! The encrypted path index
//!
//! Maps logical repository paths to object ids. The whole index is one
//! protobuf message, stored as an encrypted envelope at the well-known
//! `_index` blob. Every save is a compare-and-swap against the version tag
//! captured at load time; on a conflict the index is reloaded, the mutation
//! replayed, and the save retried a bounded number of times.

mod tree;

pub use tree::{IndexTree, TreeEntry};

use crate::backend::{VersionTag, WriteCondition, INDEX_FILE_NAME};
use crate::envelope::Metadata;
use crate::error::{Error, Result};
use crate::store::ObjectStore;
use prost::Message;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::Mutex;
use tracing::debug;
use uuid::Uuid;

/// Version of the index wire format
pub const INDEX_FORMAT_VERSION: u32 = 1;

/// Maximum compare-and-swap attempts before giving up with
/// [`Error::IndexConflict`]
pub const MAX_SAVE_ATTEMPTS: usize = 5;

/// One file in the index
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct IndexElement {
    /// Absolute, slash-separated path
    #[prost(string, tag = "1")]
    pub path: String,

    /// Object id (UUID bytes) of the encrypted file in the backend
    #[prost(bytes = "vec", tag = "2")]
    pub object_id: Vec<u8>,

    /// Optional BLAKE3 digest of the plaintext
    #[prost(bytes = "vec", optional, tag = "3")]
    pub digest: Option<Vec<u8>>,

    /// Unix timestamp of when the entry was added
    #[prost(int64, tag = "4")]
    pub date: i64,
}

impl IndexElement {
    /// The entry's object id as a UUID
    pub fn object_uuid(&self) -> Result<Uuid> {
        Uuid::from_slice(&self.object_id)
            .map_err(|_| Error::Serialization("invalid object id in index".to_string()))
    }
}

/// The serialized index document
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct IndexFile {
    #[prost(uint32, tag = "1")]
    pub version: u32,

    #[prost(message, repeated, tag = "2")]
    pub elements: Vec<IndexElement>,

    /// Monotonically increasing save counter
    #[prost(uint64, tag = "3")]
    pub sequence: u64,
}

impl IndexFile {
    fn empty() -> Self {
        IndexFile {
            version: INDEX_FORMAT_VERSION,
            elements: Vec::new(),
            sequence: 0,
        }
    }
}

struct IndexState {
    file: IndexFile,
    tree: IndexTree,
    tag: Option<VersionTag>,
    loaded: bool,
}

/// The in-memory index with its compare-and-swap persistence
pub struct Index {
    store: Arc<ObjectStore>,
    state: Mutex<IndexState>,
}

impl Index {
    pub fn new(store: Arc<ObjectStore>) -> Self {
        Index {
            store,
            state: Mutex::new(IndexState {
                file: IndexFile::empty(),
                tree: IndexTree::new(),
                tag: None,
                loaded: false,
            }),
        }
    }

    /// Force a reload from the backend on next access
    pub async fn invalidate(&self) {
        self.state.lock().await.loaded = false;
    }

    /// Fetch and decrypt `_index`, replacing the in-memory state
    async fn load_locked(&self, state: &mut IndexState) -> Result<()> {
        let mut encoded = Vec::new();
        let tag = self
            .store
            .get(INDEX_FILE_NAME, &mut encoded, |_, _| true)
            .await?;

        match tag {
            None => {
                state.file = IndexFile::empty();
                state.tag = None;
            }
            Some(tag) => {
                state.file = IndexFile::decode(encoded.as_slice())
                    .map_err(|e| Error::Serialization(format!("index decoding failed: {}", e)))?;
                state.tag = Some(tag);
            }
        }

        state.tree = IndexTree::build(&state.file.elements);
        state.loaded = true;
        debug!(
            elements = state.file.elements.len(),
            sequence = state.file.sequence,
            "loaded index"
        );
        Ok(())
    }

    /// Apply `mutate` to the index and save it with compare-and-swap
    ///
    /// On a version conflict the index is reloaded and the mutation
    /// replayed against the fresh state, up to [`MAX_SAVE_ATTEMPTS`] times.
    /// A mutation error aborts without saving.
    pub async fn update<T, F>(&self, mutate: F) -> Result<T>
    where
        F: Fn(&mut IndexFile) -> Result<T>,
    {
        let mut state = self.state.lock().await;
        if !state.loaded {
            self.load_locked(&mut state).await?;
        }

        for attempt in 0..MAX_SAVE_ATTEMPTS {
            if attempt > 0 {
                self.load_locked(&mut state).await?;
            }

            let mut working = state.file.clone();
            let out = mutate(&mut working)?;
            working.sequence += 1;

            let encoded = working.encode_to_vec();
            let metadata = Metadata {
                name: INDEX_FILE_NAME.to_string(),
                content_type: "application/protobuf".to_string(),
                size: encoded.len() as i64,
            };
            let condition = match &state.tag {
                Some(tag) => WriteCondition::IfMatch(tag.clone()),
                None => WriteCondition::IfNotExists,
            };

            match self
                .store
                .set(
                    INDEX_FILE_NAME,
                    std::io::Cursor::new(encoded),
                    condition,
                    &metadata,
                )
                .await
            {
                Ok(new_tag) => {
                    state.tree = IndexTree::build(&working.elements);
                    state.file = working;
                    state.tag = Some(new_tag);
                    return Ok(out);
                }
                Err(Error::BackendConflict) => {
                    debug!(attempt, "index changed underneath us, replaying");
                    continue;
                }
                Err(e) => return Err(e),
            }
        }

        Err(Error::IndexConflict)
    }

    /// Add a file entry; fails with [`Error::Exists`] when the path or a
    /// conflicting file/directory entry is already present
    pub async fn add_file(
        &self,
        path: &str,
        object_id: Uuid,
        digest: Option<[u8; 32]>,
    ) -> Result<()> {
        validate_file_path(path)?;
        let path = path.to_string();

        self.update(move |file| {
            let as_dir = format!("{}/", path);
            for el in &file.elements {
                if el.path == path {
                    return Err(Error::Exists(path.clone()));
                }
                // A file cannot shadow a directory or sit below another file
                if el.path.starts_with(&as_dir) || path.starts_with(&format!("{}/", el.path)) {
                    return Err(Error::Exists(el.path.clone()));
                }
            }

            file.elements.push(IndexElement {
                path: path.clone(),
                object_id: object_id.as_bytes().to_vec(),
                digest: digest.map(|d| d.to_vec()),
                date: now_unix(),
            });
            Ok(())
        })
        .await
    }

    /// Remove a file, or every file below a prefix
    ///
    /// An exact path removes one file; a path ending in `/`, or one that
    /// matches no file but is a directory, removes everything below it.
    /// Returns the removed object ids and paths so the caller can delete
    /// the backend objects after the index is committed.
    pub async fn delete_file(&self, path: &str) -> Result<(Vec<Uuid>, Vec<String>)> {
        validate_path(path)?;
        let path = path.trim_end_matches('/').to_string();
        let prefix_only = path.is_empty();

        let result = self
            .update(move |file| {
                let prefix = format!("{}/", path);
                let exact = !prefix_only && file.elements.iter().any(|el| el.path == path);

                let mut ids = Vec::new();
                let mut paths = Vec::new();
                for el in &file.elements {
                    let matched = if exact {
                        el.path == path
                    } else {
                        el.path.starts_with(&prefix)
                    };
                    if matched {
                        ids.push(el.object_uuid()?);
                        paths.push(el.path.clone());
                    }
                }

                if ids.is_empty() {
                    // Nothing matched; abort so no index version is burned
                    return Err(Error::BackendNotFound);
                }

                file.elements.retain(|el| !paths.contains(&el.path));
                Ok((ids, paths))
            })
            .await;

        match result {
            Err(Error::BackendNotFound) => Ok((Vec::new(), Vec::new())),
            other => other,
        }
    }

    /// Resolve a file path to its object id
    pub async fn lookup(&self, path: &str) -> Result<Option<Uuid>> {
        let mut state = self.state.lock().await;
        if !state.loaded {
            self.load_locked(&mut state).await?;
        }
        Ok(state.tree.file_at(path))
    }

    /// List the children of a directory path, or `None` when it does not
    /// exist
    pub async fn list(&self, path: &str) -> Result<Option<Vec<TreeEntry>>> {
        let mut state = self.state.lock().await;
        if !state.loaded {
            self.load_locked(&mut state).await?;
        }
        Ok(state.tree.list(path))
    }

    /// Snapshot of all elements (diagnostics and tests)
    pub async fn elements(&self) -> Result<Vec<IndexElement>> {
        let mut state = self.state.lock().await;
        if !state.loaded {
            self.load_locked(&mut state).await?;
        }
        Ok(state.file.elements.clone())
    }

    /// The current save counter
    pub async fn sequence(&self) -> Result<u64> {
        let mut state = self.state.lock().await;
        if !state.loaded {
            self.load_locked(&mut state).await?;
        }
        Ok(state.file.sequence)
    }
}

fn now_unix() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// Validate a repository path; trailing slashes mark directories
pub fn validate_path(path: &str) -> Result<()> {
    if !path.starts_with('/') {
        return Err(Error::InvalidPath(path.to_string()));
    }
    let trimmed = path.trim_end_matches('/');
    if trimmed.is_empty() {
        // The root directory
        return Ok(());
    }
    for segment in trimmed[1..].split('/') {
        if segment.is_empty() || segment == "." || segment == ".." {
            return Err(Error::InvalidPath(path.to_string()));
        }
    }
    Ok(())
}

/// Validate a file path: absolute, no trailing slash, no empty or dot
/// segments
pub fn validate_file_path(path: &str) -> Result<()> {
    if path.ends_with('/') {
        return Err(Error::InvalidPath(path.to_string()));
    }
    validate_path(path)?;
    if path == "/" {
        return Err(Error::InvalidPath(path.to_string()));
    }
    Ok(())
}
