//! Local filesystem backend
//!
//! Objects are plain files under a root folder. Version tags are derived
//! from the file modification time and size; conditional writes go through
//! a temp file and an atomic rename while holding the backend's write lock.

use crate::backend::{
    validate_name, Backend, BackendOption, ByteRange, OptionsList, VersionTag, WriteCondition,
    INFO_FILE_NAME,
};
use crate::error::{Error, Result};
use crate::infofile::InfoFile;
use async_trait::async_trait;
use std::collections::HashMap;
use std::io::SeekFrom;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::fs;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncSeekExt, AsyncWrite};
use tokio::sync::Mutex;
use tracing::debug;
use uuid::Uuid;

static OPTIONS: OptionsList = OptionsList {
    label: "Local folder",
    required: &[BackendOption {
        name: "path",
        option_type: "string",
        label: "Folder path",
        private: false,
        default: None,
        description: None,
    }],
    optional: &[],
};

/// Declared options of the local backend
pub fn options_list() -> OptionsList {
    OPTIONS
}

/// Registry factory
pub fn factory(opts: &HashMap<String, String>) -> Result<Arc<dyn Backend>> {
    Ok(Arc::new(LocalBackend::from_options_map(opts)?))
}

/// Parse `local:<path>` into an options map
pub fn parse_connection_string(connection: &str) -> Result<HashMap<String, String>> {
    let path = connection
        .strip_prefix("local:")
        .ok_or_else(|| Error::Config("invalid connection string".to_string()))?;
    let mut opts = HashMap::new();
    opts.insert("path".to_string(), path.to_string());
    Ok(opts)
}

/// Filesystem-backed object store
pub struct LocalBackend {
    root: PathBuf,
    /// Serializes conditional writes and deletes so check-then-act stays
    /// atomic
    write_lock: Mutex<()>,
}

impl LocalBackend {
    /// Create a backend rooted at `path`, creating the folder if needed
    pub fn new(path: impl Into<PathBuf>) -> Result<Self> {
        let root: PathBuf = path.into();
        std::fs::create_dir_all(&root)?;
        Ok(LocalBackend {
            root,
            write_lock: Mutex::new(()),
        })
    }

    /// Build from an options map; falls back to `COFFRE_LOCAL_PATH` when
    /// the `path` option is missing
    pub fn from_options_map(opts: &HashMap<String, String>) -> Result<Self> {
        let path = match opts.get("path").filter(|p| !p.is_empty()) {
            Some(p) => p.clone(),
            None => std::env::var("COFFRE_LOCAL_PATH")
                .ok()
                .filter(|p| !p.is_empty())
                .ok_or_else(|| Error::Config("option 'path' is not defined".to_string()))?,
        };
        Self::new(path)
    }

    fn object_path(&self, name: &str) -> Result<PathBuf> {
        validate_name(name)?;
        Ok(self.root.join(name))
    }

    async fn current_tag(&self, path: &PathBuf) -> Result<Option<VersionTag>> {
        match fs::metadata(path).await {
            Ok(meta) => Ok(Some(file_tag(&meta))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

fn file_tag(meta: &std::fs::Metadata) -> VersionTag {
    let mtime = meta
        .modified()
        .ok()
        .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
        .map(|d| d.as_nanos())
        .unwrap_or(0);
    VersionTag(format!("{}-{}", mtime, meta.len()))
}

#[async_trait]
impl Backend for LocalBackend {
    fn scheme(&self) -> &'static str {
        "local"
    }

    async fn raw_get(
        &self,
        name: &str,
        out: &mut (dyn AsyncWrite + Send + Unpin),
        range: Option<ByteRange>,
    ) -> Result<Option<VersionTag>> {
        let path = self.object_path(name)?;

        let mut file = match fs::File::open(&path).await {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let meta = file.metadata().await?;
        if meta.len() == 0 {
            return Ok(None);
        }
        let tag = file_tag(&meta);

        match range {
            None => {
                tokio::io::copy(&mut file, out).await?;
            }
            Some(range) => {
                if range.start >= meta.len() {
                    return Ok(Some(tag));
                }
                file.seek(SeekFrom::Start(range.start)).await?;
                let available = meta.len() - range.start;
                let count = range.count.map_or(available, |c| c.min(available));
                let mut limited = file.take(count);
                tokio::io::copy(&mut limited, out).await?;
            }
        }

        Ok(Some(tag))
    }

    async fn raw_set(
        &self,
        name: &str,
        reader: &mut (dyn AsyncRead + Send + Unpin),
        condition: WriteCondition,
    ) -> Result<VersionTag> {
        let path = self.object_path(name)?;
        let _guard = self.write_lock.lock().await;

        let current = self.current_tag(&path).await?;
        match (&condition, &current) {
            (WriteCondition::IfNotExists, Some(_)) => return Err(Error::BackendConflict),
            (WriteCondition::IfMatch(_), None) => return Err(Error::BackendConflict),
            (WriteCondition::IfMatch(expected), Some(actual)) if expected != actual => {
                return Err(Error::BackendConflict)
            }
            _ => {}
        }

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }

        let tmp = self.root.join(format!(".tmp-{}", Uuid::new_v4()));
        let result = async {
            let mut file = fs::File::create(&tmp).await?;
            tokio::io::copy(reader, &mut file).await?;
            file.sync_all().await?;
            Ok::<_, Error>(())
        }
        .await;

        if let Err(e) = result {
            let _ = fs::remove_file(&tmp).await;
            return Err(e);
        }

        fs::rename(&tmp, &path).await?;
        let meta = fs::metadata(&path).await?;
        debug!(name, "wrote object to local store");
        Ok(file_tag(&meta))
    }

    async fn delete(&self, name: &str, tag: Option<&VersionTag>) -> Result<()> {
        let path = self.object_path(name)?;
        let _guard = self.write_lock.lock().await;

        let current = self.current_tag(&path).await?;
        match (tag, &current) {
            (_, None) => return Err(Error::BackendNotFound),
            (Some(expected), Some(actual)) if *expected != *actual => {
                return Err(Error::BackendConflict)
            }
            _ => {}
        }

        fs::remove_file(&path).await?;
        Ok(())
    }

    async fn get_info_file(&self) -> Result<Option<InfoFile>> {
        let path = self.root.join(INFO_FILE_NAME);
        let data = match fs::read(&path).await {
            Ok(d) => d,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        if data.is_empty() {
            return Ok(None);
        }

        let info: InfoFile = serde_json::from_slice(&data)
            .map_err(|e| Error::Serialization(format!("invalid info file: {}", e)))?;
        info.validate()?;
        Ok(Some(info))
    }

    async fn set_info_file(&self, info: &InfoFile) -> Result<()> {
        let data = serde_json::to_vec(info)
            .map_err(|e| Error::Serialization(format!("info file encoding failed: {}", e)))?;

        let tmp = self.root.join(format!(".tmp-{}", Uuid::new_v4()));
        fs::write(&tmp, &data).await?;
        fs::rename(&tmp, self.root.join(INFO_FILE_NAME)).await?;
        Ok(())
    }
}
