//! In-memory backend
//!
//! Holds everything in a HashMap with monotonically increasing version
//! numbers. Exists for tests and throwaway repositories; compare-and-swap
//! semantics are exact, which makes it the reference backend for the index
//! conflict tests.

use crate::backend::{
    validate_name, Backend, ByteRange, OptionsList, VersionTag, WriteCondition,
};
use crate::error::{Error, Result};
use crate::infofile::InfoFile;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;

static OPTIONS: OptionsList = OptionsList {
    label: "In-memory (volatile)",
    required: &[],
    optional: &[],
};

/// Declared options of the memory backend
pub fn options_list() -> OptionsList {
    OPTIONS
}

/// Registry factory
pub fn factory(_opts: &HashMap<String, String>) -> Result<Arc<dyn Backend>> {
    Ok(Arc::new(MemoryBackend::new()))
}

/// Parse `memory:` (no options)
pub fn parse_connection_string(_connection: &str) -> Result<HashMap<String, String>> {
    Ok(HashMap::new())
}

#[derive(Default)]
struct MemoryState {
    objects: HashMap<String, StoredObject>,
    info: Option<InfoFile>,
    next_version: u64,
}

struct StoredObject {
    version: u64,
    data: Vec<u8>,
}

/// Volatile in-process object store
#[derive(Default)]
pub struct MemoryBackend {
    state: Mutex<MemoryState>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored objects, for assertions in tests
    pub async fn object_count(&self) -> usize {
        self.state.lock().await.objects.len()
    }

    /// Names of stored objects, for assertions in tests
    pub async fn object_names(&self) -> Vec<String> {
        let state = self.state.lock().await;
        state.objects.keys().cloned().collect()
    }
}

#[async_trait]
impl Backend for MemoryBackend {
    fn scheme(&self) -> &'static str {
        "memory"
    }

    async fn raw_get(
        &self,
        name: &str,
        out: &mut (dyn AsyncWrite + Send + Unpin),
        range: Option<ByteRange>,
    ) -> Result<Option<VersionTag>> {
        validate_name(name)?;

        // Copy out under the lock; objects are small enough in tests
        let (data, tag) = {
            let state = self.state.lock().await;
            match state.objects.get(name) {
                None => return Ok(None),
                Some(obj) if obj.data.is_empty() => return Ok(None),
                Some(obj) => (obj.data.clone(), VersionTag(obj.version.to_string())),
            }
        };

        let slice = match range {
            None => &data[..],
            Some(range) => {
                let start = (range.start as usize).min(data.len());
                let end = match range.count {
                    Some(c) => (start + c as usize).min(data.len()),
                    None => data.len(),
                };
                &data[start..end]
            }
        };

        out.write_all(slice).await?;
        out.flush().await?;
        Ok(Some(tag))
    }

    async fn raw_set(
        &self,
        name: &str,
        reader: &mut (dyn AsyncRead + Send + Unpin),
        condition: WriteCondition,
    ) -> Result<VersionTag> {
        validate_name(name)?;

        let mut data = Vec::new();
        reader.read_to_end(&mut data).await?;

        let mut state = self.state.lock().await;
        match (&condition, state.objects.get(name)) {
            (WriteCondition::IfNotExists, Some(_)) => return Err(Error::BackendConflict),
            (WriteCondition::IfMatch(_), None) => return Err(Error::BackendConflict),
            (WriteCondition::IfMatch(expected), Some(obj))
                if expected.0 != obj.version.to_string() =>
            {
                return Err(Error::BackendConflict)
            }
            _ => {}
        }

        state.next_version += 1;
        let version = state.next_version;
        state.objects.insert(name.to_string(), StoredObject { version, data });
        Ok(VersionTag(version.to_string()))
    }

    async fn delete(&self, name: &str, tag: Option<&VersionTag>) -> Result<()> {
        validate_name(name)?;

        let mut state = self.state.lock().await;
        match (tag, state.objects.get(name)) {
            (_, None) => return Err(Error::BackendNotFound),
            (Some(expected), Some(obj)) if expected.0 != obj.version.to_string() => {
                return Err(Error::BackendConflict)
            }
            _ => {}
        }

        state.objects.remove(name);
        Ok(())
    }

    async fn get_info_file(&self) -> Result<Option<InfoFile>> {
        let state = self.state.lock().await;
        if let Some(info) = &state.info {
            info.validate()?;
        }
        Ok(state.info.clone())
    }

    async fn set_info_file(&self, info: &InfoFile) -> Result<()> {
        let mut state = self.state.lock().await;
        state.info = Some(info.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_set_get_roundtrip() {
        let backend = MemoryBackend::new();
        let tag = backend
            .raw_set("obj", &mut &b"data"[..], WriteCondition::IfNotExists)
            .await
            .unwrap();

        let mut out = Vec::new();
        let got = backend.raw_get("obj", &mut out, None).await.unwrap();
        assert_eq!(got, Some(tag));
        assert_eq!(out, b"data");
    }

    #[tokio::test]
    async fn test_cas_semantics() {
        let backend = MemoryBackend::new();
        let tag1 = backend
            .raw_set("obj", &mut &b"v1"[..], WriteCondition::IfNotExists)
            .await
            .unwrap();

        // Matching tag succeeds and produces a new version
        let tag2 = backend
            .raw_set("obj", &mut &b"v2"[..], WriteCondition::IfMatch(tag1.clone()))
            .await
            .unwrap();
        assert_ne!(tag1, tag2);

        // Stale tag now fails
        let err = backend
            .raw_set("obj", &mut &b"v3"[..], WriteCondition::IfMatch(tag1))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::BackendConflict));
    }

    #[tokio::test]
    async fn test_delete_with_stale_tag() {
        let backend = MemoryBackend::new();
        let tag1 = backend
            .raw_set("obj", &mut &b"v1"[..], WriteCondition::IfNotExists)
            .await
            .unwrap();
        backend
            .raw_set("obj", &mut &b"v2"[..], WriteCondition::IfMatch(tag1.clone()))
            .await
            .unwrap();

        let err = backend.delete("obj", Some(&tag1)).await.unwrap_err();
        assert!(matches!(err, Error::BackendConflict));

        backend.delete("obj", None).await.unwrap();
        assert_eq!(backend.object_count().await, 0);
    }

    #[tokio::test]
    async fn test_ranged_get() {
        let backend = MemoryBackend::new();
        backend
            .raw_set("obj", &mut &b"0123456789"[..], WriteCondition::IfNotExists)
            .await
            .unwrap();

        let mut out = Vec::new();
        backend
            .raw_get(
                "obj",
                &mut out,
                Some(ByteRange {
                    start: 3,
                    count: Some(3),
                }),
            )
            .await
            .unwrap();
        assert_eq!(out, b"345");
    }
}
