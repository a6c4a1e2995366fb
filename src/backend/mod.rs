//! Pluggable object-store backends
//!
//! A backend is a flat key → blob store with opaque version tags and
//! conditional writes; everything else (encryption, metadata caching, key
//! sharding) is layered on top by [`crate::store::ObjectStore`]. Backends
//! register themselves in an explicit [`BackendRegistry`] built at startup,
//! keyed by the scheme of a connection string such as `local:/srv/repo`.

mod local;
mod memory;

pub use local::LocalBackend;
pub use memory::MemoryBackend;

use crate::error::{Error, Result};
use crate::infofile::InfoFile;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};

/// Blob name of the plaintext repository info file
pub const INFO_FILE_NAME: &str = "_info.json";

/// Blob name of the encrypted index
pub const INDEX_FILE_NAME: &str = "_index";

/// Opaque backend object version, used for compare-and-swap writes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionTag(pub String);

/// Precondition for a conditional write
#[derive(Debug, Clone)]
pub enum WriteCondition {
    /// Succeed only if no object exists at the name yet
    IfNotExists,
    /// Succeed only if the current version matches the tag
    IfMatch(VersionTag),
}

/// A byte range within an object; `count` of `None` reads to the end
#[derive(Debug, Clone, Copy)]
pub struct ByteRange {
    pub start: u64,
    pub count: Option<u64>,
}

/// Raw object-store operations every backend must provide
#[async_trait]
pub trait Backend: Send + Sync {
    /// Scheme name of this backend (`local`, `memory`, ...)
    fn scheme(&self) -> &'static str;

    /// Read an object (or a byte range of it) into `out`
    ///
    /// Returns `None` when the object does not exist or is empty.
    async fn raw_get(
        &self,
        name: &str,
        out: &mut (dyn AsyncWrite + Send + Unpin),
        range: Option<ByteRange>,
    ) -> Result<Option<VersionTag>>;

    /// Conditionally write an object from `reader`, returning its new tag
    async fn raw_set(
        &self,
        name: &str,
        reader: &mut (dyn AsyncRead + Send + Unpin),
        condition: WriteCondition,
    ) -> Result<VersionTag>;

    /// Delete an object; with a tag, only if the version still matches
    async fn delete(&self, name: &str, tag: Option<&VersionTag>) -> Result<()>;

    /// Fetch and validate `_info.json`; `None` when the repository is not
    /// initialized
    async fn get_info_file(&self) -> Result<Option<InfoFile>>;

    /// Write `_info.json` unconditionally
    async fn set_info_file(&self, info: &InfoFile) -> Result<()>;
}

/// One configurable option of a backend
#[derive(Debug, Clone, Copy)]
pub struct BackendOption {
    pub name: &'static str,
    pub option_type: &'static str,
    pub label: &'static str,
    /// Never echo the value back to the user (keys, secrets)
    pub private: bool,
    pub default: Option<&'static str>,
    pub description: Option<&'static str>,
}

/// The declared configuration schema of a backend
#[derive(Debug, Clone, Copy)]
pub struct OptionsList {
    pub label: &'static str,
    pub required: &'static [BackendOption],
    pub optional: &'static [BackendOption],
}

/// Constructs a backend from a validated options map
pub type BackendFactory = fn(&HashMap<String, String>) -> Result<Arc<dyn Backend>>;

/// Parses a scheme-specific connection string into an options map
pub type ConnectionParser = fn(&str) -> Result<HashMap<String, String>>;

struct RegistryEntry {
    options: OptionsList,
    factory: BackendFactory,
    parse_connection: ConnectionParser,
}

/// Explicit scheme → backend-factory map, built at startup and handed to
/// whoever needs to open repositories
pub struct BackendRegistry {
    entries: HashMap<&'static str, RegistryEntry>,
}

impl BackendRegistry {
    /// An empty registry
    pub fn new() -> Self {
        BackendRegistry {
            entries: HashMap::new(),
        }
    }

    /// A registry with every built-in backend registered
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(
            "local",
            local::options_list(),
            local::factory,
            local::parse_connection_string,
        );
        registry.register(
            "memory",
            memory::options_list(),
            memory::factory,
            memory::parse_connection_string,
        );
        registry
    }

    /// Register a backend under a scheme name
    pub fn register(
        &mut self,
        scheme: &'static str,
        options: OptionsList,
        factory: BackendFactory,
        parse_connection: ConnectionParser,
    ) {
        self.entries.insert(
            scheme,
            RegistryEntry {
                options,
                factory,
                parse_connection,
            },
        );
    }

    /// The declared options of a scheme, if registered
    pub fn options_list(&self, scheme: &str) -> Option<&OptionsList> {
        self.entries.get(scheme).map(|e| &e.options)
    }

    /// Registered scheme names
    pub fn schemes(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.entries.keys().copied()
    }

    /// Build a backend from an options map
    pub fn from_options_map(
        &self,
        scheme: &str,
        opts: &HashMap<String, String>,
    ) -> Result<Arc<dyn Backend>> {
        let entry = self
            .entries
            .get(scheme)
            .ok_or_else(|| Error::Config(format!("unknown backend type: {}", scheme)))?;
        (entry.factory)(opts)
    }

    /// Build a backend from a connection string such as `local:/srv/repo`
    pub fn from_connection_string(&self, connection: &str) -> Result<Arc<dyn Backend>> {
        let scheme = connection.split(':').next().unwrap_or_default();
        let entry = self
            .entries
            .get(scheme)
            .ok_or_else(|| Error::Config(format!("unknown backend type: {}", scheme)))?;
        let opts = (entry.parse_connection)(connection)?;
        (entry.factory)(&opts)
    }
}

impl Default for BackendRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

/// Reject object names that could escape the store or collide with
/// bookkeeping blobs
pub(crate) fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(Error::Config("object name is empty".to_string()));
    }
    if name.starts_with('/') || name.split('/').any(|s| s.is_empty() || s == "." || s == "..") {
        return Err(Error::Config(format!("invalid object name: {}", name)));
    }
    Ok(())
}
