//! The set of log files operators have asked to watch.
//!
//! The engine only ever reads from a [`Registry`]. Writes happen elsewhere
//! and are reported back to the engine as [`RegistryChange`] values through
//! [`WatchManager::apply_change`](crate::manager::WatchManager::apply_change),
//! or by running a full `refresh`.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use parking_lot::RwLock;
use serde::Deserialize;
use thiserror::Error;

use crate::descriptor::{LogId, WatchedFile};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("failed to read registry file {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse registry file {}: {source}", .path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("duplicate log id {0} in registry")]
    DuplicateId(LogId),
    #[error("log {id} in registry file {}: path {} is not absolute", .origin.display(), .path.display())]
    RelativePath {
        origin: PathBuf,
        id: LogId,
        path: PathBuf,
    },
}

// ---------------------------------------------------------------------------
// Registry trait
// ---------------------------------------------------------------------------

/// Read-only view of the registered log files.
pub trait Registry: Send + Sync {
    /// Every registered descriptor, ordered by id.
    fn list(&self) -> Vec<WatchedFile>;

    fn get(&self, id: LogId) -> Option<WatchedFile>;

    fn exists_by_id(&self, id: LogId) -> bool {
        self.get(id).is_some()
    }
}

/// A write that happened to the registry and that the engine must follow.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RegistryChange {
    Created(WatchedFile),
    Updated { old: WatchedFile, new: WatchedFile },
    Deleted(WatchedFile),
}

// ---------------------------------------------------------------------------
// MemoryRegistry
// ---------------------------------------------------------------------------

/// Registry held in memory, optionally seeded from a TOML file.
#[derive(Debug, Default)]
pub struct MemoryRegistry {
    files: RwLock<BTreeMap<LogId, WatchedFile>>,
}

impl MemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_files(files: Vec<WatchedFile>) -> Result<Self, RegistryError> {
        let registry = Self::new();
        registry.replace_all(files)?;
        Ok(registry)
    }

    /// Insert or overwrite a descriptor, returning the change to apply.
    pub fn upsert(&self, file: WatchedFile) -> RegistryChange {
        let previous = self.files.write().insert(file.id, file.clone());
        match previous {
            Some(old) => RegistryChange::Updated { old, new: file },
            None => RegistryChange::Created(file),
        }
    }

    pub fn remove(&self, id: LogId) -> Option<RegistryChange> {
        self.files.write().remove(&id).map(RegistryChange::Deleted)
    }

    /// Swap the whole content at once. Rejects duplicate ids and leaves the
    /// previous content untouched in that case.
    pub fn replace_all(&self, files: Vec<WatchedFile>) -> Result<(), RegistryError> {
        let mut next = BTreeMap::new();
        for file in files {
            let id = file.id;
            if next.insert(id, file).is_some() {
                return Err(RegistryError::DuplicateId(id));
            }
        }
        *self.files.write() = next;
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.files.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.read().is_empty()
    }
}

impl Registry for MemoryRegistry {
    fn list(&self) -> Vec<WatchedFile> {
        self.files.read().values().cloned().collect()
    }

    fn get(&self, id: LogId) -> Option<WatchedFile> {
        self.files.read().get(&id).cloned()
    }
}

// ---------------------------------------------------------------------------
// Registry file
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
struct RegistryFile {
    logs: Vec<RegistryEntry>,
}

/// One `[[logs]]` table. `name` is for humans and never reaches the engine.
#[derive(Debug, Deserialize)]
struct RegistryEntry {
    id: LogId,
    path: PathBuf,
    encoding: Option<String>,
    #[allow(dead_code)]
    name: Option<String>,
}

impl From<RegistryEntry> for WatchedFile {
    fn from(entry: RegistryEntry) -> Self {
        let file = WatchedFile::new(entry.id, entry.path);
        match entry.encoding {
            Some(encoding) => file.with_encoding(encoding),
            None => file,
        }
    }
}

/// Parse a registry TOML document into descriptors. Every path must be
/// absolute.
pub fn parse_registry(contents: &str, origin: &Path) -> Result<Vec<WatchedFile>, RegistryError> {
    let parsed: RegistryFile = toml::from_str(contents).map_err(|source| RegistryError::Parse {
        path: origin.to_path_buf(),
        source,
    })?;
    let files: Vec<WatchedFile> = parsed.logs.into_iter().map(WatchedFile::from).collect();
    if let Some(file) = files.iter().find(|f| !f.path.is_absolute()) {
        return Err(RegistryError::RelativePath {
            origin: origin.to_path_buf(),
            id: file.id,
            path: file.path.clone(),
        });
    }
    Ok(files)
}

/// Read and parse a registry file from disk.
pub fn load_registry_file(path: &Path) -> Result<Vec<WatchedFile>, RegistryError> {
    let contents = std::fs::read_to_string(path).map_err(|source| RegistryError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    parse_registry(&contents, path)
}
