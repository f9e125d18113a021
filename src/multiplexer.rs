//! One notifier subscription per directory, shared by every tailer in it.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::notifier::WatchHandle;
use crate::tailer::FileTailer;

/// Routes "path modified" events of one directory to the tailer whose file
/// path matches exactly. Paths without a tailer are ignored.
pub struct DirectoryMultiplexer {
    directory: PathBuf,
    handle: WatchHandle,
    tailers: HashMap<PathBuf, Arc<FileTailer>>,
}

impl DirectoryMultiplexer {
    pub fn new(directory: PathBuf, handle: WatchHandle) -> Self {
        Self {
            directory,
            handle,
            tailers: HashMap::new(),
        }
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    pub fn handle(&self) -> WatchHandle {
        self.handle
    }

    /// Insert or overwrite the tailer for `path`.
    pub fn add(&mut self, path: PathBuf, tailer: Arc<FileTailer>) {
        self.tailers.insert(path, tailer);
    }

    /// Drop the tailer for `path`. Returns `true` once no tailer is left, at
    /// which point the caller should cancel the directory subscription.
    pub fn remove(&mut self, path: &Path) -> bool {
        self.tailers.remove(path);
        self.tailers.is_empty()
    }

    /// The tailer to run for an event on `path`, if any.
    pub fn route(&self, path: &Path) -> Option<Arc<FileTailer>> {
        self.tailers.get(path).cloned()
    }

    pub fn len(&self) -> usize {
        self.tailers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tailers.is_empty()
    }
}
