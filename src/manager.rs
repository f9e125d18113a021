//! The watch manager: which files are tailed, and by whom.
//!
//! [`WatchManager`] reconciles the registry's descriptors with the set of live
//! [`FileTailer`]s. Tailers are grouped per directory in a
//! [`DirectoryMultiplexer`] so a directory holding several watched files costs
//! a single notifier subscription.
//!
//! All bookkeeping goes through one lock, which is never held while a file is
//! read or a line is broadcast. Tailers are reference counted: a tailer
//! removed from the maps while its `process` is running stays valid until
//! that call returns.
//!
//! `start_all` and `refresh` touch the file system and the registry. Called
//! from inside a tokio runtime they move that work onto the blocking pool and
//! return at once; called from a plain thread they run inline. The
//! `*_blocking` variants always run inline.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

use crate::broadcast::BroadcastSink;
use crate::descriptor::{directory_of, LogId, WatchedFile};
use crate::multiplexer::DirectoryMultiplexer;
use crate::notifier::{DirectoryNotifier, ModifyHandler, WatchHandle};
use crate::registry::{Registry, RegistryChange};
use crate::tailer::{FileTailer, TailOptions};

// ---------------------------------------------------------------------------
// Scheduled
// ---------------------------------------------------------------------------

/// How a `start_all` or `refresh` call was carried out.
#[derive(Debug)]
pub enum Scheduled {
    /// Finished before returning.
    Inline,
    /// Running on the runtime's blocking pool.
    Background(JoinHandle<()>),
}

impl Scheduled {
    /// Wait for deferred work to finish. Returns immediately for `Inline`.
    pub async fn join(self) {
        if let Scheduled::Background(handle) = self {
            if let Err(e) = handle.await {
                error!("background watch task failed: {}", e);
            }
        }
    }
}

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

#[derive(Default)]
struct ManagerState {
    tailers: HashMap<LogId, Arc<FileTailer>>,
    directories: HashMap<PathBuf, DirectoryMultiplexer>,
    started: bool,
}

struct Inner {
    registry: Arc<dyn Registry>,
    notifier: Arc<dyn DirectoryNotifier>,
    sink: Arc<dyn BroadcastSink>,
    options: TailOptions,
    state: Mutex<ManagerState>,
}

impl Inner {
    /// Entry point of every notifier event for `directory`.
    fn dispatch(&self, directory: &Path, path: &Path) {
        let tailer = {
            let state = self.state.lock();
            state
                .directories
                .get(directory)
                .and_then(|mux| mux.route(path))
        };

        match tailer {
            Some(tailer) => {
                let sent = tailer.process(self.sink.as_ref());
                if sent > 0 {
                    trace!(log_id = %tailer.log_id(), lines = sent, "broadcast new lines");
                }
            }
            None => trace!(path = %path.display(), "no tailer for modified path"),
        }
    }
}

// ---------------------------------------------------------------------------
// WatchManager
// ---------------------------------------------------------------------------

/// Cheap to clone; every clone drives the same set of watches.
#[derive(Clone)]
pub struct WatchManager {
    inner: Arc<Inner>,
}

impl WatchManager {
    pub fn new(
        registry: Arc<dyn Registry>,
        notifier: Arc<dyn DirectoryNotifier>,
        sink: Arc<dyn BroadcastSink>,
        options: TailOptions,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                registry,
                notifier,
                sink,
                options,
                state: Mutex::new(ManagerState::default()),
            }),
        }
    }

    /// Watch every registered file, then start the notifier.
    pub fn start_all(&self) -> Scheduled {
        self.schedule(Self::start_all_blocking)
    }

    pub fn start_all_blocking(&self) {
        for file in self.inner.registry.list() {
            self.start_watcher(&file);
        }

        {
            let mut state = self.inner.state.lock();
            if state.started {
                return;
            }
            state.started = true;
        }

        match self.inner.notifier.start() {
            Ok(()) => info!(watched = self.watched_ids().len(), "log watching started"),
            Err(e) => {
                error!("failed to start notifier: {}", e);
                self.inner.state.lock().started = false;
            }
        }
    }

    /// Start tailing `file`. Returns `false` when it is already tailed, its
    /// path is not absolute, it does not exist yet, or its directory cannot
    /// be watched.
    pub fn start_watcher(&self, file: &WatchedFile) -> bool {
        if self.is_watching(file.id) {
            return false;
        }

        if !file.path.is_absolute() {
            warn!(
                log_id = %file.id,
                path = %file.path.display(),
                "log path is not absolute, not watching"
            );
            return false;
        }

        if !file.path.exists() {
            warn!(
                log_id = %file.id,
                path = %file.path.display(),
                "log file does not exist, not watching until next refresh"
            );
            return false;
        }

        // Sizing the file happens here, outside the lock.
        let tailer = Arc::new(FileTailer::new(file, &self.inner.options));
        let directory = file.directory();

        // The notifier is only called with the lock released. A subscription
        // made while another caller covered the same directory is given back.
        let mut fresh: Option<WatchHandle> = None;
        loop {
            let mut state = self.inner.state.lock();
            if state.tailers.contains_key(&file.id) {
                drop(state);
                if let Some(handle) = fresh {
                    self.unsubscribe_directory(&directory, handle);
                }
                return false;
            }

            if let Some(mux) = state.directories.get_mut(&directory) {
                mux.add(file.path.clone(), Arc::clone(&tailer));
                state.tailers.insert(file.id, tailer);
                drop(state);
                if let Some(handle) = fresh {
                    self.unsubscribe_directory(&directory, handle);
                }
                break;
            }

            if let Some(handle) = fresh.take() {
                let mut mux = DirectoryMultiplexer::new(directory.clone(), handle);
                mux.add(file.path.clone(), Arc::clone(&tailer));
                state.directories.insert(directory.clone(), mux);
                state.tailers.insert(file.id, tailer);
                break;
            }
            drop(state);

            let handler = self.modify_handler(directory.clone());
            match self.inner.notifier.subscribe(&directory, handler) {
                Ok(handle) => {
                    debug!(directory = %directory.display(), "subscribed directory");
                    fresh = Some(handle);
                }
                Err(e) => {
                    warn!(
                        log_id = %file.id,
                        directory = %directory.display(),
                        "could not watch directory: {}", e
                    );
                    return false;
                }
            }
        }

        info!(log_id = %file.id, path = %file.path.display(), "watching log file");
        true
    }

    pub fn stop_watcher(&self, file: &WatchedFile) -> bool {
        self.stop_watcher_by_id(file.id)
    }

    /// Stop tailing `id`. Returns `false` if it was not tailed.
    pub fn stop_watcher_by_id(&self, id: LogId) -> bool {
        let released = {
            let mut state = self.inner.state.lock();
            let Some(tailer) = state.tailers.remove(&id) else {
                return false;
            };

            let directory = directory_of(tailer.path());
            let now_empty = match state.directories.get_mut(&directory) {
                Some(mux) => {
                    // Another id may have taken over the same path.
                    let owned = mux
                        .route(tailer.path())
                        .is_some_and(|routed| Arc::ptr_eq(&routed, &tailer));
                    if owned {
                        mux.remove(tailer.path())
                    } else {
                        mux.is_empty()
                    }
                }
                None => false,
            };

            if now_empty {
                state.directories.remove(&directory)
            } else {
                None
            }
        };

        info!(log_id = %id, "stopped watching log file");

        if let Some(mux) = released {
            self.unsubscribe_directory(mux.directory(), mux.handle());
        }
        true
    }

    /// Failures are logged and otherwise ignored.
    fn unsubscribe_directory(&self, directory: &Path, handle: WatchHandle) {
        match self.inner.notifier.unsubscribe(handle) {
            Ok(()) => debug!(directory = %directory.display(), "unsubscribed directory"),
            Err(e) => warn!(
                directory = %directory.display(),
                "failed to unsubscribe directory: {}", e
            ),
        }
    }

    /// Bring the active set in line with the registry.
    pub fn refresh(&self) -> Scheduled {
        self.schedule(Self::refresh_blocking)
    }

    pub fn refresh_blocking(&self) {
        let files = self.inner.registry.list();
        let wanted: HashMap<LogId, &WatchedFile> = files.iter().map(|f| (f.id, f)).collect();

        let stale: Vec<LogId> = {
            let state = self.inner.state.lock();
            state
                .tailers
                .iter()
                .filter(|(id, tailer)| match wanted.get(*id) {
                    Some(file) => file.path != tailer.path(),
                    None => true,
                })
                .map(|(id, _)| *id)
                .collect()
        };

        for id in &stale {
            self.stop_watcher_by_id(*id);
        }

        let mut started = 0;
        for file in &files {
            if self.start_watcher(file) {
                started += 1;
            }
        }

        debug!(stopped = stale.len(), started, "refresh complete");
    }

    /// Follow a single registry write.
    pub fn apply_change(&self, change: &RegistryChange) {
        match change {
            RegistryChange::Created(file) => {
                self.start_watcher(file);
            }
            RegistryChange::Updated { old, new } => {
                if old.path != new.path || old.encoding != new.encoding {
                    self.stop_watcher(old);
                    self.start_watcher(new);
                }
            }
            RegistryChange::Deleted(file) => {
                self.stop_watcher(file);
            }
        }
    }

    /// Stop every tailer and the notifier. Safe to call repeatedly.
    pub fn stop_all(&self) {
        let ids: Vec<LogId> = self.inner.state.lock().tailers.keys().copied().collect();
        for id in ids {
            self.stop_watcher_by_id(id);
        }

        let was_started = std::mem::replace(&mut self.inner.state.lock().started, false);
        if was_started {
            // Outside the lock: stopping waits for in-flight dispatches,
            // which take the lock themselves.
            self.inner.notifier.stop();
            info!("log watching stopped");
        }
    }

    pub fn is_watching(&self, id: LogId) -> bool {
        self.inner.state.lock().tailers.contains_key(&id)
    }

    pub fn is_started(&self) -> bool {
        self.inner.state.lock().started
    }

    /// Ids with a live tailer, sorted.
    pub fn watched_ids(&self) -> Vec<LogId> {
        let mut ids: Vec<LogId> = self.inner.state.lock().tailers.keys().copied().collect();
        ids.sort();
        ids
    }

    /// Directories currently holding a notifier subscription.
    pub fn watched_directories(&self) -> HashSet<PathBuf> {
        self.inner.state.lock().directories.keys().cloned().collect()
    }

    pub fn read_offset(&self, id: LogId) -> Option<u64> {
        let tailer = self.inner.state.lock().tailers.get(&id).cloned();
        tailer.map(|t| t.read_offset())
    }

    fn modify_handler(&self, directory: PathBuf) -> ModifyHandler {
        let inner: Weak<Inner> = Arc::downgrade(&self.inner);
        Arc::new(move |path: &Path| {
            if let Some(inner) = inner.upgrade() {
                inner.dispatch(&directory, path);
            }
        })
    }

    fn schedule(&self, work: fn(&Self)) -> Scheduled {
        match Handle::try_current() {
            Ok(runtime) => {
                let this = self.clone();
                Scheduled::Background(runtime.spawn_blocking(move || work(&this)))
            }
            Err(_) => {
                work(self);
                Scheduled::Inline
            }
        }
    }
}
