//! Directory-level change notification.
//!
//! [`DirectoryNotifier`] is the narrow capability the engine needs from a
//! file-system watcher: subscribe a directory, get told when a path inside it
//! was modified, and unsubscribe again. [`FsNotifier`] implements it on top of
//! the `notify` crate, either with the platform's native back-end or with a
//! polling watcher for file systems that do not emit change events.
//!
//! Events are bridged from `notify`'s callback into a std channel and drained
//! by a dedicated dispatch thread, started by [`DirectoryNotifier::start`].
//! Subscriptions may be added before the thread starts; their events queue up
//! until it does.

use std::collections::HashMap;
use std::ffi::OsStr;
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use notify::{Event, EventKind, RecursiveMode, Watcher};
use parking_lot::{Mutex, RwLock};
use thiserror::Error;
use tracing::{debug, error, trace, warn};

/// How often the dispatch thread wakes up to check for shutdown.
const SHUTDOWN_POLL: Duration = Duration::from_millis(200);

/// Callback invoked with the full path of a modified file.
pub type ModifyHandler = Arc<dyn Fn(&Path) + Send + Sync>;

type EventResult = Result<Event, notify::Error>;

// ---------------------------------------------------------------------------
// Handle and errors
// ---------------------------------------------------------------------------

/// Identifies one directory subscription.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct WatchHandle(pub u64);

#[derive(Debug, Error)]
pub enum NotifierError {
    #[error("filesystem watcher error: {0}")]
    Backend(#[from] notify::Error),
    #[error("unknown watch handle {0:?}")]
    UnknownHandle(WatchHandle),
    #[error("failed to spawn notifier thread: {0}")]
    Spawn(#[source] std::io::Error),
}

// ---------------------------------------------------------------------------
// DirectoryNotifier trait
// ---------------------------------------------------------------------------

pub trait DirectoryNotifier: Send + Sync {
    /// Watch `directory` (non-recursively) and call `handler` with the path
    /// of every file reported as created or modified inside it.
    fn subscribe(
        &self,
        directory: &Path,
        handler: ModifyHandler,
    ) -> Result<WatchHandle, NotifierError>;

    fn unsubscribe(&self, handle: WatchHandle) -> Result<(), NotifierError>;

    /// Begin delivering events. Calling it while already running is a no-op.
    fn start(&self) -> Result<(), NotifierError>;

    /// Stop delivering events. Calling it while stopped is a no-op.
    fn stop(&self);
}

// ---------------------------------------------------------------------------
// FsNotifier
// ---------------------------------------------------------------------------

/// Which `notify` watcher drives an [`FsNotifier`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Backend {
    Native,
    Poll(Duration),
}

struct Subscription {
    directory: PathBuf,
    /// Back-ends such as FSEvents report resolved paths, so events are
    /// matched against both spellings of the directory.
    canonical: Option<PathBuf>,
    handler: ModifyHandler,
}

#[derive(Default)]
struct RouteTable {
    next_handle: u64,
    subscriptions: HashMap<WatchHandle, Subscription>,
}

impl RouteTable {
    fn watches_directory(&self, directory: &Path) -> bool {
        self.subscriptions
            .values()
            .any(|sub| sub.directory == directory)
    }

    /// Handlers interested in `event_dir`, paired with the path to hand them.
    fn handlers_for(&self, event_dir: &Path, file_name: &OsStr) -> Vec<(PathBuf, ModifyHandler)> {
        self.subscriptions
            .values()
            .filter(|sub| {
                sub.directory == event_dir || sub.canonical.as_deref() == Some(event_dir)
            })
            .map(|sub| (sub.directory.join(file_name), sub.handler.clone()))
            .collect()
    }
}

struct Worker {
    shutdown: Arc<AtomicBool>,
    handle: JoinHandle<Receiver<EventResult>>,
}

/// `notify`-backed [`DirectoryNotifier`].
pub struct FsNotifier {
    watcher: Mutex<Box<dyn Watcher + Send>>,
    routes: Arc<RwLock<RouteTable>>,
    events: Mutex<Option<Receiver<EventResult>>>,
    worker: Mutex<Option<Worker>>,
}

impl FsNotifier {
    pub fn new(backend: Backend) -> Result<Self, NotifierError> {
        let (tx, rx) = mpsc::channel::<EventResult>();
        let handler = move |res: EventResult| {
            // Fails only once the receiver is gone, i.e. during teardown.
            let _ = tx.send(res);
        };

        let watcher: Box<dyn Watcher + Send> = match backend {
            Backend::Native => Box::new(notify::RecommendedWatcher::new(
                handler,
                notify::Config::default(),
            )?),
            Backend::Poll(interval) => Box::new(notify::PollWatcher::new(
                handler,
                notify::Config::default().with_poll_interval(interval),
            )?),
        };

        Ok(Self {
            watcher: Mutex::new(watcher),
            routes: Arc::new(RwLock::new(RouteTable::default())),
            events: Mutex::new(Some(rx)),
            worker: Mutex::new(None),
        })
    }

    /// Number of distinct directories currently watched at the OS level.
    pub fn watched_directories(&self) -> usize {
        let routes = self.routes.read();
        let mut dirs: Vec<&PathBuf> = routes
            .subscriptions
            .values()
            .map(|sub| &sub.directory)
            .collect();
        dirs.sort();
        dirs.dedup();
        dirs.len()
    }

    pub fn is_running(&self) -> bool {
        self.worker.lock().is_some()
    }
}

impl DirectoryNotifier for FsNotifier {
    fn subscribe(
        &self,
        directory: &Path,
        handler: ModifyHandler,
    ) -> Result<WatchHandle, NotifierError> {
        let mut routes = self.routes.write();

        // One OS-level watch per directory, however many subscribers.
        if !routes.watches_directory(directory) {
            self.watcher
                .lock()
                .watch(directory, RecursiveMode::NonRecursive)?;
            debug!(directory = %directory.display(), "watching directory");
        }

        let handle = WatchHandle(routes.next_handle);
        routes.next_handle += 1;
        routes.subscriptions.insert(
            handle,
            Subscription {
                directory: directory.to_path_buf(),
                canonical: directory.canonicalize().ok(),
                handler,
            },
        );
        Ok(handle)
    }

    fn unsubscribe(&self, handle: WatchHandle) -> Result<(), NotifierError> {
        let mut routes = self.routes.write();

        // Remove from the table first in case `unwatch` fails.
        let subscription = routes
            .subscriptions
            .remove(&handle)
            .ok_or(NotifierError::UnknownHandle(handle))?;

        if !routes.watches_directory(&subscription.directory) {
            self.watcher.lock().unwatch(&subscription.directory)?;
            debug!(directory = %subscription.directory.display(), "unwatched directory");
        }
        Ok(())
    }

    fn start(&self) -> Result<(), NotifierError> {
        let mut worker = self.worker.lock();
        if worker.is_some() {
            return Ok(());
        }

        let Some(events) = self.events.lock().take() else {
            error!("notifier event channel was lost, events will not be delivered");
            return Ok(());
        };

        let shutdown = Arc::new(AtomicBool::new(false));
        let routes = Arc::clone(&self.routes);
        let flag = Arc::clone(&shutdown);
        let handle = thread::Builder::new()
            .name("tailcast-notifier".to_string())
            .spawn(move || dispatch_loop(events, routes, flag))
            .map_err(NotifierError::Spawn)?;

        *worker = Some(Worker { shutdown, handle });
        debug!("notifier started");
        Ok(())
    }

    fn stop(&self) {
        let Some(worker) = self.worker.lock().take() else {
            return;
        };

        worker.shutdown.store(true, Ordering::SeqCst);
        match worker.handle.join() {
            Ok(events) => *self.events.lock() = Some(events),
            Err(_) => error!("notifier thread panicked, events will not be delivered"),
        }
        debug!("notifier stopped");
    }
}

// ---------------------------------------------------------------------------
// Dispatch
// ---------------------------------------------------------------------------

/// Drain the event channel until shutdown, handing the receiver back so a
/// later `start` can resume. Dropping the [`FsNotifier`] drops the sending
/// side, which ends the loop as well.
fn dispatch_loop(
    events: Receiver<EventResult>,
    routes: Arc<RwLock<RouteTable>>,
    shutdown: Arc<AtomicBool>,
) -> Receiver<EventResult> {
    loop {
        match events.recv_timeout(SHUTDOWN_POLL) {
            Ok(Ok(event)) => dispatch_event(&event, &routes),
            Ok(Err(e)) => error!("filesystem watcher error: {}", e),
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }
        if shutdown.load(Ordering::SeqCst) {
            break;
        }
    }
    events
}

fn dispatch_event(event: &Event, routes: &RwLock<RouteTable>) {
    if !matches!(event.kind, EventKind::Modify(_) | EventKind::Create(_)) {
        return;
    }

    for path in &event.paths {
        let (Some(dir), Some(file_name)) = (path.parent(), path.file_name()) else {
            continue;
        };

        // Clone the handlers out so none runs under the route lock.
        let targets = routes.read().handlers_for(dir, file_name);
        if targets.is_empty() {
            trace!(path = %path.display(), "event outside watched directories");
        }

        for (target, handler) in targets {
            if panic::catch_unwind(AssertUnwindSafe(|| handler(&target))).is_err() {
                warn!(path = %target.display(), "modify handler panicked");
            }
        }
    }
}
