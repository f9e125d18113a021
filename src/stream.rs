//! The `watch` command: follow registered logs and print what they deliver.
//! The `tail` command's file work also runs from here, off the runtime threads.
//!
//! `tailcast watch [--log ID]...` loads the registry, starts a
//! [`WatchManager`] over a real notifier and attaches one [`ViewerSession`]
//! per selected log. Every frame is printed to stdout as one JSON object per
//! line; diagnostics go to stderr through `tracing`.
//!
//! SIGHUP re-reads the registry file and refreshes the watches. SIGINT and
//! SIGTERM stop every watch and return.

use std::collections::HashSet;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::broadcast::ChannelLayer;
use crate::cli::WatchArgs;
use crate::config::AppConfig;
use crate::descriptor::LogId;
use crate::gateway::{ViewerFrame, ViewerSession};
use crate::manager::WatchManager;
use crate::notifier::FsNotifier;
use crate::registry::{load_registry_file, MemoryRegistry, Registry};
use crate::snapshot::{render_snapshot, SnapshotView};

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// The registry file named by the effective config.
pub fn registry_path(config: &AppConfig) -> Result<&Path, Box<dyn std::error::Error>> {
    config
        .registry
        .as_deref()
        .ok_or_else(|| "no registry file configured; pass --registry".into())
}

/// Load the configured registry file into memory.
pub fn load_registry(config: &AppConfig) -> Result<MemoryRegistry, Box<dyn std::error::Error>> {
    let path = registry_path(config)?;
    let files = load_registry_file(path)?;
    let registry = MemoryRegistry::from_files(files)?;
    debug!(path = %path.display(), logs = registry.len(), "registry loaded");
    Ok(registry)
}

/// Load the registry and read the last `max_lines` lines of log `id` on the
/// blocking pool.
pub async fn tail_snapshot(
    config: &AppConfig,
    id: LogId,
    max_lines: usize,
) -> Result<SnapshotView, String> {
    let config = config.clone();
    let task = tokio::task::spawn_blocking(move || {
        let registry = load_registry(&config).map_err(|e| e.to_string())?;
        Ok(render_snapshot(
            &registry,
            id,
            max_lines,
            &config.snapshot.options(),
        ))
    });
    match task.await {
        Ok(result) => result,
        Err(e) => Err(format!("snapshot task failed: {}", e)),
    }
}

/// Replace the registry content with the file on disk. A file that fails to
/// load leaves the previous content in place.
fn reload_registry(registry: &MemoryRegistry, path: &Path) -> bool {
    let result = load_registry_file(path).and_then(|files| registry.replace_all(files));
    match result {
        Ok(()) => {
            info!(path = %path.display(), logs = registry.len(), "registry reloaded");
            true
        }
        Err(e) => {
            warn!("keeping previous registry: {}", e);
            false
        }
    }
}

/// Log ids the viewer follows: the ones asked for, or every registered log.
fn selected_logs(args: &WatchArgs, registry: &dyn Registry) -> Vec<LogId> {
    if args.logs.is_empty() {
        return registry.list().into_iter().map(|file| file.id).collect();
    }

    let mut ids = Vec::new();
    for &raw in &args.logs {
        let id = LogId(raw);
        if !registry.exists_by_id(id) {
            warn!(log_id = %id, "log id not in registry, waiting for it to appear");
        }
        if !ids.contains(&id) {
            ids.push(id);
        }
    }
    ids
}

// ---------------------------------------------------------------------------
// Viewer sessions
// ---------------------------------------------------------------------------

/// Connects one session per log and forwards its frames into `frames`.
struct Viewers {
    layer: Arc<ChannelLayer>,
    frames: mpsc::Sender<ViewerFrame>,
    connected: HashSet<LogId>,
    tasks: JoinSet<()>,
}

impl Viewers {
    fn new(layer: Arc<ChannelLayer>, frames: mpsc::Sender<ViewerFrame>) -> Self {
        Self {
            layer,
            frames,
            connected: HashSet::new(),
            tasks: JoinSet::new(),
        }
    }

    fn connect(&mut self, id: LogId) {
        if !self.connected.insert(id) {
            return;
        }

        let mut session = ViewerSession::connect(&self.layer, id);
        let frames = self.frames.clone();
        self.tasks.spawn(async move {
            while let Some(frame) = session.next_frame().await {
                if frames.send(frame).await.is_err() {
                    break;
                }
            }
        });
    }
}

/// Write one frame as a JSON line.
fn write_frame<W: Write>(out: &mut W, frame: &ViewerFrame) -> io::Result<()> {
    writeln!(out, "{}", frame.to_json())?;
    out.flush()
}

// ---------------------------------------------------------------------------
// Runtime
// ---------------------------------------------------------------------------

pub async fn run_watch(
    config: &AppConfig,
    args: &WatchArgs,
) -> Result<(), Box<dyn std::error::Error>> {
    let path: PathBuf = registry_path(config)?.to_path_buf();
    let registry = Arc::new(load_registry(config)?);
    let notifier = Arc::new(FsNotifier::new(config.watch.backend())?);
    let layer = Arc::new(ChannelLayer::new(config.broadcast.capacity));

    let manager = WatchManager::new(
        registry.clone(),
        notifier,
        layer.clone(),
        config.watch.tail_options(),
    );

    let (tx, mut rx) = mpsc::channel::<ViewerFrame>(config.broadcast.capacity.max(1));
    let mut viewers = Viewers::new(layer, tx);
    let follow_all = args.logs.is_empty();

    // Sessions join before the watches start so no early line is missed.
    for id in selected_logs(args, registry.as_ref()) {
        viewers.connect(id);
    }

    manager.start_all().join().await;
    info!(
        watching = manager.watched_ids().len(),
        viewers = viewers.connected.len(),
        "watch running"
    );

    // Set up signal listeners for reload and graceful shutdown.
    let mut sighup = signal(SignalKind::hangup())?;
    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;

    let stdout = io::stdout();

    loop {
        tokio::select! {
            maybe_frame = rx.recv() => {
                match maybe_frame {
                    Some(frame) => {
                        if let Err(e) = write_frame(&mut stdout.lock(), &frame) {
                            // BrokenPipe when the reader went away.
                            debug!("stdout closed: {}", e);
                            break;
                        }
                    }
                    None => break,
                }
            }
            _ = sighup.recv() => {
                if reload_registry(&registry, &path) {
                    manager.refresh().join().await;
                    if follow_all {
                        for id in selected_logs(args, registry.as_ref()) {
                            viewers.connect(id);
                        }
                    }
                }
            }
            _ = sigint.recv() => {
                info!("interrupted, shutting down");
                break;
            }
            _ = sigterm.recv() => {
                info!("terminated, shutting down");
                break;
            }
        }
    }

    viewers.tasks.abort_all();

    // stop_all joins the notifier thread, which must not block the runtime.
    let stopping = manager.clone();
    if let Err(e) = tokio::task::spawn_blocking(move || stopping.stop_all()).await {
        error!("failed to stop watches: {}", e);
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broadcast::{BroadcastSink, LogMessage};
    use crate::descriptor::WatchedFile;
    use tempfile::NamedTempFile;

    fn registry_of(ids: &[u64]) -> MemoryRegistry {
        MemoryRegistry::from_files(
            ids.iter()
                .map(|&id| WatchedFile::new(id, format!("/var/log/{}.log", id)))
                .collect(),
        )
        .unwrap()
    }

    #[test]
    fn test_selected_logs_defaults_to_every_registered_log() {
        let registry = registry_of(&[3, 1, 2]);
        let ids = selected_logs(&WatchArgs::default(), &registry);
        assert_eq!(ids, vec![LogId(1), LogId(2), LogId(3)]);
    }

    #[test]
    fn test_selected_logs_keeps_requested_order_without_duplicates() {
        let registry = registry_of(&[1, 2]);
        let args = WatchArgs {
            logs: vec![2, 9, 2],
        };
        assert_eq!(selected_logs(&args, &registry), vec![LogId(2), LogId(9)]);
    }

    #[test]
    fn test_write_frame_is_one_json_line() {
        let mut out = Vec::new();
        let frame = ViewerFrame {
            line: "hello \"world\"".to_string(),
            app: LogId(4),
        };
        write_frame(&mut out, &frame).unwrap();
        assert_eq!(
            String::from_utf8(out).unwrap(),
            "{\"line\":\"hello \\\"world\\\"\",\"app\":4}\n"
        );
    }

    #[test]
    fn test_registry_path_missing() {
        let config = AppConfig {
            registry: None,
            ..AppConfig::default()
        };
        assert!(registry_path(&config).is_err());
    }

    #[test]
    fn test_reload_registry_keeps_previous_on_error() {
        let registry = registry_of(&[1]);

        let mut bad = NamedTempFile::new().unwrap();
        bad.write_all(b"[[logs]]\nid = \"x\"\n").unwrap();
        assert!(!reload_registry(&registry, bad.path()));
        assert!(registry.exists_by_id(LogId(1)));

        let mut good = NamedTempFile::new().unwrap();
        good.write_all(b"[[logs]]\nid = 5\npath = \"/var/log/five.log\"\n")
            .unwrap();
        assert!(reload_registry(&registry, good.path()));
        assert!(!registry.exists_by_id(LogId(1)));
        assert!(registry.exists_by_id(LogId(5)));
    }

    #[tokio::test(flavor = "current_thread")]
    async fn test_tail_snapshot_reads_on_blocking_pool() {
        let dir = tempfile::TempDir::new().unwrap();
        let log = dir.path().join("app.log");
        std::fs::write(&log, "one\ntwo\nthree\n").unwrap();
        let registry = dir.path().join("logs.toml");
        std::fs::write(
            &registry,
            format!("[[logs]]\nid = 1\npath = {:?}\n", log.display().to_string()),
        )
        .unwrap();
        let config = AppConfig {
            registry: Some(registry),
            ..AppConfig::default()
        };

        let view = tail_snapshot(&config, LogId(1), 2).await.unwrap();
        assert_eq!(view.lines, vec!["two", "three"]);
        assert_eq!(view.notice, None);

        let view = tail_snapshot(&config, LogId(9), 2).await.unwrap();
        assert!(view.lines.is_empty());
        assert!(view.notice.is_some());

        let unconfigured = AppConfig {
            registry: None,
            ..AppConfig::default()
        };
        assert!(tail_snapshot(&unconfigured, LogId(1), 2).await.is_err());
    }

    #[tokio::test]
    async fn test_viewers_connect_once_per_log() {
        let layer = Arc::new(ChannelLayer::new(8));
        let (tx, mut rx) = mpsc::channel(8);
        let mut viewers = Viewers::new(layer.clone(), tx);

        viewers.connect(LogId(1));
        viewers.connect(LogId(1));
        assert_eq!(viewers.connected.len(), 1);
        assert_eq!(layer.group_count(), 1);

        layer.send(LogId(1), LogMessage::new("x"));
        let frame = rx.recv().await.unwrap();
        assert_eq!(frame.line, "x");
        assert_eq!(frame.app, LogId(1));
        // A second session would have produced a duplicate.
        assert!(rx.try_recv().is_err());
    }
}
