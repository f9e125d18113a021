use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::broadcast::DEFAULT_CAPACITY;
use crate::cli::{BackendKind, Cli};
use crate::notifier::Backend;
use crate::snapshot::{SnapshotOptions, DEFAULT_BLOCK_SIZE, DEFAULT_LINES};
use crate::tailer::{PartialLines, StartPosition, TailOptions, DEFAULT_MAX_READ_BYTES};

// ---------------------------------------------------------------------------
// TOML-deserializable config (intermediate representation)
// ---------------------------------------------------------------------------

/// Raw config as parsed from the TOML file.
/// All fields are optional so that missing keys fall through to defaults.
/// Unknown keys are silently ignored by serde.
#[derive(Debug, Deserialize, Default)]
#[serde(default)]
struct FileConfig {
    verbose: Option<bool>,
    registry: Option<PathBuf>,
    watch: FileWatchConfig,
    snapshot: FileSnapshotConfig,
    broadcast: FileBroadcastConfig,
}

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
struct FileWatchConfig {
    backend: Option<String>,
    poll_interval_ms: Option<u64>,
    start_position: Option<String>,
    partial_lines: Option<String>,
    max_read_bytes: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
struct FileSnapshotConfig {
    default_lines: Option<usize>,
    block_size: Option<usize>,
    line_cap: Option<usize>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
struct FileBroadcastConfig {
    capacity: Option<usize>,
}

// ---------------------------------------------------------------------------
// Effective (merged) config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub struct AppConfig {
    /// `None` only when no config directory can be determined and neither
    /// the file nor the CLI names one.
    pub registry: Option<PathBuf>,
    pub verbose: bool,
    pub watch: WatchConfig,
    pub snapshot: SnapshotConfig,
    pub broadcast: BroadcastConfig,
}

#[derive(Debug, Clone, PartialEq)]
pub struct WatchConfig {
    pub backend: BackendKind,
    pub poll_interval_ms: u64,
    pub start_position: StartPosition,
    pub partial_lines: PartialLines,
    pub max_read_bytes: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SnapshotConfig {
    pub default_lines: usize,
    pub block_size: usize,
    pub line_cap: Option<usize>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BroadcastConfig {
    pub capacity: usize,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            registry: default_registry_path(),
            verbose: false,
            watch: WatchConfig::default(),
            snapshot: SnapshotConfig::default(),
            broadcast: BroadcastConfig::default(),
        }
    }
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            backend: BackendKind::Native,
            poll_interval_ms: 1000,
            start_position: StartPosition::default(),
            partial_lines: PartialLines::default(),
            max_read_bytes: DEFAULT_MAX_READ_BYTES,
        }
    }
}

impl Default for SnapshotConfig {
    fn default() -> Self {
        Self {
            default_lines: DEFAULT_LINES,
            block_size: DEFAULT_BLOCK_SIZE,
            line_cap: None,
        }
    }
}

impl Default for BroadcastConfig {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_CAPACITY,
        }
    }
}

impl WatchConfig {
    pub fn backend(&self) -> Backend {
        match self.backend {
            BackendKind::Native => Backend::Native,
            BackendKind::Poll => Backend::Poll(Duration::from_millis(self.poll_interval_ms.max(1))),
        }
    }

    pub fn tail_options(&self) -> TailOptions {
        TailOptions {
            start_position: self.start_position,
            partial_lines: self.partial_lines,
            max_read_bytes: self.max_read_bytes,
        }
    }
}

impl SnapshotConfig {
    pub fn options(&self) -> SnapshotOptions {
        SnapshotOptions {
            block_size: self.block_size,
            line_cap: self.line_cap,
        }
    }
}

// ---------------------------------------------------------------------------
// Config loading
// ---------------------------------------------------------------------------

/// Returns the default config file path: `~/.config/tailcast/config.toml`
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|d| d.join("tailcast").join("config.toml"))
}

/// Returns the default registry path: `~/.config/tailcast/logs.toml`
pub fn default_registry_path() -> Option<PathBuf> {
    dirs::config_dir().map(|d| d.join("tailcast").join("logs.toml"))
}

/// Load the config file from the given path.
/// Returns `None` if the file does not exist or cannot be parsed.
///
/// Runs before the tracing subscriber is installed, so problems go straight
/// to stderr.
fn load_file_config(path: &Path) -> Option<FileConfig> {
    if !path.exists() {
        return None;
    }

    match std::fs::read_to_string(path) {
        Ok(contents) => match toml::from_str::<FileConfig>(&contents) {
            Ok(cfg) => Some(cfg),
            Err(e) => {
                eprintln!(
                    "tailcast: warning: failed to parse config file {}: {}",
                    path.display(),
                    e
                );
                None
            }
        },
        Err(e) => {
            eprintln!(
                "tailcast: warning: failed to read config file {}: {}",
                path.display(),
                e
            );
            None
        }
    }
}

fn warn_unknown(key: &str, value: &str) {
    eprintln!(
        "tailcast: warning: unknown {} \"{}\", using default",
        key, value
    );
}

fn parse_backend(s: &str) -> Option<BackendKind> {
    match s.to_lowercase().as_str() {
        "native" => Some(BackendKind::Native),
        "poll" => Some(BackendKind::Poll),
        other => {
            warn_unknown("watch.backend", other);
            None
        }
    }
}

fn parse_start_position(s: &str) -> Option<StartPosition> {
    match s.to_lowercase().as_str() {
        "end" => Some(StartPosition::End),
        "beginning" => Some(StartPosition::Beginning),
        other => {
            warn_unknown("watch.start_position", other);
            None
        }
    }
}

fn parse_partial_lines(s: &str) -> Option<PartialLines> {
    match s.to_lowercase().as_str() {
        "emit" => Some(PartialLines::Emit),
        "hold" => Some(PartialLines::Hold),
        other => {
            warn_unknown("watch.partial_lines", other);
            None
        }
    }
}

fn overlay_file(config: &mut AppConfig, file_cfg: FileConfig) {
    if let Some(v) = file_cfg.verbose {
        config.verbose = v;
    }
    if let Some(registry) = file_cfg.registry {
        config.registry = Some(registry);
    }

    let watch = file_cfg.watch;
    if let Some(backend) = watch.backend.as_deref().and_then(parse_backend) {
        config.watch.backend = backend;
    }
    if let Some(ms) = watch.poll_interval_ms {
        config.watch.poll_interval_ms = ms;
    }
    if let Some(pos) = watch.start_position.as_deref().and_then(parse_start_position) {
        config.watch.start_position = pos;
    }
    if let Some(policy) = watch.partial_lines.as_deref().and_then(parse_partial_lines) {
        config.watch.partial_lines = policy;
    }
    if let Some(max) = watch.max_read_bytes {
        config.watch.max_read_bytes = max;
    }

    let snapshot = file_cfg.snapshot;
    if let Some(n) = snapshot.default_lines {
        config.snapshot.default_lines = n;
    }
    if let Some(size) = snapshot.block_size {
        config.snapshot.block_size = size;
    }
    if snapshot.line_cap.is_some() {
        config.snapshot.line_cap = snapshot.line_cap;
    }

    if let Some(capacity) = file_cfg.broadcast.capacity {
        config.broadcast.capacity = capacity;
    }
}

/// Build the effective `AppConfig` by merging defaults, config file, and CLI args.
///
/// Precedence (highest wins):
/// 1. CLI flags (if explicitly provided)
/// 2. Config file values
/// 3. Hardcoded defaults
pub fn build_config(cli: &Cli) -> AppConfig {
    let mut config = AppConfig::default();

    let config_path = cli.config.clone().or_else(default_config_path);

    if let Some(ref path) = config_path {
        if let Some(file_cfg) = load_file_config(path) {
            overlay_file(&mut config, file_cfg);
        } else if cli.config.is_some() && !path.exists() {
            // Only an explicitly requested file is worth a warning when absent.
            eprintln!(
                "tailcast: warning: config file not found: {}",
                path.display()
            );
        }
    }

    if cli.registry.is_some() {
        config.registry = cli.registry.clone();
    }
    if let Some(backend) = cli.backend {
        config.watch.backend = backend;
    }
    if cli.verbose {
        config.verbose = true;
    }

    config
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cli::{Commands, WatchArgs};
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn parse_file_config(toml_str: &str) -> Option<FileConfig> {
        toml::from_str::<FileConfig>(toml_str).ok()
    }

    fn write_config(toml_str: &str) -> NamedTempFile {
        let mut f = NamedTempFile::new().unwrap();
        f.write_all(toml_str.as_bytes()).unwrap();
        f
    }

    fn default_cli() -> Cli {
        Cli {
            config: None,
            registry: None,
            backend: None,
            verbose: false,
            command: Commands::Watch(WatchArgs::default()),
        }
    }

    fn cli_with_file(f: &NamedTempFile) -> Cli {
        Cli {
            config: Some(f.path().to_path_buf()),
            ..default_cli()
        }
    }

    // -- Default config tests -------------------------------------------------

    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert!(!config.verbose);
        assert_eq!(config.registry, default_registry_path());
        assert_eq!(config.watch.backend, BackendKind::Native);
        assert_eq!(config.watch.poll_interval_ms, 1000);
        assert_eq!(config.watch.start_position, StartPosition::End);
        assert_eq!(config.watch.partial_lines, PartialLines::Emit);
        assert_eq!(config.watch.max_read_bytes, 64 * 1024 * 1024);
        assert_eq!(config.snapshot.default_lines, 500);
        assert_eq!(config.snapshot.block_size, 1024);
        assert_eq!(config.snapshot.line_cap, None);
        assert_eq!(config.broadcast.capacity, 1024);
    }

    // -- TOML parsing tests ---------------------------------------------------

    #[test]
    fn test_parse_valid_full_config() {
        let toml = r#"
verbose = true
registry = "/etc/tailcast/logs.toml"

[watch]
backend = "poll"
poll_interval_ms = 250
start_position = "beginning"
partial_lines = "hold"
max_read_bytes = 4096

[snapshot]
default_lines = 50
block_size = 4096
line_cap = 500

[broadcast]
capacity = 16
"#;
        let cfg = parse_file_config(toml).unwrap();
        assert_eq!(cfg.verbose, Some(true));
        assert_eq!(cfg.registry, Some(PathBuf::from("/etc/tailcast/logs.toml")));
        assert_eq!(cfg.watch.backend.as_deref(), Some("poll"));
        assert_eq!(cfg.watch.poll_interval_ms, Some(250));
        assert_eq!(cfg.watch.start_position.as_deref(), Some("beginning"));
        assert_eq!(cfg.watch.partial_lines.as_deref(), Some("hold"));
        assert_eq!(cfg.watch.max_read_bytes, Some(4096));
        assert_eq!(cfg.snapshot.default_lines, Some(50));
        assert_eq!(cfg.snapshot.block_size, Some(4096));
        assert_eq!(cfg.snapshot.line_cap, Some(500));
        assert_eq!(cfg.broadcast.capacity, Some(16));
    }

    #[test]
    fn test_parse_empty_config() {
        let cfg = parse_file_config("").unwrap();
        assert_eq!(cfg.verbose, None);
        assert_eq!(cfg.registry, None);
        assert_eq!(cfg.watch.backend, None);
        assert_eq!(cfg.snapshot.line_cap, None);
        assert_eq!(cfg.broadcast.capacity, None);
    }

    #[test]
    fn test_unknown_keys_ignored() {
        let toml = r#"
verbose = false
unknown_key = "should be ignored"

[watch]
backend = "native"
recursive = true

[unknown_section]
foo = "bar"
"#;
        let cfg = parse_file_config(toml).unwrap();
        assert_eq!(cfg.verbose, Some(false));
        assert_eq!(cfg.watch.backend.as_deref(), Some("native"));
    }

    #[test]
    fn test_malformed_toml_returns_none() {
        assert!(parse_file_config("this is not valid toml [[[").is_none());
    }

    #[test]
    fn test_load_missing_file() {
        let path = Path::new("/tmp/tailcast-test-nonexistent-config-12345.toml");
        assert!(load_file_config(path).is_none());
    }

    #[test]
    fn test_load_malformed_file() {
        let f = write_config("not valid {{{{ toml");
        assert!(load_file_config(f.path()).is_none());
    }

    // -- Value parsing tests --------------------------------------------------

    #[test]
    fn test_parse_enum_values_case_insensitive() {
        assert_eq!(parse_backend("Poll"), Some(BackendKind::Poll));
        assert_eq!(parse_start_position("BEGINNING"), Some(StartPosition::Beginning));
        assert_eq!(parse_partial_lines("Hold"), Some(PartialLines::Hold));
    }

    #[test]
    fn test_parse_enum_values_unknown() {
        assert_eq!(parse_backend("inotify"), None);
        assert_eq!(parse_start_position("middle"), None);
        assert_eq!(parse_partial_lines(""), None);
    }

    // -- build_config merge tests ---------------------------------------------

    #[test]
    fn test_build_config_defaults_no_file() {
        let cli = Cli {
            config: Some(PathBuf::from("/tmp/tailcast-nonexistent-54321.toml")),
            ..default_cli()
        };
        assert_eq!(build_config(&cli), AppConfig::default());
    }

    #[test]
    fn test_build_config_file_overrides_defaults() {
        let f = write_config(
            r#"
verbose = true
registry = "/srv/logs.toml"

[watch]
backend = "poll"
poll_interval_ms = 200
partial_lines = "hold"

[snapshot]
line_cap = 500

[broadcast]
capacity = 8
"#,
        );
        let config = build_config(&cli_with_file(&f));

        assert!(config.verbose);
        assert_eq!(config.registry, Some(PathBuf::from("/srv/logs.toml")));
        assert_eq!(config.watch.backend, BackendKind::Poll);
        assert_eq!(config.watch.poll_interval_ms, 200);
        assert_eq!(config.watch.partial_lines, PartialLines::Hold);
        assert_eq!(config.watch.start_position, StartPosition::End); // default
        assert_eq!(config.snapshot.line_cap, Some(500));
        assert_eq!(config.snapshot.default_lines, 500); // default
        assert_eq!(config.broadcast.capacity, 8);
    }

    #[test]
    fn test_build_config_cli_overrides_file() {
        let f = write_config(
            r#"
verbose = false
registry = "/srv/logs.toml"

[watch]
backend = "poll"
"#,
        );
        let cli = Cli {
            registry: Some(PathBuf::from("/my/logs.toml")),
            backend: Some(BackendKind::Native),
            verbose: true,
            ..cli_with_file(&f)
        };
        let config = build_config(&cli);

        assert!(config.verbose);
        assert_eq!(config.registry, Some(PathBuf::from("/my/logs.toml")));
        assert_eq!(config.watch.backend, BackendKind::Native);
    }

    #[test]
    fn test_build_config_cli_verbose_false_does_not_override_file() {
        let f = write_config("verbose = true\n");
        assert!(build_config(&cli_with_file(&f)).verbose);
    }

    #[test]
    fn test_build_config_unknown_value_in_file_uses_default() {
        let f = write_config(
            r#"
[watch]
backend = "kqueue"
start_position = "middle"
"#,
        );
        let config = build_config(&cli_with_file(&f));
        assert_eq!(config.watch.backend, BackendKind::Native);
        assert_eq!(config.watch.start_position, StartPosition::End);
    }

    // -- Conversions ----------------------------------------------------------

    #[test]
    fn test_backend_conversion() {
        let mut watch = WatchConfig::default();
        assert_eq!(watch.backend(), Backend::Native);

        watch.backend = BackendKind::Poll;
        watch.poll_interval_ms = 250;
        assert_eq!(watch.backend(), Backend::Poll(Duration::from_millis(250)));
    }

    #[test]
    fn test_option_conversions() {
        let watch = WatchConfig {
            start_position: StartPosition::Beginning,
            partial_lines: PartialLines::Hold,
            max_read_bytes: 10,
            ..WatchConfig::default()
        };
        let tail = watch.tail_options();
        assert_eq!(tail.start_position, StartPosition::Beginning);
        assert_eq!(tail.partial_lines, PartialLines::Hold);
        assert_eq!(tail.max_read_bytes, 10);

        let snapshot = SnapshotConfig {
            block_size: 64,
            line_cap: Some(3),
            ..SnapshotConfig::default()
        };
        assert_eq!(
            snapshot.options(),
            SnapshotOptions {
                block_size: 64,
                line_cap: Some(3)
            }
        );
    }
}
