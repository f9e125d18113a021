use clap::{Args, Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

/// Tail registered log files and fan their new lines out to viewers
#[derive(Parser, Debug)]
#[command(
    name = "tailcast",
    about = "Tail registered log files and fan their new lines out to viewers"
)]
pub struct Cli {
    /// Path to config file
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Path to the log registry (a TOML file of `[[logs]]` entries).
    /// Default: `registry` from the config file, else ~/.config/tailcast/logs.toml
    #[arg(long, global = true)]
    pub registry: Option<PathBuf>,

    /// Watch back-end: native file system events or periodic polling
    #[arg(long, global = true, value_enum)]
    pub backend: Option<BackendKind>,

    /// Debug-level diagnostics on stderr
    #[arg(long, global = true, default_value_t = false)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Follow registered logs and print every new line as a JSON frame
    Watch(WatchArgs),
    /// Print the last lines of one registered log
    Tail(TailArgs),
}

#[derive(Args, Debug, Default)]
pub struct WatchArgs {
    /// Only print lines of this log id (repeatable). Default: every
    /// registered log
    #[arg(long = "log", value_name = "ID")]
    pub logs: Vec<u64>,
}

#[derive(Args, Debug)]
pub struct TailArgs {
    /// Registry id of the log
    pub id: u64,

    /// Number of lines to print. Default: `snapshot.default_lines`
    #[arg(long)]
    pub lines: Option<usize>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum BackendKind {
    Native,
    Poll,
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BackendKind::Native => write!(f, "native"),
            BackendKind::Poll => write!(f, "poll"),
        }
    }
}
