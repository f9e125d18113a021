use std::io::{self, Write};

use clap::Parser;
use tailcast::cli::{Cli, Commands, TailArgs};
use tailcast::config::{build_config, AppConfig};
use tailcast::descriptor::LogId;
use tailcast::stream;
use tracing::debug;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

fn init_tracing(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_level.into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(io::stderr))
        .init();
}

/// Print the snapshot of one log. Returns the process exit code.
async fn run_tail(config: &AppConfig, args: &TailArgs) -> i32 {
    let lines = args.lines.unwrap_or(config.snapshot.default_lines);
    let view = match stream::tail_snapshot(config, LogId(args.id), lines).await {
        Ok(view) => view,
        Err(e) => {
            eprintln!("tailcast: {}", e);
            return 1;
        }
    };

    if let Some(notice) = view.notice {
        eprintln!("tailcast: {}", notice);
        return 1;
    }

    let stdout = io::stdout();
    let mut out = stdout.lock();
    for line in &view.lines {
        if writeln!(out, "{}", line).is_err() {
            // BrokenPipe: the reader has what it wanted.
            return 0;
        }
    }
    0
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let app_config = build_config(&cli);

    init_tracing(app_config.verbose);
    debug!("effective config: {:?}", app_config);

    match cli.command {
        Commands::Watch(ref watch_args) => {
            if let Err(e) = stream::run_watch(&app_config, watch_args).await {
                eprintln!("tailcast: watch error: {}", e);
                std::process::exit(1);
            }
        }
        Commands::Tail(ref tail_args) => {
            let code = run_tail(&app_config, tail_args).await;
            if code != 0 {
                std::process::exit(code);
            }
        }
    }
}
