//! Thermotune Daemon (thermotuned)
//!
//! Runs self-tuning PID zones against a host event stream.
//!
//! # I/O
//! - **Input**: JSON lines on stdin (or `--input FILE`), one zone event per line
//! - **Output**: JSON status lines on stdout for every zone an event changed
//! - **State**: one JSON file per zone, saved with a debounce and on shutdown
//!
//! # Signals
//! SIGINT/SIGTERM stop the event loop, then pending state is flushed before exit.

mod config;
mod runtime;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use tokio::io::{AsyncBufRead, BufReader};
use tokio::sync::watch;
use tracing::{error, info, warn};
use tt_core::{JsonFileStore, StateStore};

use crate::config::DaemonConfig;
use crate::runtime::Daemon;

const VERSION: &str = env!("CARGO_PKG_VERSION");

// ============================================================================
// CLI
// ============================================================================

fn print_help() {
    eprintln!("thermotuned {} - Self-tuning PID zone daemon", VERSION);
    eprintln!();
    eprintln!("USAGE:");
    eprintln!("    thermotuned [OPTIONS]");
    eprintln!();
    eprintln!("OPTIONS:");
    eprintln!("    -c, --config PATH      Daemon config file (JSON)");
    eprintln!("    -d, --state-dir PATH   Zone state directory (overrides config)");
    eprintln!("    -i, --input PATH       Read events from a file instead of stdin");
    eprintln!("    -v, --version          Print version");
    eprintln!("    -h, --help             Print this help");
    eprintln!();
    eprintln!("ENVIRONMENT:");
    eprintln!("    THERMOTUNE_LOG         Log level (trace, debug, info, warn, error)");
}

fn print_version() {
    println!("thermotuned {}", VERSION);
}

#[derive(Default)]
struct Args {
    config: Option<PathBuf>,
    state_dir: Option<PathBuf>,
    input: Option<PathBuf>,
}

/// Parse arguments; `None` means the process should exit successfully
fn parse_args() -> Option<Args> {
    let args: Vec<String> = std::env::args().collect();
    let mut parsed = Args::default();

    let mut i = 1;
    while i < args.len() {
        let flag = args[i].as_str();
        match flag {
            "-h" | "--help" => {
                print_help();
                return None;
            }
            "-v" | "--version" => {
                print_version();
                return None;
            }
            "-c" | "--config" | "-d" | "--state-dir" | "-i" | "--input" => {
                i += 1;
                if i >= args.len() {
                    eprintln!("Error: {} requires a path argument", flag);
                    std::process::exit(1);
                }
                let path = PathBuf::from(&args[i]);
                match flag {
                    "-c" | "--config" => parsed.config = Some(path),
                    "-d" | "--state-dir" => parsed.state_dir = Some(path),
                    _ => parsed.input = Some(path),
                }
            }
            arg => {
                eprintln!("Unknown argument: {}", arg);
                print_help();
                std::process::exit(1);
            }
        }
        i += 1;
    }
    Some(parsed)
}

// ============================================================================
// Logging
// ============================================================================

/// Journald when available, stderr otherwise; returns true for journald
fn init_logging(log_level: &str) -> bool {
    use tracing_subscriber::prelude::*;

    if std::path::Path::new("/run/systemd/journal/socket").exists() {
        match tracing_journald::layer() {
            Ok(journald_layer) => {
                tracing_subscriber::registry()
                    .with(journald_layer)
                    .with(tracing_subscriber::EnvFilter::new(log_level))
                    .init();
                return true;
            }
            Err(e) => {
                eprintln!("Failed to create journald layer: {}, falling back to stderr", e);
            }
        }
    }

    // stdout carries status lines
    tracing_subscriber::fmt()
        .with_target(false)
        .with_level(true)
        .with_writer(std::io::stderr)
        .with_env_filter(log_level)
        .init();
    false
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
            }
            Err(e) => {
                warn!("Failed to install SIGTERM handler: {}", e);
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

// ============================================================================
// Main Entry Point
// ============================================================================

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let Some(args) = parse_args() else {
        return Ok(());
    };

    let log_level = std::env::var("THERMOTUNE_LOG").unwrap_or_else(|_| "info".to_string());
    let use_journald = init_logging(&log_level);

    info!("STARTUP: thermotuned {} starting", VERSION);
    info!("STARTUP: Logging to {}", if use_journald { "systemd journal" } else { "stderr" });

    let config = match &args.config {
        Some(path) => DaemonConfig::load(path)
            .with_context(|| format!("loading config {}", path.display()))?,
        None => {
            warn!("No config file given, running without zones");
            DaemonConfig::default()
        }
    };

    let state_dir = args
        .state_dir
        .or_else(|| config.state_dir.clone())
        .unwrap_or_else(JsonFileStore::default_dir);
    info!("STARTUP: State directory: {}", state_dir.display());

    let store: Arc<dyn StateStore> = Arc::new(JsonFileStore::new(state_dir));
    let registry = runtime::build_registry(&config.zones, store.as_ref())
        .context("building zone registry")?;
    info!("STARTUP: {} zones registered", registry.len());

    let daemon = Arc::new(Daemon::new(registry, store, config.save_debounce_ms));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let ticker = tokio::spawn(runtime::run_ticker(
        Arc::clone(&daemon),
        config.tick_interval_ms,
        shutdown_rx.clone(),
    ));
    let flusher = tokio::spawn(runtime::run_flusher(
        Arc::clone(&daemon),
        config.flush_interval_ms,
        shutdown_rx,
    ));

    let input: Box<dyn AsyncBufRead + Unpin + Send> = match &args.input {
        Some(path) => {
            let file = tokio::fs::File::open(path)
                .await
                .with_context(|| format!("opening input {}", path.display()))?;
            Box::new(BufReader::new(file))
        }
        None => Box::new(BufReader::new(tokio::io::stdin())),
    };
    let mut output = tokio::io::stdout();

    let result = tokio::select! {
        res = runtime::run_events(Arc::clone(&daemon), input, &mut output) => res.map(|n| {
            info!("Input closed after {} events", n);
        }),
        _ = shutdown_signal() => {
            info!("SIGNAL: Received SIGINT/SIGTERM - initiating shutdown");
            Ok(())
        }
    };

    let _ = shutdown_tx.send(true);
    let _ = ticker.await;
    let _ = flusher.await;

    match daemon.flush_all().await {
        Ok(saved) => info!("SHUTDOWN: Saved {} zone records", saved),
        Err(e) => error!("SHUTDOWN: {}", e),
    }

    if let Err(e) = result {
        error!("Event loop error: {}", e);
        return Err(e.into());
    }
    Ok(())
}
