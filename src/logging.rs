//! Purpose: Install the process-wide tracing subscriber for the CLI.
//! Exports: `LogDestination`, `init`.
//! Role: Only the binary configures logging; library code just emits events.
//! Invariants: `RUST_LOG` wins over the default filter (`info`, or `debug` with `--verbose`).
//! Invariants: An unopenable log file falls back to stderr with a warning.

use std::fs::OpenOptions;
use std::path::PathBuf;
use std::sync::Mutex;

use tracing::warn;
use tracing_subscriber::EnvFilter;

#[derive(Clone, Debug, Eq, PartialEq)]
pub(crate) enum LogDestination {
    Stderr,
    File(PathBuf),
}

impl LogDestination {
    pub(crate) fn parse(value: &str) -> Self {
        match value.trim() {
            "" | "-" | "stderr" => LogDestination::Stderr,
            path => LogDestination::File(PathBuf::from(path)),
        }
    }
}

fn env_filter(verbose: bool) -> EnvFilter {
    EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(if verbose { "debug" } else { "info" }))
}

pub(crate) fn init(destination: &LogDestination, verbose: bool) {
    let path = match destination {
        LogDestination::Stderr => {
            init_stderr(verbose);
            return;
        }
        LogDestination::File(path) => path,
    };
    match OpenOptions::new().create(true).append(true).open(path) {
        Ok(file) => {
            let _ = tracing_subscriber::fmt()
                .with_env_filter(env_filter(verbose))
                .with_target(false)
                .with_ansi(false)
                .with_writer(Mutex::new(file))
                .try_init();
        }
        Err(err) => {
            init_stderr(verbose);
            warn!(path = %path.display(), error = %err, "cannot open log file; logging to stderr");
        }
    }
}

fn init_stderr(verbose: bool) {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter(verbose))
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init();
}
