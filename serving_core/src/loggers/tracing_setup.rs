//! # Tracing Setup
//!
//! Installs the process-wide `tracing` subscriber used by the serving core:
//! an `EnvFilter`, a console layer (text or JSON lines) and an optional daily
//! rolling file written through a non-blocking appender.

use std::fs;
use std::path::{Path, PathBuf};

use glob::glob;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter, Layer};

use crate::configs::LoggingConfig;
use crate::errors::{Result, ServingError};

/// Keeps the non-blocking file writer alive; dropping it flushes pending lines.
pub struct LoggingGuard {
    _file_guard: Option<WorkerGuard>,
    /// Directory log files are written to, if file logging is enabled.
    pub log_dir: Option<PathBuf>,
}

/// # Initialise Logging
///
/// `RUST_LOG` takes precedence over `LoggingConfig::level`. Calling this twice
/// in one process fails with a configuration error because the global
/// subscriber can only be installed once.
pub fn init_logging(config: &LoggingConfig) -> Result<LoggingGuard> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.level))
        .map_err(|e| ServingError::config(format!("invalid log filter '{}': {e}", config.level)))?;

    let console = if config.json {
        fmt::layer().json().with_target(true).boxed()
    } else {
        fmt::layer().with_target(true).boxed()
    };

    let mut file_guard = None;
    let file_layer = match &config.log_dir {
        Some(dir) => {
            fs::create_dir_all(dir)?;
            prune_old_logs(dir, &config.file_prefix, config.keep_files);
            let appender = tracing_appender::rolling::daily(dir, &config.file_prefix);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            file_guard = Some(guard);
            Some(fmt::layer().json().with_ansi(false).with_writer(writer).boxed())
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(console)
        .with(file_layer)
        .try_init()
        .map_err(|e| ServingError::config(format!("logging already initialised: {e}")))?;

    Ok(LoggingGuard {
        _file_guard: file_guard,
        log_dir: config.log_dir.clone(),
    })
}

/// Remove all but the newest `keep` files named `<prefix>*` in `dir`.
///
/// Rolling file names embed the date, so lexical order is chronological.
/// Returns the number of files deleted.
pub fn prune_old_logs(dir: &Path, prefix: &str, keep: usize) -> usize {
    let pattern = format!("{}/{}*", dir.display(), prefix);
    let mut files: Vec<PathBuf> = match glob(&pattern) {
        Ok(paths) => paths.filter_map(|p| p.ok()).filter(|p| p.is_file()).collect(),
        Err(e) => {
            eprintln!("Invalid log pruning pattern {pattern}: {e}");
            return 0;
        }
    };

    // Newest first.
    files.sort_by(|a, b| b.file_name().cmp(&a.file_name()));

    let mut removed = 0;
    for old in files.iter().skip(keep) {
        match fs::remove_file(old) {
            Ok(()) => removed += 1,
            Err(e) => eprintln!("Error deleting old log file {}: {}", old.display(), e),
        }
    }
    removed
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pruning_keeps_the_newest_files() {
        let dir = tempfile::tempdir().expect("tempdir");
        for day in ["2026-01-01", "2026-01-02", "2026-01-03", "2026-01-04"] {
            fs::write(dir.path().join(format!("serving.{day}")), b"x").expect("write");
        }
        fs::write(dir.path().join("unrelated.log"), b"x").expect("write");

        let removed = prune_old_logs(dir.path(), "serving", 2);
        assert_eq!(removed, 2);
        assert!(dir.path().join("serving.2026-01-04").exists());
        assert!(dir.path().join("serving.2026-01-03").exists());
        assert!(!dir.path().join("serving.2026-01-01").exists());
        assert!(dir.path().join("unrelated.log").exists());
    }
}
