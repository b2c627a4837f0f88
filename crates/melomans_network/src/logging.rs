use std::path::Path;

use anyhow::Result;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

const LOG_FILE_PREFIX: &str = "melomans";
const DEFAULT_FILTER: &str = "info,melomans_network=debug";

/// Initializes console + daily-rolling file logging under `logs_dir`.
/// Returns a guard that must be kept alive for the duration of the app.
///
/// `RUST_LOG` overrides `filter` when set. An empty `filter` falls back to
/// `info,melomans_network=debug`.
pub fn init_logging(logs_dir: &Path, filter: &str) -> Result<WorkerGuard> {
    std::fs::create_dir_all(logs_dir)?;

    let file_appender = tracing_appender::rolling::daily(logs_dir, LOG_FILE_PREFIX);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    tracing_subscriber::registry()
        .with(env_filter(filter))
        .with(
            fmt::layer()
                .with_target(true)
                .with_thread_ids(false)
                .with_writer(non_blocking),
        )
        .with(
            fmt::layer()
                .with_target(false)
                .with_thread_ids(false)
                .compact(),
        )
        .try_init()
        .map_err(|e| anyhow::anyhow!("Failed to initialize logging: {e}"))?;

    Ok(guard)
}

/// File-only logging to `logs_dir`, without ANSI colours.
/// Useful for tests or embedded hosts that own the console.
pub fn init_logging_to_dir(logs_dir: &Path, filter: &str) -> Result<WorkerGuard> {
    std::fs::create_dir_all(logs_dir)?;

    let file_appender = tracing_appender::rolling::daily(logs_dir, LOG_FILE_PREFIX);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    tracing_subscriber::registry()
        .with(env_filter(filter))
        .with(
            fmt::layer()
                .with_target(true)
                .with_thread_ids(false)
                .with_ansi(false)
                .with_writer(non_blocking),
        )
        .try_init()
        .map_err(|e| anyhow::anyhow!("Failed to initialize logging: {e}"))?;

    Ok(guard)
}

fn env_filter(filter: &str) -> EnvFilter {
    let fallback = if filter.trim().is_empty() {
        DEFAULT_FILTER
    } else {
        filter
    };
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback))
}

#[cfg(test)]
mod tests {
    use super::*;

    // Only one global subscriber can be installed per process, so these tests
    // accept either outcome of `try_init` and check the side effects.

    #[test]
    fn test_init_logging_to_dir_creates_directory() {
        let tmp = tempfile::tempdir().expect("Failed to create tempdir");
        let logs_dir = tmp.path().join("nested").join("logs");
        assert!(!logs_dir.exists());

        let result = init_logging_to_dir(&logs_dir, "warn");
        assert!(logs_dir.exists());
        drop(result);
    }

    #[test]
    fn test_second_init_reports_error() {
        let tmp = tempfile::tempdir().expect("Failed to create tempdir");
        let first = init_logging_to_dir(&tmp.path().join("a"), "debug");
        let second = init_logging(&tmp.path().join("b"), "debug");

        // At most one of the two can own the global subscriber.
        assert!(first.is_err() || second.is_err());
        if let Err(e) = second {
            assert!(e.to_string().contains("logging"), "unexpected error: {e}");
        }
        assert!(tmp.path().join("b").exists());
    }

    #[test]
    fn test_env_filter_fallback() {
        for f in ["", "info", "melomans_network=trace,warn"] {
            drop(env_filter(f));
        }
    }
}
