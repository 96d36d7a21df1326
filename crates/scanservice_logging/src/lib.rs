//! Shared logging setup for scan service binaries.

use anyhow::{Context, Result};
use std::fs;
use std::path::PathBuf;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

pub const DEFAULT_LOG_FILTER: &str =
    "scanservice=info,scanservice_sentinel=info,scanservice_worker=info";
const VERBOSE_LOG_FILTER: &str =
    "scanservice=debug,scanservice_sentinel=debug,scanservice_worker=debug";
const MAX_LOG_FILES: usize = 5;

/// Where log lines go.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogTarget {
    /// Daily-rolled file under [`logs_dir`] plus stderr.
    FileAndStderr,
    /// Stderr only. Worker processes use this: their stdout is the wire.
    Stderr,
}

/// Logging configuration shared by scan service binaries.
#[derive(Debug, Clone)]
pub struct LogConfig<'a> {
    pub app_name: &'a str,
    pub verbose: bool,
    pub target: LogTarget,
}

/// Initialize tracing. Keep the returned guard alive for the lifetime of
/// the process, dropping it flushes the file writer.
pub fn init_logging(config: LogConfig<'_>) -> Result<Option<WorkerGuard>> {
    let file_filter = env_filter(false);
    let console_filter = env_filter(config.verbose);

    match config.target {
        LogTarget::Stderr => {
            let console_layer = tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_filter(console_filter);
            tracing_subscriber::registry()
                .with(console_layer)
                .try_init()
                .context("Failed to install tracing subscriber")?;
            Ok(None)
        }
        LogTarget::FileAndStderr => {
            let log_dir = ensure_logs_dir().context("Failed to ensure log directory")?;
            let appender = tracing_appender::rolling::Builder::new()
                .rotation(tracing_appender::rolling::Rotation::DAILY)
                .filename_prefix(sanitize_name(config.app_name))
                .filename_suffix("log")
                .max_log_files(MAX_LOG_FILES)
                .build(&log_dir)
                .with_context(|| format!("Failed to open log file in {}", log_dir.display()))?;
            let (file_writer, guard) = tracing_appender::non_blocking(appender);
            let console_layer = tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_filter(console_filter);

            tracing_subscriber::registry()
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_writer(file_writer)
                        .with_ansi(false)
                        .with_filter(file_filter),
                )
                .with(console_layer)
                .try_init()
                .context("Failed to install tracing subscriber")?;
            Ok(Some(guard))
        }
    }
}

/// `RUST_LOG` wins; otherwise the default (or verbose) filter.
fn env_filter(verbose: bool) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if verbose {
            EnvFilter::new(VERBOSE_LOG_FILTER)
        } else {
            EnvFilter::new(DEFAULT_LOG_FILTER)
        }
    })
}

/// Scan service home: `$SCANSERVICE_HOME`, else `~/.scanservice`,
/// else a directory under the system temp dir.
pub fn scanservice_home() -> PathBuf {
    if let Ok(override_path) = std::env::var("SCANSERVICE_HOME") {
        return PathBuf::from(override_path);
    }
    dirs::home_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join(".scanservice")
}

/// Logs directory: `<home>/logs`
pub fn logs_dir() -> PathBuf {
    scanservice_home().join("logs")
}

pub fn ensure_logs_dir() -> Result<PathBuf> {
    let logs = logs_dir();
    fs::create_dir_all(&logs)
        .with_context(|| format!("Failed to create logs directory: {}", logs.display()))?;
    Ok(logs)
}

fn sanitize_name(name: &str) -> String {
    name.chars()
        .map(|ch| if ch.is_ascii_alphanumeric() || ch == '-' || ch == '_' { ch } else { '_' })
        .collect()
}
