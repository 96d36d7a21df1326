//! Canonical default values shared by the dispatcher, workers and binaries.

pub const DEFAULT_BIND_ADDR: &str = "0.0.0.0:8000";
pub const DEFAULT_PROCESSES: usize = 6;
pub const DEFAULT_DELTA_T_SECS: u64 = 10;
pub const DEFAULT_GRACE_SECS: u64 = 30;
pub const DEFAULT_IO_THREADS: usize = 2;
pub const DEFAULT_MAX_ANALYZED_BYTES: u64 = 8 * 1024 * 1024;

/// Analyzer order used when none is configured.
pub const DEFAULT_ANALYZERS: &[&str] = &["file_info", "licenses", "copyrights"];

/// Environment variable naming the temp directory handed to workers.
pub const TEMP_DIR_ENV: &str = "SCANSERVICE_TEMP";

pub const TOOL_NAME: &str = "scanservice";
pub const OUTPUT_FORMAT_VERSION: &str = "3.0.0";
pub const HEADER_NOTICE: &str = "Executed within scanservice.";
pub const CANCELLED_MESSAGE: &str = "cancelled";
