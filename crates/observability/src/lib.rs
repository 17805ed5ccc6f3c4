//! Tracing and logging setup shared by the lotsync binaries.

use thiserror::Error;

/// Tracing configuration (filters, output format).
pub mod tracing;

pub use tracing::LogFormat;

/// Env var selecting the log output format (`json` or `pretty`).
pub const LOG_FORMAT_VAR: &str = "LOTSYNC_LOG_FORMAT";

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("unknown log format '{0}' (expected json or pretty)")]
pub struct UnknownLogFormat(pub String);

/// Initialize process-wide tracing/logging.
///
/// This is safe to call multiple times; subsequent calls become no-ops.
pub fn init(format: LogFormat) {
    tracing::init(format);
}
