//! Tracing and logging setup shared by worker processes.

/// Initialize process-wide tracing with the format chosen by
/// `POLICYBATCH_LOG_FORMAT`.
///
/// Safe to call multiple times; subsequent calls become no-ops.
pub fn init() {
    tracing::init();
}

/// Subscriber configuration (filters, output format).
pub mod tracing;

pub use self::tracing::{LogFormat, ParseLogFormatError, init_with};
