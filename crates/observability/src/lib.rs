//! Process-wide tracing setup for the job worker.

/// Subscriber construction (filters, output format).
pub mod subscriber;

pub use subscriber::LogFormat;

/// Initialize process-wide logging with the format chosen by
/// `FORMJOBS_LOG_FORMAT` (JSON unless it says `pretty`).
///
/// This is safe to call multiple times; subsequent calls become no-ops.
pub fn init() {
    subscriber::init(LogFormat::from_env());
}

/// Initialize process-wide logging with an explicit format.
pub fn init_with_format(format: LogFormat) {
    subscriber::init(format);
}
