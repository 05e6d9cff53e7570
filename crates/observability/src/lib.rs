//! Tracing and logging setup shared by every armada process.

pub mod tracing;

pub use tracing::LogConfig;

/// Initialize process-wide tracing with the default configuration.
///
/// This is safe to call multiple times; subsequent calls become no-ops.
pub fn init() {
    tracing::init(&LogConfig::default());
}

/// Initialize process-wide tracing from an explicit configuration.
pub fn init_with(config: &LogConfig) {
    tracing::init(config);
}
