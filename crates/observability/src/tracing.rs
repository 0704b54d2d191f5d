//! Tracing/logging initialization.

use tracing_subscriber::EnvFilter;

/// Default directive used when `RUST_LOG` is unset.
pub const DEFAULT_FILTER: &str = "info,leadflow_queue=debug";

/// Output format for the fmt layer.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum LogFormat {
    /// One JSON object per line, for log shippers.
    Json,
    /// Human-readable output for local runs.
    Pretty,
    /// Compact output routed through the libtest capture writer.
    Test,
}

/// Initialize tracing/logging for the process.
///
/// Safe to call multiple times (subsequent calls are no-ops).
pub fn init(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_timer(tracing_subscriber::fmt::time::SystemTime);

    let _ = match format {
        LogFormat::Json => builder.json().with_target(false).try_init(),
        LogFormat::Pretty => builder.pretty().try_init(),
        LogFormat::Test => builder.compact().with_test_writer().try_init(),
    };
}
