//! Logging setup.
//!
//! Uses `tracing-subscriber`'s `EnvFilter` the way most of the pack does,
//! writing formatted output to stderr so stdout stays free for `--version`.

use tracing_subscriber::EnvFilter;

/// Initializes the global tracing subscriber at `level` (one of `DEBUG`,
/// `INFO`, `WARNING`, `ERROR`). Safe to call more than once per process in
/// tests; subsequent calls after the first are no-ops.
pub fn init(level: &str) {
    let directive = match level.to_uppercase().as_str() {
        "DEBUG" => "debug",
        "WARNING" => "warn",
        "ERROR" => "error",
        _ => "info",
    };

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(directive));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}
