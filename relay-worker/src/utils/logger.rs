//! Logging Infrastructure
//!
//! `RUST_LOG` wins over the configured level. With a log directory, output
//! goes to a daily rolling file instead of stdout.

use std::path::Path;
use tracing_subscriber::EnvFilter;

/// Filter directives for a default level
///
/// The MQTT transport is chatty at debug, so it stays at `warn` unless
/// `RUST_LOG` says otherwise.
pub fn default_directives(level: &str) -> String {
    format!("{},rumqttc=warn", level)
}

/// Initialize the logger
pub fn init_logger() {
    init_logger_with_file("info", None);
}

/// Initialize the logger with optional file output
pub fn init_logger_with_file(log_level: &str, log_dir: Option<&Path>) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directives(log_level)));

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_file(false)
        .with_line_number(false)
        .with_thread_ids(false)
        .with_target(false);

    if let Some(dir) = log_dir
        && dir.exists()
    {
        let file_appender = tracing_appender::rolling::daily(dir, "relay-worker");
        subscriber.with_ansi(false).with_writer(file_appender).init();
        return;
    }

    subscriber.init();
}
