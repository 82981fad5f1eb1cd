//! Destination for attributed plugin output.

/// Receives plugin output after attribution.
pub trait LogSink: Send + Sync {
    /// Regular output (stdout, `print`, `log.info`).
    fn log_plugin_message(&self, plugin: &str, text: &str);

    /// Error output (stderr, failed callbacks, load errors).
    fn log_error(&self, plugin: &str, text: &str);
}

/// Default sink: the `log` facade with target `plugin::<name>`.
///
/// Filtering per plugin then works through `RUST_LOG`, e.g.
/// `RUST_LOG=info,plugin::noisy=warn`.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogCrateSink;

impl LogSink for LogCrateSink {
    fn log_plugin_message(&self, plugin: &str, text: &str) {
        let target = format!("plugin::{plugin}");
        log::info!(target: target.as_str(), "[{plugin}] {text}");
    }

    fn log_error(&self, plugin: &str, text: &str) {
        let target = format!("plugin::{plugin}");
        log::error!(target: target.as_str(), "[{plugin}] {text}");
    }
}
