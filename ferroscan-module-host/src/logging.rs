//! Forwarding of guest log lines to the host.

use std::fmt;

/// Severity of a guest log line, one per `env` log import.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        };
        f.write_str(name)
    }
}

/// Sink receiving log lines emitted by guests.
///
/// `message` is the decoded guest payload and nothing else; attribution to
/// the emitting module is carried separately so sinks choose their own
/// framing.
pub trait LogSink: Send + Sync {
    fn log(&self, level: LogLevel, module: &str, message: &str);
}

/// Default sink emitting `tracing` events with the module name as a field.
#[derive(Debug, Default)]
pub struct TracingSink;

impl LogSink for TracingSink {
    fn log(&self, level: LogLevel, module: &str, message: &str) {
        match level {
            LogLevel::Debug => tracing::debug!(module = %module, "{message}"),
            LogLevel::Info => tracing::info!(module = %module, "{message}"),
            LogLevel::Warn => tracing::warn!(module = %module, "{message}"),
            LogLevel::Error => tracing::error!(module = %module, "{message}"),
        }
    }
}
