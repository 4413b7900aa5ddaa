//! Logging configuration for embedding hosts
//!
//! The library itself only emits `tracing` events; hosts that do not bring
//! their own subscriber can use [`init_logging`] to set up a sensible
//! stderr-based one.

use tracing::Level;
use tracing_subscriber::EnvFilter;

/// Logging configuration
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Log level
    pub level: Level,

    /// Include thread IDs
    pub thread_ids: bool,

    /// Include source file and line
    pub file_location: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: Level::INFO,
            thread_ids: false,
            file_location: false,
        }
    }
}

impl LogConfig {
    /// Create config from environment
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(rust_log) = std::env::var("RUST_LOG") {
            if rust_log.contains("trace") {
                config.level = Level::TRACE;
            } else if rust_log.contains("debug") {
                config.level = Level::DEBUG;
            } else if rust_log.contains("warn") {
                config.level = Level::WARN;
            } else if rust_log.contains("error") {
                config.level = Level::ERROR;
            }
        }

        config
    }
}

/// Initialize logging with the given configuration
pub fn init_logging(config: LogConfig) -> Result<(), Box<dyn std::error::Error>> {
    let env_filter = EnvFilter::builder()
        .with_default_directive(config.level.into())
        .from_env_lossy();

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_thread_ids(config.thread_ids)
        .with_file(config.file_location)
        .with_line_number(config.file_location)
        .with_writer(std::io::stderr)
        .try_init()
        .map_err(|e| -> Box<dyn std::error::Error> { e })?;

    Ok(())
}
