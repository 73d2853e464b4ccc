//! Logging infrastructure - structured tracing for the binding runtime
//!
//! Design: Uses `tracing` for structured, contextual logging with:
//! - Configurable level via environment or config file
//! - Zero-cost when disabled
//! - Optional JSON output and daily-rotated file output
//! - Event helpers for the boundary crossings worth recording

use once_cell::sync::OnceCell;
use std::io;
use std::path::Path;
use tracing::Level;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter, Layer,
};

pub use tracing::{debug, error, info, trace, warn};

/// Global logging state; holds the file writer guard when file output is on
static LOGGER: OnceCell<Option<WorkerGuard>> = OnceCell::new();

/// Logging configuration
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Default log level
    pub level: Level,
    /// Enable file logging
    pub file_output: bool,
    /// Log file path (if file_output enabled)
    pub log_path: Option<String>,
    /// Enable JSON format (vs human-readable)
    pub json_format: bool,
    /// Show span events (enter/exit)
    pub show_spans: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: Level::INFO,
            file_output: false,
            log_path: None,
            json_format: false,
            show_spans: false,
        }
    }
}

impl LogConfig {
    /// Create config from environment variables
    pub fn from_env() -> Self {
        let mut config = Self::default();

        // GIR_BRIDGE_LOG_LEVEL: trace, debug, info, warn, error
        if let Ok(level_str) = std::env::var("GIR_BRIDGE_LOG_LEVEL") {
            config.level = parse_level(&level_str);
        }

        // GIR_BRIDGE_LOG_FILE: path to log file
        if let Ok(path) = std::env::var("GIR_BRIDGE_LOG_FILE") {
            config.file_output = true;
            config.log_path = Some(path);
        }

        config.json_format = std::env::var("GIR_BRIDGE_LOG_JSON").is_ok();
        config.show_spans = std::env::var("GIR_BRIDGE_LOG_SPANS").is_ok();

        config
    }

    /// Errors only
    pub fn quiet() -> Self {
        Self {
            level: Level::ERROR,
            ..Self::default()
        }
    }

    /// Every marshalled value
    pub fn verbose() -> Self {
        Self {
            level: Level::TRACE,
            show_spans: true,
            ..Self::default()
        }
    }
}

/// Parse a level name, defaulting to INFO
pub fn parse_level(name: &str) -> Level {
    match name.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" | "warning" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    }
}

/// Initialize logging with default configuration
pub fn init() {
    init_with_config(LogConfig::from_env());
}

/// Initialize logging with custom configuration (first call wins)
pub fn init_with_config(config: LogConfig) {
    LOGGER.get_or_init(|| {
        let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new(format!("gir_bridge={}", config.level.as_str().to_lowercase()))
        });

        let span_events = if config.show_spans {
            FmtSpan::ENTER | FmtSpan::CLOSE
        } else {
            FmtSpan::NONE
        };

        let (writer, guard) = match config.log_path.as_deref().filter(|_| config.file_output) {
            Some(path) => {
                let path = Path::new(path);
                let directory = path
                    .parent()
                    .filter(|dir| !dir.as_os_str().is_empty())
                    .unwrap_or_else(|| Path::new("."));
                let prefix = path
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_else(|| "gir_bridge.log".into());
                let appender = tracing_appender::rolling::daily(directory, prefix);
                let (writer, guard) = tracing_appender::non_blocking(appender);
                (writer, Some(guard))
            }
            None => {
                let (writer, guard) = tracing_appender::non_blocking(io::stderr());
                (writer, Some(guard))
            }
        };

        let layer = if config.json_format {
            fmt::layer()
                .json()
                .with_writer(writer)
                .with_span_events(span_events)
                .boxed()
        } else {
            fmt::layer()
                .with_writer(writer)
                .with_span_events(span_events)
                .with_target(true)
                .with_thread_ids(cfg!(debug_assertions))
                .with_line_number(cfg!(debug_assertions))
                .boxed()
        };

        // Another subscriber may already be installed by the host application
        let _ = tracing_subscriber::registry()
            .with(env_filter)
            .with(layer)
            .try_init();

        guard
    });
}

/// Check if logging is initialized
pub fn is_initialized() -> bool {
    LOGGER.get().is_some()
}

// ============================================================================
// Boundary events
// ============================================================================

/// Log native function call
#[inline]
pub fn log_ffi_call(library: &str, symbol: &str, arg_count: usize) {
    debug!(
        event = "ffi_call",
        library,
        symbol,
        args = arg_count,
        "Native function called"
    );
}

/// Log native function return
#[inline]
pub fn log_ffi_return(symbol: &str, return_kind: &str) {
    trace!(
        event = "ffi_return",
        symbol,
        returns = return_kind,
        "Native function returned"
    );
}

/// Log a deferred native release being carried out
#[inline]
pub fn log_release(kind: &str, address: *const u8) {
    trace!(
        event = "release",
        kind,
        address = ?address,
        "Native resource released"
    );
}

/// Log a handler failure caught at the trampoline boundary
pub fn log_callback_error(registration: u64, message: &str) {
    error!(
        event = "callback_error",
        registration,
        error = message,
        "Managed handler failed during native callback"
    );
}

/// Performance tracking utilities
pub mod perf {
    use std::time::Instant;
    use tracing::debug;

    /// Track operation duration (returns guard that logs on drop)
    #[must_use]
    pub fn track(operation: &'static str) -> PerformanceGuard {
        PerformanceGuard {
            operation,
            start: Instant::now(),
        }
    }

    pub struct PerformanceGuard {
        operation: &'static str,
        start: Instant,
    }

    impl Drop for PerformanceGuard {
        fn drop(&mut self) {
            debug!(
                operation = self.operation,
                duration_us = self.start.elapsed().as_micros() as u64,
                "operation completed"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_creation() {
        let config = LogConfig::default();
        assert_eq!(config.level, Level::INFO);
        assert!(!config.file_output);

        assert_eq!(LogConfig::quiet().level, Level::ERROR);
        assert_eq!(LogConfig::verbose().level, Level::TRACE);
    }

    #[test]
    fn test_parse_level() {
        assert_eq!(parse_level("DEBUG"), Level::DEBUG);
        assert_eq!(parse_level("warning"), Level::WARN);
        assert_eq!(parse_level("nonsense"), Level::INFO);
    }

    #[test]
    fn test_init_idempotent() {
        init();
        init();
        assert!(is_initialized());
    }
}
