//! Structured logging setup shared by the controller and provider binaries.
//!
//! ## Features
//! - Console output with timestamps, targets and span close events
//! - JSON output for log aggregation (ELK, Loki, ...)
//! - Optional file output for appliance-style deployments
//! - Performance timing helper

use std::path::Path;

use anyhow::Result;
use tracing_subscriber::{
    fmt::{self, format::FmtSpan, time::ChronoLocal},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter, Layer,
};

// ============================================================================
// Initialization Functions
// ============================================================================

/// Initialize logging with human-readable console output.
///
/// The level argument is the default filter; `RUST_LOG` overrides it when set.
///
/// # Example
/// ```
/// virtrigaud_common::init_logging("info").unwrap();
/// ```
pub fn init_logging(level: &str) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level));

    let subscriber = tracing_subscriber::registry()
        .with(filter)
        .with(
            fmt::layer()
                .with_ansi(true)
                .with_target(true)
                .with_timer(ChronoLocal::new("%Y-%m-%d %H:%M:%S%.3f".to_string()))
                .with_span_events(FmtSpan::CLOSE)
        );

    subscriber.init();

    Ok(())
}

/// Initialize logging with JSON output format.
/// Suitable for production environments with log aggregation.
pub fn init_logging_json(level: &str) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level));

    let subscriber = tracing_subscriber::registry()
        .with(filter)
        .with(
            fmt::layer()
                .json()
                .with_target(true)
                .with_span_events(FmtSpan::CLOSE)
                .with_current_span(true)
        );

    subscriber.init();

    Ok(())
}

/// Initialize production logging with both console and file output.
///
/// # Arguments
/// * `level` - Log level for console output
/// * `log_dir` - Directory for log files
/// * `json_file` - Enable JSON format for file logs
pub fn init_logging_production(
    level: &str,
    log_dir: &Path,
    json_file: bool,
) -> Result<()> {
    use std::fs::{self, OpenOptions};

    fs::create_dir_all(log_dir)?;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level));

    let console_layer = fmt::layer()
        .with_ansi(true)
        .with_target(true)
        .with_timer(ChronoLocal::new("%H:%M:%S%.3f".to_string()))
        .with_filter(filter.clone());

    let main_log_path = log_dir.join("virtrigaud.log");
    let main_log_file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&main_log_path)?;

    let file_layer = if json_file {
        fmt::layer()
            .json()
            .with_writer(move || main_log_file.try_clone().unwrap())
            .with_ansi(false)
            .with_filter(filter)
            .boxed()
    } else {
        fmt::layer()
            .with_writer(move || main_log_file.try_clone().unwrap())
            .with_ansi(false)
            .with_timer(ChronoLocal::new("%Y-%m-%d %H:%M:%S%.3f".to_string()))
            .with_filter(filter)
            .boxed()
    };

    let subscriber = tracing_subscriber::registry()
        .with(console_layer)
        .with(file_layer);

    subscriber.init();

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        log_dir = %log_dir.display(),
        "Logging initialized"
    );

    Ok(())
}

// ============================================================================
// Timed Operation Helper
// ============================================================================

/// A helper struct that logs operation duration when dropped
pub struct TimedOperation {
    operation: String,
    start: std::time::Instant,
}

impl TimedOperation {
    pub fn new(operation: impl Into<String>) -> Self {
        let operation = operation.into();
        tracing::debug!(operation = %operation, "Operation started");
        Self {
            operation,
            start: std::time::Instant::now(),
        }
    }

    pub fn success(self) {
        tracing::info!(
            component = "perf",
            operation = %self.operation,
            duration_ms = %self.start.elapsed().as_millis(),
            "Operation completed"
        );
        std::mem::forget(self); // Don't run Drop
    }

    pub fn failure(self, error: &str) {
        tracing::error!(
            component = "perf",
            operation = %self.operation,
            duration_ms = %self.start.elapsed().as_millis(),
            error = error,
            "Operation failed"
        );
        std::mem::forget(self); // Don't run Drop
    }
}

impl Drop for TimedOperation {
    fn drop(&mut self) {
        // If not explicitly finished, log as warning
        tracing::warn!(
            component = "perf",
            operation = %self.operation,
            duration_ms = %self.start.elapsed().as_millis(),
            "Operation ended without explicit success/failure"
        );
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timed_operation() {
        // Just ensure it compiles and doesn't panic
        let op = TimedOperation::new("test_operation");
        op.success();
    }
}
