//! # Structured Logging Module
//!
//! Environment-aware structured logging that writes human-readable output to the
//! console and JSON lines to a file, for diagnosing long unattended runs.
//!
//! This is diagnostic logging only. The per-module activity trail shown to
//! operators lives in [`crate::orchestration::activity_log`].

use chrono::Utc;
use std::fs;
use std::path::Path;
use std::process;
use std::sync::OnceLock;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

static LOGGER_INITIALIZED: OnceLock<()> = OnceLock::new();

/// Initialize structured logging with environment-specific configuration.
///
/// Safe to call more than once; only the first call installs the subscriber.
pub fn init_structured_logging(log_dir: &Path) {
    LOGGER_INITIALIZED.get_or_init(|| {
        let environment = crate::config::ConfigManager::detect_environment();
        let log_level = default_level(&environment);

        if let Err(e) = fs::create_dir_all(log_dir) {
            eprintln!("Failed to create log directory {}: {e}", log_dir.display());
            return;
        }

        let pid = process::id();
        let timestamp = Utc::now().format("%Y%m%d_%H%M%S").to_string();
        let log_filename = format!("cycle.{environment}.{pid}.{timestamp}.jsonl");

        let file_appender = tracing_appender::rolling::never(log_dir, &log_filename);
        let (file_writer, guard) = tracing_appender::non_blocking(file_appender);

        let subscriber = tracing_subscriber::registry()
            .with(
                fmt::layer()
                    .with_target(true)
                    .with_thread_ids(true)
                    .with_level(true)
                    .with_ansi(true)
                    .with_filter(env_filter(log_level)),
            )
            .with(
                fmt::layer()
                    .with_writer(file_writer)
                    .with_target(true)
                    .with_thread_ids(true)
                    .with_level(true)
                    .with_ansi(false)
                    .json()
                    .with_filter(env_filter(log_level)),
            );

        if subscriber.try_init().is_err() {
            // Embedding application already installed a subscriber
            tracing::debug!("Global tracing subscriber already initialized - continuing with existing subscriber");
        }

        tracing::info!(
            pid = pid,
            environment = %environment,
            log_file = %log_dir.join(&log_filename).display(),
            "Structured logging initialized"
        );

        // Keep the non-blocking writer alive for the process lifetime
        std::mem::forget(guard);
    });
}

/// `RUST_LOG` wins over the environment-derived default
fn env_filter(default_level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level))
}

/// Default level per deployment environment
fn default_level(environment: &str) -> &'static str {
    match environment {
        "production" | "staging" => "info",
        _ => "debug",
    }
}

/// Log a module lifecycle transition with consistent fields
pub fn log_module_operation(
    operation: &str,
    module: &str,
    cycle_id: Option<&str>,
    status: &str,
    details: Option<&str>,
) {
    tracing::info!(
        operation = %operation,
        module = %module,
        cycle_id = cycle_id,
        status = %status,
        details = details,
        "MODULE_OPERATION"
    );
}

/// Log error with full context
pub fn log_error(component: &str, operation: &str, error: &str, context: Option<&str>) {
    tracing::error!(
        component = %component,
        operation = %operation,
        error = %error,
        context = context,
        "ERROR"
    );
}
