//! Logging initialization
//!
//! JSON structured logs filtered by `RUST_LOG` (falling back to a sane
//! default). The filter sits behind a reload layer so the operator's log
//! verbosity can follow the operator configuration at runtime.

use parking_lot::Mutex;
use std::sync::Arc;
use thiserror::Error;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{reload, EnvFilter, Registry};

/// Filter used when `RUST_LOG` is unset or invalid
pub const DEFAULT_FILTER: &str = "info,kube=info,tower=warn,hyper=warn";

/// Errors that can occur during telemetry setup or reconfiguration
#[derive(Debug, Error)]
pub enum TelemetryError {
    /// Failed to install the global subscriber
    #[error("failed to initialize tracing subscriber: {0}")]
    SubscriberInit(String),

    /// The filter directives could not be parsed
    #[error("invalid log filter {directives:?}: {message}")]
    InvalidFilter {
        /// The rejected directives
        directives: String,
        /// Parser error
        message: String,
    },

    /// The subscriber owning the filter no longer exists
    #[error("failed to reload log filter: {0}")]
    Reload(String),
}

/// Configuration for logging initialization
#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    /// Emit JSON lines rather than human-readable text
    pub json: bool,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self { json: true }
    }
}

/// Handle for changing the active log filter after initialization
#[derive(Clone)]
pub struct LogFilterHandle {
    handle: reload::Handle<EnvFilter, Registry>,
    current: Arc<Mutex<String>>,
}

impl std::fmt::Debug for LogFilterHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogFilterHandle")
            .field("current", &*self.current.lock())
            .finish()
    }
}

impl LogFilterHandle {
    /// Replace the active filter with `directives`
    pub fn set_filter(&self, directives: &str) -> Result<(), TelemetryError> {
        let filter = EnvFilter::try_new(directives).map_err(|e| TelemetryError::InvalidFilter {
            directives: directives.to_string(),
            message: e.to_string(),
        })?;
        self.handle
            .reload(filter)
            .map_err(|e| TelemetryError::Reload(e.to_string()))?;
        *self.current.lock() = directives.to_string();
        Ok(())
    }

    /// Directives currently in effect
    pub fn current(&self) -> String {
        self.current.lock().clone()
    }
}

/// Build the reloadable filter layer and its handle
pub fn reloadable_filter(
    directives: &str,
) -> (reload::Layer<EnvFilter, Registry>, LogFilterHandle) {
    let (filter, installed) = match EnvFilter::try_new(directives) {
        Ok(filter) => (filter, directives),
        Err(_) => (EnvFilter::new(DEFAULT_FILTER), DEFAULT_FILTER),
    };
    let (layer, handle) = reload::Layer::new(filter);
    (
        layer,
        LogFilterHandle {
            handle,
            current: Arc::new(Mutex::new(installed.to_string())),
        },
    )
}

/// Install the global subscriber. Returns a handle for runtime filter changes.
pub fn init_telemetry(config: TelemetryConfig) -> Result<LogFilterHandle, TelemetryError> {
    let directives = std::env::var(EnvFilter::DEFAULT_ENV).unwrap_or_else(|_| DEFAULT_FILTER.to_string());
    let (filter_layer, handle) = reloadable_filter(&directives);

    let json_layer = config.json.then(|| {
        tracing_subscriber::fmt::layer()
            .json()
            .with_current_span(true)
            .with_span_list(false)
            .with_target(true)
            .with_file(false)
            .with_line_number(false)
    });
    let text_layer = (!config.json).then(|| tracing_subscriber::fmt::layer().with_target(true));

    tracing_subscriber::registry()
        .with(filter_layer)
        .with(json_layer)
        .with(text_layer)
        .try_init()
        .map_err(|e: tracing_subscriber::util::TryInitError| {
            TelemetryError::SubscriberInit(e.to_string())
        })?;

    Ok(handle)
}
