//! # Vassago Telemetry
//!
//! Observability for the Vassago knowledge pipeline: structured logging,
//! optional OpenTelemetry trace export, and pipeline counters.
//!
//! Nothing here is global. The binary initializes logging once and hands a
//! shared [`PipelineMetrics`] to each pipeline it constructs.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod logging;
pub mod metrics;
pub mod tracing_config;

pub use logging::init_logging;
pub use metrics::{MetricsSnapshot, PipelineMetrics, Timer};
pub use tracing_config::{init_tracing, TracingGuard};

/// Configuration for telemetry.
#[derive(Debug, Clone, Default)]
pub struct TelemetryConfig {
    /// Service name for tracing.
    pub service_name: String,
    /// OTLP endpoint for traces.
    pub otlp_endpoint: Option<String>,
    /// Log level.
    pub log_level: String,
    /// Enable JSON logging.
    pub json_logs: bool,
}

impl TelemetryConfig {
    /// Creates a new telemetry configuration.
    #[must_use]
    pub fn new(service_name: impl Into<String>) -> Self {
        Self {
            service_name: service_name.into(),
            otlp_endpoint: None,
            log_level: "info".to_string(),
            json_logs: false,
        }
    }

    /// Sets the OTLP endpoint.
    #[must_use]
    pub fn with_otlp(mut self, endpoint: impl Into<String>) -> Self {
        self.otlp_endpoint = Some(endpoint.into());
        self
    }

    /// Sets the log level.
    #[must_use]
    pub fn with_log_level(mut self, level: impl Into<String>) -> Self {
        self.log_level = level.into();
        self
    }

    /// Enables JSON logging.
    #[must_use]
    pub fn with_json_logs(mut self) -> Self {
        self.json_logs = true;
        self
    }
}
