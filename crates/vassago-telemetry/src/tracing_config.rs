//! Distributed tracing configuration.

use opentelemetry_sdk::trace::SdkTracerProvider;

use crate::TelemetryConfig;

/// Guard for the tracing provider that shuts down on drop.
pub struct TracingGuard {
    provider: Option<SdkTracerProvider>,
}

impl TracingGuard {
    /// Returns `true` if spans are being exported.
    #[must_use]
    pub fn is_exporting(&self) -> bool {
        self.provider.is_some()
    }
}

impl Drop for TracingGuard {
    fn drop(&mut self) {
        if let Some(provider) = self.provider.take() {
            if let Err(e) = provider.shutdown() {
                tracing::warn!("Error shutting down tracer provider: {:?}", e);
            }
        }
    }
}

/// Initializes distributed tracing with OpenTelemetry.
///
/// Without an OTLP endpoint, or without the `otlp` feature, tracing stays local
/// and the returned guard is inert.
///
/// # Errors
///
/// Returns an error if the exporter cannot be built.
pub fn init_tracing(
    config: &TelemetryConfig,
) -> Result<TracingGuard, Box<dyn std::error::Error + Send + Sync>> {
    let Some(endpoint) = &config.otlp_endpoint else {
        tracing::debug!("No OTLP endpoint configured, using local tracing only");
        return Ok(TracingGuard { provider: None });
    };

    tracing::info!(endpoint = %endpoint, "Initializing OTLP tracing");

    #[cfg(feature = "otlp")]
    {
        use std::time::Duration;

        use opentelemetry::{global, KeyValue};
        use opentelemetry_otlp::{SpanExporter, WithExportConfig};
        use opentelemetry_sdk::{
            trace::{RandomIdGenerator, Sampler},
            Resource,
        };

        let exporter = SpanExporter::builder()
            .with_tonic()
            .with_endpoint(endpoint)
            .with_timeout(Duration::from_secs(10))
            .build()?;

        let resource = Resource::builder()
            .with_service_name(config.service_name.clone())
            .with_attribute(KeyValue::new("service.version", env!("CARGO_PKG_VERSION")))
            .build();

        let provider = SdkTracerProvider::builder()
            .with_batch_exporter(exporter)
            .with_sampler(Sampler::AlwaysOn)
            .with_id_generator(RandomIdGenerator::default())
            .with_resource(resource)
            .build();

        let _ = global::set_tracer_provider(provider.clone());

        tracing::info!(
            service = %config.service_name,
            endpoint = %endpoint,
            "OTLP tracing initialized"
        );

        Ok(TracingGuard {
            provider: Some(provider),
        })
    }

    #[cfg(not(feature = "otlp"))]
    {
        tracing::warn!("OTLP feature not enabled, tracing will be local only");
        Ok(TracingGuard { provider: None })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_endpoint_is_inert() {
        let guard = init_tracing(&TelemetryConfig::new("vassago")).unwrap();
        assert!(!guard.is_exporting());
    }

    #[cfg(not(feature = "otlp"))]
    #[test]
    fn test_endpoint_without_otlp_feature_stays_local() {
        let config = TelemetryConfig::new("vassago").with_otlp("http://localhost:4317");
        let guard = init_tracing(&config).unwrap();
        assert!(!guard.is_exporting());
    }
}
