//! Telemetry: logging, metrics and trace export.
//!
//! - **Logging**: structured JSON/pretty/compact logging with per-module levels
//! - **Metrics**: Prometheus recorder and metric descriptions
//! - **OTLP**: optional OpenTelemetry trace export

pub mod logging;
pub mod metrics;
pub mod otlp;

pub use logging::{build_filter, fmt_layer, init_logging, LogFormat, LogOutput, LoggingConfig};
pub use metrics::{init_metrics, MetricsConfig, MetricsRegistry};
pub use otlp::{otlp_tracer, shutdown_tracing};

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Unified telemetry configuration.
#[derive(Debug, Clone, Default)]
pub struct TelemetryConfig {
    pub service_name: String,
    pub otlp_endpoint: Option<String>,
    pub logging: LoggingConfig,
    pub metrics: MetricsConfig,
}

/// Initialize logging, trace export and metrics in one go.
///
/// # Errors
///
/// Returns an error if any part fails to initialize.
pub fn init_telemetry(config: &TelemetryConfig) -> anyhow::Result<MetricsRegistry> {
    let otel_layer = match config.otlp_endpoint.as_deref() {
        Some(endpoint) => {
            let tracer = otlp_tracer(&config.service_name, endpoint)?;
            Some(tracing_opentelemetry::layer().with_tracer(tracer))
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(build_filter(&config.logging)?)
        .with(fmt_layer(&config.logging))
        .with(otel_layer)
        .try_init()?;

    let registry = init_metrics(&config.metrics)?;

    tracing::info!(
        service_name = %config.service_name,
        otlp = config.otlp_endpoint.is_some(),
        metrics = registry.is_enabled(),
        "Telemetry initialized"
    );

    Ok(registry)
}
