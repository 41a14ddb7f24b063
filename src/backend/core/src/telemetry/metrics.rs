//! Prometheus metrics for the event log.
//!
//! Store, subscription and processor code records through the `metrics`
//! facade; this module installs the Prometheus recorder and describes every
//! metric the crate emits.

use metrics::{describe_counter, describe_gauge, describe_histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use serde::Deserialize;
use std::collections::HashMap;
use std::net::SocketAddr;

/// Metrics configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct MetricsConfig {
    /// Whether metrics collection is enabled
    #[serde(default)]
    pub enabled: bool,

    /// Serve the scrape endpoint on this address (e.g. "0.0.0.0:9090")
    pub listen: Option<SocketAddr>,

    /// Global labels to add to all metrics
    #[serde(default)]
    pub global_labels: HashMap<String, String>,
}

/// Handle onto the installed recorder.
pub struct MetricsRegistry {
    enabled: bool,
    /// Present when metrics are rendered in-process rather than served.
    prometheus_handle: Option<PrometheusHandle>,
}

impl std::fmt::Debug for MetricsRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetricsRegistry")
            .field("enabled", &self.enabled)
            .field("prometheus_handle", &self.prometheus_handle.is_some())
            .finish()
    }
}

impl MetricsRegistry {
    /// A registry with no recorder installed.
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            prometheus_handle: None,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Render all metrics in Prometheus text format.
    pub fn render(&self) -> String {
        self.prometheus_handle
            .as_ref()
            .map(|h| h.render())
            .unwrap_or_default()
    }
}

/// Initialize the metrics subsystem.
///
/// # Errors
///
/// Returns an error if a recorder is already installed or the scrape
/// endpoint cannot be bound.
pub fn init_metrics(config: &MetricsConfig) -> anyhow::Result<MetricsRegistry> {
    if !config.enabled {
        return Ok(MetricsRegistry::disabled());
    }

    let mut builder = PrometheusBuilder::new();
    for (key, value) in &config.global_labels {
        builder = builder.add_global_label(key, value);
    }

    // The HTTP listener variant spawns its exporter on the current runtime.
    let handle = match config.listen {
        Some(addr) => {
            builder.with_http_listener(addr).install()?;
            None
        }
        None => Some(builder.install_recorder()?),
    };

    register_metric_descriptions();

    tracing::info!(listen = ?config.listen, "Metrics initialized");

    Ok(MetricsRegistry {
        enabled: true,
        prometheus_handle: handle,
    })
}

/// Register all metric descriptions.
fn register_metric_descriptions() {
    // Store metrics
    describe_counter!("eventlog_events_appended_total", "Total number of events appended");
    describe_counter!(
        "eventlog_append_conflicts_total",
        "Appends rejected because the expected version did not match"
    );
    describe_counter!("eventlog_errors_total", "Total number of logged errors by code");

    // Subscription metrics
    describe_counter!("eventlog_subscriptions_opened_total", "Total subscriptions opened");
    describe_gauge!("eventlog_active_subscriptions", "Subscriptions currently registered for live records");

    // Upcasting metrics
    describe_counter!("eventlog_events_upcast_total", "Stored records transformed by an upcaster chain");

    // Processor metrics
    describe_counter!("eventlog_events_processed_total", "Records handled by processors");
    describe_counter!("eventlog_processor_failures_total", "Processor runs aborted by an error");
    describe_gauge!("eventlog_checkpoint_position", "Last checkpointed position per processor");
    describe_histogram!(
        "eventlog_catch_up_duration_seconds",
        "Duration of a processor catch-up pass in seconds"
    );
}
