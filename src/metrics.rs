use std::net::SocketAddr;

use metrics::{counter, gauge};
use metrics_exporter_prometheus::PrometheusBuilder;

/// Install the Prometheus recorder, optionally serving a scrape endpoint,
/// and pre-register the engine's metrics so they appear before first use.
///
/// Safe to call when a recorder is already installed (tests): the
/// installation error is ignored and counters become no-ops.
pub fn init_metrics(listen: Option<SocketAddr>) {
    let result = match listen {
        Some(addr) => PrometheusBuilder::new()
            .with_http_listener(addr)
            .install()
            .map_err(|e| e.to_string()),
        None => PrometheusBuilder::new()
            .install_recorder()
            .map(|_| ())
            .map_err(|e| e.to_string()),
    };
    if let Err(e) = result {
        tracing::debug!(error = %e, "Prometheus recorder already installed");
    }

    counter!("fills_observed_total").absolute(0);
    counter!("mirrors_executed_total").absolute(0);
    counter!("mirrors_rejected_total").absolute(0);
    counter!("mirrors_failed_total").absolute(0);
    counter!("mirrors_skipped_total").absolute(0);

    gauge!("global_exposure_usd").set(0.0);
    gauge!("enabled_leaders").set(0.0);
}
