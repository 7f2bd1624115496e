use std::net::SocketAddr;

use tracing_subscriber::EnvFilter;

/// Install the global fmt subscriber. `RUST_LOG` takes precedence over
/// `default_filter`. A second call is a no-op.
pub fn init_tracing(default_filter: &str) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_filter));
    if let Err(err) = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .compact()
        .try_init()
    {
        tracing::debug!(error = %err, "Tracing subscriber already installed");
    }
}

#[cfg(feature = "metrics-exporter")]
pub fn init_metrics(listen: SocketAddr) -> Result<(), metrics_exporter_prometheus::BuildError> {
    use metrics_exporter_prometheus::PrometheusBuilder;

    PrometheusBuilder::new()
        .with_http_listener(listen)
        .install()?;

    tracing::info!(%listen, "Prometheus exporter listening");
    metrics::gauge!("ladderx_up").set(1.0);
    Ok(())
}

#[cfg(not(feature = "metrics-exporter"))]
pub fn init_metrics(listen: SocketAddr) -> Result<(), std::convert::Infallible> {
    tracing::debug!(%listen, "Built without metrics-exporter, metrics stay in-process");
    Ok(())
}
