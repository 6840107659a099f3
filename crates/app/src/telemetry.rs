//! Tracing subscriber and Prometheus metrics wiring.

use std::{sync::OnceLock, thread, time::Duration};

use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

static PROM_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Install the global tracing subscriber. `RUST_LOG` overrides the
/// default `info` level.
pub fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::registry()
        .with(fmt::layer().with_target(false))
        .with(env_filter)
        .try_init();
}

/// Ensure the global metrics recorder is installed and return the
/// Prometheus render handle. Idempotent.
pub fn init_metrics_recorder() -> &'static PrometheusHandle {
    PROM_HANDLE.get_or_init(|| {
        let recorder = PrometheusBuilder::new().build_recorder();
        let handle = recorder.handle();

        if metrics::set_global_recorder(recorder).is_err() {
            tracing::warn!("metrics recorder already installed; keeping the existing one");
        }

        let upkeep_handle = handle.clone();
        let _ = thread::Builder::new()
            .name("prometheus-upkeep".into())
            .spawn(move || loop {
                thread::sleep(Duration::from_secs(5));
                upkeep_handle.run_upkeep();
            });

        handle
    })
}
