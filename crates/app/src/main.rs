mod annotate;
mod batch;
mod config;
mod data;
mod error;
mod hub;
mod invoker;
mod payload;
mod server;
mod state;
mod telemetry;
#[cfg(feature = "webrtc")]
mod webrtc;

use std::sync::Arc;

use anyhow::Result;
use tracing::info;

use crate::config::Config;
use crate::hub::{HubConfig, SourceOpener, StreamHub};
use crate::server::AppState;
use crate::state::SharedDetectionState;

fn main() {
    if let Err(err) = run() {
        eprintln!("{err:?}");
        std::process::exit(1);
    }
}

#[actix_web::main]
async fn run() -> Result<()> {
    telemetry::init_tracing();
    telemetry::init_metrics_recorder();

    let args: Vec<String> = std::env::args().collect();
    let cfg = Arc::new(Config::from_args(&args)?);

    let factory = invoker::detector_factory(&cfg);
    // A detector that cannot start is a deployment fault, not something
    // to degrade around at request time.
    invoker::probe_engine(&factory, cfg.working_size)?;

    let source_cfg = cfg.source_config();
    let opener: SourceOpener = Arc::new(move || video_source::open_live_source(&source_cfg));

    let detections = SharedDetectionState::new();
    let hub = StreamHub::new(
        opener,
        factory.clone(),
        detections.clone(),
        HubConfig::from_config(&cfg),
    );

    let state = AppState {
        #[cfg(feature = "webrtc")]
        sessions: webrtc::SessionManager::new(hub.clone(), cfg.target_fps),
        hub,
        detections,
        cfg: cfg.clone(),
        factory,
    };

    info!("listening on {}", cfg.bind_addr);
    server::run(state, &cfg.bind_addr).await?;
    Ok(())
}
