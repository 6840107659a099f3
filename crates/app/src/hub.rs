//! Stream multiplexer: one capture-and-inference pipeline fanned out to
//! every live consumer over a broadcast channel.
//!
//! The pipeline run exists only while someone is watching. The first
//! `subscribe()` spawns the run thread; when the receiver count reaches
//! zero the run releases its capture handle and exits within one cycle.
//! A later `subscribe()` respawns a fresh run with a fresh invoker, so
//! tracker identities never leak across runs.

use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::Duration;

use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};
use video_source::{FrameSource, ReadOutcome, SourceError};

use crate::annotate;
use crate::config::Config;
use crate::data::{AnnotatedFrame, FrameUpdate, Update};
use crate::invoker::{DetectionInvoker, DetectorFactory, InferMode, InvokerConfig};
use crate::payload;
use crate::state::SharedDetectionState;

/// Opens the live source. Injected so pipeline behaviour is testable
/// without a camera.
pub type SourceOpener =
    Arc<dyn Fn() -> Result<Box<dyn FrameSource>, SourceError> + Send + Sync>;

#[derive(Clone)]
pub struct HubConfig {
    pub working_size: (i32, i32),
    pub invoker: InvokerConfig,
    pub placeholder_interval: Duration,
    pub reconnect_backoff: Duration,
    pub fanout_capacity: usize,
}

impl HubConfig {
    pub fn from_config(cfg: &Config) -> Self {
        Self {
            working_size: cfg.working_size,
            invoker: InvokerConfig::from_config(cfg),
            placeholder_interval: crate::config::PLACEHOLDER_INTERVAL,
            reconnect_backoff: crate::config::RECONNECT_BACKOFF,
            fanout_capacity: crate::config::FANOUT_CAPACITY,
        }
    }
}

pub struct StreamHub {
    inner: Arc<Mutex<HubInner>>,
    opener: SourceOpener,
    factory: DetectorFactory,
    state: SharedDetectionState,
    cfg: HubConfig,
}

#[derive(Default)]
struct HubInner {
    sender: Option<broadcast::Sender<Update>>,
    generation: u64,
}

impl StreamHub {
    pub fn new(
        opener: SourceOpener,
        factory: DetectorFactory,
        state: SharedDetectionState,
        cfg: HubConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            inner: Arc::new(Mutex::new(HubInner::default())),
            opener,
            factory,
            state,
            cfg,
        })
    }

    /// Attach a consumer, starting the pipeline run if none is active.
    /// Consumers that fall behind the channel capacity observe a
    /// `Lagged` gap and resume at the newest update.
    pub fn subscribe(&self) -> broadcast::Receiver<Update> {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(sender) = &inner.sender {
            return sender.subscribe();
        }

        let (tx, rx) = broadcast::channel(self.cfg.fanout_capacity);
        inner.generation = inner.generation.wrapping_add(1);
        inner.sender = Some(tx.clone());
        let run = PipelineRun {
            generation: inner.generation,
            tx,
            inner: self.inner.clone(),
            opener: self.opener.clone(),
            factory: self.factory.clone(),
            state: self.state.clone(),
            cfg: self.cfg.clone(),
        };
        let spawned = thread::Builder::new()
            .name("sightline-pipeline".into())
            .spawn(move || run.run());
        if let Err(err) = spawned {
            // No producer exists. Roll the registration back so the
            // channel closes and a later subscribe starts fresh.
            error!("failed to spawn pipeline thread: {err}");
            inner.sender = None;
            inner.generation = inner.generation.wrapping_sub(1);
        }
        rx
    }

    #[cfg(test)]
    pub(crate) fn is_running(&self) -> bool {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .sender
            .is_some()
    }
}

struct PipelineRun {
    generation: u64,
    tx: broadcast::Sender<Update>,
    inner: Arc<Mutex<HubInner>>,
    opener: SourceOpener,
    factory: DetectorFactory,
    state: SharedDetectionState,
    cfg: HubConfig,
}

impl PipelineRun {
    fn run(self) {
        let mut invoker = match (self.factory)() {
            Ok(detector) => {
                DetectionInvoker::new(detector, InferMode::Tracking, self.cfg.invoker.clone())
            }
            Err(err) => {
                error!("detector unavailable for this run: {err:#}");
                self.retire();
                return;
            }
        };

        let mut sequence: u64 = 0;
        let mut source: Option<Box<dyn FrameSource>> = None;
        let mut placeholder: Option<AnnotatedFrame> = None;
        let mut was_unavailable = false;

        debug!(generation = self.generation, "pipeline run starting");

        loop {
            if self.idle() {
                debug!("last consumer left; releasing capture handle");
                return;
            }

            if source.is_none() {
                match (self.opener)() {
                    Ok(handle) => {
                        info!("capture source opened");
                        was_unavailable = false;
                        source = Some(handle);
                    }
                    Err(err) => {
                        if !was_unavailable {
                            warn!("source unavailable, publishing placeholders: {err}");
                            was_unavailable = true;
                        }
                        sequence += 1;
                        self.publish_placeholder(sequence, &mut placeholder);
                        thread::sleep(self.cfg.placeholder_interval);
                        continue;
                    }
                }
            }

            let outcome = match source.as_mut() {
                Some(handle) => handle.read(),
                None => continue,
            };

            match outcome {
                ReadOutcome::Frame(frame) => {
                    let output = invoker.infer(&frame);
                    let event = payload::build_event(&output);
                    let annotated = match annotate::annotate(&frame, &output) {
                        Ok(annotated) => annotated,
                        Err(err) => {
                            error!("annotation failed, skipping frame: {err:#}");
                            continue;
                        }
                    };
                    sequence += 1;
                    self.state.store(event.clone());
                    let update = Arc::new(FrameUpdate {
                        sequence,
                        timestamp_ms: frame.timestamp_ms,
                        event,
                        frame: annotated,
                        placeholder: false,
                    });
                    let _ = self.tx.send(update);
                    metrics::counter!("sightline_frames_published_total").increment(1);
                    metrics::gauge!("sightline_stream_consumers")
                        .set(self.tx.receiver_count() as f64);
                }
                ReadOutcome::EndOfStream => {
                    info!("source reached end of stream");
                    self.retire();
                    return;
                }
                ReadOutcome::Error(err) => {
                    warn!("frame read failed, reopening source: {err}");
                    metrics::counter!("sightline_source_reconnects_total").increment(1);
                    source = None;
                    thread::sleep(self.cfg.reconnect_backoff);
                }
            }
        }
    }

    /// True when the run should stop because nobody is listening. The
    /// receiver count is re-checked under the hub lock so a subscriber
    /// arriving concurrently keeps the run alive.
    fn idle(&self) -> bool {
        if self.tx.receiver_count() > 0 {
            return false;
        }
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        if inner.generation == self.generation && self.tx.receiver_count() == 0 {
            inner.sender = None;
            true
        } else {
            false
        }
    }

    /// Mark this run dead so the next `subscribe()` respawns.
    fn retire(&self) {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        if inner.generation == self.generation {
            inner.sender = None;
        }
    }

    fn publish_placeholder(&self, sequence: u64, cache: &mut Option<AnnotatedFrame>) {
        let frame = match cache {
            Some(frame) => frame.clone(),
            None => match annotate::placeholder(self.cfg.working_size.0, self.cfg.working_size.1)
            {
                Ok(frame) => {
                    *cache = Some(frame.clone());
                    frame
                }
                Err(err) => {
                    error!("failed to render placeholder frame: {err:#}");
                    return;
                }
            },
        };
        self.state.store(payload::empty_event());
        let update = Arc::new(FrameUpdate {
            sequence,
            timestamp_ms: chrono::Utc::now().timestamp_millis(),
            event: payload::empty_event(),
            frame,
            placeholder: true,
        });
        let _ = self.tx.send(update);
        metrics::counter!("sightline_placeholder_frames_total").increment(1);
    }
}
