//! Detection invoker: the uniform call contract over the engine.
//!
//! Applies the configured confidence threshold and class filter, layers
//! IoU track association on top in tracking mode, and absorbs engine
//! failures into empty per-frame results so a flaky engine degrades the
//! output instead of killing the pipeline.

use std::sync::Arc;

use anyhow::{Context, Result};
use detect_core::{tracker::Tracker, Detector, RawDetection};
use tracing::warn;
use video_source::Frame;

use crate::config::Config;

/// Boxes (working-resolution pixels) plus tracker ids when in tracking
/// mode. `ids`, when present, is the same length as `boxes`.
#[derive(Clone, Debug, Default)]
pub struct EngineOutput {
    pub boxes: Vec<[i32; 4]>,
    pub ids: Option<Vec<i64>>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InferMode {
    /// Per-frame detection; no cross-frame identity.
    Stateless,
    /// Cross-frame identity via IoU association.
    Tracking,
}

#[derive(Clone, Debug)]
pub struct InvokerConfig {
    pub confidence: f32,
    pub iou: f32,
    /// Kept classes. Empty means keep everything.
    pub class_filter: Vec<i64>,
}

impl InvokerConfig {
    pub fn from_config(cfg: &Config) -> Self {
        Self {
            confidence: cfg.confidence,
            iou: cfg.iou,
            class_filter: cfg.class_filter.clone(),
        }
    }
}

/// Wraps one detector instance. Tracking state lives inside, so a fresh
/// invoker per pipeline run guarantees identifiers never leak across
/// unrelated runs.
pub struct DetectionInvoker {
    detector: Box<dyn Detector>,
    tracker: Option<Tracker>,
    cfg: InvokerConfig,
}

impl DetectionInvoker {
    pub fn new(detector: Box<dyn Detector>, mode: InferMode, cfg: InvokerConfig) -> Self {
        let tracker = match mode {
            InferMode::Tracking => Some(Tracker::new(cfg.iou)),
            InferMode::Stateless => None,
        };
        Self {
            detector,
            tracker,
            cfg,
        }
    }

    /// Run inference on one frame. Never fails: an engine error is logged
    /// and surfaces as an empty result for this frame only.
    pub fn infer(&mut self, frame: &Frame) -> EngineOutput {
        let raw = match self
            .detector
            .detect(&frame.data, frame.width, frame.height)
        {
            Ok(detections) => detections,
            Err(err) => {
                warn!("inference failed, emitting empty result: {err:#}");
                metrics::counter!("sightline_engine_failures_total").increment(1);
                return EngineOutput::default();
            }
        };

        let kept: Vec<RawDetection> = raw
            .into_iter()
            .filter(|det| {
                det.score >= self.cfg.confidence
                    && (self.cfg.class_filter.is_empty()
                        || self.cfg.class_filter.contains(&det.class_id))
            })
            .collect();

        let ids = self.tracker.as_mut().map(|tracker| tracker.update(&kept));
        let boxes = kept
            .iter()
            .map(|det| clamp_bbox(det.bbox, frame.width, frame.height))
            .collect();

        EngineOutput { boxes, ids }
    }
}

fn clamp_bbox(bbox: [f32; 4], width: i32, height: i32) -> [i32; 4] {
    let max_x = (width - 1).max(0) as f32;
    let max_y = (height - 1).max(0) as f32;
    [
        bbox[0].clamp(0.0, max_x).round() as i32,
        bbox[1].clamp(0.0, max_y).round() as i32,
        bbox[2].clamp(0.0, max_x).round() as i32,
        bbox[3].clamp(0.0, max_y).round() as i32,
    ]
}

/// Produces a fresh detector per pipeline run.
pub type DetectorFactory = Arc<dyn Fn() -> Result<Box<dyn Detector>> + Send + Sync>;

#[cfg(feature = "with-tch")]
pub fn detector_factory(cfg: &Config) -> DetectorFactory {
    let model_path = cfg.model_path.clone();
    let input_size = (cfg.working_size.0 as i64, cfg.working_size.1 as i64);
    Arc::new(move || {
        let detector = detect_core::TorchDetector::load(&model_path, input_size)
            .with_context(|| format!("failed to load detector from {}", model_path.display()))?;
        Ok(Box::new(detector) as Box<dyn Detector>)
    })
}

/// Built without a detector backend: emit empty detections so the
/// delivery pipeline stays demonstrable end to end.
#[cfg(not(feature = "with-tch"))]
pub fn detector_factory(_cfg: &Config) -> DetectorFactory {
    warn!("no detector backend compiled in (enable `with-tch`); detections will be empty");
    Arc::new(|| Ok(Box::new(NoopDetector) as Box<dyn Detector>))
}

#[cfg(not(feature = "with-tch"))]
struct NoopDetector;

#[cfg(not(feature = "with-tch"))]
impl Detector for NoopDetector {
    fn detect(&mut self, _bgr: &[u8], _width: i32, _height: i32) -> Result<Vec<RawDetection>> {
        Ok(Vec::new())
    }
}

/// One-shot startup probe: a consistently failing engine is a fatal
/// startup condition, not a per-frame concern.
pub fn probe_engine(factory: &DetectorFactory, working_size: (i32, i32)) -> Result<()> {
    let mut detector = factory().context("detection engine failed to initialise")?;
    let probe = video_source::placeholder_frame(working_size.0, working_size.1);
    detector
        .detect(&probe.data, probe.width, probe.height)
        .context("detection engine failed its startup probe")?;
    Ok(())
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use std::collections::VecDeque;

    /// Scripted detector: pops one pre-programmed frame result per call.
    /// Repeats the last entry once the script runs out.
    pub struct ScriptedDetector {
        script: VecDeque<Vec<RawDetection>>,
        last: Vec<RawDetection>,
    }

    impl ScriptedDetector {
        pub fn new(script: Vec<Vec<RawDetection>>) -> Self {
            Self {
                script: script.into(),
                last: Vec::new(),
            }
        }
    }

    impl Detector for ScriptedDetector {
        fn detect(&mut self, _bgr: &[u8], _w: i32, _h: i32) -> Result<Vec<RawDetection>> {
            if let Some(next) = self.script.pop_front() {
                self.last = next;
            }
            Ok(self.last.clone())
        }
    }

    pub struct FailingDetector;

    impl Detector for FailingDetector {
        fn detect(&mut self, _bgr: &[u8], _w: i32, _h: i32) -> Result<Vec<RawDetection>> {
            anyhow::bail!("engine exploded")
        }
    }

    pub fn det(bbox: [f32; 4], score: f32, class_id: i64) -> RawDetection {
        RawDetection {
            bbox,
            score,
            class_id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;

    fn frame() -> Frame {
        video_source::placeholder_frame(100, 80)
    }

    fn cfg() -> InvokerConfig {
        InvokerConfig {
            confidence: 0.4,
            iou: 0.5,
            class_filter: vec![0],
        }
    }

    #[test]
    fn applies_confidence_and_class_filter() {
        let detector = ScriptedDetector::new(vec![vec![
            det([0.0, 0.0, 10.0, 10.0], 0.9, 0),
            det([0.0, 0.0, 10.0, 10.0], 0.2, 0),  // below threshold
            det([20.0, 20.0, 30.0, 30.0], 0.9, 3), // filtered class
        ]]);
        let mut invoker = DetectionInvoker::new(Box::new(detector), InferMode::Stateless, cfg());
        let out = invoker.infer(&frame());
        assert_eq!(out.boxes.len(), 1);
        assert!(out.ids.is_none());
    }

    #[test]
    fn tracking_mode_returns_matching_length_ids() {
        let detector = ScriptedDetector::new(vec![
            vec![det([0.0, 0.0, 10.0, 10.0], 0.9, 0)],
            vec![
                det([1.0, 0.0, 11.0, 10.0], 0.9, 0),
                det([50.0, 50.0, 70.0, 70.0], 0.9, 0),
            ],
        ]);
        let mut invoker = DetectionInvoker::new(Box::new(detector), InferMode::Tracking, cfg());
        let first = invoker.infer(&frame());
        let second = invoker.infer(&frame());
        assert_eq!(first.ids.as_deref(), Some(&[1][..]));
        assert_eq!(second.ids.as_deref(), Some(&[1, 2][..]));
    }

    #[test]
    fn engine_failure_yields_empty_output() {
        let mut invoker =
            DetectionInvoker::new(Box::new(FailingDetector), InferMode::Tracking, cfg());
        let out = invoker.infer(&frame());
        assert!(out.boxes.is_empty());
        assert!(out.ids.is_none());
    }

    #[test]
    fn boxes_are_clamped_to_frame_bounds() {
        let detector = ScriptedDetector::new(vec![vec![det(
            [-5.0, -5.0, 500.0, 500.0],
            0.9,
            0,
        )]]);
        let mut invoker = DetectionInvoker::new(Box::new(detector), InferMode::Stateless, cfg());
        let out = invoker.infer(&frame());
        assert_eq!(out.boxes[0], [0, 0, 99, 79]);
    }
}
