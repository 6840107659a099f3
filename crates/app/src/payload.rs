//! Canonical payload construction.
//!
//! Pure and deterministic: identical invoker output always yields an
//! identical [`DetectionEvent`], which makes the count/id invariants
//! directly testable.

use crate::data::{Detection, DetectionEvent};
use crate::invoker::EngineOutput;

/// Build the canonical event from invoker output.
///
/// With tracker ids the count is the number of *distinct* ids (a tracker
/// may report the same object twice in one frame); without ids each box
/// receives a synthetic 1-based id in encounter order and the count is
/// the number of boxes.
pub fn build_event(output: &EngineOutput) -> DetectionEvent {
    match &output.ids {
        Some(ids) => {
            let detections: Vec<Detection> = output
                .boxes
                .iter()
                .zip(ids.iter())
                .map(|(bbox, &id)| Detection { id, bbox: *bbox })
                .collect();
            let mut seen = Vec::with_capacity(ids.len());
            for &id in ids {
                if !seen.contains(&id) {
                    seen.push(id);
                }
            }
            DetectionEvent {
                count: seen.len(),
                detections,
            }
        }
        None => {
            let detections: Vec<Detection> = output
                .boxes
                .iter()
                .enumerate()
                .map(|(idx, bbox)| Detection {
                    id: idx as i64 + 1,
                    bbox: *bbox,
                })
                .collect();
            DetectionEvent {
                count: detections.len(),
                detections,
            }
        }
    }
}

/// Zero-valued event emitted before any frame was processed and during
/// source-unavailable placeholder cadence.
pub fn empty_event() -> DetectionEvent {
    DetectionEvent::default()
}
