//! Shared latest-detection snapshot for the polling endpoint.

use std::sync::{Arc, Mutex};

use crate::data::DetectionEvent;

/// Latest published detection event. Readers always see a complete event,
/// never a partially written one, and never an error: before the first
/// frame this reads as the zero event.
#[derive(Clone, Default)]
pub struct SharedDetectionState {
    inner: Arc<Mutex<DetectionEvent>>,
}

impl SharedDetectionState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn store(&self, event: DetectionEvent) {
        if let Ok(mut slot) = self.inner.lock() {
            *slot = event;
        }
    }

    pub fn snapshot(&self) -> DetectionEvent {
        match self.inner.lock() {
            Ok(slot) => slot.clone(),
            Err(_) => DetectionEvent::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::Detection;

    #[test]
    fn starts_at_zero_event() {
        let state = SharedDetectionState::new();
        let event = state.snapshot();
        assert_eq!(event.count, 0);
        assert!(event.detections.is_empty());
    }

    #[test]
    fn store_then_snapshot_round_trips() {
        let state = SharedDetectionState::new();
        state.store(DetectionEvent {
            count: 2,
            detections: vec![
                Detection {
                    id: 7,
                    bbox: [1, 2, 3, 4],
                },
                Detection {
                    id: 9,
                    bbox: [5, 6, 7, 8],
                },
            ],
        });
        let event = state.snapshot();
        assert_eq!(event.count, 2);
        assert_eq!(event.detections[1].id, 9);
    }

    #[test]
    fn clones_share_the_same_slot() {
        let state = SharedDetectionState::new();
        let alias = state.clone();
        state.store(DetectionEvent {
            count: 1,
            detections: vec![Detection {
                id: 1,
                bbox: [0, 0, 10, 10],
            }],
        });
        assert_eq!(alias.snapshot().count, 1);
    }
}
