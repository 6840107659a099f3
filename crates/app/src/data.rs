//! Shared structs passed between pipeline stages and transports.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// One detected object. `id` is a tracker identifier in tracking mode or
/// a synthetic 1-based index in stateless mode.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Detection {
    pub id: i64,
    /// (x1, y1, x2, y2) in working-resolution pixels.
    pub bbox: [i32; 4],
}

/// Canonical per-frame payload consumed by every transport.
///
/// `count` deduplicates tracker ids; with synthetic ids it equals the
/// number of detections.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DetectionEvent {
    pub count: usize,
    pub detections: Vec<Detection>,
}

/// Annotated copy of a frame, ready for human-facing transports.
#[derive(Clone)]
pub struct AnnotatedFrame {
    pub width: u32,
    pub height: u32,
    /// Packed RGB8, row-major. Consumed by the WebRTC media encoder.
    pub rgb: Bytes,
    /// Self-contained JPEG. Consumed by MJPEG and snapshot transports.
    pub jpeg: Bytes,
}

/// One processed pipeline result fanned out to all subscribed consumers.
pub struct FrameUpdate {
    /// Strictly increasing within a pipeline run, no gaps.
    pub sequence: u64,
    pub timestamp_ms: i64,
    pub event: DetectionEvent,
    pub frame: AnnotatedFrame,
    /// True while no physical source is reachable.
    pub placeholder: bool,
}

pub type Update = std::sync::Arc<FrameUpdate>;

/// Per-frame count entry of a batch report.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct FrameCount {
    pub frame: u64,
    pub count: usize,
}

/// Aggregate result of batch video analysis.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BatchReport {
    pub frames_processed: u64,
    pub unique_object_count: usize,
    pub frame_wise_counts: Vec<FrameCount>,
    pub output_path: String,
}

/// Result of single-image analysis.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ImageReport {
    pub count: usize,
    pub detections: Vec<Detection>,
    pub annotated_jpeg_base64: String,
}

/// WebRTC signaling payloads: session description plus a type tag.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SessionOffer {
    pub sdp: String,
    #[serde(rename = "type")]
    pub kind: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SessionAnswer {
    pub sdp: String,
    #[serde(rename = "type")]
    pub kind: String,
}
