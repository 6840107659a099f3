//! Frame acquisition for the detection pipeline.
//!
//! A [`FrameSource`] hands out BGR8 frames one at a time and reports
//! end-of-stream and read faults separately so callers can tell a finite
//! file running out from a camera dropping the connection. The OpenCV
//! backed sources live behind the `opencv` feature; without it the crate
//! still provides the frame type, the source contract, and placeholder
//! frame synthesis so the rest of the pipeline can run (and be tested)
//! backend-free.

use thiserror::Error;

#[cfg(feature = "opencv")]
mod capture;
#[cfg(feature = "opencv")]
mod writer;

#[cfg(feature = "opencv")]
pub use capture::{open_file_source, FileSource, VideoMetadata};
#[cfg(feature = "opencv")]
pub use writer::VideoArtifactWriter;

/// Raw BGR8 frame captured from a video source.
#[derive(Clone)]
pub struct Frame {
    pub data: Vec<u8>,
    pub width: i32,
    pub height: i32,
    pub timestamp_ms: i64,
}

impl Frame {
    /// Byte length a well-formed BGR8 buffer must have.
    pub fn expected_len(width: i32, height: i32) -> usize {
        (width.max(0) as usize) * (height.max(0) as usize) * 3
    }
}

/// Outcome of a single read from a [`FrameSource`].
pub enum ReadOutcome {
    Frame(Frame),
    /// Finite source exhausted. Terminal; do not reconnect.
    EndOfStream,
    /// Transient fault. The owner should release the handle and reopen.
    Error(ReadError),
}

#[derive(Debug, Error)]
pub enum ReadError {
    #[error("capture read failed: {0}")]
    Capture(String),
    #[error("capture produced a malformed buffer ({got} bytes, expected {expected})")]
    Malformed { got: usize, expected: usize },
}

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("no frame source reachable (stream: {stream:?}, device index: {device})")]
    Unavailable { stream: Option<String>, device: i32 },
    #[error("not a decodable video: {0}")]
    Undecodable(String),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Pull-based frame producer. Exactly one owner calls `read` at a time;
/// the handle owns the physical capture resource and releases it on drop.
pub trait FrameSource: Send {
    fn read(&mut self) -> ReadOutcome;
}

/// Where frames should come from and at what working resolution.
#[derive(Clone, Debug)]
pub struct LiveSourceConfig {
    /// Network stream URI tried first (e.g. `rtsp://...`). `None` skips
    /// straight to the local device.
    pub stream_uri: Option<String>,
    /// Local capture device index tried when the stream is unreachable.
    pub device_index: i32,
    /// Frames are resized to this (width, height) on read.
    pub target_size: (i32, i32),
}

/// Open a live source with ordered fallback: network stream first, local
/// device second. Returns [`SourceError::Unavailable`] when neither opens;
/// the caller degrades to placeholder cadence rather than failing.
#[cfg(feature = "opencv")]
pub fn open_live_source(cfg: &LiveSourceConfig) -> Result<Box<dyn FrameSource>, SourceError> {
    capture::open_live(cfg)
}

/// Built without a capture backend every source is unavailable; the
/// pipeline still runs on placeholder frames.
#[cfg(not(feature = "opencv"))]
pub fn open_live_source(cfg: &LiveSourceConfig) -> Result<Box<dyn FrameSource>, SourceError> {
    Err(SourceError::Unavailable {
        stream: cfg.stream_uri.clone(),
        device: cfg.device_index,
    })
}

/// Luma value of the synthesized placeholder background.
const PLACEHOLDER_SHADE: u8 = 24;

/// Synthesize a flat dark frame emitted while no source is reachable.
/// The annotator stamps the human-readable banner on top.
pub fn placeholder_frame(width: i32, height: i32) -> Frame {
    Frame {
        data: vec![PLACEHOLDER_SHADE; Frame::expected_len(width, height)],
        width,
        height,
        timestamp_ms: chrono::Utc::now().timestamp_millis(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn placeholder_has_well_formed_buffer() {
        let frame = placeholder_frame(64, 48);
        assert_eq!(frame.data.len(), Frame::expected_len(64, 48));
        assert!(frame.data.iter().all(|&b| b == PLACEHOLDER_SHADE));
    }

    #[cfg(not(feature = "opencv"))]
    #[test]
    fn live_open_without_backend_reports_unavailable() {
        let cfg = LiveSourceConfig {
            stream_uri: Some("rtsp://example/stream".into()),
            device_index: 0,
            target_size: (640, 360),
        };
        assert!(matches!(
            open_live_source(&cfg),
            Err(SourceError::Unavailable { .. })
        ));
    }
}
