//! OpenCV-backed live and file sources.

use anyhow::anyhow;
use chrono::Utc;
use opencv::{
    core::{self, Mat, MatTraitConstManual},
    prelude::*,
    videoio::{self, VideoCapture, VideoCaptureTrait, VideoCaptureTraitConst},
};
use tracing::{debug, warn};

use crate::{
    Frame, FrameSource, LiveSourceConfig, ReadError, ReadOutcome, SourceError,
};

/// Live capture handle that resizes every frame to the working resolution.
struct LiveSource {
    capture: VideoCapture,
    target_size: (i32, i32),
    scratch: Mat,
}

impl FrameSource for LiveSource {
    fn read(&mut self) -> ReadOutcome {
        let mut raw = Mat::default();
        match self.capture.read(&mut raw) {
            Ok(true) => {}
            // A live source never legitimately ends; a failed grab is a
            // dropped connection and the owner should reopen.
            Ok(false) => return ReadOutcome::Error(ReadError::Capture("frame grab failed".into())),
            Err(err) => return ReadOutcome::Error(ReadError::Capture(err.to_string())),
        }
        mat_to_frame(&raw, self.target_size, &mut self.scratch)
    }
}

/// Finite file-backed source for batch analysis. End-of-stream is terminal.
pub struct FileSource {
    capture: VideoCapture,
    metadata: VideoMetadata,
}

/// Container properties of an opened video file.
#[derive(Clone, Copy, Debug)]
pub struct VideoMetadata {
    pub width: i32,
    pub height: i32,
    pub fps: f64,
}

impl FileSource {
    pub fn metadata(&self) -> VideoMetadata {
        self.metadata
    }
}

impl FrameSource for FileSource {
    fn read(&mut self) -> ReadOutcome {
        let mut raw = Mat::default();
        match self.capture.read(&mut raw) {
            Ok(true) => {}
            Ok(false) => return ReadOutcome::EndOfStream,
            Err(err) => return ReadOutcome::Error(ReadError::Capture(err.to_string())),
        }
        let size = (self.metadata.width, self.metadata.height);
        let mut scratch = Mat::default();
        mat_to_frame(&raw, size, &mut scratch)
    }
}

pub(crate) fn open_live(cfg: &LiveSourceConfig) -> Result<Box<dyn FrameSource>, SourceError> {
    if let Some(uri) = cfg.stream_uri.as_deref() {
        debug!("trying network stream {uri}");
        match VideoCapture::from_file(uri, videoio::CAP_FFMPEG) {
            Ok(mut capture) => {
                if capture.is_opened().unwrap_or(false) {
                    // Keep the driver buffer shallow so reads stay close to live.
                    let _ = capture.set(videoio::CAP_PROP_BUFFERSIZE, 1.0);
                    return Ok(Box::new(LiveSource {
                        capture,
                        target_size: cfg.target_size,
                        scratch: Mat::default(),
                    }));
                }
                let _ = capture.release();
            }
            Err(err) => warn!("stream open failed: {err}"),
        }
    }

    debug!("falling back to local device #{}", cfg.device_index);
    for backend in [videoio::CAP_V4L, videoio::CAP_ANY] {
        match VideoCapture::new(cfg.device_index, backend) {
            Ok(capture) => {
                if capture.is_opened().unwrap_or(false) {
                    return Ok(Box::new(LiveSource {
                        capture,
                        target_size: cfg.target_size,
                        scratch: Mat::default(),
                    }));
                }
            }
            Err(err) => {
                warn!(
                    "device #{} open failed with backend {backend}: {err}",
                    cfg.device_index
                );
            }
        }
    }

    Err(SourceError::Unavailable {
        stream: cfg.stream_uri.clone(),
        device: cfg.device_index,
    })
}

/// Open a finite video file at its native resolution.
pub fn open_file_source(path: &std::path::Path) -> Result<FileSource, SourceError> {
    let capture = VideoCapture::from_file(&path.to_string_lossy(), videoio::CAP_ANY)
        .map_err(|err| SourceError::Other(anyhow!(err)))?;
    if !capture.is_opened().unwrap_or(false) {
        return Err(SourceError::Undecodable(path.display().to_string()));
    }

    let width = capture
        .get(videoio::CAP_PROP_FRAME_WIDTH)
        .unwrap_or(0.0) as i32;
    let height = capture
        .get(videoio::CAP_PROP_FRAME_HEIGHT)
        .unwrap_or(0.0) as i32;
    let fps = match capture.get(videoio::CAP_PROP_FPS) {
        Ok(fps) if fps.is_finite() && fps > 0.0 => fps,
        _ => 25.0,
    };

    Ok(FileSource {
        capture,
        metadata: VideoMetadata { width, height, fps },
    })
}

fn mat_to_frame(raw: &Mat, target_size: (i32, i32), scratch: &mut Mat) -> ReadOutcome {
    let size = match raw.size() {
        Ok(size) => size,
        Err(err) => return ReadOutcome::Error(ReadError::Capture(err.to_string())),
    };
    if size.width <= 0 || size.height <= 0 {
        return ReadOutcome::Error(ReadError::Capture("empty frame".into()));
    }

    let (target_w, target_h) = target_size;
    let working: &Mat = if size.width != target_w || size.height != target_h {
        if let Err(err) = opencv::imgproc::resize(
            raw,
            scratch,
            core::Size {
                width: target_w,
                height: target_h,
            },
            0.0,
            0.0,
            opencv::imgproc::INTER_LINEAR,
        ) {
            return ReadOutcome::Error(ReadError::Capture(err.to_string()));
        }
        scratch
    } else {
        raw
    };

    let data = match working.data_bytes() {
        Ok(bytes) => bytes.to_vec(),
        Err(err) => return ReadOutcome::Error(ReadError::Capture(err.to_string())),
    };
    let expected = Frame::expected_len(target_w, target_h);
    if data.len() != expected {
        return ReadOutcome::Error(ReadError::Malformed {
            got: data.len(),
            expected,
        });
    }

    ReadOutcome::Frame(Frame {
        data,
        width: target_w,
        height: target_h,
        timestamp_ms: Utc::now().timestamp_millis(),
    })
}
