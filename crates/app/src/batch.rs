//! Batch analysis of uploaded media: whole videos and single images.
//!
//! Batch work never touches the live pipeline. Each request gets its own
//! disposable invoker, so tracker identities are scoped to one upload.

use std::collections::BTreeSet;

use anyhow::Result;
#[cfg(feature = "with-opencv")]
use anyhow::Context;
use base64::Engine;
use image::{imageops::FilterType, ImageBuffer, Rgb};
#[cfg(feature = "with-opencv")]
use tracing::{debug, warn};
use video_source::{Frame, FrameSource, ReadOutcome};

use crate::annotate;
use crate::config::Config;
use crate::data::{AnnotatedFrame, BatchReport, FrameCount, ImageReport};
use crate::error::ServiceError;
use crate::invoker::{DetectionInvoker, DetectorFactory, EngineOutput, InferMode, InvokerConfig};
use crate::payload;

/// Receives each processed frame: the BGR pixels restored to the target
/// resolution plus the annotated RGB/JPEG pair. Abstracted from the
/// container writer so the loop is testable and so the same loop can
/// feed a live multipart stream.
pub(crate) trait AnnotatedSink {
    fn write(&mut self, frame: &Frame, annotated: &AnnotatedFrame) -> Result<()>;
}

pub(crate) struct BatchOutcome {
    pub frames_processed: u64,
    pub unique_object_count: usize,
    pub frame_wise_counts: Vec<FrameCount>,
}

/// Drive a finite source through the detection loop: resize each frame to
/// the working resolution, infer, accumulate per-frame counts and the
/// union of identifiers, then hand the annotated frame back at native
/// resolution. A read fault mid-file aborts the whole analysis.
pub(crate) fn run_batch(
    source: &mut dyn FrameSource,
    invoker: &mut DetectionInvoker,
    working_size: (i32, i32),
    native_size: (i32, i32),
    sink: &mut dyn AnnotatedSink,
) -> Result<BatchOutcome, ServiceError> {
    let mut frames_processed: u64 = 0;
    let mut seen_ids: BTreeSet<i64> = BTreeSet::new();
    let mut frame_wise_counts = Vec::new();

    loop {
        let frame = match source.read() {
            ReadOutcome::Frame(frame) => frame,
            ReadOutcome::EndOfStream => break,
            ReadOutcome::Error(err) => {
                return Err(ServiceError::ReadFailure(err.to_string()));
            }
        };

        let working = resize_bgr(&frame, working_size);
        let output = invoker.infer(&working);
        let event = payload::build_event(&output);
        for detection in &event.detections {
            seen_ids.insert(detection.id);
        }

        let annotated = annotate::annotate(&working, &output).map_err(ServiceError::Internal)?;
        let bgr = rgb_to_bgr_frame(&annotated.rgb, working_size, frame.timestamp_ms);
        let restored = resize_bgr(&bgr, native_size);
        sink.write(&restored, &annotated).map_err(ServiceError::Internal)?;

        frames_processed += 1;
        frame_wise_counts.push(FrameCount {
            frame: frames_processed,
            count: event.count,
        });
    }

    Ok(BatchOutcome {
        frames_processed,
        unique_object_count: seen_ids.len(),
        frame_wise_counts,
    })
}

/// Analyze an uploaded video end to end, producing the processed artifact
/// and the aggregate report. The upload is spooled to a temp file that is
/// removed on every exit path.
#[cfg(feature = "with-opencv")]
pub fn analyze_video(
    upload: &[u8],
    cfg: &Config,
    factory: &DetectorFactory,
) -> Result<BatchReport, ServiceError> {
    use std::io::Write as _;

    let mut spool = tempfile::NamedTempFile::new()
        .context("failed to create spool file")
        .map_err(ServiceError::Internal)?;
    spool
        .write_all(upload)
        .context("failed to spool upload")
        .map_err(ServiceError::Internal)?;

    let mut source = match video_source::open_file_source(spool.path()) {
        Ok(source) => source,
        Err(video_source::SourceError::Undecodable(path)) => {
            return Err(ServiceError::DecodeFailure(path));
        }
        Err(err) => return Err(ServiceError::Internal(err.into())),
    };
    let metadata = source.metadata();
    if metadata.width <= 0 || metadata.height <= 0 {
        return Err(ServiceError::DecodeFailure(
            "video reports no frame dimensions".into(),
        ));
    }

    std::fs::create_dir_all(&cfg.artifact_dir)
        .context("failed to create artifact directory")
        .map_err(ServiceError::Internal)?;
    let output_path = cfg
        .artifact_dir
        .join(format!("processed_{}.mp4", uuid::Uuid::new_v4()));

    let writer = video_source::VideoArtifactWriter::create(
        &output_path,
        (metadata.width, metadata.height),
        metadata.fps,
    )
    .map_err(ServiceError::Internal)?;
    let mut sink = WriterSink { writer };

    let mut invoker = DetectionInvoker::new(
        factory().map_err(|err| ServiceError::EngineFailure(format!("{err:#}")))?,
        InferMode::Tracking,
        InvokerConfig::from_config(cfg),
    );

    let outcome = run_batch(
        &mut source,
        &mut invoker,
        cfg.working_size,
        (metadata.width, metadata.height),
        &mut sink,
    )?;

    let output_path = sink.writer.finish().map_err(ServiceError::Internal)?;
    if let Err(err) = spool.close() {
        // The primary outcome stands even when cleanup trips.
        warn!("failed to remove spooled upload: {err}");
    }

    debug!(
        frames = outcome.frames_processed,
        unique = outcome.unique_object_count,
        "batch analysis finished"
    );
    Ok(BatchReport {
        frames_processed: outcome.frames_processed,
        unique_object_count: outcome.unique_object_count,
        frame_wise_counts: outcome.frame_wise_counts,
        output_path: output_path.display().to_string(),
    })
}

#[cfg(not(feature = "with-opencv"))]
pub fn analyze_video(
    _upload: &[u8],
    _cfg: &Config,
    _factory: &DetectorFactory,
) -> Result<BatchReport, ServiceError> {
    Err(ServiceError::CapabilityUnavailable("video analysis"))
}

/// Process an uploaded video while streaming the annotated frames out as
/// they are produced. Returns a channel of JPEG-encoded frames at the
/// working resolution; the detection loop runs on its own thread and the
/// channel closes when the file ends or the consumer goes away.
#[cfg(feature = "with-opencv")]
pub fn stream_video(
    upload: &[u8],
    cfg: &Config,
    factory: &DetectorFactory,
) -> Result<tokio::sync::mpsc::Receiver<bytes::Bytes>, ServiceError> {
    use std::io::Write as _;

    let mut spool = tempfile::NamedTempFile::new()
        .context("failed to create spool file")
        .map_err(ServiceError::Internal)?;
    spool
        .write_all(upload)
        .context("failed to spool upload")
        .map_err(ServiceError::Internal)?;

    let mut source = match video_source::open_file_source(spool.path()) {
        Ok(source) => source,
        Err(video_source::SourceError::Undecodable(path)) => {
            return Err(ServiceError::DecodeFailure(path));
        }
        Err(err) => return Err(ServiceError::Internal(err.into())),
    };
    let metadata = source.metadata();
    if metadata.width <= 0 || metadata.height <= 0 {
        return Err(ServiceError::DecodeFailure(
            "video reports no frame dimensions".into(),
        ));
    }

    let mut invoker = DetectionInvoker::new(
        factory().map_err(|err| ServiceError::EngineFailure(format!("{err:#}")))?,
        InferMode::Tracking,
        InvokerConfig::from_config(cfg),
    );
    let working_size = cfg.working_size;

    let (tx, rx) = tokio::sync::mpsc::channel(4);
    std::thread::Builder::new()
        .name("sightline-upload-stream".into())
        .spawn(move || {
            let mut sink = ChannelSink { tx };
            // The streamed frames stay at working resolution, so the
            // restore pass degenerates to a clone.
            if let Err(err) =
                run_batch(&mut source, &mut invoker, working_size, working_size, &mut sink)
            {
                debug!("upload stream ended early: {err}");
            }
            if let Err(err) = spool.close() {
                warn!("failed to remove spooled upload: {err}");
            }
        })
        .map_err(|err| {
            ServiceError::Internal(anyhow::anyhow!("failed to spawn stream worker: {err}"))
        })?;

    Ok(rx)
}

#[cfg(not(feature = "with-opencv"))]
pub fn stream_video(
    _upload: &[u8],
    _cfg: &Config,
    _factory: &DetectorFactory,
) -> Result<tokio::sync::mpsc::Receiver<bytes::Bytes>, ServiceError> {
    Err(ServiceError::CapabilityUnavailable("video analysis"))
}

#[cfg(feature = "with-opencv")]
struct WriterSink {
    writer: video_source::VideoArtifactWriter,
}

#[cfg(feature = "with-opencv")]
impl AnnotatedSink for WriterSink {
    fn write(&mut self, frame: &Frame, _annotated: &AnnotatedFrame) -> Result<()> {
        self.writer.write_bgr(frame)
    }
}

#[cfg(feature = "with-opencv")]
struct ChannelSink {
    tx: tokio::sync::mpsc::Sender<bytes::Bytes>,
}

#[cfg(feature = "with-opencv")]
impl AnnotatedSink for ChannelSink {
    fn write(&mut self, _frame: &Frame, annotated: &AnnotatedFrame) -> Result<()> {
        self.tx
            .blocking_send(annotated.jpeg.clone())
            .map_err(|_| anyhow::anyhow!("stream consumer disconnected"))
    }
}

/// Analyze one uploaded still image with a stateless invoker. Inference
/// runs at the working resolution, but the reported coordinates and the
/// annotated JPEG are at the native resolution of the upload. The JPEG
/// rides back inline, base64-encoded.
pub fn analyze_image(
    upload: &[u8],
    cfg: &Config,
    factory: &DetectorFactory,
) -> Result<ImageReport, ServiceError> {
    let decoded = image::load_from_memory(upload)
        .map_err(|err| ServiceError::DecodeFailure(err.to_string()))?
        .to_rgb8();
    let native_size = (decoded.width() as i32, decoded.height() as i32);
    if native_size.0 <= 0 || native_size.1 <= 0 {
        return Err(ServiceError::DecodeFailure(
            "image reports no dimensions".into(),
        ));
    }

    let native = rgb_to_bgr_frame(decoded.as_raw(), native_size, 0);
    let working = resize_bgr(&native, cfg.working_size);

    let mut invoker = DetectionInvoker::new(
        factory().map_err(|err| ServiceError::EngineFailure(format!("{err:#}")))?,
        InferMode::Stateless,
        InvokerConfig::from_config(cfg),
    );
    let output = scale_boxes(&invoker.infer(&working), cfg.working_size, native_size);
    let event = payload::build_event(&output);
    let annotated = annotate::annotate(&native, &output).map_err(ServiceError::Internal)?;

    Ok(ImageReport {
        count: event.count,
        detections: event.detections,
        annotated_jpeg_base64: base64::engine::general_purpose::STANDARD.encode(&annotated.jpeg),
    })
}

/// Map boxes from the inference resolution back onto the original image.
fn scale_boxes(output: &EngineOutput, from: (i32, i32), to: (i32, i32)) -> EngineOutput {
    if from == to {
        return output.clone();
    }
    let fx = to.0 as f32 / from.0.max(1) as f32;
    let fy = to.1 as f32 / from.1.max(1) as f32;
    let boxes = output
        .boxes
        .iter()
        .map(|b| {
            [
                ((b[0] as f32 * fx).round() as i32).clamp(0, to.0 - 1),
                ((b[1] as f32 * fy).round() as i32).clamp(0, to.1 - 1),
                ((b[2] as f32 * fx).round() as i32).clamp(0, to.0 - 1),
                ((b[3] as f32 * fy).round() as i32).clamp(0, to.1 - 1),
            ]
        })
        .collect();
    EngineOutput {
        boxes,
        ids: output.ids.clone(),
    }
}

/// Resize a BGR frame with the image crate. The channel order is opaque
/// to the resampler, so BGR passes through a `Rgb` container unchanged.
fn resize_bgr(frame: &Frame, target: (i32, i32)) -> Frame {
    if (frame.width, frame.height) == target {
        return frame.clone();
    }
    let buffer = ImageBuffer::<Rgb<u8>, Vec<u8>>::from_raw(
        frame.width as u32,
        frame.height as u32,
        frame.data.clone(),
    );
    let data = match buffer {
        Some(buffer) => {
            image::imageops::resize(&buffer, target.0 as u32, target.1 as u32, FilterType::Triangle)
                .into_raw()
        }
        None => vec![0; Frame::expected_len(target.0, target.1)],
    };
    Frame {
        data,
        width: target.0,
        height: target.1,
        timestamp_ms: frame.timestamp_ms,
    }
}

fn rgb_to_bgr_frame(rgb: &[u8], size: (i32, i32), timestamp_ms: i64) -> Frame {
    let mut data = Vec::with_capacity(rgb.len());
    for chunk in rgb.chunks_exact(3) {
        data.push(chunk[2]);
        data.push(chunk[1]);
        data.push(chunk[0]);
    }
    Frame {
        data,
        width: size.0,
        height: size.1,
        timestamp_ms,
    }
}
