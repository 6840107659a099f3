//! HTTP surface: MJPEG and polling transports, WebRTC signaling, batch
//! analysis uploads, and artifact download.
//!
//! Handlers are thin adapters over the hub, shared state, and batch
//! analyzer. Route wiring lives in [`configure`] so integration tests can
//! mount the same surface on an in-memory service.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use actix_web::{
    http::header,
    web::{self, Bytes},
    App, HttpResponse, HttpServer,
};
use anyhow::anyhow;
use async_stream::stream;
use serde::Deserialize;
use serde_json::json;
use tokio::sync::broadcast::error::RecvError;

use crate::batch;
use crate::config::Config;
use crate::data::SessionOffer;
use crate::error::ServiceError;
use crate::hub::StreamHub;
use crate::invoker::DetectorFactory;
use crate::state::SharedDetectionState;
use crate::telemetry;

/// Shared state backing the HTTP handlers.
pub struct AppState {
    pub hub: Arc<StreamHub>,
    pub detections: SharedDetectionState,
    pub cfg: Arc<Config>,
    pub factory: DetectorFactory,
    #[cfg(feature = "webrtc")]
    pub sessions: Arc<crate::webrtc::SessionManager>,
}

/// Mount every route onto a service config.
pub fn configure(state: web::Data<AppState>) -> impl FnOnce(&mut web::ServiceConfig) {
    move |cfg| {
        cfg.app_data(state)
            .app_data(web::PayloadConfig::new(256 * 1024 * 1024))
            .route("/api/detection/stream", web::get().to(mjpeg_handler))
            .route("/api/detection/current", web::get().to(current_handler))
            .route("/api/webrtc/offer", web::post().to(offer_handler))
            .route("/api/image/analyze", web::post().to(image_handler))
            .route("/api/video/analyze", web::post().to(video_handler))
            .route(
                "/api/video/analyze/stream",
                web::post().to(video_stream_handler),
            )
            .route("/api/video/download", web::get().to(download_handler))
            .route("/health", web::get().to(health_handler))
            .route("/metrics", web::get().to(metrics_handler));
    }
}

/// Run the server until the process is told to stop.
pub async fn run(state: AppState, bind_addr: &str) -> std::io::Result<()> {
    let data = web::Data::new(state);
    HttpServer::new(move || App::new().configure(configure(data.clone())))
        .bind(bind_addr)?
        .run()
        .await
}

/// Multipart MJPEG feed. Each subscriber rides the hub broadcast; a
/// subscriber that falls behind skips to the newest frame instead of
/// stalling the pipeline.
async fn mjpeg_handler(state: web::Data<AppState>) -> HttpResponse {
    let mut rx = state.hub.subscribe();
    let stream = stream! {
        loop {
            match rx.recv().await {
                Ok(update) => {
                    yield Ok::<Bytes, actix_web::Error>(multipart_chunk(&update.frame.jpeg));
                }
                Err(RecvError::Lagged(skipped)) => {
                    metrics::counter!("sightline_stream_lagged_frames_total").increment(skipped);
                }
                Err(RecvError::Closed) => break,
            }
        }
    };

    HttpResponse::Ok()
        .insert_header((header::ACCESS_CONTROL_ALLOW_ORIGIN, "*"))
        .append_header(("Cache-Control", "no-cache"))
        .append_header(("Content-Type", "multipart/x-mixed-replace; boundary=frame"))
        .streaming(stream)
}

/// Wrap one JPEG in the multipart framing both live and upload streams
/// share.
fn multipart_chunk(jpeg: &[u8]) -> Bytes {
    let mut chunk = Vec::with_capacity(jpeg.len() + 48);
    chunk.extend_from_slice(b"--frame\r\nContent-Type: image/jpeg\r\n\r\n");
    chunk.extend_from_slice(jpeg);
    chunk.extend_from_slice(b"\r\n");
    Bytes::from(chunk)
}

/// Latest detection snapshot, independent of any media stream.
async fn current_handler(state: web::Data<AppState>) -> HttpResponse {
    HttpResponse::Ok().json(state.detections.snapshot())
}

#[cfg(feature = "webrtc")]
async fn offer_handler(
    state: web::Data<AppState>,
    offer: web::Json<SessionOffer>,
) -> Result<HttpResponse, ServiceError> {
    let answer = state.sessions.create_answer(offer.into_inner()).await?;
    Ok(HttpResponse::Ok().json(answer))
}

#[cfg(not(feature = "webrtc"))]
async fn offer_handler(
    _state: web::Data<AppState>,
    _offer: web::Json<SessionOffer>,
) -> Result<HttpResponse, ServiceError> {
    Err(ServiceError::CapabilityUnavailable("webrtc"))
}

async fn image_handler(
    state: web::Data<AppState>,
    body: Bytes,
) -> Result<HttpResponse, ServiceError> {
    let cfg = state.cfg.clone();
    let factory = state.factory.clone();
    let report = web::block(move || batch::analyze_image(&body, &cfg, &factory))
        .await
        .map_err(|err| ServiceError::Internal(anyhow!("analysis task failed: {err}")))??;
    Ok(HttpResponse::Ok().json(report))
}

async fn video_handler(
    state: web::Data<AppState>,
    body: Bytes,
) -> Result<HttpResponse, ServiceError> {
    let cfg = state.cfg.clone();
    let factory = state.factory.clone();
    let report = web::block(move || batch::analyze_video(&body, &cfg, &factory))
        .await
        .map_err(|err| ServiceError::Internal(anyhow!("analysis task failed: {err}")))??;
    Ok(HttpResponse::Ok().json(report))
}

/// Process an uploaded video and stream the annotated frames back as
/// MJPEG while the analysis runs, rather than waiting for the report.
async fn video_stream_handler(
    state: web::Data<AppState>,
    body: Bytes,
) -> Result<HttpResponse, ServiceError> {
    let cfg = state.cfg.clone();
    let factory = state.factory.clone();
    let mut rx = web::block(move || batch::stream_video(&body, &cfg, &factory))
        .await
        .map_err(|err| ServiceError::Internal(anyhow!("analysis task failed: {err}")))??;

    let stream = stream! {
        while let Some(jpeg) = rx.recv().await {
            yield Ok::<Bytes, actix_web::Error>(multipart_chunk(&jpeg));
        }
    };

    Ok(HttpResponse::Ok()
        .insert_header((header::ACCESS_CONTROL_ALLOW_ORIGIN, "*"))
        .append_header(("Cache-Control", "no-cache"))
        .append_header(("Content-Type", "multipart/x-mixed-replace; boundary=frame"))
        .streaming(stream))
}

#[derive(Deserialize)]
struct DownloadQuery {
    path: String,
}

/// Serve a processed batch artifact. Only files inside the artifact
/// directory carrying the `processed_` prefix are reachable.
async fn download_handler(
    state: web::Data<AppState>,
    query: web::Query<DownloadQuery>,
) -> Result<HttpResponse, ServiceError> {
    let path = validate_artifact_path(&query.path, &state.cfg.artifact_dir)?;
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "artifact.mp4".into());
    let bytes = web::block(move || std::fs::read(&path))
        .await
        .map_err(|err| ServiceError::Internal(anyhow!("read task failed: {err}")))?
        .map_err(|err| ServiceError::Internal(anyhow!(err)))?;
    Ok(HttpResponse::Ok()
        .content_type("video/mp4")
        .insert_header((
            header::CONTENT_DISPOSITION,
            format!("attachment; filename=\"{name}\""),
        ))
        .body(bytes))
}

async fn health_handler() -> HttpResponse {
    HttpResponse::Ok().json(json!({ "status": "ok" }))
}

async fn metrics_handler() -> HttpResponse {
    HttpResponse::Ok()
        .content_type("text/plain; version=0.0.4")
        .body(telemetry::init_metrics_recorder().render())
}

/// Resolve and vet a requested artifact path. Symlinks and `..` segments
/// are neutralised by canonicalising before the containment check.
fn validate_artifact_path(requested: &str, artifact_dir: &Path) -> Result<PathBuf, ServiceError> {
    let candidate = Path::new(requested);
    let name = candidate
        .file_name()
        .and_then(|name| name.to_str())
        .ok_or_else(|| ServiceError::ArtifactPathRejected("missing file name".into()))?;
    if !name.starts_with("processed_") {
        return Err(ServiceError::ArtifactPathRejected(
            "not a processed artifact".into(),
        ));
    }
    let root = artifact_dir
        .canonicalize()
        .map_err(|_| ServiceError::ArtifactPathRejected("artifact directory unavailable".into()))?;
    let resolved = candidate
        .canonicalize()
        .map_err(|_| ServiceError::ArtifactPathRejected("no such artifact".into()))?;
    if !resolved.starts_with(&root) {
        return Err(ServiceError::ArtifactPathRejected(
            "outside the artifact directory".into(),
        ));
    }
    Ok(resolved)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::DetectionEvent;
    use crate::hub::{HubConfig, SourceOpener};
    use crate::invoker::test_support::{det, ScriptedDetector};
    use crate::invoker::InvokerConfig;
    use actix_web::{http::StatusCode, test};
    use std::time::Duration;
    use video_source::SourceError;

    fn test_state() -> AppState {
        let opener: SourceOpener = Arc::new(|| {
            Err(SourceError::Unavailable {
                stream: None,
                device: 0,
            })
        });
        let factory: DetectorFactory = Arc::new(|| {
            Ok(Box::new(ScriptedDetector::new(vec![vec![
                det([5.0, 5.0, 20.0, 20.0], 0.9, 0),
            ]])) as Box<dyn detect_core::Detector>)
        });
        let detections = SharedDetectionState::new();
        let cfg = Arc::new(Config::defaults());
        let hub_cfg = HubConfig {
            working_size: (64, 48),
            invoker: InvokerConfig {
                confidence: 0.4,
                iou: 0.5,
                class_filter: vec![0],
            },
            placeholder_interval: Duration::from_millis(5),
            reconnect_backoff: Duration::from_millis(1),
            fanout_capacity: 8,
        };
        let hub = StreamHub::new(opener, factory.clone(), detections.clone(), hub_cfg);
        AppState {
            #[cfg(feature = "webrtc")]
            sessions: crate::webrtc::SessionManager::new(hub.clone(), 24),
            hub,
            detections,
            cfg,
            factory,
        }
    }

    #[actix_web::test]
    async fn health_reports_ok() {
        let app =
            test::init_service(App::new().configure(configure(web::Data::new(test_state()))))
                .await;
        let resp = test::call_service(&app, test::TestRequest::get().uri("/health").to_request())
            .await;
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[actix_web::test]
    async fn current_returns_latest_snapshot() {
        let state = test_state();
        state.detections.store(DetectionEvent {
            count: 1,
            detections: vec![crate::data::Detection {
                id: 4,
                bbox: [1, 2, 3, 4],
            }],
        });
        let app = test::init_service(App::new().configure(configure(web::Data::new(state)))).await;
        let resp = test::call_service(
            &app,
            test::TestRequest::get()
                .uri("/api/detection/current")
                .to_request(),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::OK);
        let event: DetectionEvent = test::read_body_json(resp).await;
        assert_eq!(event.count, 1);
        assert_eq!(event.detections[0].id, 4);
    }

    #[actix_web::test]
    async fn mjpeg_stream_negotiates_multipart() {
        let app =
            test::init_service(App::new().configure(configure(web::Data::new(test_state()))))
                .await;
        let resp = test::call_service(
            &app,
            test::TestRequest::get()
                .uri("/api/detection/stream")
                .to_request(),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::OK);
        let content_type = resp
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string();
        assert!(content_type.starts_with("multipart/x-mixed-replace"));
    }

    #[cfg(not(feature = "webrtc"))]
    #[actix_web::test]
    async fn offer_without_webrtc_support_is_501() {
        let app =
            test::init_service(App::new().configure(configure(web::Data::new(test_state()))))
                .await;
        let resp = test::call_service(
            &app,
            test::TestRequest::post()
                .uri("/api/webrtc/offer")
                .set_json(SessionOffer {
                    sdp: "v=0".into(),
                    kind: "offer".into(),
                })
                .to_request(),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::NOT_IMPLEMENTED);
    }

    #[::core::prelude::v1::test]
    fn multipart_chunk_frames_the_jpeg() {
        let chunk = multipart_chunk(&[0xFF, 0xD8, 0xFF, 0xD9]);
        assert_eq!(
            &chunk[..],
            &b"--frame\r\nContent-Type: image/jpeg\r\n\r\n\xFF\xD8\xFF\xD9\r\n"[..]
        );
    }

    #[cfg(not(feature = "with-opencv"))]
    #[actix_web::test]
    async fn upload_stream_without_video_support_is_501() {
        let app =
            test::init_service(App::new().configure(configure(web::Data::new(test_state()))))
                .await;
        let resp = test::call_service(
            &app,
            test::TestRequest::post()
                .uri("/api/video/analyze/stream")
                .set_payload("fake video bytes")
                .to_request(),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::NOT_IMPLEMENTED);
    }

    #[actix_web::test]
    async fn undecodable_image_upload_is_400() {
        let app =
            test::init_service(App::new().configure(configure(web::Data::new(test_state()))))
                .await;
        let resp = test::call_service(
            &app,
            test::TestRequest::post()
                .uri("/api/image/analyze")
                .set_payload("not an image")
                .to_request(),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[::core::prelude::v1::test]
    fn artifact_path_guard() {
        let dir = tempfile::tempdir().expect("tempdir");
        let good = dir.path().join("processed_abc.mp4");
        std::fs::write(&good, b"mp4").expect("write artifact");
        let stray = dir.path().join("raw_abc.mp4");
        std::fs::write(&stray, b"mp4").expect("write stray");
        let outside = tempfile::NamedTempFile::with_prefix("processed_").expect("outside file");

        assert!(validate_artifact_path(&good.display().to_string(), dir.path()).is_ok());
        // Wrong prefix.
        assert!(matches!(
            validate_artifact_path(&stray.display().to_string(), dir.path()),
            Err(ServiceError::ArtifactPathRejected(_))
        ));
        // Right prefix, wrong directory.
        assert!(matches!(
            validate_artifact_path(&outside.path().display().to_string(), dir.path()),
            Err(ServiceError::ArtifactPathRejected(_))
        ));
        // Traversal out of the sandbox.
        let sneaky = format!("{}/../processed_abc.mp4", dir.path().display());
        assert!(matches!(
            validate_artifact_path(&sneaky, dir.path()),
            Err(ServiceError::ArtifactPathRejected(_))
        ));
        // Missing file.
        let missing = dir.path().join("processed_missing.mp4");
        assert!(matches!(
            validate_artifact_path(&missing.display().to_string(), dir.path()),
            Err(ServiceError::ArtifactPathRejected(_))
        ));
    }

    #[actix_web::test]
    async fn download_serves_valid_artifact() {
        let state = test_state();
        let dir = state.cfg.artifact_dir.clone();
        std::fs::create_dir_all(&dir).expect("artifact dir");
        let path = dir.join("processed_download_test.mp4");
        std::fs::write(&path, b"fake mp4 payload").expect("write artifact");

        let app = test::init_service(App::new().configure(configure(web::Data::new(state)))).await;
        let uri = format!("/api/video/download?path={}", path.display());
        let resp = test::call_service(&app, test::TestRequest::get().uri(&uri).to_request()).await;
        assert_eq!(resp.status(), StatusCode::OK);
        let body = test::read_body(resp).await;
        assert_eq!(&body[..], b"fake mp4 payload");
        let _ = std::fs::remove_file(&path);
    }
}
