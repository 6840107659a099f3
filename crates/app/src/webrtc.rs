//! WebRTC session manager: one peer connection per viewer, fed H.264
//! samples from the shared pipeline at a fixed pace.
//!
//! Compiled only with the `webrtc` feature; without it the signaling
//! endpoint answers 501.

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use bytes::Bytes;
use openh264::encoder::Encoder;
use openh264::formats::{RgbSliceU8, YUVBuffer};
use tokio::sync::broadcast::error::{RecvError, TryRecvError};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MediaEngine, MIME_TYPE_H264};
use webrtc::api::APIBuilder;
use webrtc::data_channel::data_channel_state::RTCDataChannelState;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::media::Sample;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;

use crate::data::{SessionAnswer, SessionOffer, Update};
use crate::error::ServiceError;
use crate::hub::StreamHub;

/// Process-wide set of live viewer sessions.
pub struct SessionManager {
    hub: Arc<StreamHub>,
    target_fps: u32,
    sessions: Mutex<HashMap<Uuid, Arc<RTCPeerConnection>>>,
}

impl SessionManager {
    pub fn new(hub: Arc<StreamHub>, target_fps: u32) -> Arc<Self> {
        Arc::new(Self {
            hub,
            target_fps,
            sessions: Mutex::new(HashMap::new()),
        })
    }

    /// Negotiate one viewer session. Nothing is registered until the
    /// answer is fully prepared; a failed negotiation closes the partly
    /// built peer connection and leaves no session behind.
    pub async fn create_answer(
        self: &Arc<Self>,
        offer: SessionOffer,
    ) -> Result<SessionAnswer, ServiceError> {
        if offer.kind != "offer" {
            return Err(ServiceError::SessionNegotiation(format!(
                "expected an offer, got {:?}",
                offer.kind
            )));
        }
        let remote = RTCSessionDescription::offer(offer.sdp)
            .map_err(|err| ServiceError::SessionNegotiation(err.to_string()))?;

        let pc = new_peer_connection()
            .await
            .map_err(|err| ServiceError::SessionNegotiation(err.to_string()))?;
        let pc = Arc::new(pc);
        let session_id = Uuid::new_v4();

        let (local, track, channel) = match self.negotiate(&pc, remote, session_id).await {
            Ok(parts) => parts,
            Err(err) => {
                // Closing also unblocks the RTCP drain task.
                let _ = pc.close().await;
                return Err(err);
            }
        };

        self.sessions.lock().await.insert(session_id, pc.clone());
        metrics::gauge!("sightline_webrtc_sessions").increment(1.0);
        info!(session = %session_id, "webrtc session established");

        let hub = self.hub.clone();
        let manager = Arc::downgrade(self);
        let fps = self.target_fps;
        tokio::spawn(run_telemetry_task(self.hub.clone(), channel));
        tokio::spawn(async move {
            if let Err(err) = run_media_task(hub, track, fps).await {
                warn!(session = %session_id, "media task ended: {err:#}");
            }
            close_session(manager, session_id, Weak::new()).await;
        });

        Ok(SessionAnswer {
            sdp: local.sdp,
            kind: local.sdp_type.to_string(),
        })
    }

    /// The fallible middle of session setup. The caller owns the peer
    /// connection and tears it down when this returns an error.
    async fn negotiate(
        self: &Arc<Self>,
        pc: &Arc<RTCPeerConnection>,
        remote: RTCSessionDescription,
        session_id: Uuid,
    ) -> Result<
        (
            RTCSessionDescription,
            Arc<TrackLocalStaticSample>,
            Arc<RTCDataChannel>,
        ),
        ServiceError,
    > {
        let track = Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: MIME_TYPE_H264.to_owned(),
                ..Default::default()
            },
            "video".to_owned(),
            "sightline".to_owned(),
        ));
        let rtp_sender = pc
            .add_track(track.clone())
            .await
            .map_err(|err| ServiceError::SessionNegotiation(err.to_string()))?;
        // Drain RTCP so the interceptor chain keeps running. The reads
        // fail once the connection closes, ending the task.
        tokio::spawn(async move {
            let mut buf = vec![0u8; 1500];
            while rtp_sender.read(&mut buf).await.is_ok() {}
        });

        let channel = pc
            .create_data_channel("detections", None)
            .await
            .map_err(|err| ServiceError::SessionNegotiation(err.to_string()))?;

        let manager = Arc::downgrade(self);
        let state_pc = Arc::downgrade(pc);
        pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
            let manager = manager.clone();
            let state_pc = state_pc.clone();
            Box::pin(async move {
                match state {
                    RTCPeerConnectionState::Failed
                    | RTCPeerConnectionState::Disconnected
                    | RTCPeerConnectionState::Closed => {
                        close_session(manager, session_id, state_pc).await;
                    }
                    other => debug!(session = %session_id, state = %other, "session state"),
                }
            })
        }));

        pc.set_remote_description(remote)
            .await
            .map_err(|err| ServiceError::SessionNegotiation(err.to_string()))?;
        let answer = pc
            .create_answer(None)
            .await
            .map_err(|err| ServiceError::SessionNegotiation(err.to_string()))?;
        let mut gather_complete = pc.gathering_complete_promise().await;
        pc.set_local_description(answer)
            .await
            .map_err(|err| ServiceError::SessionNegotiation(err.to_string()))?;
        let _ = gather_complete.recv().await;

        let local = pc.local_description().await.ok_or_else(|| {
            ServiceError::SessionNegotiation("local description missing after gathering".into())
        })?;

        Ok((local, track, channel))
    }

    #[cfg(test)]
    pub(crate) async fn session_count(&self) -> usize {
        self.sessions.lock().await.len()
    }
}

/// Remove and close a session. Safe to call more than once for the same
/// id; only the first call finds anything to tear down.
async fn close_session(
    manager: Weak<SessionManager>,
    session_id: Uuid,
    fallback: Weak<RTCPeerConnection>,
) {
    let removed = match manager.upgrade() {
        Some(manager) => manager.sessions.lock().await.remove(&session_id),
        None => None,
    };
    match removed {
        Some(pc) => {
            let _ = pc.close().await;
            metrics::gauge!("sightline_webrtc_sessions").decrement(1.0);
            info!(session = %session_id, "webrtc session closed");
        }
        None => {
            // Session was never registered or already torn down.
            if let Some(pc) = fallback.upgrade() {
                let _ = pc.close().await;
            }
        }
    }
}

async fn new_peer_connection() -> webrtc::error::Result<RTCPeerConnection> {
    let mut media = MediaEngine::default();
    media.register_default_codecs()?;
    let registry = register_default_interceptors(Registry::new(), &mut media)?;
    let api = APIBuilder::new()
        .with_media_engine(media)
        .with_interceptor_registry(registry)
        .build();
    api.new_peer_connection(RTCConfiguration {
        ice_servers: vec![RTCIceServer {
            urls: vec!["stun:stun.l.google.com:19302".to_owned()],
            ..Default::default()
        }],
        ..Default::default()
    })
    .await
}

/// Feed the outbound track at a fixed pace, always transmitting the
/// newest available frame. Ends when the hub channel closes.
async fn run_media_task(
    hub: Arc<StreamHub>,
    track: Arc<TrackLocalStaticSample>,
    fps: u32,
) -> anyhow::Result<()> {
    let mut rx = hub.subscribe();
    let mut encoder = Encoder::new()?;
    let pace = frame_interval(fps);
    let mut ticker = tokio::time::interval(pace);

    loop {
        ticker.tick().await;
        let update = match drain_to_newest(&mut rx) {
            DrainOutcome::Update(update) => update,
            DrainOutcome::Empty => continue,
            DrainOutcome::Ended => {
                debug!("hub stream ended; stopping media task");
                return Ok(());
            }
        };

        let yuv = YUVBuffer::from_rgb_source(RgbSliceU8::new(
            &update.frame.rgb,
            (update.frame.width as usize, update.frame.height as usize),
        ));
        let bitstream = encoder.encode(&yuv)?;
        track
            .write_sample(&Sample {
                data: Bytes::from(bitstream.to_vec()),
                duration: pace,
                ..Default::default()
            })
            .await?;
    }
}

/// Push detection payloads over the data channel on the session's own
/// hub subscription, one per published update, decoupled from the pace
/// of the media track.
async fn run_telemetry_task(hub: Arc<StreamHub>, channel: Arc<RTCDataChannel>) {
    let rx = hub.subscribe();
    forward_events(rx, move |json| {
        let channel = channel.clone();
        async move {
            if channel.ready_state() != RTCDataChannelState::Open {
                // Not open yet, or already torn down; the session state
                // handler owns teardown either way.
                return true;
            }
            channel.send_text(json).await.is_ok()
        }
    })
    .await;
}

/// Forward every update's detection payload to `send` until the channel
/// closes or `send` reports the consumer is gone. A lag skips straight
/// to the newest updates, matching the hub's slow-consumer policy.
async fn forward_events<S, Fut>(mut rx: tokio::sync::broadcast::Receiver<Update>, mut send: S)
where
    S: FnMut(String) -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    loop {
        match rx.recv().await {
            Ok(update) => {
                if let Ok(json) = serde_json::to_string(&update.event) {
                    if !send(json).await {
                        return;
                    }
                }
            }
            Err(RecvError::Lagged(_)) => continue,
            Err(RecvError::Closed) => return,
        }
    }
}

enum DrainOutcome {
    Update(Update),
    Empty,
    Ended,
}

fn drain_to_newest(rx: &mut tokio::sync::broadcast::Receiver<Update>) -> DrainOutcome {
    let mut newest = None;
    loop {
        match rx.try_recv() {
            Ok(update) => newest = Some(update),
            Err(TryRecvError::Lagged(_)) => continue,
            Err(TryRecvError::Empty) => break,
            Err(TryRecvError::Closed) => {
                return match newest {
                    Some(update) => DrainOutcome::Update(update),
                    None => DrainOutcome::Ended,
                };
            }
        }
    }
    match newest {
        Some(update) => DrainOutcome::Update(update),
        None => DrainOutcome::Empty,
    }
}

fn frame_interval(fps: u32) -> Duration {
    Duration::from_secs_f64(1.0 / f64::from(fps.max(1)))
}
