//! Peer media negotiation.
//!
//! One negotiation exists at a time, owned by the call controller. The
//! engine never drives call-session transitions itself; it reports what the
//! transport layer observed ([`EngineEvent`]) and lets the controller decide.

use crate::config::ClientConfig;
use crate::error::{Error, Result};
use crate::models::{CallType, TurnCredentials};
use crate::wire::IceCandidate;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MediaEngine, MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_connection_state::RTCIceConnectionState;
use webrtc::ice_transport::ice_credential_type::RTCIceCredentialType;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;

/// What the engine reports back to the call controller.
#[derive(Debug, Clone, PartialEq)]
pub enum EngineEvent {
    /// A locally-discovered candidate, ready to forward to the peer.
    LocalCandidate(IceCandidate),
    /// ICE reached connected/completed: media is flowing.
    Connected,
    /// ICE failed or fell apart mid-call.
    Disconnected,
}

/// Media negotiation seam. The production implementation is
/// [`WebRtcNegotiator`]; tests script their own.
#[async_trait]
pub trait MediaNegotiator: Send + Sync {
    /// Acquire local media and build the peer connection. Audio is always
    /// captured; video calls add a camera track.
    async fn start(
        &self,
        call_type: CallType,
        events: mpsc::UnboundedSender<EngineEvent>,
    ) -> Result<()>;

    /// Initiator only: produce the SDP offer.
    async fn create_offer(&self) -> Result<String>;

    /// Receiver only: apply the remote offer and produce the answer. Waits
    /// briefly for `start` if the offer beat it over the wire.
    async fn handle_offer(&self, sdp: String) -> Result<String>;

    /// Initiator only: apply the remote answer.
    async fn handle_answer(&self, sdp: String) -> Result<()>;

    /// Apply or buffer a remote ICE candidate.
    async fn handle_candidate(&self, candidate: IceCandidate) -> Result<()>;

    /// Tear everything down. Safe to call repeatedly.
    async fn shutdown(&self);

    /// Track toggles. All return `false` when no local media exists.
    fn set_muted(&self, muted: bool) -> bool;
    fn set_video_enabled(&self, enabled: bool) -> bool;
    fn switch_camera(&self) -> bool;
}

/// Where the offer/answer exchange stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SignalingPhase {
    Unstarted,
    HaveLocalOffer,
    HaveRemoteOffer,
    Stable,
}

struct PeerMediaContext {
    pc: Arc<RTCPeerConnection>,
    phase: SignalingPhase,
    /// Remote description applied; candidates may be added directly.
    remote_set: bool,
    /// Candidates that arrived before the remote description, receipt order.
    pending_remote: Vec<IceCandidate>,
}

#[derive(Default)]
struct TrackControls {
    active: bool,
    has_video: bool,
    muted: bool,
    video_enabled: bool,
    front_camera: bool,
}

pub struct WebRtcNegotiator {
    ice_servers: Vec<RTCIceServer>,
    offer_wait: Duration,
    probe_capture: bool,
    ctx: tokio::sync::Mutex<Option<PeerMediaContext>>,
    controls: parking_lot::Mutex<TrackControls>,
}

impl WebRtcNegotiator {
    pub fn new(config: &ClientConfig, turn: Option<TurnCredentials>) -> Self {
        Self::build(config, turn, true)
    }

    /// For environments without local capture hardware; negotiation runs,
    /// device probing is skipped.
    pub fn without_capture_probe(config: &ClientConfig, turn: Option<TurnCredentials>) -> Self {
        Self::build(config, turn, false)
    }

    fn build(config: &ClientConfig, turn: Option<TurnCredentials>, probe_capture: bool) -> Self {
        let mut ice_servers = vec![RTCIceServer {
            urls: config.stun_urls.clone(),
            ..Default::default()
        }];
        if let Some(turn) = turn {
            ice_servers.push(RTCIceServer {
                urls: turn.urls,
                username: turn.username,
                credential: turn.credential,
                credential_type: RTCIceCredentialType::Password,
            });
        }

        Self {
            ice_servers,
            offer_wait: config.offer_wait,
            probe_capture,
            ctx: tokio::sync::Mutex::new(None),
            controls: parking_lot::Mutex::new(TrackControls::default()),
        }
    }

    #[cfg(test)]
    async fn pending_count(&self) -> usize {
        self.ctx
            .lock()
            .await
            .as_ref()
            .map(|c| c.pending_remote.len())
            .unwrap_or(0)
    }
}

fn probe_capture_device() -> Result<()> {
    use cpal::traits::HostTrait;
    let host = cpal::default_host();
    match host.input_devices() {
        Ok(mut devices) => {
            if devices.next().is_none() {
                Err(Error::DeviceUnavailable)
            } else {
                Ok(())
            }
        }
        Err(_) => Err(Error::NoDevicePermission),
    }
}

async fn flush_pending(ctx: &mut PeerMediaContext) {
    for candidate in ctx.pending_remote.drain(..) {
        add_candidate(&ctx.pc, candidate).await;
    }
}

async fn add_candidate(pc: &RTCPeerConnection, candidate: IceCandidate) {
    let init = RTCIceCandidateInit {
        candidate: candidate.candidate,
        sdp_mid: candidate.sdp_mid,
        sdp_mline_index: candidate.sdp_mline_index,
        username_fragment: None,
    };
    // A malformed candidate must not kill the call; the next one may pair.
    if let Err(e) = pc.add_ice_candidate(init).await {
        log::warn!("Discarding remote candidate: {}", e);
    }
}

#[async_trait]
impl MediaNegotiator for WebRtcNegotiator {
    async fn start(
        &self,
        call_type: CallType,
        events: mpsc::UnboundedSender<EngineEvent>,
    ) -> Result<()> {
        let mut guard = self.ctx.lock().await;
        if guard.is_some() {
            return Err(Error::InvalidSignalingState(
                "negotiation already active".to_string(),
            ));
        }

        if self.probe_capture {
            probe_capture_device()?;
        }

        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs()?;
        let registry = register_default_interceptors(Registry::new(), &mut media_engine)?;
        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let pc = Arc::new(
            api.new_peer_connection(RTCConfiguration {
                ice_servers: self.ice_servers.clone(),
                ..Default::default()
            })
            .await?,
        );

        let audio_track = Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: MIME_TYPE_OPUS.to_owned(),
                ..Default::default()
            },
            "audio".to_owned(),
            "parley-media".to_owned(),
        ));
        let _ = pc
            .add_track(Arc::clone(&audio_track) as Arc<dyn TrackLocal + Send + Sync>)
            .await?;

        let has_video = call_type == CallType::Video;
        if has_video {
            let video_track = Arc::new(TrackLocalStaticSample::new(
                RTCRtpCodecCapability {
                    mime_type: MIME_TYPE_VP8.to_owned(),
                    ..Default::default()
                },
                "video".to_owned(),
                "parley-media".to_owned(),
            ));
            let _ = pc
                .add_track(Arc::clone(&video_track) as Arc<dyn TrackLocal + Send + Sync>)
                .await?;
        }

        let candidate_events = events.clone();
        pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            let events = candidate_events.clone();
            Box::pin(async move {
                if let Some(candidate) = candidate {
                    match candidate.to_json() {
                        Ok(init) => {
                            let _ = events.send(EngineEvent::LocalCandidate(IceCandidate {
                                candidate: init.candidate,
                                sdp_mid: init.sdp_mid,
                                sdp_mline_index: init.sdp_mline_index,
                            }));
                        }
                        Err(e) => log::warn!("Failed to serialize local candidate: {}", e),
                    }
                }
            })
        }));

        let state_events = events;
        pc.on_ice_connection_state_change(Box::new(move |state: RTCIceConnectionState| {
            let events = state_events.clone();
            Box::pin(async move {
                match state {
                    RTCIceConnectionState::Connected | RTCIceConnectionState::Completed => {
                        let _ = events.send(EngineEvent::Connected);
                    }
                    RTCIceConnectionState::Failed | RTCIceConnectionState::Disconnected => {
                        let _ = events.send(EngineEvent::Disconnected);
                    }
                    _ => {}
                }
            })
        }));

        *guard = Some(PeerMediaContext {
            pc,
            phase: SignalingPhase::Unstarted,
            remote_set: false,
            pending_remote: Vec::new(),
        });

        {
            let mut controls = self.controls.lock();
            controls.active = true;
            controls.has_video = has_video;
            controls.muted = false;
            controls.video_enabled = has_video;
            controls.front_camera = true;
        }

        log::info!("Media negotiation started ({:?})", call_type);
        Ok(())
    }

    async fn create_offer(&self) -> Result<String> {
        let mut guard = self.ctx.lock().await;
        let ctx = guard.as_mut().ok_or_else(|| {
            Error::InvalidSignalingState("negotiation not started".to_string())
        })?;
        if ctx.phase != SignalingPhase::Unstarted {
            return Err(Error::InvalidSignalingState(format!(
                "cannot create offer in {:?}",
                ctx.phase
            )));
        }

        let offer = ctx.pc.create_offer(None).await?;
        let sdp = offer.sdp.clone();
        ctx.pc.set_local_description(offer).await?;
        ctx.phase = SignalingPhase::HaveLocalOffer;
        Ok(sdp)
    }

    async fn handle_offer(&self, sdp: String) -> Result<String> {
        // The accepted/offer wire events race benignly; give start() a short
        // window before treating the offer as misordered.
        let deadline = tokio::time::Instant::now() + self.offer_wait;
        loop {
            if self.ctx.lock().await.is_some() {
                break;
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(Error::InvalidSignalingState(
                    "offer arrived before negotiation started".to_string(),
                ));
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }

        let mut guard = self.ctx.lock().await;
        let ctx = guard.as_mut().ok_or_else(|| {
            Error::InvalidSignalingState("negotiation torn down".to_string())
        })?;
        if ctx.phase != SignalingPhase::Unstarted {
            return Err(Error::InvalidSignalingState(format!(
                "cannot apply offer in {:?}",
                ctx.phase
            )));
        }

        let offer = RTCSessionDescription::offer(sdp)?;
        ctx.pc.set_remote_description(offer).await?;
        ctx.remote_set = true;
        ctx.phase = SignalingPhase::HaveRemoteOffer;
        flush_pending(ctx).await;

        let answer = ctx.pc.create_answer(None).await?;
        let sdp = answer.sdp.clone();
        ctx.pc.set_local_description(answer).await?;
        ctx.phase = SignalingPhase::Stable;
        Ok(sdp)
    }

    async fn handle_answer(&self, sdp: String) -> Result<()> {
        let mut guard = self.ctx.lock().await;
        let ctx = guard.as_mut().ok_or_else(|| {
            Error::InvalidSignalingState("negotiation not started".to_string())
        })?;
        if ctx.phase != SignalingPhase::HaveLocalOffer {
            return Err(Error::InvalidSignalingState(format!(
                "cannot apply answer in {:?}",
                ctx.phase
            )));
        }

        let answer = RTCSessionDescription::answer(sdp)?;
        ctx.pc.set_remote_description(answer).await?;
        ctx.remote_set = true;
        flush_pending(ctx).await;
        ctx.phase = SignalingPhase::Stable;
        Ok(())
    }

    async fn handle_candidate(&self, candidate: IceCandidate) -> Result<()> {
        let mut guard = self.ctx.lock().await;
        match guard.as_mut() {
            None => {
                // Candidates straggling in after teardown are expected.
                log::debug!("Ignoring candidate without active negotiation");
                Ok(())
            }
            Some(ctx) => {
                if ctx.remote_set {
                    add_candidate(&ctx.pc, candidate).await;
                } else {
                    ctx.pending_remote.push(candidate);
                }
                Ok(())
            }
        }
    }

    async fn shutdown(&self) {
        let ctx = self.ctx.lock().await.take();
        {
            let mut controls = self.controls.lock();
            controls.active = false;
            controls.has_video = false;
        }
        if let Some(ctx) = ctx {
            if let Err(e) = ctx.pc.close().await {
                log::debug!("Peer connection close: {}", e);
            }
            log::info!("Media negotiation torn down");
        }
    }

    fn set_muted(&self, muted: bool) -> bool {
        let mut controls = self.controls.lock();
        if !controls.active {
            return false;
        }
        controls.muted = muted;
        true
    }

    fn set_video_enabled(&self, enabled: bool) -> bool {
        let mut controls = self.controls.lock();
        if !controls.active || !controls.has_video {
            return false;
        }
        controls.video_enabled = enabled;
        true
    }

    fn switch_camera(&self) -> bool {
        let mut controls = self.controls.lock();
        if !controls.active || !controls.has_video {
            return false;
        }
        controls.front_camera = !controls.front_camera;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn negotiator() -> WebRtcNegotiator {
        let mut config = ClientConfig::new("localhost", 1, false);
        config.offer_wait = Duration::from_millis(150);
        WebRtcNegotiator::without_capture_probe(&config, None)
    }

    fn host_candidate(port: u16) -> IceCandidate {
        IceCandidate {
            candidate: format!("candidate:1 1 udp 2122260223 127.0.0.1 {} typ host", port),
            sdp_mid: Some("0".to_string()),
            sdp_mline_index: Some(0),
        }
    }

    #[tokio::test]
    async fn test_offer_before_start_is_rejected() {
        let engine = negotiator();
        let result = engine.handle_offer("v=0".to_string()).await;
        assert!(matches!(result, Err(Error::InvalidSignalingState(_))));
    }

    #[tokio::test]
    async fn test_answer_out_of_order_is_rejected() {
        let engine = negotiator();
        let (tx, _rx) = mpsc::unbounded_channel();
        engine.start(CallType::Audio, tx).await.unwrap();

        // No local offer exists yet.
        let result = engine.handle_answer("v=0".to_string()).await;
        assert!(matches!(result, Err(Error::InvalidSignalingState(_))));
    }

    #[tokio::test]
    async fn test_double_offer_is_rejected() {
        let engine = negotiator();
        let (tx, _rx) = mpsc::unbounded_channel();
        engine.start(CallType::Audio, tx).await.unwrap();

        let offer = engine.create_offer().await.unwrap();
        assert!(offer.contains("v=0"));

        let result = engine.create_offer().await;
        assert!(matches!(result, Err(Error::InvalidSignalingState(_))));
    }

    #[tokio::test]
    async fn test_candidates_buffer_until_remote_description() {
        let caller = negotiator();
        let callee = negotiator();
        let (caller_tx, _caller_rx) = mpsc::unbounded_channel();
        let (callee_tx, _callee_rx) = mpsc::unbounded_channel();

        caller.start(CallType::Audio, caller_tx).await.unwrap();
        callee.start(CallType::Audio, callee_tx).await.unwrap();

        let offer = caller.create_offer().await.unwrap();

        // Candidates beat the offer: they must queue, not apply.
        callee.handle_candidate(host_candidate(50000)).await.unwrap();
        callee.handle_candidate(host_candidate(50001)).await.unwrap();
        assert_eq!(callee.pending_count().await, 2);

        let answer = callee.handle_offer(offer).await.unwrap();
        assert!(answer.contains("v=0"));
        assert_eq!(callee.pending_count().await, 0);

        caller.handle_answer(answer).await.unwrap();

        // With the remote description in place, candidates apply directly.
        caller.handle_candidate(host_candidate(50002)).await.unwrap();
        assert_eq!(caller.pending_count().await, 0);
    }

    #[tokio::test]
    async fn test_offer_waits_for_late_start() {
        let engine = Arc::new(negotiator());

        let starter = engine.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            let (tx, _rx) = mpsc::unbounded_channel();
            starter.start(CallType::Audio, tx).await.unwrap();
        });

        // Build a real offer to hand over once the late start lands.
        let caller = negotiator();
        let (tx, _rx) = mpsc::unbounded_channel();
        caller.start(CallType::Audio, tx).await.unwrap();
        let offer = caller.create_offer().await.unwrap();

        let answer = engine.handle_offer(offer).await.unwrap();
        assert!(answer.contains("v=0"));
    }

    #[tokio::test]
    async fn test_shutdown_is_idempotent() {
        let engine = negotiator();
        let (tx, _rx) = mpsc::unbounded_channel();
        engine.start(CallType::Video, tx).await.unwrap();

        assert!(engine.set_muted(true));
        engine.shutdown().await;
        engine.shutdown().await;

        assert!(!engine.set_muted(false));
        assert!(!engine.set_video_enabled(true));
        assert!(!engine.switch_camera());
    }

    #[tokio::test]
    async fn test_toggles_without_local_stream() {
        let engine = negotiator();
        assert!(!engine.set_muted(true));
        assert!(!engine.set_video_enabled(false));
        assert!(!engine.switch_camera());
    }

    #[tokio::test]
    async fn test_video_toggle_on_audio_call() {
        let engine = negotiator();
        let (tx, _rx) = mpsc::unbounded_channel();
        engine.start(CallType::Audio, tx).await.unwrap();

        assert!(engine.set_muted(true));
        assert!(!engine.set_video_enabled(true));
        assert!(!engine.switch_camera());
    }

    #[tokio::test]
    async fn test_restart_after_shutdown() {
        let engine = negotiator();
        let (tx, _rx) = mpsc::unbounded_channel();
        engine.start(CallType::Audio, tx).await.unwrap();
        engine.shutdown().await;

        let (tx, _rx) = mpsc::unbounded_channel();
        engine.start(CallType::Audio, tx).await.unwrap();
        let offer = engine.create_offer().await.unwrap();
        assert!(offer.contains("v=0"));
    }
}
