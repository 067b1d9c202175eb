//! [`PeerEngine`] over webrtc-rs.
//!
//! Each engine wraps one `RTCPeerConnection`. Gathering and connection state
//! callbacks are fanned out through [`ListenerSet`]s so any number of
//! handshake components can subscribe and drop their interest independently.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use call_handshake::engine::{
    ConnectivityHandler, ConnectivityState, EngineError, EngineFactory, GatheringHandler,
    GatheringState, PeerEngine, Subscription,
};
use call_handshake::{HandshakeConfig, ListenerSet, MediaTrackSet, SdpKind, SessionDescription, TrackKind};
use parking_lot::Mutex;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, info, trace, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MIME_TYPE_OPUS, MIME_TYPE_VP8, MediaEngine};
use webrtc::api::setting_engine::SettingEngine;
use webrtc::api::{API, APIBuilder};
use webrtc::ice_transport::ice_candidate::RTCIceCandidate;
use webrtc::ice_transport::ice_gatherer_state::RTCIceGathererState;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::rtp_transceiver::RTCRtpTransceiver;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::rtp_transceiver::rtp_receiver::RTCRtpReceiver;
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_remote::TrackRemote;

const STREAM_ID: &str = "beach-call";
const ICE_DISCONNECTED_TIMEOUT: Duration = Duration::from_secs(3);
const ICE_FAILED_TIMEOUT: Duration = Duration::from_secs(10);
const ICE_KEEPALIVE_INTERVAL: Duration = Duration::from_millis(500);

fn build_api() -> Result<API, EngineError> {
    let mut media_engine = MediaEngine::default();
    media_engine
        .register_default_codecs()
        .map_err(to_setup_error)?;

    let mut registry = Registry::new();
    registry =
        register_default_interceptors(registry, &mut media_engine).map_err(to_setup_error)?;

    let mut setting = SettingEngine::default();
    setting.set_ice_timeouts(
        Some(ICE_DISCONNECTED_TIMEOUT),
        Some(ICE_FAILED_TIMEOUT),
        Some(ICE_KEEPALIVE_INTERVAL),
    );

    Ok(APIBuilder::new()
        .with_setting_engine(setting)
        .with_media_engine(media_engine)
        .with_interceptor_registry(registry)
        .build())
}

fn to_setup_error<E: std::fmt::Display>(err: E) -> EngineError {
    EngineError::Setup(err.to_string())
}

fn to_rejected<E: std::fmt::Display>(err: E) -> EngineError {
    EngineError::Rejected(err.to_string())
}

fn to_rtc(description: SessionDescription) -> Result<RTCSessionDescription, EngineError> {
    match description.kind {
        SdpKind::Offer => RTCSessionDescription::offer(description.sdp),
        SdpKind::Answer => RTCSessionDescription::answer(description.sdp),
    }
    .map_err(to_rejected)
}

fn from_rtc(description: RTCSessionDescription) -> Result<SessionDescription, EngineError> {
    let kind = match description.sdp_type {
        RTCSdpType::Offer => SdpKind::Offer,
        RTCSdpType::Answer => SdpKind::Answer,
        other => {
            return Err(EngineError::Rejected(format!(
                "unsupported session description type {other}"
            )));
        }
    };
    Ok(SessionDescription::new(kind, description.sdp))
}

fn gathering_from_rtc(state: RTCIceGathererState) -> Option<GatheringState> {
    match state {
        RTCIceGathererState::New => Some(GatheringState::New),
        RTCIceGathererState::Gathering => Some(GatheringState::Gathering),
        RTCIceGathererState::Complete => Some(GatheringState::Complete),
        _ => None,
    }
}

fn connectivity_from_rtc(state: RTCPeerConnectionState) -> Option<ConnectivityState> {
    match state {
        RTCPeerConnectionState::New => Some(ConnectivityState::New),
        RTCPeerConnectionState::Connecting => Some(ConnectivityState::Connecting),
        RTCPeerConnectionState::Connected => Some(ConnectivityState::Connected),
        RTCPeerConnectionState::Disconnected => Some(ConnectivityState::Disconnected),
        RTCPeerConnectionState::Failed => Some(ConnectivityState::Failed),
        RTCPeerConnectionState::Closed => Some(ConnectivityState::Closed),
        _ => None,
    }
}

fn codec_for(kind: TrackKind) -> RTCRtpCodecCapability {
    match kind {
        TrackKind::Audio => RTCRtpCodecCapability {
            mime_type: MIME_TYPE_OPUS.to_owned(),
            clock_rate: 48_000,
            channels: 2,
            ..Default::default()
        },
        TrackKind::Video => RTCRtpCodecCapability {
            mime_type: MIME_TYPE_VP8.to_owned(),
            clock_rate: 90_000,
            ..Default::default()
        },
    }
}

pub struct WebRtcEngine {
    pc: Arc<RTCPeerConnection>,
    gathering: ListenerSet<GatheringState>,
    connectivity: ListenerSet<ConnectivityState>,
    gathering_state: Arc<Mutex<GatheringState>>,
    senders: AsyncMutex<Vec<Arc<RTCRtpSender>>>,
}

impl WebRtcEngine {
    pub async fn connect(ice_servers: &[String]) -> Result<Self, EngineError> {
        let api = build_api()?;
        let config = RTCConfiguration {
            ice_servers: if ice_servers.is_empty() {
                Vec::new()
            } else {
                vec![RTCIceServer {
                    urls: ice_servers.to_vec(),
                    ..Default::default()
                }]
            },
            ..Default::default()
        };

        trace!(
            target: "beach_call::webrtc",
            step = "api.new_peer_connection",
            state = "start",
            ice_servers = ice_servers.len()
        );
        let pc_result = api.new_peer_connection(config).await;
        trace!(
            target: "beach_call::webrtc",
            step = "api.new_peer_connection",
            state = "end",
            ok = pc_result.is_ok()
        );
        let pc = Arc::new(pc_result.map_err(to_setup_error)?);

        let engine = Self {
            pc,
            gathering: ListenerSet::new(),
            connectivity: ListenerSet::new(),
            gathering_state: Arc::new(Mutex::new(GatheringState::New)),
            senders: AsyncMutex::new(Vec::new()),
        };
        engine.install_handlers();
        Ok(engine)
    }

    fn install_handlers(&self) {
        let listeners = self.gathering.clone();
        let current = Arc::clone(&self.gathering_state);
        self.pc
            .on_ice_gathering_state_change(Box::new(move |state: RTCIceGathererState| {
                if let Some(mapped) = gathering_from_rtc(state) {
                    *current.lock() = mapped;
                    debug!(target: "beach_call::webrtc", state = ?mapped, "ice gathering state changed");
                    listeners.emit(mapped);
                }
                Box::pin(async {})
            }));

        let listeners = self.connectivity.clone();
        self.pc
            .on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
                debug!(target: "beach_call::webrtc", state = %state, "peer connection state changed");
                if let Some(mapped) = connectivity_from_rtc(state) {
                    listeners.emit(mapped);
                }
                Box::pin(async {})
            }));

        self.pc
            .on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
                if let Some(candidate) = candidate {
                    match candidate.to_json() {
                        Ok(init) => trace!(
                            target: "beach_call::webrtc",
                            candidate = %init.candidate,
                            "local ice candidate"
                        ),
                        Err(err) => trace!(
                            target: "beach_call::webrtc",
                            error = %err,
                            "unserializable local ice candidate"
                        ),
                    }
                }
                Box::pin(async {})
            }));

        self.pc.on_track(Box::new(
            move |track: Arc<TrackRemote>,
                  _receiver: Arc<RTCRtpReceiver>,
                  _transceiver: Arc<RTCRtpTransceiver>| {
                info!(target: "beach_call::webrtc", kind = %track.kind(), "remote track received");
                Box::pin(async {})
            },
        ));
    }
}

#[async_trait]
impl PeerEngine for WebRtcEngine {
    async fn create_offer(&self) -> Result<SessionDescription, EngineError> {
        let offer = self.pc.create_offer(None).await.map_err(to_rejected)?;
        from_rtc(offer)
    }

    async fn create_answer(&self) -> Result<SessionDescription, EngineError> {
        let answer = self.pc.create_answer(None).await.map_err(to_rejected)?;
        from_rtc(answer)
    }

    async fn set_local_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), EngineError> {
        let description = to_rtc(description)?;
        self.pc
            .set_local_description(description)
            .await
            .map_err(to_rejected)
    }

    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), EngineError> {
        let description = to_rtc(description)?;
        self.pc
            .set_remote_description(description)
            .await
            .map_err(to_rejected)
    }

    async fn local_description(&self) -> Option<SessionDescription> {
        let description = self.pc.local_description().await?;
        match from_rtc(description) {
            Ok(description) => Some(description),
            Err(err) => {
                warn!(target: "beach_call::webrtc", error = %err, "ignoring local description");
                None
            }
        }
    }

    fn gathering_state(&self) -> GatheringState {
        *self.gathering_state.lock()
    }

    fn on_gathering_change(&self, handler: GatheringHandler) -> Subscription {
        self.gathering.subscribe(handler)
    }

    fn on_connectivity_change(&self, handler: ConnectivityHandler) -> Subscription {
        self.connectivity.subscribe(handler)
    }

    async fn attach_tracks(&self, tracks: &MediaTrackSet) -> Result<(), EngineError> {
        let mut senders = self.senders.lock().await;
        for track in tracks.tracks() {
            let local = Arc::new(TrackLocalStaticSample::new(
                codec_for(track.kind()),
                track.id().to_owned(),
                STREAM_ID.to_owned(),
            ));
            let sender = self
                .pc
                .add_track(local as Arc<dyn TrackLocal + Send + Sync>)
                .await
                .map_err(to_rejected)?;
            debug!(
                target: "beach_call::webrtc",
                track_id = track.id(),
                kind = %track.kind(),
                "local track added"
            );
            senders.push(sender);
        }
        Ok(())
    }

    async fn detach_tracks(&self) -> Result<(), EngineError> {
        let mut senders = self.senders.lock().await;
        for sender in senders.drain(..) {
            self.pc.remove_track(&sender).await.map_err(to_rejected)?;
        }
        Ok(())
    }

    async fn close(&self) -> Result<(), EngineError> {
        let result = self.pc.close().await.map_err(to_setup_error);
        self.gathering.clear();
        self.connectivity.clear();
        result
    }
}

/// Builds a fresh [`WebRtcEngine`] for every call attempt.
#[derive(Debug, Clone)]
pub struct WebRtcEngineFactory {
    ice_servers: Vec<String>,
}

impl WebRtcEngineFactory {
    pub fn new(config: &HandshakeConfig) -> Self {
        Self {
            ice_servers: config.ice_servers.clone(),
        }
    }
}

#[async_trait]
impl EngineFactory for WebRtcEngineFactory {
    async fn create_engine(&self) -> Result<Arc<dyn PeerEngine>, EngineError> {
        let engine = WebRtcEngine::connect(&self.ice_servers).await?;
        Ok(Arc::new(engine))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use call_handshake::{CandidateGatherer, LocalTrack};

    #[test_timeout::timeout]
    fn session_descriptions_map_to_rtc_kinds() {
        let parsed = to_rtc(SessionDescription::offer(
            "v=0\r\no=- 1 2 IN IP4 127.0.0.1\r\ns=-\r\nt=0 0\r\n",
        ))
        .expect("valid sdp");
        assert_eq!(parsed.sdp_type, RTCSdpType::Offer);

        let back = from_rtc(parsed).expect("offer kind");
        assert_eq!(back.kind, SdpKind::Offer);

        assert!(matches!(
            to_rtc(SessionDescription::answer("garbage")),
            Err(EngineError::Rejected(_))
        ));
    }

    #[test_timeout::timeout]
    fn state_mapping_skips_unspecified() {
        assert_eq!(
            gathering_from_rtc(RTCIceGathererState::Complete),
            Some(GatheringState::Complete)
        );
        assert_eq!(gathering_from_rtc(RTCIceGathererState::Unspecified), None);
        assert_eq!(
            connectivity_from_rtc(RTCPeerConnectionState::Failed),
            Some(ConnectivityState::Failed)
        );
        assert_eq!(connectivity_from_rtc(RTCPeerConnectionState::Unspecified), None);
    }

    #[test_timeout::tokio_timeout_test(30)]
    async fn offer_carries_attached_tracks() {
        let engine = match WebRtcEngine::connect(&[]).await {
            Ok(engine) => engine,
            Err(err) => {
                eprintln!("skipping webrtc engine test: {err}");
                return;
            }
        };
        let media = MediaTrackSet::new(vec![
            LocalTrack::new(TrackKind::Audio, "mic"),
            LocalTrack::new(TrackKind::Video, "cam"),
        ]);
        engine.attach_tracks(&media).await.expect("attach");

        let offer = engine.create_offer().await.expect("offer");
        assert_eq!(offer.kind, SdpKind::Offer);
        engine.set_local_description(offer).await.expect("local");

        CandidateGatherer::new(Duration::from_secs(5))
            .await_completion(&engine)
            .await;
        let local = engine.local_description().await.expect("local description");
        assert!(local.sdp.contains("m=audio"));
        assert!(local.sdp.contains("m=video"));

        engine.close().await.expect("close");
    }
}
