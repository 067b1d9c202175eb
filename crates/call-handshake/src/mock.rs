//! In-memory engine and collaborators for exercising handshakes without a
//! network.
//!
//! Engines created from the same [`MockNetwork`] connect to each other once
//! each has applied the other's description, mirroring what ICE would do
//! after a successful blob exchange.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::trace;
use uuid::Uuid;

use crate::blob::{SdpKind, SessionDescription};
use crate::clipboard::{Clipboard, ClipboardError};
use crate::engine::{
    ConnectivityHandler, ConnectivityState, EngineError, EngineFactory, GatheringHandler,
    GatheringState, PeerEngine, Subscription,
};
use crate::listeners::ListenerSet;
use crate::media::{AcquisitionError, LocalTrack, MediaSource, MediaTrackSet, TrackKind};

const ENDPOINT_ATTRIBUTE: &str = "a=x-mock-endpoint:";

/// When a mock engine finishes gathering after its local description is set.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GatherBehavior {
    /// Inside `set_local_description`, before it returns.
    Immediate,
    After(Duration),
    /// Only through [`MockEngine::complete_gathering`].
    Never,
}

pub struct MockNetwork {
    engines: Mutex<Vec<Weak<MockEngine>>>,
}

impl MockNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            engines: Mutex::new(Vec::new()),
        })
    }

    pub fn engine(self: &Arc<Self>, behavior: GatherBehavior) -> Arc<MockEngine> {
        let network = Arc::downgrade(self);
        let engine = Arc::new_cyclic(|me| MockEngine {
            me: me.clone(),
            endpoint: Uuid::new_v4().simple().to_string(),
            network,
            behavior,
            state: Mutex::new(MockState::default()),
            gathering: ListenerSet::new(),
            connectivity: ListenerSet::new(),
            fail_next_offer: AtomicBool::new(false),
            reject_remote: AtomicBool::new(false),
            description_delay: Mutex::new(Duration::ZERO),
        });
        self.engines.lock().push(Arc::downgrade(&engine));
        engine
    }

    fn live_engines(&self) -> Vec<Arc<MockEngine>> {
        let mut engines = self.engines.lock();
        engines.retain(|engine| engine.strong_count() > 0);
        engines.iter().filter_map(Weak::upgrade).collect()
    }

    /// Connects every pair of open engines that hold each other's
    /// descriptions as remote.
    fn relink(&self) {
        let engines = self.live_engines();
        let mut newly_connected = Vec::new();
        for (index, first) in engines.iter().enumerate() {
            for second in engines.iter().skip(index + 1) {
                if first.is_paired_with(second) && second.is_paired_with(first) {
                    newly_connected.push(Arc::clone(first));
                    newly_connected.push(Arc::clone(second));
                }
            }
        }
        for engine in newly_connected {
            if engine.mark_connected() {
                engine.connectivity.emit(ConnectivityState::Connected);
            }
        }
    }
}

#[derive(Default)]
struct MockState {
    local: Option<SessionDescription>,
    remote: Option<SessionDescription>,
    gathering: Option<GatheringState>,
    connectivity: Option<ConnectivityState>,
    tracks: Option<MediaTrackSet>,
    closed: bool,
}

pub struct MockEngine {
    me: Weak<MockEngine>,
    endpoint: String,
    network: Weak<MockNetwork>,
    behavior: GatherBehavior,
    state: Mutex<MockState>,
    gathering: ListenerSet<GatheringState>,
    connectivity: ListenerSet<ConnectivityState>,
    fail_next_offer: AtomicBool,
    reject_remote: AtomicBool,
    description_delay: Mutex<Duration>,
}

static SDP_VERSION: AtomicU64 = AtomicU64::new(1);

impl MockEngine {
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn fail_next_offer(&self) {
        self.fail_next_offer.store(true, Ordering::SeqCst);
    }

    pub fn set_reject_remote(&self, reject: bool) {
        self.reject_remote.store(reject, Ordering::SeqCst);
    }

    /// Makes offer/answer creation and remote application take `delay`
    /// before they look at the engine state.
    pub fn delay_descriptions(&self, delay: Duration) {
        *self.description_delay.lock() = delay;
    }

    async fn description_latency(&self) {
        let delay = *self.description_delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    pub fn gathering_listener_count(&self) -> usize {
        self.gathering.subscriber_count()
    }

    pub fn connectivity_listener_count(&self) -> usize {
        self.connectivity.subscriber_count()
    }

    pub fn attached_track_count(&self) -> usize {
        self.state
            .lock()
            .tracks
            .as_ref()
            .map(|tracks| tracks.tracks().len())
            .unwrap_or(0)
    }

    pub fn remote(&self) -> Option<SessionDescription> {
        self.state.lock().remote.clone()
    }

    /// Pushes a connectivity signal to subscribers as the transport would.
    pub fn emit_connectivity(&self, signal: ConnectivityState) {
        {
            let mut state = self.state.lock();
            if state.closed {
                return;
            }
            state.connectivity = Some(signal);
        }
        self.connectivity.emit(signal);
    }

    /// Appends host candidates to the local description and reports
    /// gathering complete. No-op once closed or already complete.
    pub fn complete_gathering(&self) {
        {
            let mut state = self.state.lock();
            if state.closed || state.gathering == Some(GatheringState::Complete) {
                return;
            }
            let Some(local) = state.local.as_mut() else {
                return;
            };
            let port = 50_000 + (self.endpoint.len() as u16 * 7) % 1000;
            local.sdp.push_str(&format!(
                "a=candidate:1 1 udp 2130706431 127.0.0.1 {port} typ host\r\n"
            ));
            local.sdp.push_str("a=end-of-candidates\r\n");
            state.gathering = Some(GatheringState::Complete);
        }
        trace!(target: "beach_call::mock", endpoint = %self.endpoint, "gathering complete");
        self.gathering.emit(GatheringState::Complete);
    }

    fn render_sdp(&self, kind: SdpKind) -> String {
        let tracks = self
            .state
            .lock()
            .tracks
            .as_ref()
            .map(|tracks| tracks.tracks().to_vec())
            .unwrap_or_default();
        let version = SDP_VERSION.fetch_add(1, Ordering::Relaxed);
        let mut sdp = format!(
            "v=0\r\no=- {version} 2 IN IP4 127.0.0.1\r\ns=-\r\nt=0 0\r\n{ENDPOINT_ATTRIBUTE}{}\r\na=x-mock-kind:{kind}\r\n",
            self.endpoint
        );
        for track in &tracks {
            let media = match track.kind() {
                TrackKind::Audio => "audio",
                TrackKind::Video => "video",
            };
            sdp.push_str(&format!(
                "m={media} 9 UDP/TLS/RTP/SAVPF 96\r\na=msid:beach-call {}\r\n",
                track.id()
            ));
        }
        if tracks.is_empty() {
            sdp.push_str("m=application 9 UDP/DTLS/SCTP webrtc-datachannel\r\n");
        }
        sdp
    }

    fn is_paired_with(&self, other: &MockEngine) -> bool {
        let state = self.state.lock();
        !state.closed
            && state
                .remote
                .as_ref()
                .and_then(|remote| endpoint_of(&remote.sdp))
                .is_some_and(|endpoint| endpoint == other.endpoint)
    }

    fn mark_connected(&self) -> bool {
        let mut state = self.state.lock();
        if state.closed || state.connectivity == Some(ConnectivityState::Connected) {
            return false;
        }
        state.connectivity = Some(ConnectivityState::Connected);
        true
    }

    fn schedule_gathering(&self) {
        match self.behavior {
            GatherBehavior::Immediate => self.complete_gathering(),
            GatherBehavior::After(delay) => {
                let me = self.me.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    if let Some(engine) = me.upgrade() {
                        engine.complete_gathering();
                    }
                });
            }
            GatherBehavior::Never => {}
        }
    }
}

fn endpoint_of(sdp: &str) -> Option<&str> {
    sdp.lines()
        .find_map(|line| line.trim().strip_prefix(ENDPOINT_ATTRIBUTE))
}

#[async_trait]
impl PeerEngine for MockEngine {
    async fn create_offer(&self) -> Result<SessionDescription, EngineError> {
        self.description_latency().await;
        if self.is_closed() {
            return Err(EngineError::Closed);
        }
        if self.fail_next_offer.swap(false, Ordering::SeqCst) {
            return Err(EngineError::Rejected("offer creation failed".into()));
        }
        Ok(SessionDescription::offer(self.render_sdp(SdpKind::Offer)))
    }

    async fn create_answer(&self) -> Result<SessionDescription, EngineError> {
        self.description_latency().await;
        {
            let state = self.state.lock();
            if state.closed {
                return Err(EngineError::Closed);
            }
            if state.remote.as_ref().map(|remote| remote.kind) != Some(SdpKind::Offer) {
                return Err(EngineError::Rejected("no remote offer to answer".into()));
            }
        }
        Ok(SessionDescription::answer(self.render_sdp(SdpKind::Answer)))
    }

    async fn set_local_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), EngineError> {
        {
            let mut state = self.state.lock();
            if state.closed {
                return Err(EngineError::Closed);
            }
            if endpoint_of(&description.sdp) != Some(self.endpoint.as_str()) {
                return Err(EngineError::Rejected(
                    "local description was not created by this engine".into(),
                ));
            }
            state.local = Some(description);
            state.gathering = Some(GatheringState::Gathering);
        }
        self.gathering.emit(GatheringState::Gathering);
        self.schedule_gathering();
        Ok(())
    }

    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), EngineError> {
        self.description_latency().await;
        {
            let mut state = self.state.lock();
            if state.closed {
                return Err(EngineError::Closed);
            }
            if self.reject_remote.load(Ordering::SeqCst) {
                return Err(EngineError::Rejected("remote description refused".into()));
            }
            if endpoint_of(&description.sdp).is_none() {
                return Err(EngineError::Rejected(
                    "unrecognized session description".into(),
                ));
            }
            let local_kind = state.local.as_ref().map(|local| local.kind);
            match (description.kind, local_kind) {
                (SdpKind::Offer, None) | (SdpKind::Answer, Some(SdpKind::Offer)) => {}
                (kind, local) => {
                    return Err(EngineError::Rejected(format!(
                        "cannot apply remote {kind} with local {local:?}"
                    )));
                }
            }
            state.remote = Some(description);
        }
        if let Some(network) = self.network.upgrade() {
            network.relink();
        }
        Ok(())
    }

    async fn local_description(&self) -> Option<SessionDescription> {
        self.state.lock().local.clone()
    }

    fn gathering_state(&self) -> GatheringState {
        self.state.lock().gathering.unwrap_or(GatheringState::New)
    }

    fn on_gathering_change(&self, handler: GatheringHandler) -> Subscription {
        self.gathering.subscribe(handler)
    }

    fn on_connectivity_change(&self, handler: ConnectivityHandler) -> Subscription {
        self.connectivity.subscribe(handler)
    }

    async fn attach_tracks(&self, tracks: &MediaTrackSet) -> Result<(), EngineError> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(EngineError::Closed);
        }
        state.tracks = Some(tracks.clone());
        Ok(())
    }

    async fn detach_tracks(&self) -> Result<(), EngineError> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(EngineError::Closed);
        }
        state.tracks = None;
        Ok(())
    }

    async fn close(&self) -> Result<(), EngineError> {
        {
            let mut state = self.state.lock();
            if state.closed {
                return Ok(());
            }
            state.closed = true;
            state.connectivity = Some(ConnectivityState::Closed);
        }
        self.connectivity.emit(ConnectivityState::Closed);
        self.gathering.clear();
        self.connectivity.clear();
        Ok(())
    }
}

/// Hands out engines from one network and keeps them for inspection.
pub struct MockEngineFactory {
    network: Arc<MockNetwork>,
    behavior: GatherBehavior,
    created: Mutex<Vec<Arc<MockEngine>>>,
    fail_setup: AtomicBool,
}

impl MockEngineFactory {
    pub fn new(network: Arc<MockNetwork>, behavior: GatherBehavior) -> Self {
        Self {
            network,
            behavior,
            created: Mutex::new(Vec::new()),
            fail_setup: AtomicBool::new(false),
        }
    }

    pub fn fail_setup(&self, fail: bool) {
        self.fail_setup.store(fail, Ordering::SeqCst);
    }

    pub fn created(&self) -> Vec<Arc<MockEngine>> {
        self.created.lock().clone()
    }

    pub fn last_engine(&self) -> Option<Arc<MockEngine>> {
        self.created.lock().last().cloned()
    }
}

#[async_trait]
impl EngineFactory for MockEngineFactory {
    async fn create_engine(&self) -> Result<Arc<dyn PeerEngine>, EngineError> {
        if self.fail_setup.load(Ordering::SeqCst) {
            return Err(EngineError::Setup("mock engine setup disabled".into()));
        }
        let engine = self.network.engine(self.behavior);
        self.created.lock().push(Arc::clone(&engine));
        Ok(engine)
    }
}

/// Camera and microphone stand-in.
pub struct MockMediaSource {
    available: bool,
    acquisitions: AtomicU64,
}

impl MockMediaSource {
    pub fn camera() -> Self {
        Self {
            available: true,
            acquisitions: AtomicU64::new(0),
        }
    }

    pub fn unavailable() -> Self {
        Self {
            available: false,
            acquisitions: AtomicU64::new(0),
        }
    }

    pub fn acquisitions(&self) -> u64 {
        self.acquisitions.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MediaSource for MockMediaSource {
    async fn acquire_local_media(&self) -> Result<MediaTrackSet, AcquisitionError> {
        let attempt = self.acquisitions.fetch_add(1, Ordering::SeqCst) + 1;
        if !self.available {
            return Err(AcquisitionError::Denied("permission dismissed".into()));
        }
        Ok(MediaTrackSet::new(vec![
            LocalTrack::new(TrackKind::Audio, format!("mock-audio-{attempt}")),
            LocalTrack::new(TrackKind::Video, format!("mock-video-{attempt}")),
        ]))
    }
}

#[derive(Default)]
pub struct MockClipboard {
    contents: Mutex<Vec<String>>,
    broken: AtomicBool,
}

impl MockClipboard {
    pub fn broken() -> Self {
        let clipboard = Self::default();
        clipboard.broken.store(true, Ordering::SeqCst);
        clipboard
    }

    pub fn contents(&self) -> Vec<String> {
        self.contents.lock().clone()
    }
}

impl Clipboard for MockClipboard {
    fn copy_text(&self, text: &str) -> Result<(), ClipboardError> {
        if self.broken.load(Ordering::SeqCst) {
            return Err(ClipboardError::Unavailable("no display".into()));
        }
        self.contents.lock().push(text.to_string());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_timeout::tokio_timeout_test]
    async fn engines_connect_after_exchanging_descriptions() {
        let network = MockNetwork::new();
        let caller = network.engine(GatherBehavior::Immediate);
        let callee = network.engine(GatherBehavior::Immediate);

        let offer = caller.create_offer().await.expect("offer");
        caller.set_local_description(offer).await.expect("local offer");
        let gathered_offer = caller.local_description().await.expect("gathered");
        assert_eq!(gathered_offer.candidates().count(), 1);

        callee
            .set_remote_description(gathered_offer)
            .await
            .expect("remote offer");
        let answer = callee.create_answer().await.expect("answer");
        callee.set_local_description(answer).await.expect("local answer");
        assert_eq!(callee.state.lock().connectivity, None);

        let connected = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&connected);
        let _subscription = caller.on_connectivity_change(Arc::new(move |state| {
            if state == ConnectivityState::Connected {
                flag.store(true, Ordering::SeqCst);
            }
        }));
        let gathered_answer = callee.local_description().await.expect("answer");
        caller
            .set_remote_description(gathered_answer)
            .await
            .expect("remote answer");
        assert!(connected.load(Ordering::SeqCst));
        assert_eq!(
            callee.state.lock().connectivity,
            Some(ConnectivityState::Connected)
        );
    }

    #[test_timeout::tokio_timeout_test]
    async fn foreign_descriptions_are_rejected() {
        let network = MockNetwork::new();
        let engine = network.engine(GatherBehavior::Never);
        let err = engine
            .set_remote_description(SessionDescription::offer("v=0\r\n"))
            .await
            .expect_err("foreign sdp");
        assert!(matches!(err, EngineError::Rejected(_)));

        let answer = engine.create_answer().await.expect_err("no remote offer");
        assert!(matches!(answer, EngineError::Rejected(_)));
    }

    #[test_timeout::tokio_timeout_test]
    async fn close_clears_listeners_and_refuses_work() {
        let network = MockNetwork::new();
        let engine = network.engine(GatherBehavior::Never);
        let _gathering = engine.on_gathering_change(Arc::new(|_| {}));
        assert_eq!(engine.gathering_listener_count(), 1);

        engine.close().await.expect("close");
        assert_eq!(engine.gathering_listener_count(), 0);
        assert!(matches!(
            engine.create_offer().await,
            Err(EngineError::Closed)
        ));
    }
}
