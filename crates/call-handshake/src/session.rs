//! Per-call handshake state machine.
//!
//! A [`PeerSession`] owns one engine and walks it through offer/answer
//! creation, the bounded candidate wait, blob export, and remote application.
//! All methods take `&self`; transitions are applied under the session mutex
//! and every engine call re-checks the state when it resolves, so a
//! [`PeerSession::close`] racing with an in-flight step always wins.

use std::fmt;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use crate::blob::{self, SdpKind, SessionDescription};
use crate::engine::{ConnectivityState, EngineError, PeerEngine, Subscription};
use crate::error::{HandshakeError, HandshakeResult};
use crate::gatherer::{CandidateGatherer, GatherOutcome};
use crate::media::MediaTrackSet;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Role {
    /// Creates the offer and later applies the answer.
    Caller,
    /// Applies the offer and creates the answer.
    Callee,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Caller => f.write_str("caller"),
            Role::Callee => f.write_str("callee"),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    New,
    Gathering,
    Ready,
    AwaitingRemote,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl ConnectionState {
    pub fn as_str(self) -> &'static str {
        match self {
            ConnectionState::New => "new",
            ConnectionState::Gathering => "gathering",
            ConnectionState::Ready => "ready",
            ConnectionState::AwaitingRemote => "awaiting_remote",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Failed => "failed",
            ConnectionState::Closed => "closed",
        }
    }

    /// Human-readable status line.
    pub fn label(self) -> &'static str {
        match self {
            ConnectionState::New => "Ready",
            ConnectionState::Gathering => "Creating connection code...",
            ConnectionState::Ready => "Connection code ready",
            ConnectionState::AwaitingRemote => "Code created. Send it to your peer.",
            ConnectionState::Connecting => "Connecting...",
            ConnectionState::Connected => "Connected",
            ConnectionState::Disconnected => "Connection lost",
            ConnectionState::Failed => "Connection failed",
            ConnectionState::Closed => "Call ended",
        }
    }

    /// No further transition except `Closed`.
    pub fn is_terminal(self) -> bool {
        matches!(self, ConnectionState::Failed | ConnectionState::Closed)
    }

    /// Whether the remote description has been applied on this side.
    fn remote_applied(self) -> bool {
        matches!(
            self,
            ConnectionState::Connecting
                | ConnectionState::Connected
                | ConnectionState::Disconnected
                | ConnectionState::Failed
        )
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SessionId(Uuid);

impl SessionId {
    fn generate() -> Self {
        SessionId(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Called synchronously, under the session lock, on every transition. It
/// must not call back into the session.
pub type StateObserver = Arc<dyn Fn(ConnectionState) + Send + Sync>;

struct SessionInner {
    state: ConnectionState,
    local: Option<SessionDescription>,
    remote: Option<SessionDescription>,
    /// An offer/answer or remote application is awaiting the engine.
    in_flight: bool,
    media: Option<MediaTrackSet>,
    pending_connectivity: Option<ConnectivityState>,
    connectivity: Option<Subscription>,
}

struct Shared {
    id: SessionId,
    role: Role,
    inner: Mutex<SessionInner>,
    state_tx: watch::Sender<ConnectionState>,
    observer: Option<StateObserver>,
}

impl Shared {
    fn transition(&self, inner: &mut SessionInner, next: ConnectionState) {
        let previous = inner.state;
        if previous == next {
            return;
        }
        inner.state = next;
        debug!(
            target: "beach_call::session",
            session_id = %self.id,
            role = %self.role,
            from = %previous,
            to = %next,
            "state transition"
        );
        self.state_tx.send_replace(next);
        if let Some(observer) = &self.observer {
            observer(next);
        }
    }

    fn on_connectivity(&self, signal: ConnectivityState) {
        let mut inner = self.inner.lock();
        match inner.state {
            ConnectionState::Closed | ConnectionState::Failed => {
                trace!(
                    target: "beach_call::session",
                    session_id = %self.id,
                    signal = ?signal,
                    "ignoring connectivity signal after terminal state"
                );
            }
            ConnectionState::New
            | ConnectionState::Gathering
            | ConnectionState::Ready
            | ConnectionState::AwaitingRemote => {
                if matches!(
                    signal,
                    ConnectivityState::Connected
                        | ConnectivityState::Disconnected
                        | ConnectivityState::Failed
                        | ConnectivityState::Closed
                ) {
                    debug!(
                        target: "beach_call::session",
                        session_id = %self.id,
                        state = %inner.state,
                        signal = ?signal,
                        "deferring connectivity signal until connecting"
                    );
                    inner.pending_connectivity = Some(signal);
                }
            }
            ConnectionState::Connecting
            | ConnectionState::Connected
            | ConnectionState::Disconnected => self.apply_connectivity(&mut inner, signal),
        }
    }

    fn apply_connectivity(&self, inner: &mut SessionInner, signal: ConnectivityState) {
        let next = match (inner.state, signal) {
            (
                ConnectionState::Connecting | ConnectionState::Disconnected,
                ConnectivityState::Connected,
            ) => ConnectionState::Connected,
            (
                ConnectionState::Connecting | ConnectionState::Connected,
                ConnectivityState::Disconnected,
            ) => ConnectionState::Disconnected,
            (
                ConnectionState::Connecting
                | ConnectionState::Connected
                | ConnectionState::Disconnected,
                ConnectivityState::Failed | ConnectivityState::Closed,
            ) => ConnectionState::Failed,
            _ => return,
        };
        if next == ConnectionState::Failed {
            warn!(
                target: "beach_call::session",
                session_id = %self.id,
                role = %self.role,
                signal = ?signal,
                "peer connection failed"
            );
        } else if next == ConnectionState::Connected {
            info!(
                target: "beach_call::session",
                session_id = %self.id,
                role = %self.role,
                "peer connected"
            );
        }
        self.transition(inner, next);
    }

    fn enter_connecting(&self, inner: &mut SessionInner) {
        self.transition(inner, ConnectionState::Connecting);
        if let Some(signal) = inner.pending_connectivity.take() {
            self.apply_connectivity(inner, signal);
        }
    }
}

pub struct PeerSession {
    shared: Arc<Shared>,
    engine: Arc<dyn PeerEngine>,
}

impl PeerSession {
    pub fn new(role: Role, engine: Arc<dyn PeerEngine>) -> Self {
        Self::with_observer(role, engine, None)
    }

    pub fn with_observer(
        role: Role,
        engine: Arc<dyn PeerEngine>,
        observer: Option<StateObserver>,
    ) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::New);
        let shared = Arc::new(Shared {
            id: SessionId::generate(),
            role,
            inner: Mutex::new(SessionInner {
                state: ConnectionState::New,
                local: None,
                remote: None,
                in_flight: false,
                media: None,
                pending_connectivity: None,
                connectivity: None,
            }),
            state_tx,
            observer,
        });

        let weak: Weak<Shared> = Arc::downgrade(&shared);
        let subscription = engine.on_connectivity_change(Arc::new(move |signal| {
            if let Some(shared) = weak.upgrade() {
                shared.on_connectivity(signal);
            }
        }));
        shared.inner.lock().connectivity = Some(subscription);

        debug!(
            target: "beach_call::session",
            session_id = %shared.id,
            role = %role,
            "session created"
        );
        Self { shared, engine }
    }

    pub fn id(&self) -> SessionId {
        self.shared.id
    }

    pub fn role(&self) -> Role {
        self.shared.role
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.inner.lock().state
    }

    pub fn local_description(&self) -> Option<SessionDescription> {
        self.shared.inner.lock().local.clone()
    }

    pub fn remote_description(&self) -> Option<SessionDescription> {
        self.shared.inner.lock().remote.clone()
    }

    pub fn media(&self) -> Option<MediaTrackSet> {
        self.shared.inner.lock().media.clone()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state_tx.subscribe()
    }

    /// Caller only: creates the offer and starts candidate gathering.
    pub async fn create_offer(&self) -> HandshakeResult<()> {
        self.begin_negotiation(Role::Caller, "create_offer")?;
        let result = self.negotiate_offer().await;
        if result.is_err() {
            self.end_in_flight();
        }
        result
    }

    async fn negotiate_offer(&self) -> HandshakeResult<()> {
        let offer = self
            .engine
            .create_offer()
            .await
            .map_err(|err| self.rejected(err))?;
        self.engine
            .set_local_description(offer.clone())
            .await
            .map_err(|err| self.rejected(err))?;

        let mut inner = self.shared.inner.lock();
        if inner.state == ConnectionState::Closed {
            return Err(HandshakeError::SessionClosed);
        }
        inner.local = Some(offer);
        inner.in_flight = false;
        self.shared.transition(&mut inner, ConnectionState::Gathering);
        Ok(())
    }

    /// Callee only: applies the pasted offer, creates the answer, and starts
    /// candidate gathering. The remote offer is recorded only once every step
    /// has succeeded.
    pub async fn create_answer(&self, remote_offer: &str) -> HandshakeResult<()> {
        self.begin_negotiation(Role::Callee, "create_answer")?;
        let result = self.negotiate_answer(remote_offer).await;
        if result.is_err() {
            self.end_in_flight();
        }
        result
    }

    async fn negotiate_answer(&self, remote_offer: &str) -> HandshakeResult<()> {
        let offer = blob::decode(remote_offer)?;
        if offer.kind != SdpKind::Offer {
            return Err(HandshakeError::HandshakeRejected(format!(
                "expected an offer, received an {}",
                offer.kind
            )));
        }
        self.engine
            .set_remote_description(offer.clone())
            .await
            .map_err(|err| self.rejected(err))?;
        let answer = self
            .engine
            .create_answer()
            .await
            .map_err(|err| self.rejected(err))?;
        self.engine
            .set_local_description(answer.clone())
            .await
            .map_err(|err| self.rejected(err))?;

        let mut inner = self.shared.inner.lock();
        if inner.state == ConnectionState::Closed {
            return Err(HandshakeError::SessionClosed);
        }
        inner.remote = Some(offer);
        inner.local = Some(answer);
        inner.in_flight = false;
        self.shared.transition(&mut inner, ConnectionState::Gathering);
        Ok(())
    }

    /// Waits for candidate gathering, then captures the engine's final local
    /// description.
    pub async fn await_gathering(&self, gatherer: &CandidateGatherer) -> HandshakeResult<GatherOutcome> {
        {
            let mut inner = self.shared.inner.lock();
            match inner.state {
                ConnectionState::Gathering if !inner.in_flight => inner.in_flight = true,
                ConnectionState::Closed => return Err(HandshakeError::SessionClosed),
                state => return Err(self.invalid("await_gathering", state)),
            }
        }

        let outcome = gatherer.await_completion(self.engine.as_ref()).await;
        let gathered = self.engine.local_description().await;

        let mut inner = self.shared.inner.lock();
        inner.in_flight = false;
        if inner.state == ConnectionState::Closed {
            debug!(
                target: "beach_call::session",
                session_id = %self.shared.id,
                "discarding gathering result for closed session"
            );
            return Err(HandshakeError::SessionClosed);
        }
        match gathered {
            Some(local) if inner.local.as_ref().map(|l| l.kind) == Some(local.kind) => {
                debug!(
                    target: "beach_call::session",
                    session_id = %self.shared.id,
                    candidates = local.candidates().count(),
                    end_of_candidates = local.has_end_of_candidates(),
                    outcome = ?outcome,
                    "captured local description"
                );
                inner.local = Some(local);
            }
            _ => warn!(
                target: "beach_call::session",
                session_id = %self.shared.id,
                "engine returned no matching local description; keeping the initial one"
            ),
        }
        self.shared.transition(&mut inner, ConnectionState::Ready);
        Ok(outcome)
    }

    /// Encodes the local description for the user to hand to the peer. The
    /// first export moves a Caller to `AwaitingRemote` and a Callee to
    /// `Connecting`.
    pub fn export_local_blob(&self) -> HandshakeResult<String> {
        let mut inner = self.shared.inner.lock();
        let state = inner.state;
        match state {
            ConnectionState::New | ConnectionState::Gathering => {
                Err(HandshakeError::PrematureExport { state })
            }
            ConnectionState::Closed => Err(HandshakeError::SessionClosed),
            _ => {
                let blob = match &inner.local {
                    Some(local) => blob::encode(local),
                    None => return Err(HandshakeError::PrematureExport { state }),
                };
                if state == ConnectionState::Ready {
                    match self.shared.role {
                        Role::Caller => self
                            .shared
                            .transition(&mut inner, ConnectionState::AwaitingRemote),
                        Role::Callee => self.shared.enter_connecting(&mut inner),
                    }
                }
                Ok(blob)
            }
        }
    }

    /// Caller only: applies the pasted answer.
    pub async fn apply_remote_description(&self, remote_answer: &str) -> HandshakeResult<()> {
        {
            let mut inner = self.shared.inner.lock();
            let state = inner.state;
            if state == ConnectionState::Closed {
                return Err(HandshakeError::SessionClosed);
            }
            if self.shared.role != Role::Caller {
                return Err(self.invalid("apply_remote_description", state));
            }
            match state {
                ConnectionState::Ready | ConnectionState::AwaitingRemote if inner.in_flight => {
                    return Err(HandshakeError::AlreadyApplied);
                }
                ConnectionState::Ready | ConnectionState::AwaitingRemote => {}
                state if state.remote_applied() => return Err(HandshakeError::AlreadyApplied),
                state => return Err(self.invalid("apply_remote_description", state)),
            }
            inner.in_flight = true;
        }

        let result = self.apply_answer(remote_answer).await;
        if result.is_err() {
            self.end_in_flight();
        }
        result
    }

    async fn apply_answer(&self, remote_answer: &str) -> HandshakeResult<()> {
        let answer = blob::decode(remote_answer)?;
        if answer.kind != SdpKind::Answer {
            return Err(HandshakeError::HandshakeRejected(format!(
                "expected an answer, received an {}",
                answer.kind
            )));
        }
        self.engine
            .set_remote_description(answer.clone())
            .await
            .map_err(|err| self.rejected(err))?;

        let mut inner = self.shared.inner.lock();
        if inner.state == ConnectionState::Closed {
            return Err(HandshakeError::SessionClosed);
        }
        inner.remote = Some(answer);
        inner.in_flight = false;
        self.shared.enter_connecting(&mut inner);
        Ok(())
    }

    /// Hands local tracks to the engine. Tracks attached after the local
    /// description exists are not renegotiated.
    pub async fn attach_media(&self, tracks: MediaTrackSet) -> HandshakeResult<()> {
        {
            let inner = self.shared.inner.lock();
            if inner.state == ConnectionState::Closed {
                return Err(HandshakeError::SessionClosed);
            }
            if inner.local.is_some() {
                warn!(
                    target: "beach_call::session",
                    session_id = %self.shared.id,
                    state = %inner.state,
                    "attaching media after the local description was created; peer will not see it"
                );
            }
        }

        self.engine
            .attach_tracks(&tracks)
            .await
            .map_err(|err| self.engine_failure(err.into()))?;

        let mut inner = self.shared.inner.lock();
        if inner.state == ConnectionState::Closed {
            return Err(HandshakeError::SessionClosed);
        }
        debug!(
            target: "beach_call::session",
            session_id = %self.shared.id,
            tracks = tracks.tracks().len(),
            "media attached"
        );
        inner.media = Some(tracks);
        Ok(())
    }

    pub async fn detach_media(&self) -> HandshakeResult<()> {
        if self.state() == ConnectionState::Closed {
            return Err(HandshakeError::SessionClosed);
        }
        self.engine
            .detach_tracks()
            .await
            .map_err(|err| self.engine_failure(err.into()))?;

        let mut inner = self.shared.inner.lock();
        if inner.state == ConnectionState::Closed {
            return Err(HandshakeError::SessionClosed);
        }
        inner.media = None;
        Ok(())
    }

    /// Ends the session. Stops attached tracks and closes the engine; engine
    /// errors are logged. Calling it again is a no-op.
    pub async fn close(&self) {
        let (media, subscription) = {
            let mut inner = self.shared.inner.lock();
            if inner.state == ConnectionState::Closed {
                return;
            }
            self.shared.transition(&mut inner, ConnectionState::Closed);
            inner.pending_connectivity = None;
            (inner.media.take(), inner.connectivity.take())
        };
        drop(subscription);
        if let Some(media) = media {
            media.stop_all();
        }
        if let Err(err) = self.engine.close().await {
            warn!(
                target: "beach_call::session",
                session_id = %self.shared.id,
                error = %err,
                "engine close failed"
            );
        }
        info!(
            target: "beach_call::session",
            session_id = %self.shared.id,
            role = %self.shared.role,
            "session closed"
        );
    }

    fn begin_negotiation(&self, required: Role, operation: &'static str) -> HandshakeResult<()> {
        let mut inner = self.shared.inner.lock();
        let state = inner.state;
        if state == ConnectionState::Closed {
            return Err(HandshakeError::SessionClosed);
        }
        if self.shared.role != required || state != ConnectionState::New || inner.in_flight {
            return Err(self.invalid(operation, state));
        }
        inner.in_flight = true;
        Ok(())
    }

    /// An engine call that failed because `close()` shut the engine down
    /// reports `SessionClosed`.
    fn engine_failure(&self, err: HandshakeError) -> HandshakeError {
        if self.state() == ConnectionState::Closed {
            HandshakeError::SessionClosed
        } else {
            err
        }
    }

    fn rejected(&self, err: EngineError) -> HandshakeError {
        self.engine_failure(HandshakeError::HandshakeRejected(err.to_string()))
    }

    fn end_in_flight(&self) {
        self.shared.inner.lock().in_flight = false;
    }

    fn invalid(&self, operation: &'static str, state: ConnectionState) -> HandshakeError {
        HandshakeError::InvalidRoleTransition {
            operation,
            role: self.shared.role,
            state,
        }
    }
}

impl fmt::Debug for PeerSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PeerSession")
            .field("id", &self.shared.id)
            .field("role", &self.shared.role)
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::{LocalTrack, TrackKind};
    use crate::mock::{GatherBehavior, MockEngine, MockNetwork};
    use std::time::Duration;

    fn session(
        network: &Arc<MockNetwork>,
        role: Role,
        behavior: GatherBehavior,
    ) -> (PeerSession, Arc<MockEngine>) {
        let engine = network.engine(behavior);
        (PeerSession::new(role, engine.clone()), engine)
    }

    async fn ready_caller(network: &Arc<MockNetwork>) -> (PeerSession, Arc<MockEngine>) {
        let (caller, engine) = session(network, Role::Caller, GatherBehavior::Immediate);
        caller.create_offer().await.expect("offer");
        caller
            .await_gathering(&CandidateGatherer::default())
            .await
            .expect("gather");
        (caller, engine)
    }

    #[test_timeout::tokio_timeout_test]
    async fn caller_walks_to_awaiting_remote() {
        let network = MockNetwork::new();
        let (caller, _engine) = session(&network, Role::Caller, GatherBehavior::Immediate);
        assert_eq!(caller.state(), ConnectionState::New);

        caller.create_offer().await.expect("offer");
        assert_eq!(caller.state(), ConnectionState::Gathering);

        let outcome = caller
            .await_gathering(&CandidateGatherer::default())
            .await
            .expect("gather");
        assert_eq!(outcome, GatherOutcome::Complete);
        assert_eq!(caller.state(), ConnectionState::Ready);

        let blob = caller.export_local_blob().expect("export");
        assert_eq!(caller.state(), ConnectionState::AwaitingRemote);
        let decoded = blob::decode(&blob).expect("decode");
        assert_eq!(decoded.kind, SdpKind::Offer);
        assert!(decoded.candidates().count() > 0);

        // Re-export returns the same blob without moving the state.
        assert_eq!(caller.export_local_blob().expect("re-export"), blob);
        assert_eq!(caller.state(), ConnectionState::AwaitingRemote);
    }

    #[test_timeout::tokio_timeout_test]
    async fn export_before_ready_is_premature_for_both_roles() {
        let network = MockNetwork::new();
        let (caller, _) = session(&network, Role::Caller, GatherBehavior::Never);
        let (callee, _) = session(&network, Role::Callee, GatherBehavior::Never);

        assert!(matches!(
            caller.export_local_blob(),
            Err(HandshakeError::PrematureExport {
                state: ConnectionState::New
            })
        ));
        assert!(matches!(
            callee.export_local_blob(),
            Err(HandshakeError::PrematureExport {
                state: ConnectionState::New
            })
        ));

        caller.create_offer().await.expect("offer");
        assert!(matches!(
            caller.export_local_blob(),
            Err(HandshakeError::PrematureExport {
                state: ConnectionState::Gathering
            })
        ));
    }

    #[test_timeout::tokio_timeout_test]
    async fn roles_reject_the_other_side_operations() {
        let network = MockNetwork::new();
        let (caller, _) = session(&network, Role::Caller, GatherBehavior::Immediate);
        let (callee, _) = session(&network, Role::Callee, GatherBehavior::Immediate);

        assert!(matches!(
            callee.create_offer().await,
            Err(HandshakeError::InvalidRoleTransition {
                operation: "create_offer",
                role: Role::Callee,
                state: ConnectionState::New
            })
        ));
        assert!(matches!(
            caller.create_answer("{}").await,
            Err(HandshakeError::InvalidRoleTransition {
                role: Role::Caller,
                ..
            })
        ));
        assert!(matches!(
            callee.apply_remote_description("{}").await,
            Err(HandshakeError::InvalidRoleTransition { .. })
        ));
        assert!(matches!(
            caller.apply_remote_description("{}").await,
            Err(HandshakeError::InvalidRoleTransition {
                state: ConnectionState::New,
                ..
            })
        ));
        assert_eq!(caller.state(), ConnectionState::New);
        assert_eq!(callee.state(), ConnectionState::New);
    }

    #[test_timeout::tokio_timeout_test]
    async fn second_offer_is_an_invalid_transition() {
        let network = MockNetwork::new();
        let (caller, _) = session(&network, Role::Caller, GatherBehavior::Never);
        caller.create_offer().await.expect("offer");
        assert!(matches!(
            caller.create_offer().await,
            Err(HandshakeError::InvalidRoleTransition {
                state: ConnectionState::Gathering,
                ..
            })
        ));
    }

    #[test_timeout::tokio_timeout_test]
    async fn engine_failure_during_offer_leaves_state_new() {
        let network = MockNetwork::new();
        let (caller, engine) = session(&network, Role::Caller, GatherBehavior::Immediate);
        engine.fail_next_offer();

        assert!(matches!(
            caller.create_offer().await,
            Err(HandshakeError::HandshakeRejected(_))
        ));
        assert_eq!(caller.state(), ConnectionState::New);
        assert!(caller.local_description().is_none());

        caller.create_offer().await.expect("retry succeeds");
        assert_eq!(caller.state(), ConnectionState::Gathering);
    }

    #[test_timeout::tokio_timeout_test]
    async fn answer_kind_offered_to_callee_is_rejected() {
        let network = MockNetwork::new();
        let (callee, _) = session(&network, Role::Callee, GatherBehavior::Immediate);
        let answer = blob::encode(&SessionDescription::answer("v=0\r\ns=-\r\n"));

        assert!(matches!(
            callee.create_answer(&answer).await,
            Err(HandshakeError::HandshakeRejected(_))
        ));
        assert_eq!(callee.state(), ConnectionState::New);
        assert!(callee.remote_description().is_none());
    }

    #[test_timeout::tokio_timeout_test]
    async fn engine_rejecting_the_offer_records_nothing() {
        let network = MockNetwork::new();
        let (callee, _) = session(&network, Role::Callee, GatherBehavior::Immediate);
        let foreign = blob::encode(&SessionDescription::offer("v=0\r\ns=unknown\r\n"));

        assert!(matches!(
            callee.create_answer(&foreign).await,
            Err(HandshakeError::HandshakeRejected(_))
        ));
        assert_eq!(callee.state(), ConnectionState::New);
        assert!(callee.remote_description().is_none());
        assert!(callee.local_description().is_none());
    }

    #[test_timeout::tokio_timeout_test]
    async fn apply_checks_state_and_kind_before_engine() {
        let network = MockNetwork::new();
        let (caller, _) = ready_caller(&network).await;
        caller.export_local_blob().expect("export");

        assert!(matches!(
            caller.apply_remote_description("not json").await,
            Err(HandshakeError::MalformedBlob(_))
        ));
        let offer = blob::encode(&SessionDescription::offer("v=0\r\ns=-\r\n"));
        assert!(matches!(
            caller.apply_remote_description(&offer).await,
            Err(HandshakeError::HandshakeRejected(_))
        ));
        assert_eq!(caller.state(), ConnectionState::AwaitingRemote);
        assert!(caller.remote_description().is_none());
    }

    #[test_timeout::tokio_timeout_test]
    async fn connectivity_drives_connected_disconnected_and_recovery() {
        let network = MockNetwork::new();
        let (caller, engine) = ready_caller(&network).await;
        caller.export_local_blob().expect("export");

        let (callee, _callee_engine) = session(&network, Role::Callee, GatherBehavior::Immediate);
        callee
            .create_answer(&caller.export_local_blob().expect("offer blob"))
            .await
            .expect("answer");
        callee
            .await_gathering(&CandidateGatherer::default())
            .await
            .expect("gather");
        let answer = callee.export_local_blob().expect("answer blob");

        caller.apply_remote_description(&answer).await.expect("apply");
        assert_eq!(caller.state(), ConnectionState::Connected);
        assert_eq!(callee.state(), ConnectionState::Connected);

        engine.emit_connectivity(ConnectivityState::Disconnected);
        assert_eq!(caller.state(), ConnectionState::Disconnected);
        engine.emit_connectivity(ConnectivityState::Connected);
        assert_eq!(caller.state(), ConnectionState::Connected);

        engine.emit_connectivity(ConnectivityState::Failed);
        assert_eq!(caller.state(), ConnectionState::Failed);
        engine.emit_connectivity(ConnectivityState::Connected);
        assert_eq!(caller.state(), ConnectionState::Failed);

        assert!(matches!(
            caller.apply_remote_description(&answer).await,
            Err(HandshakeError::AlreadyApplied)
        ));
    }

    #[test_timeout::tokio_timeout_test]
    async fn early_connectivity_is_replayed_on_connecting() {
        let network = MockNetwork::new();
        let (callee, engine) = session(&network, Role::Callee, GatherBehavior::Immediate);
        let (caller, _) = ready_caller(&network).await;
        callee
            .create_answer(&caller.export_local_blob().expect("offer"))
            .await
            .expect("answer");
        callee
            .await_gathering(&CandidateGatherer::default())
            .await
            .expect("gather");

        engine.emit_connectivity(ConnectivityState::Connected);
        assert_eq!(callee.state(), ConnectionState::Ready);

        callee.export_local_blob().expect("export");
        assert_eq!(callee.state(), ConnectionState::Connected);
    }

    #[test_timeout::tokio_timeout_test]
    async fn close_is_idempotent_and_stops_tracks() {
        let network = MockNetwork::new();
        let (caller, engine) = session(&network, Role::Caller, GatherBehavior::Immediate);
        let media = MediaTrackSet::new(vec![
            LocalTrack::new(TrackKind::Audio, "mic"),
            LocalTrack::new(TrackKind::Video, "cam"),
        ]);
        caller.attach_media(media.clone()).await.expect("attach");
        assert_eq!(engine.attached_track_count(), 2);
        assert_eq!(engine.connectivity_listener_count(), 1);

        let mut states = caller.subscribe_state();
        caller.close().await;
        caller.close().await;

        assert_eq!(caller.state(), ConnectionState::Closed);
        assert_eq!(*states.borrow_and_update(), ConnectionState::Closed);
        assert!(media.is_stopped());
        assert!(engine.is_closed());
        assert_eq!(engine.connectivity_listener_count(), 0);

        assert!(matches!(
            caller.create_offer().await,
            Err(HandshakeError::SessionClosed)
        ));
        assert!(matches!(
            caller.export_local_blob(),
            Err(HandshakeError::SessionClosed)
        ));
        assert!(matches!(
            caller.attach_media(media).await,
            Err(HandshakeError::SessionClosed)
        ));
    }

    #[test_timeout::tokio_timeout_test(5, paused)]
    async fn close_during_description_calls_reports_session_closed() {
        let network = MockNetwork::new();
        let (caller, engine) = session(&network, Role::Caller, GatherBehavior::Immediate);
        engine.delay_descriptions(Duration::from_millis(100));

        let (offered, ()) = tokio::join!(caller.create_offer(), async {
            tokio::time::sleep(Duration::from_millis(40)).await;
            caller.close().await;
        });
        assert!(matches!(offered, Err(HandshakeError::SessionClosed)));
        assert_eq!(caller.state(), ConnectionState::Closed);
        assert!(caller.local_description().is_none());

        let (offerer, _) = ready_caller(&network).await;
        let offer = offerer.export_local_blob().expect("offer blob");
        let (callee, callee_engine) = session(&network, Role::Callee, GatherBehavior::Immediate);
        callee_engine.delay_descriptions(Duration::from_millis(100));

        let (answered, ()) = tokio::join!(callee.create_answer(&offer), async {
            tokio::time::sleep(Duration::from_millis(40)).await;
            callee.close().await;
        });
        assert!(matches!(answered, Err(HandshakeError::SessionClosed)));
        assert!(callee.remote_description().is_none());
    }

    #[test_timeout::tokio_timeout_test(5, paused)]
    async fn close_during_answer_application_reports_session_closed() {
        let network = MockNetwork::new();
        let (caller, caller_engine) = ready_caller(&network).await;
        let offer = caller.export_local_blob().expect("offer blob");

        let (callee, _) = session(&network, Role::Callee, GatherBehavior::Immediate);
        callee.create_answer(&offer).await.expect("answer");
        callee
            .await_gathering(&CandidateGatherer::default())
            .await
            .expect("gather");
        let answer = callee.export_local_blob().expect("answer blob");

        caller_engine.delay_descriptions(Duration::from_millis(100));
        let (applied, ()) = tokio::join!(caller.apply_remote_description(&answer), async {
            tokio::time::sleep(Duration::from_millis(40)).await;
            caller.close().await;
        });
        assert!(matches!(applied, Err(HandshakeError::SessionClosed)));
        assert_eq!(caller.state(), ConnectionState::Closed);
        assert!(caller.remote_description().is_none());
    }

    #[test_timeout::tokio_timeout_test]
    async fn toggling_tracks_does_not_touch_state() {
        let network = MockNetwork::new();
        let (caller, _) = ready_caller(&network).await;
        let media = MediaTrackSet::new(vec![LocalTrack::new(TrackKind::Audio, "mic")]);
        caller.attach_media(media.clone()).await.expect("attach");

        media.toggle_kind(TrackKind::Audio);
        assert_eq!(caller.state(), ConnectionState::Ready);
        assert!(!caller.media().expect("media").is_kind_enabled(TrackKind::Audio));

        caller.detach_media().await.expect("detach");
        assert!(caller.media().is_none());
        assert_eq!(caller.state(), ConnectionState::Ready);
    }

    #[test_timeout::tokio_timeout_test]
    async fn observer_sees_every_transition_in_order() {
        let network = MockNetwork::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let observer: StateObserver = Arc::new(move |state| sink.lock().push(state));
        let caller = PeerSession::with_observer(
            Role::Caller,
            network.engine(GatherBehavior::Immediate),
            Some(observer),
        );

        caller.create_offer().await.expect("offer");
        caller
            .await_gathering(&CandidateGatherer::new(Duration::from_millis(50)))
            .await
            .expect("gather");
        caller.export_local_blob().expect("export");
        caller.close().await;

        assert_eq!(
            *seen.lock(),
            vec![
                ConnectionState::Gathering,
                ConnectionState::Ready,
                ConnectionState::AwaitingRemote,
                ConnectionState::Closed
            ]
        );
    }
}
