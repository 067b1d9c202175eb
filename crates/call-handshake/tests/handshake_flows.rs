use std::sync::Arc;
use std::time::Duration;

use call_handshake::mock::{
    GatherBehavior, MockClipboard, MockEngineFactory, MockMediaSource, MockNetwork,
};
use call_handshake::{
    CandidateGatherer, ConnectionState, ConnectivityState, GatherOutcome, HandshakeConfig,
    HandshakeError, HandshakeOrchestrator, PeerSession, Role, SdpKind, StateObserver, blob,
    status,
};
use parking_lot::Mutex;

fn orchestrator(
    network: &Arc<MockNetwork>,
    behavior: GatherBehavior,
) -> (HandshakeOrchestrator, Arc<MockEngineFactory>) {
    let factory = Arc::new(MockEngineFactory::new(Arc::clone(network), behavior));
    let orchestrator = HandshakeOrchestrator::new(factory.clone(), HandshakeConfig::default())
        .with_media_source(Arc::new(MockMediaSource::camera()));
    (orchestrator, factory)
}

#[test_timeout::tokio_timeout_test]
async fn invite_answer_complete_connects_both_sides() {
    let network = MockNetwork::new();
    let (caller, _) = orchestrator(&network, GatherBehavior::Immediate);
    let (callee, _) = orchestrator(&network, GatherBehavior::Immediate);

    let invite = caller.initiate().await.expect("initiate");
    assert_eq!(invite.session.role(), Role::Caller);
    assert_eq!(invite.session.state(), ConnectionState::AwaitingRemote);
    assert_eq!(caller.status().message, status::INVITE_READY);
    let offer = blob::decode(&invite.blob).expect("offer blob");
    assert_eq!(offer.kind, SdpKind::Offer);
    assert!(offer.candidates().count() > 0);

    let answer = callee.join(&invite.blob).await.expect("join");
    assert_eq!(answer.session.role(), Role::Callee);
    assert_eq!(answer.session.state(), ConnectionState::Connecting);
    assert_eq!(callee.status().message, status::ANSWER_READY);
    assert_eq!(
        answer.session.remote_description().expect("remote offer"),
        offer
    );

    caller
        .complete(&invite.session, &answer.blob)
        .await
        .expect("complete");

    let limit = Duration::from_secs(1);
    assert_eq!(
        caller.wait_for_outcome(&invite.session, limit).await,
        Some(ConnectionState::Connected)
    );
    assert_eq!(
        callee.wait_for_outcome(&answer.session, limit).await,
        Some(ConnectionState::Connected)
    );
    assert_eq!(caller.status().message, "Connected");
    assert_eq!(caller.status().state, Some(ConnectionState::Connected));

    assert!(matches!(
        caller.complete(&invite.session, &answer.blob).await,
        Err(HandshakeError::AlreadyApplied)
    ));
    assert_eq!(caller.status().message, status::ANSWER_ALREADY_APPLIED);

    caller.hang_up(&invite.session).await;
    assert_eq!(invite.session.state(), ConnectionState::Closed);
    assert_eq!(caller.status().message, "Call ended");
}

#[test_timeout::tokio_timeout_test]
async fn malformed_invite_leaves_callee_session_new() {
    let network = MockNetwork::new();
    let engine = network.engine(GatherBehavior::Immediate);
    let callee = PeerSession::new(Role::Callee, engine);

    let err = callee.create_answer("{garbage}").await.expect_err("garbage");
    assert!(matches!(err, HandshakeError::MalformedBlob(_)));
    assert_eq!(callee.state(), ConnectionState::New);
    assert!(callee.remote_description().is_none());

    let (orchestrator, factory) = orchestrator(&network, GatherBehavior::Immediate);
    let err = orchestrator.join("not json").await.expect_err("not json");
    assert!(matches!(err, HandshakeError::MalformedBlob(_)));
    assert_eq!(orchestrator.status().message, status::INVALID_INVITE);
    let abandoned = factory.last_engine().expect("engine was created");
    assert!(abandoned.is_closed());
}

#[test_timeout::tokio_timeout_test(paused)]
async fn close_during_gathering_ignores_the_late_result() {
    let network = MockNetwork::new();
    let engine = network.engine(GatherBehavior::Never);
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    let observer: StateObserver = Arc::new(move |state| sink.lock().push(state));
    let session = Arc::new(PeerSession::with_observer(
        Role::Caller,
        engine.clone(),
        Some(observer),
    ));

    session.create_offer().await.expect("offer");
    assert_eq!(session.state(), ConnectionState::Gathering);

    let waiting = {
        let session = Arc::clone(&session);
        tokio::spawn(async move {
            session
                .await_gathering(&CandidateGatherer::new(Duration::from_millis(2000)))
                .await
        })
    };
    tokio::task::yield_now().await;

    session.close().await;
    assert_eq!(session.state(), ConnectionState::Closed);

    let late = waiting.await.expect("join");
    assert!(matches!(late, Err(HandshakeError::SessionClosed)));
    assert_eq!(session.state(), ConnectionState::Closed);
    assert_eq!(
        *seen.lock(),
        vec![ConnectionState::Gathering, ConnectionState::Closed]
    );
    assert!(matches!(
        session.export_local_blob(),
        Err(HandshakeError::SessionClosed)
    ));
    assert_eq!(engine.gathering_listener_count(), 0);
}

#[test_timeout::tokio_timeout_test(paused)]
async fn slow_gathering_still_exports_after_the_timeout() {
    let network = MockNetwork::new();
    let (caller, _) = orchestrator(&network, GatherBehavior::After(Duration::from_secs(30)));

    let started = tokio::time::Instant::now();
    let invite = caller.initiate().await.expect("initiate");
    let elapsed = started.elapsed();

    assert!(elapsed >= Duration::from_millis(2000));
    assert!(elapsed < Duration::from_secs(3));
    assert_eq!(invite.session.state(), ConnectionState::AwaitingRemote);
    let offer = blob::decode(&invite.blob).expect("offer");
    assert_eq!(offer.candidates().count(), 0);
}

#[test_timeout::tokio_timeout_test]
async fn gathering_outcome_is_reported_to_the_session_caller() {
    let network = MockNetwork::new();
    let session = PeerSession::new(Role::Caller, network.engine(GatherBehavior::Immediate));
    session.create_offer().await.expect("offer");
    let outcome = session
        .await_gathering(&CandidateGatherer::default())
        .await
        .expect("gather");
    assert_eq!(outcome, GatherOutcome::Complete);
    assert!(matches!(
        session
            .await_gathering(&CandidateGatherer::default())
            .await,
        Err(HandshakeError::InvalidRoleTransition {
            state: ConnectionState::Ready,
            ..
        })
    ));
}

#[test_timeout::tokio_timeout_test]
async fn bad_answer_paste_can_be_retried() {
    let network = MockNetwork::new();
    let (caller, _) = orchestrator(&network, GatherBehavior::Immediate);
    let (callee, _) = orchestrator(&network, GatherBehavior::Immediate);

    let invite = caller.initiate().await.expect("initiate");
    let answer = callee.join(&invite.blob).await.expect("join");

    let err = caller
        .complete(&invite.session, &answer.blob[..answer.blob.len() / 2])
        .await
        .expect_err("truncated paste");
    assert!(matches!(err, HandshakeError::MalformedBlob(_)));
    assert_eq!(caller.status().message, status::INVALID_ANSWER);
    assert_eq!(invite.session.state(), ConnectionState::AwaitingRemote);

    // Pasting our own invite back is the wrong kind.
    let err = caller
        .complete(&invite.session, &invite.blob)
        .await
        .expect_err("own invite");
    assert!(matches!(err, HandshakeError::HandshakeRejected(_)));

    caller
        .complete(&invite.session, &answer.blob)
        .await
        .expect("retry");
    assert_eq!(
        caller
            .wait_for_outcome(&invite.session, Duration::from_secs(1))
            .await,
        Some(ConnectionState::Connected)
    );
}

#[test_timeout::tokio_timeout_test]
async fn connectivity_failure_is_terminal_and_reported() {
    let network = MockNetwork::new();
    let (caller, factory) = orchestrator(&network, GatherBehavior::Immediate);
    let (callee, _) = orchestrator(&network, GatherBehavior::Immediate);

    let invite = caller.initiate().await.expect("initiate");
    let answer = callee.join(&invite.blob).await.expect("join");
    caller
        .complete(&invite.session, &answer.blob)
        .await
        .expect("complete");
    assert_eq!(invite.session.state(), ConnectionState::Connected);

    let engine = factory.last_engine().expect("caller engine");
    engine.emit_connectivity(ConnectivityState::Disconnected);
    assert_eq!(caller.status().message, "Connection lost");
    engine.emit_connectivity(ConnectivityState::Failed);
    engine.emit_connectivity(ConnectivityState::Connected);

    assert_eq!(
        caller
            .wait_for_outcome(&invite.session, Duration::from_secs(1))
            .await,
        Some(ConnectionState::Failed)
    );
    assert!(caller.status().is_error());
    assert_eq!(caller.status().message, "Connection failed");
}

#[test_timeout::tokio_timeout_test]
async fn engine_rejecting_the_answer_keeps_awaiting_remote() {
    let network = MockNetwork::new();
    let (caller, factory) = orchestrator(&network, GatherBehavior::Immediate);
    let (callee, _) = orchestrator(&network, GatherBehavior::Immediate);

    let invite = caller.initiate().await.expect("initiate");
    let answer = callee.join(&invite.blob).await.expect("join");
    factory
        .last_engine()
        .expect("caller engine")
        .set_reject_remote(true);

    assert!(matches!(
        caller.complete(&invite.session, &answer.blob).await,
        Err(HandshakeError::HandshakeRejected(_))
    ));
    assert_eq!(invite.session.state(), ConnectionState::AwaitingRemote);
    assert!(invite.session.remote_description().is_none());
}

#[test_timeout::tokio_timeout_test]
async fn missing_media_falls_back_to_receive_only() {
    let network = MockNetwork::new();
    let factory = Arc::new(MockEngineFactory::new(
        Arc::clone(&network),
        GatherBehavior::Immediate,
    ));
    let source = Arc::new(MockMediaSource::unavailable());
    let caller = HandshakeOrchestrator::new(factory.clone(), HandshakeConfig::default())
        .with_media_source(source.clone());

    assert!(matches!(
        caller.prepare_media().await,
        Err(HandshakeError::Acquisition(_))
    ));
    assert_eq!(caller.status().message, status::MEDIA_UNAVAILABLE);

    let invite = caller.initiate().await.expect("initiate without media");
    assert!(invite.session.media().is_none());
    assert!(caller.status().message.starts_with(status::INVITE_READY));
    assert!(caller.status().message.contains("receive-only"));
    assert_eq!(factory.last_engine().expect("engine").attached_track_count(), 0);
    assert_eq!(caller.toggle_mic(), None);
    assert_eq!(source.acquisitions(), 2);
}

#[test_timeout::tokio_timeout_test]
async fn toggles_flip_tracks_without_touching_the_session() {
    let network = MockNetwork::new();
    let (caller, factory) = orchestrator(&network, GatherBehavior::Immediate);

    let invite = caller.initiate().await.expect("initiate");
    let media = caller.local_media().expect("media acquired");
    assert_eq!(factory.last_engine().expect("engine").attached_track_count(), 2);

    assert_eq!(caller.toggle_mic(), Some(true));
    assert_eq!(caller.toggle_video(), Some(true));
    assert!(!media.is_kind_enabled(call_handshake::TrackKind::Audio));
    assert!(!media.is_kind_enabled(call_handshake::TrackKind::Video));
    assert_eq!(caller.toggle_mic(), Some(false));
    assert_eq!(invite.session.state(), ConnectionState::AwaitingRemote);

    caller.hang_up(&invite.session).await;
    assert!(media.is_stopped());

    // A new attempt acquires a fresh capture.
    let retry = caller.initiate().await.expect("second attempt");
    let fresh = caller.local_media().expect("fresh media");
    assert!(!fresh.is_stopped());
    assert_ne!(fresh.tracks()[0].id(), media.tracks()[0].id());
    caller.hang_up(&retry.session).await;
}

#[test_timeout::tokio_timeout_test]
async fn copy_reports_through_status() {
    let network = MockNetwork::new();
    let factory = Arc::new(MockEngineFactory::new(
        Arc::clone(&network),
        GatherBehavior::Immediate,
    ));
    let clipboard = Arc::new(MockClipboard::default());
    let working = HandshakeOrchestrator::new(factory.clone(), HandshakeConfig::default())
        .with_clipboard(clipboard.clone());

    working.copy_blob("{\"type\":\"offer\"}").expect("copy");
    assert_eq!(working.status().message, status::COPIED);
    assert_eq!(clipboard.contents(), vec!["{\"type\":\"offer\"}".to_string()]);

    let broken = HandshakeOrchestrator::new(factory.clone(), HandshakeConfig::default())
        .with_clipboard(Arc::new(MockClipboard::broken()));
    assert!(matches!(
        broken.copy_blob("x"),
        Err(HandshakeError::Clipboard(_))
    ));
    assert_eq!(broken.status().message, status::COPY_FAILED);

    let absent = HandshakeOrchestrator::new(factory, HandshakeConfig::default());
    assert!(absent.copy_blob("x").is_err());
}

#[test_timeout::tokio_timeout_test]
async fn engine_setup_failure_surfaces_as_error_status() {
    let network = MockNetwork::new();
    let (caller, factory) = orchestrator(&network, GatherBehavior::Immediate);
    factory.fail_setup(true);

    assert!(matches!(
        caller.initiate().await,
        Err(HandshakeError::Engine(_))
    ));
    assert!(caller.status().is_error());
    assert!(factory.created().is_empty());
}

#[test_timeout::tokio_timeout_test]
async fn wait_for_outcome_times_out_without_connectivity() {
    let network = MockNetwork::new();
    let (caller, _) = orchestrator(&network, GatherBehavior::Immediate);
    let invite = caller.initiate().await.expect("initiate");

    assert_eq!(
        caller
            .wait_for_outcome(&invite.session, Duration::from_millis(50))
            .await,
        None
    );
}
