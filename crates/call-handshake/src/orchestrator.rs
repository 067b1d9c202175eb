//! Call flows on top of [`PeerSession`]: media preparation, the caller's
//! invite, the callee's answer, completion, hang-up, and the status line.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::clipboard::{Clipboard, ClipboardError};
use crate::config::HandshakeConfig;
use crate::engine::EngineFactory;
use crate::error::{HandshakeError, HandshakeResult};
use crate::media::{MediaSource, MediaTrackSet, TrackKind};
use crate::session::{ConnectionState, PeerSession, Role, StateObserver};
use crate::status::{self, Status};

/// A session whose local blob is ready to hand to the peer.
#[derive(Debug, Clone)]
pub struct Handshake {
    pub session: Arc<PeerSession>,
    pub blob: String,
}

pub struct HandshakeOrchestrator {
    config: HandshakeConfig,
    engines: Arc<dyn EngineFactory>,
    media_source: Option<Arc<dyn MediaSource>>,
    clipboard: Option<Arc<dyn Clipboard>>,
    local_media: Mutex<Option<MediaTrackSet>>,
    status: Arc<watch::Sender<Status>>,
}

impl HandshakeOrchestrator {
    pub fn new(engines: Arc<dyn EngineFactory>, config: HandshakeConfig) -> Self {
        let (status, _) = watch::channel(Status::idle());
        Self {
            config,
            engines,
            media_source: None,
            clipboard: None,
            local_media: Mutex::new(None),
            status: Arc::new(status),
        }
    }

    pub fn with_media_source(mut self, source: Arc<dyn MediaSource>) -> Self {
        self.media_source = Some(source);
        self
    }

    pub fn with_clipboard(mut self, clipboard: Arc<dyn Clipboard>) -> Self {
        self.clipboard = Some(clipboard);
        self
    }

    pub fn config(&self) -> &HandshakeConfig {
        &self.config
    }

    pub fn status(&self) -> Status {
        self.status.borrow().clone()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<Status> {
        self.status.subscribe()
    }

    pub fn local_media(&self) -> Option<MediaTrackSet> {
        self.local_media.lock().clone()
    }

    /// Acquires local media unless a live capture already exists. Returns
    /// `Ok(None)` when no media source is configured.
    pub async fn prepare_media(&self) -> HandshakeResult<Option<MediaTrackSet>> {
        let current = self.local_media.lock().clone();
        if let Some(media) = current.filter(|media| !media.is_stopped()) {
            return Ok(Some(media));
        }
        let Some(source) = &self.media_source else {
            return Ok(None);
        };
        match source.acquire_local_media().await {
            Ok(media) => {
                info!(
                    target: "beach_call::orchestrator",
                    tracks = media.tracks().len(),
                    "local media acquired"
                );
                *self.local_media.lock() = Some(media.clone());
                self.set_message(status::MEDIA_READY);
                Ok(Some(media))
            }
            Err(err) => {
                warn!(
                    target: "beach_call::orchestrator",
                    error = %err,
                    "local media unavailable"
                );
                self.set_message(status::MEDIA_UNAVAILABLE);
                Err(err.into())
            }
        }
    }

    /// Caller flow: returns the invite blob once candidate gathering has
    /// finished or timed out.
    pub async fn initiate(&self) -> HandshakeResult<Handshake> {
        let (media, receive_only) = self.media_for_call().await;
        let session = self.open_session(Role::Caller, media).await?;
        self.set_message(status::CREATING_INVITE);

        let result = async {
            session.create_offer().await?;
            session.await_gathering(&self.config.gatherer()).await?;
            session.export_local_blob()
        }
        .await;

        match result {
            Ok(blob) => {
                self.set_message(status::with_media_note(status::INVITE_READY, receive_only));
                info!(
                    target: "beach_call::orchestrator",
                    session_id = %session.id(),
                    blob_len = blob.len(),
                    "invite ready"
                );
                Ok(Handshake { session, blob })
            }
            Err(err) => Err(self.abandon(&session, None, err).await),
        }
    }

    /// Callee flow: applies the pasted invite and returns the answer blob.
    pub async fn join(&self, offer_text: &str) -> HandshakeResult<Handshake> {
        let (media, receive_only) = self.media_for_call().await;
        let session = self.open_session(Role::Callee, media).await?;
        self.set_message(status::CREATING_ANSWER);

        let result = async {
            session.create_answer(offer_text).await?;
            session.await_gathering(&self.config.gatherer()).await?;
            session.export_local_blob()
        }
        .await;

        match result {
            Ok(blob) => {
                self.set_message(status::with_media_note(status::ANSWER_READY, receive_only));
                info!(
                    target: "beach_call::orchestrator",
                    session_id = %session.id(),
                    blob_len = blob.len(),
                    "answer ready"
                );
                Ok(Handshake { session, blob })
            }
            Err(err) => Err(self.abandon(&session, Some(status::INVALID_INVITE), err).await),
        }
    }

    /// Applies the callee's answer to a caller session. The session stays
    /// usable after a bad paste, so the user can try again.
    pub async fn complete(&self, session: &PeerSession, answer_text: &str) -> HandshakeResult<()> {
        match session.apply_remote_description(answer_text).await {
            Ok(()) => {
                info!(
                    target: "beach_call::orchestrator",
                    session_id = %session.id(),
                    "answer applied"
                );
                Ok(())
            }
            Err(err) => {
                warn!(
                    target: "beach_call::orchestrator",
                    session_id = %session.id(),
                    error = %err,
                    "could not apply answer"
                );
                let message = match &err {
                    HandshakeError::AlreadyApplied => status::ANSWER_ALREADY_APPLIED.to_string(),
                    other => status::flow_failure(status::INVALID_ANSWER, other),
                };
                self.set_message(message);
                Err(err)
            }
        }
    }

    /// First of Connected, Failed, or Closed; `None` when `limit` elapses.
    pub async fn wait_for_outcome(
        &self,
        session: &PeerSession,
        limit: Duration,
    ) -> Option<ConnectionState> {
        let mut states = session.subscribe_state();
        let settled = states.wait_for(|state| {
            matches!(
                state,
                ConnectionState::Connected | ConnectionState::Failed | ConnectionState::Closed
            )
        });
        match tokio::time::timeout(limit, settled).await {
            Ok(Ok(state)) => Some(*state),
            Ok(Err(_)) | Err(_) => None,
        }
    }

    pub async fn hang_up(&self, session: &PeerSession) {
        session.close().await;
    }

    /// Returns `Some(true)` when the microphone is now muted.
    pub fn toggle_mic(&self) -> Option<bool> {
        self.toggle(TrackKind::Audio)
    }

    /// Returns `Some(true)` when the camera is now off.
    pub fn toggle_video(&self) -> Option<bool> {
        self.toggle(TrackKind::Video)
    }

    pub fn copy_blob(&self, text: &str) -> HandshakeResult<()> {
        let result = match &self.clipboard {
            Some(clipboard) => clipboard.copy_text(text),
            None => Err(ClipboardError::Unavailable("no clipboard configured".into())),
        };
        match result {
            Ok(()) => {
                self.set_message(status::COPIED);
                Ok(())
            }
            Err(err) => {
                warn!(target: "beach_call::orchestrator", error = %err, "clipboard copy failed");
                self.set_message(status::COPY_FAILED);
                Err(err.into())
            }
        }
    }

    fn toggle(&self, kind: TrackKind) -> Option<bool> {
        let media = self.local_media.lock().clone()?;
        let enabled = media.toggle_kind(kind)?;
        info!(
            target: "beach_call::orchestrator",
            kind = %kind,
            enabled,
            "local track toggled"
        );
        Some(!enabled)
    }

    /// Local media for a new call, and whether the call is receive-only
    /// because acquisition failed.
    async fn media_for_call(&self) -> (Option<MediaTrackSet>, bool) {
        match self.prepare_media().await {
            Ok(media) => (media, false),
            Err(_) => (None, true),
        }
    }

    async fn open_session(
        &self,
        role: Role,
        media: Option<MediaTrackSet>,
    ) -> HandshakeResult<Arc<PeerSession>> {
        let engine = match self.engines.create_engine().await {
            Ok(engine) => engine,
            Err(err) => {
                warn!(
                    target: "beach_call::orchestrator",
                    role = %role,
                    error = %err,
                    "engine setup failed"
                );
                self.set_message(format!("Error: {err}"));
                return Err(err.into());
            }
        };
        let session = Arc::new(PeerSession::with_observer(
            role,
            engine,
            Some(self.observer()),
        ));
        if let Some(media) = media {
            if let Err(err) = session.attach_media(media).await {
                return Err(self.abandon(&session, None, err).await);
            }
        }
        Ok(session)
    }

    /// Closes a session that failed mid-flow and reports why.
    async fn abandon(
        &self,
        session: &PeerSession,
        invalid_input: Option<&'static str>,
        err: HandshakeError,
    ) -> HandshakeError {
        warn!(
            target: "beach_call::orchestrator",
            session_id = %session.id(),
            role = %session.role(),
            error = %err,
            "handshake flow failed"
        );
        session.close().await;
        let message = match invalid_input {
            Some(invalid_input) => status::flow_failure(invalid_input, &err),
            None => format!("Error: {err}"),
        };
        self.status.send_replace(Status {
            state: None,
            message,
        });
        err
    }

    fn observer(&self) -> StateObserver {
        let status = Arc::clone(&self.status);
        Arc::new(move |state| {
            status.send_replace(Status::from_state(state));
        })
    }

    fn set_message(&self, message: impl Into<String>) {
        let message = message.into();
        self.status.send_modify(|status| status.message = message);
    }
}
