//! Capability boundary between the handshake controller and the peer
//! connection implementation (webrtc-rs in the binary, [`crate::mock`] in
//! tests).

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use crate::blob::SessionDescription;
use crate::media::MediaTrackSet;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum GatheringState {
    New,
    Gathering,
    Complete,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ConnectivityState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("engine setup failed: {0}")]
    Setup(String),
    #[error("engine rejected the request: {0}")]
    Rejected(String),
    #[error("engine is closed")]
    Closed,
}

pub type GatheringHandler = Arc<dyn Fn(GatheringState) + Send + Sync>;
pub type ConnectivityHandler = Arc<dyn Fn(ConnectivityState) + Send + Sync>;

/// Registration handle for an engine callback. Dropping it deregisters the
/// handler.
#[must_use = "dropping a subscription deregisters its handler"]
pub struct Subscription {
    cancel: Option<Box<dyn FnOnce() + Send>>,
}

impl Subscription {
    pub fn new(cancel: impl FnOnce() + Send + 'static) -> Self {
        Self {
            cancel: Some(Box::new(cancel)),
        }
    }

    pub fn unsubscribe(self) {
        drop(self);
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("active", &self.cancel.is_some())
            .finish()
    }
}

/// One peer connection. Handlers may be invoked from any task; they must not
/// block.
#[async_trait]
pub trait PeerEngine: Send + Sync {
    async fn create_offer(&self) -> Result<SessionDescription, EngineError>;

    /// Requires the remote offer to be set first.
    async fn create_answer(&self) -> Result<SessionDescription, EngineError>;

    /// Assigning the local description starts candidate gathering.
    async fn set_local_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), EngineError>;

    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), EngineError>;

    /// Current local description, including every candidate gathered so far.
    async fn local_description(&self) -> Option<SessionDescription>;

    fn gathering_state(&self) -> GatheringState;

    fn on_gathering_change(&self, handler: GatheringHandler) -> Subscription;

    fn on_connectivity_change(&self, handler: ConnectivityHandler) -> Subscription;

    async fn attach_tracks(&self, tracks: &MediaTrackSet) -> Result<(), EngineError>;

    async fn detach_tracks(&self) -> Result<(), EngineError>;

    async fn close(&self) -> Result<(), EngineError>;
}

/// Produces a fresh engine for every call attempt.
#[async_trait]
pub trait EngineFactory: Send + Sync {
    async fn create_engine(&self) -> Result<Arc<dyn PeerEngine>, EngineError>;
}
