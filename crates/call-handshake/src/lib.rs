//! Manual offer/answer handshake for two-party calls.
//!
//! Peers exchange connection blobs by hand (copy, paste, chat message), so
//! there is no signaling server: the caller exports an offer once candidate
//! gathering settles, the callee answers it, and the caller applies the
//! answer. The peer connection itself sits behind [`PeerEngine`].

pub mod blob;
pub mod clipboard;
pub mod config;
pub mod engine;
pub mod error;
pub mod gatherer;
pub mod listeners;
pub mod media;
pub mod mock;
pub mod orchestrator;
pub mod session;
pub mod status;

pub use blob::{DecodeError, SdpKind, SessionDescription};
pub use clipboard::{Clipboard, ClipboardError};
pub use config::HandshakeConfig;
pub use engine::{
    ConnectivityState, EngineError, EngineFactory, GatheringState, PeerEngine, Subscription,
};
pub use error::{HandshakeError, HandshakeResult};
pub use gatherer::{CandidateGatherer, GatherOutcome};
pub use listeners::ListenerSet;
pub use media::{AcquisitionError, LocalTrack, MediaSource, MediaTrackSet, TrackKind};
pub use orchestrator::{Handshake, HandshakeOrchestrator};
pub use session::{ConnectionState, PeerSession, Role, SessionId, StateObserver};
pub use status::Status;
