use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use thiserror::Error;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TrackKind {
    Audio,
    Video,
}

impl fmt::Display for TrackKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrackKind::Audio => f.write_str("audio"),
            TrackKind::Video => f.write_str("video"),
        }
    }
}

#[derive(Debug)]
struct TrackFlags {
    enabled: AtomicBool,
    stopped: AtomicBool,
}

/// A local capture track. Clones share the same enabled/stopped flags, so the
/// UI can toggle a track the session has already handed to the engine.
#[derive(Clone, Debug)]
pub struct LocalTrack {
    id: String,
    kind: TrackKind,
    flags: Arc<TrackFlags>,
}

impl LocalTrack {
    pub fn new(kind: TrackKind, id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind,
            flags: Arc::new(TrackFlags {
                enabled: AtomicBool::new(true),
                stopped: AtomicBool::new(false),
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn kind(&self) -> TrackKind {
        self.kind
    }

    pub fn is_enabled(&self) -> bool {
        self.flags.enabled.load(Ordering::Acquire)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.flags.enabled.store(enabled, Ordering::Release);
    }

    pub fn is_stopped(&self) -> bool {
        self.flags.stopped.load(Ordering::Acquire)
    }

    pub fn stop(&self) {
        self.flags.stopped.store(true, Ordering::Release);
    }
}

/// The local tracks of one capture. Fixed once built; only the per-track
/// flags change afterwards.
#[derive(Clone, Debug, Default)]
pub struct MediaTrackSet {
    tracks: Arc<Vec<LocalTrack>>,
}

impl MediaTrackSet {
    pub fn new(tracks: Vec<LocalTrack>) -> Self {
        Self {
            tracks: Arc::new(tracks),
        }
    }

    pub fn tracks(&self) -> &[LocalTrack] {
        &self.tracks
    }

    pub fn of_kind(&self, kind: TrackKind) -> impl Iterator<Item = &LocalTrack> {
        self.tracks.iter().filter(move |track| track.kind == kind)
    }

    pub fn is_empty(&self) -> bool {
        self.tracks.is_empty()
    }

    pub fn has_kind(&self, kind: TrackKind) -> bool {
        self.of_kind(kind).next().is_some()
    }

    pub fn is_kind_enabled(&self, kind: TrackKind) -> bool {
        self.of_kind(kind).any(LocalTrack::is_enabled)
    }

    pub fn set_kind_enabled(&self, kind: TrackKind, enabled: bool) {
        for track in self.of_kind(kind) {
            track.set_enabled(enabled);
        }
    }

    /// Flips every track of `kind`. Returns the new enabled flag, or `None`
    /// when the set has no such track.
    pub fn toggle_kind(&self, kind: TrackKind) -> Option<bool> {
        if !self.has_kind(kind) {
            return None;
        }
        let enabled = !self.is_kind_enabled(kind);
        self.set_kind_enabled(kind, enabled);
        Some(enabled)
    }

    pub fn stop_all(&self) {
        for track in self.tracks.iter() {
            track.stop();
        }
    }

    pub fn is_stopped(&self) -> bool {
        !self.tracks.is_empty() && self.tracks.iter().all(LocalTrack::is_stopped)
    }
}

#[derive(Debug, Error)]
pub enum AcquisitionError {
    #[error("no camera or microphone available")]
    NoDevices,
    #[error("media access denied: {0}")]
    Denied(String),
    #[error("media device error: {0}")]
    Device(String),
}

#[async_trait]
pub trait MediaSource: Send + Sync {
    async fn acquire_local_media(&self) -> Result<MediaTrackSet, AcquisitionError>;
}
