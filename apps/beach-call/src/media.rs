use async_trait::async_trait;
use call_handshake::{AcquisitionError, LocalTrack, MediaSource, MediaTrackSet, TrackKind};
use uuid::Uuid;

/// Capture stand-in for a terminal client: one audio and one video track
/// with fresh ids. Nothing is sampled from real devices.
#[derive(Debug, Default, Clone, Copy)]
pub struct SyntheticMedia;

#[async_trait]
impl MediaSource for SyntheticMedia {
    async fn acquire_local_media(&self) -> Result<MediaTrackSet, AcquisitionError> {
        Ok(MediaTrackSet::new(vec![
            LocalTrack::new(TrackKind::Audio, format!("audio-{}", Uuid::new_v4())),
            LocalTrack::new(TrackKind::Video, format!("video-{}", Uuid::new_v4())),
        ]))
    }
}
