//! Text codec for the connection blobs users copy between peers.
//!
//! A blob is the JSON rendering of a session description, the same shape a
//! browser produces with `JSON.stringify(pc.localDescription)`:
//! `{"sdp": "...", "type": "offer"}`. Candidates travel inside the SDP body.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

const CANDIDATE_PREFIX: &str = "a=candidate:";
const END_OF_CANDIDATES: &str = "a=end-of-candidates";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    Offer,
    Answer,
}

impl SdpKind {
    pub fn as_str(self) -> &'static str {
        match self {
            SdpKind::Offer => "offer",
            SdpKind::Answer => "answer",
        }
    }
}

impl fmt::Display for SdpKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One side's offer or answer.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: SdpKind,
    pub sdp: String,
}

impl SessionDescription {
    pub fn new(kind: SdpKind, sdp: impl Into<String>) -> Self {
        Self {
            kind,
            sdp: sdp.into(),
        }
    }

    pub fn offer(sdp: impl Into<String>) -> Self {
        Self::new(SdpKind::Offer, sdp)
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self::new(SdpKind::Answer, sdp)
    }

    /// Candidate attributes embedded in the SDP, without the `a=` prefix.
    pub fn candidates(&self) -> impl Iterator<Item = &str> {
        self.sdp
            .lines()
            .map(str::trim)
            .filter(|line| line.starts_with(CANDIDATE_PREFIX))
            .map(|line| &line[2..])
    }

    pub fn has_end_of_candidates(&self) -> bool {
        self.sdp
            .lines()
            .any(|line| line.trim() == END_OF_CANDIDATES)
    }
}

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("not a session description document: {0}")]
    Syntax(#[from] serde_json::Error),
    #[error("session description has an empty sdp payload")]
    EmptyPayload,
}

/// Renders a description as a single-line blob. Keys are emitted in sorted
/// order so equal descriptions always produce identical text.
pub fn encode(description: &SessionDescription) -> String {
    serde_json::json!({
        "sdp": description.sdp,
        "type": description.kind.as_str(),
    })
    .to_string()
}

/// Parses a pasted blob. Surrounding whitespace and unknown fields are
/// tolerated; a missing or unknown `type`, a missing `sdp`, or an empty SDP
/// body are not.
pub fn decode(text: &str) -> Result<SessionDescription, DecodeError> {
    let description: SessionDescription = serde_json::from_str(text.trim())?;
    if description.sdp.trim().is_empty() {
        return Err(DecodeError::EmptyPayload);
    }
    Ok(description)
}
