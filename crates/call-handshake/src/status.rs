use crate::error::HandshakeError;
use crate::session::ConnectionState;

pub const IDLE_MESSAGE: &str = "Ready";
pub const MEDIA_READY: &str = "Camera on. Ready to connect.";
pub const MEDIA_UNAVAILABLE: &str = "Error: cannot access camera or microphone. Continuing receive-only.";
pub const CREATING_INVITE: &str = "Creating invite code...";
pub const INVITE_READY: &str = "Invite created. Send it to your peer.";
pub const CREATING_ANSWER: &str = "Creating answer code...";
pub const ANSWER_READY: &str = "Answer created. Send it back to the caller.";
pub const INVALID_INVITE: &str = "Error: invalid invite code";
pub const INVALID_ANSWER: &str = "Error: invalid answer code";
pub const ANSWER_ALREADY_APPLIED: &str = "Answer already applied";
pub const RECEIVE_ONLY_NOTE: &str = "(receive-only: camera and microphone unavailable)";
pub const COPIED: &str = "Copied to clipboard!";
pub const COPY_FAILED: &str = "Error: could not copy to clipboard";

/// What the user sees: the last connection state and a message line.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Status {
    pub state: Option<ConnectionState>,
    pub message: String,
}

impl Status {
    pub fn idle() -> Self {
        Self {
            state: None,
            message: IDLE_MESSAGE.to_string(),
        }
    }

    pub fn from_state(state: ConnectionState) -> Self {
        Self {
            state: Some(state),
            message: state.label().to_string(),
        }
    }

    pub fn is_error(&self) -> bool {
        self.message.starts_with("Error:") || self.state == Some(ConnectionState::Failed)
    }
}

impl Default for Status {
    fn default() -> Self {
        Self::idle()
    }
}

pub(crate) fn with_media_note(message: &str, receive_only: bool) -> String {
    if receive_only {
        format!("{message} {RECEIVE_ONLY_NOTE}")
    } else {
        message.to_string()
    }
}

/// Message for a failed initiate/join step.
pub(crate) fn flow_failure(invalid_input: &'static str, err: &HandshakeError) -> String {
    if err.is_bad_input() {
        invalid_input.to_string()
    } else {
        format!("Error: {err}")
    }
}
