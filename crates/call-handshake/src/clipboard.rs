use thiserror::Error;

#[derive(Debug, Error)]
pub enum ClipboardError {
    #[error("clipboard unavailable: {0}")]
    Unavailable(String),
    #[error("clipboard write failed: {0}")]
    Write(String),
}

/// Destination for a blob the user wants to paste elsewhere.
pub trait Clipboard: Send + Sync {
    fn copy_text(&self, text: &str) -> Result<(), ClipboardError>;
}
