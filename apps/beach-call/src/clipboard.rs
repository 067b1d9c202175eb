use call_handshake::{Clipboard, ClipboardError};
use copypasta::{ClipboardContext, ClipboardProvider};

/// The desktop clipboard. A fresh context is opened per copy so a missing
/// display only fails the copy, not startup.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClipboard;

impl Clipboard for SystemClipboard {
    fn copy_text(&self, text: &str) -> Result<(), ClipboardError> {
        let mut ctx =
            ClipboardContext::new().map_err(|err| ClipboardError::Unavailable(err.to_string()))?;
        ctx.set_contents(text.to_string())
            .map_err(|err| ClipboardError::Write(err.to_string()))
    }
}
