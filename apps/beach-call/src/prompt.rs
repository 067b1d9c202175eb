//! Reading pasted connection codes.
//!
//! Chat clients and terminals often re-wrap long lines, so a code may
//! arrive split across several lines. Lines are collected until they form
//! one complete JSON document.

use std::path::Path;

use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader, Lines, Stdin};

use crate::error::CliError;

#[derive(Debug, Default)]
pub struct BlobAccumulator {
    buffer: String,
}

impl BlobAccumulator {
    /// Returns the complete code once `line` finishes it.
    ///
    /// Input that does not open with `{`, or that can no longer become valid
    /// JSON, is returned as-is so the decoder can reject it instead of
    /// waiting for more.
    pub fn push_line(&mut self, line: &str) -> Option<String> {
        let line = if self.buffer.is_empty() {
            let line = line.trim();
            if line.is_empty() {
                return None;
            }
            if !line.starts_with('{') {
                return Some(line.to_string());
            }
            line
        } else {
            // Wrapping never adds whitespace, but it can split inside it.
            line.trim_end_matches('\r')
        };
        self.buffer.push_str(line);
        match serde_json::from_str::<serde_json::Value>(&self.buffer) {
            Err(err) if err.is_eof() => None,
            _ => Some(std::mem::take(&mut self.buffer)),
        }
    }

    /// Whatever was collected when input ended, if anything.
    pub fn finish(self) -> Option<String> {
        (!self.buffer.is_empty()).then_some(self.buffer)
    }
}

pub struct BlobPrompt<R> {
    lines: Lines<R>,
}

impl BlobPrompt<BufReader<Stdin>> {
    pub fn stdin() -> Self {
        Self::new(BufReader::new(tokio::io::stdin()))
    }
}

impl<R: AsyncBufRead + Unpin> BlobPrompt<R> {
    pub fn new(reader: R) -> Self {
        Self {
            lines: reader.lines(),
        }
    }

    pub async fn next_blob(&mut self, prompt: &str) -> Result<String, CliError> {
        eprintln!("{prompt}");
        let mut accumulator = BlobAccumulator::default();
        while let Some(line) = self.lines.next_line().await? {
            if let Some(blob) = accumulator.push_line(&line) {
                return Ok(blob);
            }
        }
        accumulator.finish().ok_or(CliError::MissingBlob)
    }
}

pub async fn read_blob_file(path: &Path) -> Result<String, CliError> {
    let contents = tokio::fs::read_to_string(path).await?;
    let trimmed = contents.trim();
    if trimmed.is_empty() {
        return Err(CliError::MissingBlob);
    }
    Ok(trimmed.to_string())
}
