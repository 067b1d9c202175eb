use std::io;
use std::time::Duration;

use call_handshake::HandshakeError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CliError {
    #[error("{0}")]
    Handshake(#[from] HandshakeError),
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("logging initialization failed: {0}")]
    Logging(String),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("no connection code received before end of input")]
    MissingBlob,
    #[error("peer did not connect within {}s", .0.as_secs())]
    ConnectTimeout(Duration),
    #[error("connection to the peer failed")]
    ConnectionFailed,
}
