//! Crate-wide error type.
//!
//! Distinguishes the error kinds named in the design: protocol framing
//! failures, routing failures against the peer registry, transport
//! failures, handler-returned application errors, configuration errors,
//! and storage-driver errors.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// Malformed envelope, unknown method, or a response_writer double-write.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// `ice-candidate` / `delete-peer` against an id with no registry entry.
    #[error("peer not found: {0}")]
    PeerNotFound(String),

    /// Write or read failure on the underlying transport.
    #[error("transport error: {0}")]
    Transport(String),

    /// Error returned by a handler, delivered back to the request's initiator.
    #[error("{0}")]
    Application(String),

    /// Bad CLI flags or an unresolvable storage driver.
    #[error("configuration error: {0}")]
    Config(String),

    /// Surfaced by the storage driver trait.
    #[error("storage error: {0}")]
    Storage(String),
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Protocol(err.to_string())
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Transport(err.to_string())
    }
}

impl From<webrtc::Error> for Error {
    fn from(err: webrtc::Error) -> Self {
        Error::Transport(err.to_string())
    }
}

impl From<axum::Error> for Error {
    fn from(err: axum::Error) -> Self {
        Error::Transport(err.to_string())
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for Error {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        Error::Transport(err.to_string())
    }
}
