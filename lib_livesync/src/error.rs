//! # Error Taxonomy
//!
//! Every failure the sync layer can observe falls into one of a few buckets,
//! and each bucket has a fixed policy:
//!
//! - [`DecodeError`]: one malformed payload. The frame is dropped, the
//!   connection stays up.
//! - [`FrameError`]: the STOMP envelope itself could not be parsed.
//! - [`TransportError`]: socket-level trouble. Recoverable, retried with a
//!   fixed backoff.
//! - [`FetchError`]: a REST pull failed. Callers fall back to empty/zero
//!   state and record the failure.
//! - [`PublishError`]: an outbound send could not be confirmed. Absorbed by
//!   the publish pipeline (local fallback), never shown to the caller.
//! - [`ConfigError`]: bad configuration at startup.

use thiserror::Error;

/// A single inbound payload could not be normalized.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("payload is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("team id {0} does not map to a side")]
    UnknownSide(i64),

    #[error("required field `{0}` is missing")]
    MissingField(&'static str),

    #[error("unparseable timestamp `{0}`")]
    BadTimestamp(String),
}

/// The STOMP envelope could not be parsed.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum FrameError {
    #[error("empty frame")]
    Empty,

    #[error("unknown command `{0}`")]
    UnknownCommand(String),

    #[error("malformed header line `{0}`")]
    MalformedHeader(String),

    #[error("invalid escape sequence in header `{0}`")]
    BadEscape(String),

    #[error("frame is not NUL-terminated")]
    Unterminated,
}

/// Socket-level failures. All of these are recoverable.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("failed to open connection to {url}: {reason}")]
    Connect { url: String, reason: String },

    #[error("send failed: {0}")]
    Send(String),

    #[error("receive failed: {0}")]
    Receive(String),

    #[error("connection closed by peer")]
    Closed,

    #[error("handshake timed out after {0}ms")]
    HandshakeTimeout(u64),

    #[error("no traffic from server for {0}ms")]
    Silent(u64),
}

/// The server refused to talk to us (ERROR frame or rejected CONNECT).
/// Not retried automatically.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("server rejected the session: {message}")]
pub struct ProtocolError {
    pub message: String,
    pub details: Option<String>,
}

/// A REST pull failed.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("resource not found: {0}")]
    NotFound(String),

    #[error("server answered {status} for {path}: {body}")]
    Status {
        status: u16,
        path: String,
        body: String,
    },

    #[error("request failed: {0}")]
    Request(String),

    #[error("response body could not be decoded: {0}")]
    Body(String),

    #[error("fetching is not available: {0}")]
    Unavailable(String),
}

/// An outbound send could not be confirmed.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PublishError {
    #[error("channel group is not connected")]
    NotConnected,

    #[error("transport rejected the frame: {0}")]
    Transport(String),

    #[error("connection task is gone")]
    DriverGone,
}

/// Configuration could not be loaded or validated.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error occurred: {0}")]
    IoError(#[from] std::io::Error),

    #[error("config file {path} is not valid JSON: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("environment variable {name} has invalid value `{value}`")]
    InvalidEnvVar { name: String, value: String },

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Umbrella error for the session-level API.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error(transparent)]
    Decode(#[from] DecodeError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    Fetch(#[from] FetchError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("no room is currently joined")]
    NoActiveRoom,

    #[error("{0} is not a valid target in this room")]
    InvalidTarget(String),
}
