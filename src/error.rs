//! Error types shared by the client and server binaries.
//!
//! Library code returns these concrete enums; the binaries compose them
//! behind `anyhow::Result` to get readable top-level reporting and to
//! attach context while walking out of the event loop.

use thiserror::Error;

/// Errors from the fixed-capacity [`crate::ring::RingBuffer`].
#[derive(Error, Debug)]
pub enum RingError {
    #[error("ring buffer overflow: tried to hold {attempted} bytes in a {capacity}-byte buffer")]
    Overflow { attempted: usize, capacity: usize },

    #[error("requested {requested} bytes but only {available} are buffered")]
    Underrun { requested: usize, available: usize },
}

/// Errors from decoding the frame stream (§4.2).
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("unknown message kind {0:#06x}")]
    UnknownKind(u16),

    #[error("frame payload of {len} bytes exceeds the {max}-byte limit")]
    PayloadTooLarge { len: usize, max: usize },

    #[error(transparent)]
    Ring(#[from] RingError),
}

/// Errors from loading and querying the board registry (§4.8).
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("no registry file found (looked for ./.cdba and /etc/cdba)")]
    NotFound,

    #[error("could not read registry file {path}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("could not parse registry file {path}")]
    Parse {
        path: String,
        #[source]
        source: toml::de::Error,
    },

    #[error("board {name:?} declares driver {driver:?}, which is not implemented by this build")]
    UnimplementedDriver { name: String, driver: String },

    #[error("no such board {0:?}")]
    NoSuchBoard(String),

    #[error("user {user:?} is not permitted to access board {board:?}")]
    NotAuthorized { user: String, board: String },
}

/// Errors surfaced by a [`crate::server::device::BoardDriver`] during normal operation.
#[derive(Error, Debug)]
pub enum DeviceError {
    #[error("{operation} is not supported by this board's driver")]
    Unsupported { operation: &'static str },

    #[error("driver failure during {operation}: {message}")]
    Driver {
        operation: &'static str,
        message: String,
    },
}

/// Transport-level failures, distinct from protocol framing errors.
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("remote process exited before the session completed")]
    Eof,

    #[error("write to transport failed")]
    Write(#[source] std::io::Error),

    #[error("could not spawn remote shell")]
    Spawn(#[source] std::io::Error),
}
