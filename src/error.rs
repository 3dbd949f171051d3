use crate::session::SessionState;
use thiserror::Error;

/// Crate-level error.
///
/// Only [`Error::InvalidState`] and [`Error::SessionClosed`] are fatal to the
/// operation that raised them. Decode and channel failures that happen inside
/// a running session are recorded in the report instead of surfacing here.
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Decode error: {0}")]
    Decode(#[from] DecodeError),

    #[error("Channel error: {0}")]
    Channel(#[from] ChannelError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid state: cannot {operation} while session is {state}")]
    InvalidState {
        operation: &'static str,
        state: SessionState,
    },

    #[error("Session closed: statistics are finalized")]
    SessionClosed,

    #[error("Task error: {0}")]
    Task(String),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Reasons a datagram could not be turned into a probe.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeError {
    #[error("malformed packet: {len} bytes is shorter than the {min}-byte header")]
    MalformedPacket { len: usize, min: usize },

    #[error("truncated payload: expected {expected} bytes, got {actual}")]
    TruncatedPayload { expected: usize, actual: usize },

    #[error("corrupt padding: non-zero byte at offset {offset}")]
    CorruptPadding { offset: usize },
}

/// Failures of the abstract datagram channel.
#[derive(Error, Debug)]
pub enum ChannelError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// No datagram arrived before the receive deadline.
    #[error("receive timed out")]
    Timeout,

    /// The other end of the channel is gone; no more datagrams will arrive.
    #[error("channel closed")]
    Closed,

    /// A listening channel has not learned its peer address yet.
    #[error("no peer address known")]
    NoPeer,
}

impl ChannelError {
    /// Returns `true` for the expected "nothing arrived" outcome.
    pub fn is_timeout(&self) -> bool {
        matches!(self, ChannelError::Timeout)
    }
}
