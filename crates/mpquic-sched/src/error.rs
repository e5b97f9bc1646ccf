//! Error types for mpquic-sched.

use std::time::Duration;

use mpquic_core::{PathId, StreamId};
use thiserror::Error;

/// Errors that can occur while scheduling streams onto paths.
#[derive(Debug, Error)]
pub enum Error {
    /// Stream id 0 names the root of the priority tree.
    #[error("stream id 0 is reserved for the priority root")]
    RootStreamId,

    /// The stream is not known to the priority tree or the streams map.
    #[error("unknown stream {0}")]
    UnknownStream(StreamId),

    /// Rejected re-parenting (self dependency or a reserved control stream).
    #[error("stream {child} cannot depend on stream {parent}")]
    InvalidParent { child: StreamId, parent: StreamId },

    /// The stream quota negotiated for the connection is used up.
    #[error("too many open streams")]
    TooManyOpenStreams,

    /// The peer used a stream id of the wrong parity.
    #[error("invalid stream id {0}")]
    InvalidStreamId(StreamId),

    /// The peer opened a stream far below the highest id it used before.
    #[error("stream {id} is too far below the highest opened stream {highest}")]
    StreamIdRegression { id: StreamId, highest: StreamId },

    /// Ledger lookup for a stream that has no path.
    #[error("no path assigned to stream {0}")]
    NotFound(StreamId),

    /// Ledger removal of a pair that was never added.
    #[error("stream {stream} is not assigned to path {path}")]
    NothingToDelete { stream: StreamId, path: PathId },

    /// The path is not part of the connection.
    #[error("unknown path {0}")]
    UnknownPath(PathId),

    /// Write after the stream was closed locally.
    #[error("stream {0} is closed for writing")]
    StreamClosed(StreamId),

    /// Connection closed.
    #[error("connection closed: {reason}")]
    ConnectionClosed { reason: String },

    /// Flow control accounting failed.
    #[error("flow control error: {0}")]
    FlowControl(String),

    /// The path advisor could not be consulted.
    #[error("advisor error: {0}")]
    Advisor(#[from] AdvisorError),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration error.
    #[error("config error: {0}")]
    Config(String),
}

impl Error {
    /// Peer misbehaviour that must close the connection.
    pub fn is_protocol_violation(&self) -> bool {
        matches!(
            self,
            Error::InvalidStreamId(_) | Error::StreamIdRegression { .. }
        )
    }

    /// Capacity exhaustion; the caller should wait and try again.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::TooManyOpenStreams)
    }
}

impl Clone for Error {
    fn clone(&self) -> Self {
        match self {
            Error::RootStreamId => Error::RootStreamId,
            Error::UnknownStream(id) => Error::UnknownStream(*id),
            Error::InvalidParent { child, parent } => Error::InvalidParent {
                child: *child,
                parent: *parent,
            },
            Error::TooManyOpenStreams => Error::TooManyOpenStreams,
            Error::InvalidStreamId(id) => Error::InvalidStreamId(*id),
            Error::StreamIdRegression { id, highest } => Error::StreamIdRegression {
                id: *id,
                highest: *highest,
            },
            Error::NotFound(id) => Error::NotFound(*id),
            Error::NothingToDelete { stream, path } => Error::NothingToDelete {
                stream: *stream,
                path: *path,
            },
            Error::UnknownPath(id) => Error::UnknownPath(*id),
            Error::StreamClosed(id) => Error::StreamClosed(*id),
            // Everything else is reported to waiters by its message.
            other => Error::ConnectionClosed {
                reason: other.to_string(),
            },
        }
    }
}

/// Errors talking to the path advisor.
#[derive(Debug, Error)]
pub enum AdvisorError {
    /// Nothing came back before the global timeout.
    #[error("no reply within {0:?}")]
    NoReply(Duration),

    /// The advisor closed the connection.
    #[error("advisor closed the connection")]
    Closed,

    /// The reply answered a different request.
    #[error("reply for stream {got}, expected stream {expected}")]
    UnexpectedStream { expected: StreamId, got: StreamId },

    /// The advisor picked a path that was not offered.
    #[error("advisor chose unknown path {0}")]
    UnknownPath(PathId),

    /// Malformed request or reply.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Transport failure.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification() {
        assert!(Error::InvalidStreamId(4).is_protocol_violation());
        assert!(Error::StreamIdRegression { id: 1, highest: 999 }.is_protocol_violation());
        assert!(!Error::TooManyOpenStreams.is_protocol_violation());
        assert!(Error::TooManyOpenStreams.is_retryable());
        assert!(!Error::RootStreamId.is_retryable());
        assert!(!Error::StreamClosed(5).is_protocol_violation());
        assert!(!Error::StreamClosed(5).is_retryable());
    }

    #[test]
    fn clone_keeps_message() {
        let err = Error::Io(std::io::Error::new(std::io::ErrorKind::Other, "boom"));
        let cloned = err.clone();
        assert!(cloned.to_string().contains("boom"));
        assert!(matches!(
            Error::UnknownStream(9).clone(),
            Error::UnknownStream(9)
        ));
    }
}
