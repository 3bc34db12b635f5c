//! # Client Errors
//!
//! One error type for the driver and the pool. Faults fall into four classes:
//! validation (caught before any I/O), connection (I/O on the stream, tagged
//! with the operation), protocol (the server answered with a failure keyword)
//! and pool admission.
//!
//! I/O sources are held in `Arc` so the error is `Clone`; a leased handle
//! replays a captured acquisition fault on every call.

use std::io;
use std::sync::Arc;

use stalk_common::{NameError, Status};
use thiserror::Error;

/// Result type for the client.
pub type StalkResult<T> = Result<T, StalkError>;

/// Errors surfaced by the driver and the pool.
#[derive(Debug, Clone, Error)]
pub enum StalkError {
    /// A tube name failed validation.
    #[error("invalid tube name {name:?}: {reason}")]
    InvalidName {
        name: String,
        #[source]
        reason: NameError,
    },

    /// A watch list named no tubes.
    #[error("tube set must name at least one tube")]
    EmptyTubeSet,

    /// Network or IO failure while writing a command or reading its reply.
    #[error("{op}: {source}")]
    Connection {
        op: &'static str,
        source: Arc<io::Error>,
    },

    /// Could not open a connection to the server.
    #[error("dial {addr}: {source}")]
    Dial {
        addr: String,
        source: Arc<io::Error>,
    },

    /// The server answered with a failure keyword.
    #[error("{op}: {status}")]
    Protocol { op: &'static str, status: Status },

    /// The reply matched neither the expected shape nor a known failure.
    #[error("{op}: unexpected reply {line:?}")]
    UnexpectedReply { op: &'static str, line: String },

    /// A reply was read for a request other than the oldest unanswered one.
    #[error("{op}: request {id} read while request {expected} is next")]
    OutOfOrder {
        op: &'static str,
        id: u64,
        expected: u64,
    },

    /// The pool is at `max_active` and is not configured to wait.
    #[error("connection pool exhausted")]
    PoolExhausted,

    /// `get` was called on a closed pool.
    #[error("get on closed pool")]
    PoolClosed,

    /// The leased handle was already closed.
    #[error("connection closed")]
    ConnClosed,
}

impl StalkError {
    pub(crate) fn connection(op: &'static str, err: io::Error) -> Self {
        StalkError::Connection {
            op,
            source: Arc::new(err),
        }
    }

    pub(crate) fn invalid_name(name: &str, reason: NameError) -> Self {
        StalkError::InvalidName {
            name: name.to_string(),
            reason,
        }
    }

    /// Operation the error is tagged with, when it came from the wire.
    pub fn op(&self) -> Option<&'static str> {
        match self {
            StalkError::Connection { op, .. }
            | StalkError::Protocol { op, .. }
            | StalkError::UnexpectedReply { op, .. }
            | StalkError::OutOfOrder { op, .. } => Some(*op),
            _ => None,
        }
    }

    /// Server status keyword for protocol faults.
    pub fn status(&self) -> Option<Status> {
        match self {
            StalkError::Protocol { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// True when the peer closed the stream.
    ///
    /// This is the only fault that triggers a transparent reconnect.
    pub fn is_eof(&self) -> bool {
        match self {
            StalkError::Connection { source, .. } => source.kind() == io::ErrorKind::UnexpectedEof,
            _ => false,
        }
    }

    /// True for any I/O failure on an established connection.
    pub fn is_connection(&self) -> bool {
        matches!(self, StalkError::Connection { .. })
    }
}
