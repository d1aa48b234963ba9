// Error types for the sync core.
//
// Almost nothing here reaches the user. Transport failures drive the
// election state machine (retry as client, promote, migrate) and are only
// logged; `SessionError` is the one thing a caller of `join` can get back.

use dangeros_protocol::PeerAddress;
use thiserror::Error;

use crate::transport::{ConnectionId, HandleId};

/// Rejected `join` requests.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionError {
    #[error("room name must not be empty")]
    EmptyRoomName,
    #[error("display name must not be empty")]
    EmptyDisplayName,
    #[error("already joined room {0:?}; leave first")]
    AlreadyJoined(String),
}

/// Failures reported by a transport binding.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    /// Somebody else owns the requested address.
    #[error("address {0} is already claimed")]
    AddressUnavailable(PeerAddress),
    /// Nobody listens on the address we tried to reach.
    #[error("no endpoint at {0}")]
    Unreachable(PeerAddress),
    #[error("handle {0:?} is not open")]
    HandleClosed(HandleId),
    #[error("connection {0:?} is not open")]
    NotOpen(ConnectionId),
    /// Anything the underlying I/O layer reported.
    #[error("transport I/O failure: {0}")]
    Io(String),
}

/// Failures of a `NodeHandle` call.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NodeError {
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error("the node thread has stopped")]
    Stopped,
}
