// Broker error types.
//
// `BrokerError` covers both sides: the registry's rule violations (which the
// server only logs, since the offending session already got its reply) and
// the client's session-level failures.

use dangeros_protocol::FrameError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("address {0} is already owned")]
    AddressTaken(String),
    #[error("nobody owns {0}")]
    Unreachable(String),
    #[error("session has no address yet")]
    NotOpen,
    #[error("session already has an address")]
    AlreadyOpen,
    #[error("unknown session")]
    UnknownEndpoint,
    #[error("broker session I/O: {0}")]
    Frame(#[from] FrameError),
    #[error("bad broker message: {0}")]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}
