// The transport binding the sync core runs on.
//
// Modelled on a browser peer library: a *handle* owns one address (either an
// ephemeral one the transport picks, or a specific one we ask for), can dial
// other addresses, and accepts incoming connections. Every call returns
// immediately; completions come back later as `TransportEvent`s pushed into
// the `EventSink` the binding was built with. Nothing here has a timeout: a
// dial to a silent address may simply never complete, which is why the
// negotiator runs its own timers.
//
// Guarantees the negotiator relies on:
// - at most one live handle owns a given address (claims race, one wins);
// - per-connection FIFO delivery;
// - destroying a handle releases its address and closes its connections,
//   and the remote ends observe `ConnectionClosed`.
//
// Bindings: `local::LocalNetwork` (in-process) and
// `dangeros_broker::BrokerTransport` (TCP rendezvous broker).

pub mod local;

use std::sync::mpsc;

use dangeros_protocol::PeerAddress;

use crate::error::TransportError;

/// One opened (or opening) address.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HandleId(pub u64);

/// One logical connection, unique per transport.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub u64);

#[derive(Clone, Debug, PartialEq)]
pub enum TransportEvent {
    /// The handle got its address.
    Opened {
        handle: HandleId,
        address: PeerAddress,
    },
    /// The handle could not be opened. The handle is dead.
    OpenFailed {
        handle: HandleId,
        error: TransportError,
    },
    /// Someone dialed the handle's address.
    Incoming {
        handle: HandleId,
        conn: ConnectionId,
        remote: PeerAddress,
    },
    ConnectionOpened { conn: ConnectionId },
    Data { conn: ConnectionId, payload: Vec<u8> },
    ConnectionClosed { conn: ConnectionId },
    ConnectionError {
        conn: ConnectionId,
        error: TransportError,
    },
}

/// Where a binding delivers its events.
pub trait EventSink: Send + 'static {
    fn deliver(&self, event: TransportEvent);
}

impl EventSink for mpsc::Sender<TransportEvent> {
    fn deliver(&self, event: TransportEvent) {
        // A dropped receiver means the owner is gone; nothing to tell.
        let _ = self.send(event);
    }
}

/// Operations the negotiator issues. Results arrive as events.
pub trait Transport {
    /// Open a handle, asking for `requested` as its address or for an
    /// ephemeral one. Answered by `Opened` or `OpenFailed`.
    fn open(&mut self, requested: Option<&PeerAddress>) -> HandleId;

    /// Dial `remote` from `handle`. Answered by `ConnectionOpened` or
    /// `ConnectionError`, or by nothing at all.
    fn connect(
        &mut self,
        handle: HandleId,
        remote: &PeerAddress,
    ) -> Result<ConnectionId, TransportError>;

    fn send(&mut self, conn: ConnectionId, payload: &[u8]) -> Result<(), TransportError>;

    fn is_open(&self, conn: ConnectionId) -> bool;

    /// Tear the handle down with all its connections. Idempotent.
    fn destroy(&mut self, handle: HandleId);
}
