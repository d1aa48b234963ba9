// In-process transport binding.
//
// `LocalNetwork` is a shared switchboard; each participant gets its own
// `LocalTransport` endpoint from it. All bookkeeping sits behind one mutex,
// so address claims are atomic: when two endpoints ask for the same address,
// whichever call takes the lock first wins and the other gets `OpenFailed`.
//
// Events go to the endpoint's `EventSink` while the lock is held, which keeps
// per-connection order and also the order between the two ends of a new
// connection (`Incoming` + `ConnectionOpened` at the callee are queued before
// the caller can possibly send anything).
//
// Dropping a `LocalTransport` destroys all its handles, which is how tests
// model a participant vanishing without a goodbye.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use dangeros_protocol::PeerAddress;

use super::{ConnectionId, EventSink, HandleId, Transport, TransportEvent};
use crate::error::TransportError;

#[derive(Clone, Default)]
pub struct LocalNetwork {
    inner: Arc<Mutex<Switchboard>>,
}

#[derive(Default)]
struct Switchboard {
    next_id: u64,
    endpoints: HashMap<u64, Box<dyn EventSink>>,
    handles: HashMap<HandleId, HandleEntry>,
    addresses: HashMap<PeerAddress, HandleId>,
    conns: HashMap<ConnectionId, ConnEntry>,
}

struct HandleEntry {
    endpoint: u64,
    address: PeerAddress,
}

struct ConnEntry {
    endpoint: u64,
    handle: HandleId,
    peer: ConnectionId,
}

impl LocalNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a new participant whose events go to `sink`.
    pub fn transport(&self, sink: impl EventSink) -> LocalTransport {
        let mut board = self.lock();
        let endpoint = board.allocate();
        board.endpoints.insert(endpoint, Box::new(sink));
        LocalTransport {
            network: self.clone(),
            endpoint,
        }
    }

    /// Whether some live handle currently owns `address`.
    pub fn is_claimed(&self, address: &PeerAddress) -> bool {
        self.lock().addresses.contains_key(address)
    }

    /// Number of open connection ends across the whole network.
    pub fn connection_count(&self) -> usize {
        self.lock().conns.len()
    }

    fn lock(&self) -> MutexGuard<'_, Switchboard> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Switchboard {
    fn allocate(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn deliver(&self, endpoint: u64, event: TransportEvent) {
        if let Some(sink) = self.endpoints.get(&endpoint) {
            sink.deliver(event);
        }
    }

    fn destroy(&mut self, handle: HandleId) {
        let Some(entry) = self.handles.remove(&handle) else {
            return;
        };
        if self.addresses.get(&entry.address) == Some(&handle) {
            self.addresses.remove(&entry.address);
        }
        let doomed: Vec<ConnectionId> = self
            .conns
            .iter()
            .filter(|(_, c)| c.handle == handle)
            .map(|(id, _)| *id)
            .collect();
        for conn in doomed {
            let Some(local) = self.conns.remove(&conn) else {
                continue;
            };
            if let Some(remote) = self.conns.remove(&local.peer) {
                self.deliver(
                    remote.endpoint,
                    TransportEvent::ConnectionClosed { conn: local.peer },
                );
            }
        }
    }
}

/// One participant's view of a `LocalNetwork`.
pub struct LocalTransport {
    network: LocalNetwork,
    endpoint: u64,
}

impl Transport for LocalTransport {
    fn open(&mut self, requested: Option<&PeerAddress>) -> HandleId {
        let mut board = self.network.lock();
        let handle = HandleId(board.allocate());
        let address = match requested {
            Some(address) if board.addresses.contains_key(address) => {
                board.deliver(
                    self.endpoint,
                    TransportEvent::OpenFailed {
                        handle,
                        error: TransportError::AddressUnavailable(address.clone()),
                    },
                );
                return handle;
            }
            Some(address) => address.clone(),
            None => PeerAddress::new(format!("local-peer-{}", handle.0)),
        };
        board.addresses.insert(address.clone(), handle);
        board.handles.insert(
            handle,
            HandleEntry {
                endpoint: self.endpoint,
                address: address.clone(),
            },
        );
        board.deliver(self.endpoint, TransportEvent::Opened { handle, address });
        handle
    }

    fn connect(
        &mut self,
        handle: HandleId,
        remote: &PeerAddress,
    ) -> Result<ConnectionId, TransportError> {
        let mut board = self.network.lock();
        let caller = board
            .handles
            .get(&handle)
            .map(|h| h.address.clone())
            .ok_or(TransportError::HandleClosed(handle))?;
        let conn = ConnectionId(board.allocate());

        let Some(&target) = board.addresses.get(remote) else {
            board.deliver(
                self.endpoint,
                TransportEvent::ConnectionError {
                    conn,
                    error: TransportError::Unreachable(remote.clone()),
                },
            );
            return Ok(conn);
        };
        let Some(target_endpoint) = board.handles.get(&target).map(|h| h.endpoint) else {
            return Ok(conn);
        };

        let far = ConnectionId(board.allocate());
        board.conns.insert(
            conn,
            ConnEntry {
                endpoint: self.endpoint,
                handle,
                peer: far,
            },
        );
        board.conns.insert(
            far,
            ConnEntry {
                endpoint: target_endpoint,
                handle: target,
                peer: conn,
            },
        );
        board.deliver(
            target_endpoint,
            TransportEvent::Incoming {
                handle: target,
                conn: far,
                remote: caller,
            },
        );
        board.deliver(target_endpoint, TransportEvent::ConnectionOpened { conn: far });
        board.deliver(self.endpoint, TransportEvent::ConnectionOpened { conn });
        Ok(conn)
    }

    fn send(&mut self, conn: ConnectionId, payload: &[u8]) -> Result<(), TransportError> {
        let board = self.network.lock();
        let peer = board
            .conns
            .get(&conn)
            .filter(|c| c.endpoint == self.endpoint)
            .map(|c| c.peer)
            .ok_or(TransportError::NotOpen(conn))?;
        let remote = board
            .conns
            .get(&peer)
            .map(|c| c.endpoint)
            .ok_or(TransportError::NotOpen(conn))?;
        board.deliver(
            remote,
            TransportEvent::Data {
                conn: peer,
                payload: payload.to_vec(),
            },
        );
        Ok(())
    }

    fn is_open(&self, conn: ConnectionId) -> bool {
        self.network
            .lock()
            .conns
            .get(&conn)
            .is_some_and(|c| c.endpoint == self.endpoint)
    }

    fn destroy(&mut self, handle: HandleId) {
        let mut board = self.network.lock();
        if board
            .handles
            .get(&handle)
            .is_some_and(|h| h.endpoint == self.endpoint)
        {
            board.destroy(handle);
        }
    }
}

impl Drop for LocalTransport {
    fn drop(&mut self) {
        let mut board = self.network.lock();
        let mine: Vec<HandleId> = board
            .handles
            .iter()
            .filter(|(_, h)| h.endpoint == self.endpoint)
            .map(|(id, _)| *id)
            .collect();
        for handle in mine {
            board.destroy(handle);
        }
        board.endpoints.remove(&self.endpoint);
    }
}
