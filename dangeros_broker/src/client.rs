// `Transport` binding over the rendezvous broker.
//
// Each transport handle is its own TCP session to the broker, so destroying a
// handle is just closing its socket, and the broker does the rest (address
// released, links closed, peers told). Architecture per session:
// - `open()` connects, sends `Open`, and spawns a reader thread.
// - The reader thread turns `BrokerReply`s into `TransportEvent`s and pushes
//   them into the `EventSink`.
// - Calls on the transport (`connect`, `send`, `destroy`) write requests
//   synchronously from the caller's thread.
//
// Connection ids are allocated here, not by the broker. For outgoing
// connections the id travels as the `local` tag of `Connect` and comes back
// in `ConnectAccepted`; incoming links get a fresh id when `Incoming` arrives.
// The shared table maps between our ids and the broker's `LinkId`s.
//
// Events are delivered while the table lock is held, so the order the broker
// wrote replies in is the order the sink sees them.

use std::collections::HashMap;
use std::io::{BufReader, BufWriter};
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;

use dangeros_protocol::broker::{BrokerReply, BrokerRequest, LinkId};
use dangeros_protocol::{PeerAddress, read_frame, write_frame};
use dangeros_sync::transport::{ConnectionId, EventSink, HandleId, Transport, TransportEvent};
use dangeros_sync::TransportError;
use tracing::{debug, warn};

use crate::error::BrokerError;

struct Session {
    writer: BufWriter<TcpStream>,
    socket: TcpStream,
    address: Option<PeerAddress>,
}

struct Conn {
    handle: HandleId,
    remote: PeerAddress,
    link: Option<LinkId>,
    open: bool,
}

struct Shared {
    sink: Box<dyn EventSink>,
    next_id: u64,
    sessions: HashMap<HandleId, Session>,
    conns: HashMap<ConnectionId, Conn>,
    links: HashMap<(HandleId, LinkId), ConnectionId>,
}

impl Shared {
    fn allocate(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn deliver(&self, event: TransportEvent) {
        self.sink.deliver(event);
    }

    fn forget_conn(&mut self, conn: ConnectionId) -> Option<Conn> {
        let removed = self.conns.remove(&conn)?;
        if let Some(link) = removed.link {
            self.links.remove(&(removed.handle, link));
        }
        Some(removed)
    }

    fn conns_of(&self, handle: HandleId) -> Vec<ConnectionId> {
        self.conns
            .iter()
            .filter(|(_, c)| c.handle == handle)
            .map(|(id, _)| *id)
            .collect()
    }

    fn write(&mut self, handle: HandleId, request: &BrokerRequest) -> Result<(), BrokerError> {
        let session = self
            .sessions
            .get_mut(&handle)
            .ok_or(BrokerError::NotOpen)?;
        let bytes = serde_json::to_vec(request)?;
        write_frame(&mut session.writer, &bytes)?;
        Ok(())
    }
}

/// A participant's connection to a broker.
pub struct BrokerTransport {
    broker: SocketAddr,
    shared: Arc<Mutex<Shared>>,
}

impl BrokerTransport {
    pub fn new(broker: SocketAddr, sink: impl EventSink) -> Self {
        Self {
            broker,
            shared: Arc::new(Mutex::new(Shared {
                sink: Box::new(sink),
                next_id: 0,
                sessions: HashMap::new(),
                conns: HashMap::new(),
                links: HashMap::new(),
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Shared> {
        lock(&self.shared)
    }

    fn start_session(
        &self,
        handle: HandleId,
        requested: Option<&PeerAddress>,
    ) -> Result<BufReader<TcpStream>, BrokerError> {
        let socket = TcpStream::connect(self.broker)?;
        socket.set_nodelay(true).ok();
        let reader = BufReader::new(socket.try_clone()?);
        let writer = BufWriter::new(socket.try_clone()?);

        let mut shared = self.lock();
        shared.sessions.insert(
            handle,
            Session {
                writer,
                socket,
                address: None,
            },
        );
        let open = BrokerRequest::Open {
            requested: requested.map(|a| a.as_str().to_owned()),
        };
        if let Err(error) = shared.write(handle, &open) {
            shared.sessions.remove(&handle);
            return Err(error);
        }
        Ok(reader)
    }
}

fn lock(shared: &Mutex<Shared>) -> MutexGuard<'_, Shared> {
    shared.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Transport for BrokerTransport {
    fn open(&mut self, requested: Option<&PeerAddress>) -> HandleId {
        let handle = HandleId(self.lock().allocate());
        match self.start_session(handle, requested) {
            Ok(reader) => {
                let shared = self.shared.clone();
                thread::spawn(move || reader_loop(reader, handle, shared));
            }
            Err(error) => {
                warn!(broker = %self.broker, %error, "could not reach the broker");
                self.lock().deliver(TransportEvent::OpenFailed {
                    handle,
                    error: TransportError::Io(error.to_string()),
                });
            }
        }
        handle
    }

    fn connect(
        &mut self,
        handle: HandleId,
        remote: &PeerAddress,
    ) -> Result<ConnectionId, TransportError> {
        let mut shared = self.lock();
        if !shared
            .sessions
            .get(&handle)
            .is_some_and(|s| s.address.is_some())
        {
            return Err(TransportError::HandleClosed(handle));
        }
        let conn = ConnectionId(shared.allocate());
        shared.conns.insert(
            conn,
            Conn {
                handle,
                remote: remote.clone(),
                link: None,
                open: false,
            },
        );
        let request = BrokerRequest::Connect {
            local: conn.0,
            to: remote.as_str().to_owned(),
        };
        if let Err(error) = shared.write(handle, &request) {
            shared.forget_conn(conn);
            return Err(TransportError::Io(error.to_string()));
        }
        Ok(conn)
    }

    fn send(&mut self, conn: ConnectionId, payload: &[u8]) -> Result<(), TransportError> {
        let mut shared = self.lock();
        let (handle, link) = shared
            .conns
            .get(&conn)
            .filter(|c| c.open)
            .and_then(|c| Some((c.handle, c.link?)))
            .ok_or(TransportError::NotOpen(conn))?;
        let request = BrokerRequest::Send {
            link,
            payload: payload.to_vec(),
        };
        shared
            .write(handle, &request)
            .map_err(|error| TransportError::Io(error.to_string()))
    }

    fn is_open(&self, conn: ConnectionId) -> bool {
        self.lock().conns.get(&conn).is_some_and(|c| c.open)
    }

    fn destroy(&mut self, handle: HandleId) {
        let mut shared = self.lock();
        for conn in shared.conns_of(handle) {
            shared.forget_conn(conn);
        }
        if let Some(session) = shared.sessions.remove(&handle) {
            debug!(?handle, address = ?session.address, "closing broker session");
            session.socket.shutdown(Shutdown::Both).ok();
        }
    }
}

impl Drop for BrokerTransport {
    fn drop(&mut self) {
        let handles: Vec<HandleId> = self.lock().sessions.keys().copied().collect();
        for handle in handles {
            self.destroy(handle);
        }
    }
}

/// Reader loop for one broker session. Runs in its own thread.
fn reader_loop(mut reader: BufReader<TcpStream>, handle: HandleId, shared: Arc<Mutex<Shared>>) {
    loop {
        let reply = read_frame(&mut reader)
            .map_err(BrokerError::from)
            .and_then(|bytes| Ok(serde_json::from_slice::<BrokerReply>(&bytes)?));
        let mut table = lock(&shared);
        if !table.sessions.contains_key(&handle) {
            // Destroyed locally; nobody wants to hear about it.
            return;
        }
        match reply {
            Ok(reply) => {
                if !on_reply(&mut table, handle, reply) {
                    return;
                }
            }
            Err(error) => {
                debug!(?handle, %error, "broker session lost");
                session_lost(&mut table, handle, &error);
                return;
            }
        }
    }
}

/// Apply one reply. Returns false when the session is over.
fn on_reply(table: &mut Shared, handle: HandleId, reply: BrokerReply) -> bool {
    match reply {
        BrokerReply::Opened { address } => {
            let address = PeerAddress::new(address);
            if let Some(session) = table.sessions.get_mut(&handle) {
                session.address = Some(address.clone());
            }
            table.deliver(TransportEvent::Opened { handle, address });
        }
        BrokerReply::Unavailable { address } => {
            table.sessions.remove(&handle);
            table.deliver(TransportEvent::OpenFailed {
                handle,
                error: TransportError::AddressUnavailable(PeerAddress::new(address)),
            });
            return false;
        }
        BrokerReply::ConnectAccepted { local, link } => {
            let conn = ConnectionId(local);
            if let Some(c) = table.conns.get_mut(&conn) {
                c.link = Some(link);
                table.links.insert((handle, link), conn);
            }
        }
        BrokerReply::ConnectFailed { local, reason } => {
            let conn = ConnectionId(local);
            if let Some(c) = table.forget_conn(conn) {
                debug!(?conn, %reason, "connect failed");
                table.deliver(TransportEvent::ConnectionError {
                    conn,
                    error: TransportError::Unreachable(c.remote),
                });
            }
        }
        BrokerReply::Incoming { link, from } => {
            let conn = ConnectionId(table.allocate());
            let remote = PeerAddress::new(from);
            table.conns.insert(
                conn,
                Conn {
                    handle,
                    remote: remote.clone(),
                    link: Some(link),
                    open: false,
                },
            );
            table.links.insert((handle, link), conn);
            table.deliver(TransportEvent::Incoming {
                handle,
                conn,
                remote,
            });
        }
        BrokerReply::LinkOpened { link } => {
            if let Some(&conn) = table.links.get(&(handle, link)) {
                if let Some(c) = table.conns.get_mut(&conn) {
                    c.open = true;
                }
                table.deliver(TransportEvent::ConnectionOpened { conn });
            }
        }
        BrokerReply::Data { link, payload } => {
            if let Some(&conn) = table.links.get(&(handle, link)) {
                table.deliver(TransportEvent::Data { conn, payload });
            }
        }
        BrokerReply::LinkClosed { link } => {
            if let Some(conn) = table.links.get(&(handle, link)).copied() {
                table.forget_conn(conn);
                table.deliver(TransportEvent::ConnectionClosed { conn });
            }
        }
    }
    true
}

/// The broker went away under a live session.
fn session_lost(table: &mut Shared, handle: HandleId, error: &BrokerError) {
    let Some(session) = table.sessions.remove(&handle) else {
        return;
    };
    if session.address.is_none() {
        table.deliver(TransportEvent::OpenFailed {
            handle,
            error: TransportError::Io(error.to_string()),
        });
        return;
    }
    for conn in table.conns_of(handle) {
        if let Some(c) = table.forget_conn(conn) {
            let event = if c.open {
                TransportEvent::ConnectionClosed { conn }
            } else {
                TransportEvent::ConnectionError {
                    conn,
                    error: TransportError::Io(error.to_string()),
                }
            };
            table.deliver(event);
        }
    }
}
