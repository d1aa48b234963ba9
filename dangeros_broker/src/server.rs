// TCP server and main event loop for the rendezvous broker.
//
// Architecture: thread-per-reader with a central `mpsc` channel.
//
// - **Listener thread** (`TcpListener::accept()` loop): accepts new TCP
//   sessions and sends `InternalEvent::NewSession` to the main thread.
// - **Reader threads** (one per session): call `read_frame()` in a loop,
//   decode `BrokerRequest`, and send `InternalEvent::Request` to the main
//   thread. On error/EOF they send `InternalEvent::Disconnected`.
// - **Main thread**: owns the `Registry`, receives events from the channel,
//   and dispatches them. Uses `recv_timeout` so it can notice the
//   `keep_running` flag even when no session is talking.
//
// The main thread is the only writer to session streams (through the
// registry). Reader threads only read.
//
// A session whose claim is refused is shut down right after the
// `Unavailable` reply. When any session ends, its address becomes free at
// once; there is no grace period, so a relay that drops off can be replaced
// within one migration step.
//
// Shutdown: `BrokerHandle::stop` clears `keep_running`; the main loop exits,
// shuts every session socket down (which ends the reader threads), and
// returns.

use std::collections::BTreeMap;
use std::io::{BufReader, BufWriter};
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::thread;
use std::time::Duration;

use dangeros_protocol::broker::BrokerRequest;
use dangeros_protocol::read_frame;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::BrokerError;
use crate::registry::{EndpointId, Registry};

/// Events sent from listener/reader threads to the main thread.
enum InternalEvent {
    NewSession {
        stream: TcpStream,
    },
    Request {
        endpoint: EndpointId,
        request: BrokerRequest,
    },
    Disconnected {
        endpoint: EndpointId,
    },
}

/// Handle returned by `start_broker` to control the running server.
pub struct BrokerHandle {
    keep_running: Arc<AtomicBool>,
    thread: Option<thread::JoinHandle<()>>,
}

impl BrokerHandle {
    /// Signal the broker to stop and wait for it to shut down.
    pub fn stop(mut self) {
        self.keep_running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.thread.take() {
            let _ = handle.join();
        }
    }

    /// Block until the broker exits on its own.
    pub fn wait(mut self) {
        if let Some(handle) = self.thread.take() {
            let _ = handle.join();
        }
    }
}

/// Configuration for starting a broker.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    pub port: u16,
    pub bind: String,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            port: 7979,
            bind: "127.0.0.1".into(),
        }
    }
}

/// Start the broker on a background thread. Returns a handle for stopping
/// it and the actual bound address (useful when port 0 is used to let the
/// OS pick a free port).
pub fn start_broker(config: BrokerConfig) -> std::io::Result<(BrokerHandle, SocketAddr)> {
    let listener = TcpListener::bind((config.bind.as_str(), config.port))?;
    let addr = listener.local_addr()?;
    let keep_running = Arc::new(AtomicBool::new(true));
    let keep_running_clone = keep_running.clone();

    let thread = thread::spawn(move || {
        run_broker(listener, keep_running_clone);
    });

    info!(%addr, "broker listening");
    Ok((
        BrokerHandle {
            keep_running,
            thread: Some(thread),
        },
        addr,
    ))
}

/// Main broker loop. Runs until `keep_running` is set to false.
fn run_broker(listener: TcpListener, keep_running: Arc<AtomicBool>) {
    let mut registry = Registry::default();
    let mut sockets: BTreeMap<EndpointId, TcpStream> = BTreeMap::new();
    let (tx, rx): (Sender<InternalEvent>, Receiver<InternalEvent>) = mpsc::channel();

    // Non-blocking so the accept thread can check keep_running periodically.
    if let Err(error) = listener.set_nonblocking(true) {
        warn!(%error, "listener stays blocking");
    }

    let keep_running_listener = keep_running.clone();
    let tx_listener = tx.clone();
    thread::spawn(move || {
        while keep_running_listener.load(Ordering::SeqCst) {
            match listener.accept() {
                Ok((stream, peer)) => {
                    debug!(%peer, "session accepted");
                    stream.set_nonblocking(false).ok();
                    stream.set_nodelay(true).ok();
                    let _ = tx_listener.send(InternalEvent::NewSession { stream });
                }
                Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    thread::sleep(Duration::from_millis(20));
                }
                Err(error) => {
                    warn!(%error, "accept failed; listener exiting");
                    break;
                }
            }
        }
    });

    while keep_running.load(Ordering::SeqCst) {
        match rx.recv_timeout(Duration::from_millis(50)) {
            Ok(event) => {
                handle_event(&mut registry, &mut sockets, event, &tx);
                while let Ok(event) = rx.try_recv() {
                    handle_event(&mut registry, &mut sockets, event, &tx);
                }
            }
            Err(mpsc::RecvTimeoutError::Timeout) => {}
            Err(mpsc::RecvTimeoutError::Disconnected) => break,
        }
    }

    for (_, socket) in sockets {
        socket.shutdown(Shutdown::Both).ok();
    }
    info!("broker stopped");
}

fn handle_event(
    registry: &mut Registry,
    sockets: &mut BTreeMap<EndpointId, TcpStream>,
    event: InternalEvent,
    tx: &Sender<InternalEvent>,
) {
    match event {
        InternalEvent::NewSession { stream } => {
            if let Err(error) = handle_new_session(registry, sockets, stream, tx) {
                warn!(%error, "could not set up session");
            }
        }
        InternalEvent::Request { endpoint, request } => {
            handle_request(registry, sockets, endpoint, request);
        }
        InternalEvent::Disconnected { endpoint } => {
            debug!(?endpoint, "session ended");
            registry.remove_endpoint(endpoint);
            if let Some(socket) = sockets.remove(&endpoint) {
                socket.shutdown(Shutdown::Both).ok();
            }
        }
    }
}

/// Register the session and spawn its reader thread.
fn handle_new_session(
    registry: &mut Registry,
    sockets: &mut BTreeMap<EndpointId, TcpStream>,
    stream: TcpStream,
    tx: &Sender<InternalEvent>,
) -> Result<(), BrokerError> {
    let writer = BufWriter::new(stream.try_clone()?);
    let reader = BufReader::new(stream.try_clone()?);
    let endpoint = registry.add_endpoint(Box::new(writer));
    sockets.insert(endpoint, stream);

    let tx_reader = tx.clone();
    thread::spawn(move || reader_loop(reader, endpoint, tx_reader));
    Ok(())
}

/// Reader loop for a single session. Runs in its own thread.
fn reader_loop(mut reader: BufReader<TcpStream>, endpoint: EndpointId, tx: Sender<InternalEvent>) {
    loop {
        let request = read_frame(&mut reader)
            .map_err(BrokerError::from)
            .and_then(|bytes| Ok(serde_json::from_slice::<BrokerRequest>(&bytes)?));
        match request {
            Ok(request) => {
                if tx.send(InternalEvent::Request { endpoint, request }).is_err() {
                    break;
                }
            }
            Err(error) => {
                // EOF, reset, or garbage: the session is over either way.
                debug!(?endpoint, %error, "session reader stopping");
                let _ = tx.send(InternalEvent::Disconnected { endpoint });
                break;
            }
        }
    }
}

fn handle_request(
    registry: &mut Registry,
    sockets: &mut BTreeMap<EndpointId, TcpStream>,
    endpoint: EndpointId,
    request: BrokerRequest,
) {
    match request {
        BrokerRequest::Open { requested } => match registry.open(endpoint, requested) {
            Ok(_) => {}
            Err(BrokerError::AddressTaken(address)) => {
                debug!(?endpoint, %address, "closing refused session");
                registry.remove_endpoint(endpoint);
                if let Some(socket) = sockets.remove(&endpoint) {
                    socket.shutdown(Shutdown::Both).ok();
                }
            }
            Err(error) => debug!(?endpoint, %error, "open ignored"),
        },
        BrokerRequest::Connect { local, to } => {
            if let Err(error) = registry.connect(endpoint, local, &to) {
                debug!(?endpoint, %error, "connect refused");
            }
        }
        BrokerRequest::Send { link, payload } => registry.send(endpoint, link, payload),
        BrokerRequest::Close { link } => registry.close(endpoint, link),
    }
}
