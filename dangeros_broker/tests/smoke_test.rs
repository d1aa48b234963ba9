// Integration smoke test for the broker.
//
// Starts a broker on localhost and drives it two ways: with plain framed TCP
// sockets speaking `BrokerRequest`/`BrokerReply` directly, and through
// `BrokerTransport`, checking the guarantees the sync layer relies on (one
// owner per address, ordered delivery, address released on disconnect).

use std::io::{BufReader, BufWriter};
use std::net::{SocketAddr, TcpStream};
use std::sync::mpsc::{self, Receiver};
use std::time::Duration;

use dangeros_broker::{BrokerConfig, BrokerTransport, start_broker};
use dangeros_protocol::broker::{BrokerReply, BrokerRequest};
use dangeros_protocol::{PeerAddress, read_frame, write_frame};
use dangeros_sync::{Transport, TransportError, TransportEvent};

struct RawSession {
    reader: BufReader<TcpStream>,
    writer: BufWriter<TcpStream>,
}

impl RawSession {
    fn connect(addr: SocketAddr) -> Self {
        let stream = TcpStream::connect(addr).unwrap();
        stream
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        Self {
            reader: BufReader::new(stream.try_clone().unwrap()),
            writer: BufWriter::new(stream),
        }
    }

    fn send(&mut self, request: &BrokerRequest) {
        write_frame(&mut self.writer, &serde_json::to_vec(request).unwrap()).unwrap();
    }

    fn recv(&mut self) -> BrokerReply {
        serde_json::from_slice(&read_frame(&mut self.reader).unwrap()).unwrap()
    }

    fn open(addr: SocketAddr, requested: Option<&str>) -> (Self, BrokerReply) {
        let mut session = Self::connect(addr);
        session.send(&BrokerRequest::Open {
            requested: requested.map(str::to_owned),
        });
        let reply = session.recv();
        (session, reply)
    }
}

fn broker() -> (dangeros_broker::BrokerHandle, SocketAddr) {
    start_broker(BrokerConfig {
        port: 0,
        ..BrokerConfig::default()
    })
    .unwrap()
}

#[test]
fn raw_session_lifecycle() {
    let (handle, addr) = broker();

    // 1. Claim an address; a second claim is refused and the session closed.
    let (mut host, reply) = RawSession::open(addr, Some("dangeros-room-smoke"));
    assert_eq!(
        reply,
        BrokerReply::Opened {
            address: "dangeros-room-smoke".into()
        }
    );
    let (mut loser, reply) = RawSession::open(addr, Some("dangeros-room-smoke"));
    assert_eq!(
        reply,
        BrokerReply::Unavailable {
            address: "dangeros-room-smoke".into()
        }
    );
    assert!(read_frame(&mut loser.reader).is_err());

    // 2. A guest with an ephemeral address links to the host.
    let (mut guest, reply) = RawSession::open(addr, None);
    let guest_address = match reply {
        BrokerReply::Opened { address } => address,
        other => panic!("expected Opened, got {other:?}"),
    };
    guest.send(&BrokerRequest::Connect {
        local: 11,
        to: "dangeros-room-smoke".into(),
    });
    let link = match guest.recv() {
        BrokerReply::ConnectAccepted { local: 11, link } => link,
        other => panic!("expected ConnectAccepted, got {other:?}"),
    };
    assert_eq!(guest.recv(), BrokerReply::LinkOpened { link });
    assert_eq!(
        host.recv(),
        BrokerReply::Incoming {
            link,
            from: guest_address
        }
    );
    assert_eq!(host.recv(), BrokerReply::LinkOpened { link });

    // 3. Data in both directions, in order.
    for n in 0..3u8 {
        guest.send(&BrokerRequest::Send {
            link,
            payload: vec![n],
        });
    }
    for n in 0..3u8 {
        assert_eq!(
            host.recv(),
            BrokerReply::Data {
                link,
                payload: vec![n]
            }
        );
    }
    host.send(&BrokerRequest::Send {
        link,
        payload: b"ack".to_vec(),
    });
    assert_eq!(
        guest.recv(),
        BrokerReply::Data {
            link,
            payload: b"ack".to_vec()
        }
    );

    // 4. The host disconnecting closes the link and frees the address.
    drop(host);
    assert_eq!(guest.recv(), BrokerReply::LinkClosed { link });
    let (_next, reply) = RawSession::open(addr, Some("dangeros-room-smoke"));
    assert_eq!(
        reply,
        BrokerReply::Opened {
            address: "dangeros-room-smoke".into()
        }
    );

    handle.stop();
}

#[test]
fn connect_to_an_unowned_address_fails() {
    let (handle, addr) = broker();
    let (mut guest, _) = RawSession::open(addr, None);
    guest.send(&BrokerRequest::Connect {
        local: 1,
        to: "dangeros-room-nobody".into(),
    });
    assert!(matches!(
        guest.recv(),
        BrokerReply::ConnectFailed { local: 1, .. }
    ));
    handle.stop();
}

fn next(rx: &Receiver<TransportEvent>) -> TransportEvent {
    rx.recv_timeout(Duration::from_secs(5))
        .expect("timed out waiting for a transport event")
}

#[test]
fn broker_transport_behaves_like_a_transport() {
    let (handle, addr) = broker();
    let room = PeerAddress::new("dangeros-room-transport");

    let (tx_host, rx_host) = mpsc::channel();
    let (tx_guest, rx_guest) = mpsc::channel();
    let (tx_rival, rx_rival) = mpsc::channel();
    let mut host = BrokerTransport::new(addr, tx_host);
    let mut guest = BrokerTransport::new(addr, tx_guest);
    let mut rival = BrokerTransport::new(addr, tx_rival);

    let hh = host.open(Some(&room));
    assert_eq!(
        next(&rx_host),
        TransportEvent::Opened {
            handle: hh,
            address: room.clone()
        }
    );
    let hr = rival.open(Some(&room));
    assert_eq!(
        next(&rx_rival),
        TransportEvent::OpenFailed {
            handle: hr,
            error: TransportError::AddressUnavailable(room.clone())
        }
    );

    let hg = guest.open(None);
    assert!(matches!(next(&rx_guest), TransportEvent::Opened { handle, .. } if handle == hg));
    let conn = guest.connect(hg, &room).unwrap();
    assert_eq!(next(&rx_guest), TransportEvent::ConnectionOpened { conn });
    let far = match next(&rx_host) {
        TransportEvent::Incoming { handle, conn, .. } => {
            assert_eq!(handle, hh);
            conn
        }
        other => panic!("expected Incoming, got {other:?}"),
    };
    assert_eq!(next(&rx_host), TransportEvent::ConnectionOpened { conn: far });
    assert!(guest.is_open(conn));

    guest.send(conn, b"hello").unwrap();
    assert_eq!(
        next(&rx_host),
        TransportEvent::Data {
            conn: far,
            payload: b"hello".to_vec()
        }
    );

    host.destroy(hh);
    assert_eq!(next(&rx_guest), TransportEvent::ConnectionClosed { conn });
    assert!(!guest.is_open(conn));

    // The address is free again.
    let again = rival.open(Some(&room));
    assert_eq!(
        next(&rx_rival),
        TransportEvent::Opened {
            handle: again,
            address: room
        }
    );

    handle.stop();
}
