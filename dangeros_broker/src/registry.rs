// Broker state: who owns which address, and which endpoints are linked.
//
// `Registry` is the central data structure that `server.rs` drives. One
// endpoint per TCP session; an endpoint owns at most one address. All
// mutation happens through methods called from the server's single-threaded
// main loop, so there is no internal locking and the "one owner per address"
// rule needs nothing more than a map lookup.
//
// Links are symmetric: a `LinkId` names the pair, and `Data` sent by one end
// goes to the other. Removing an endpoint releases its address and closes
// every link it is part of, telling the other ends with `LinkClosed`. That is
// exactly the signal the sync layer turns into relay migration.
//
// Writing to sessions: the registry holds each session's write half. Write
// errors are logged and otherwise ignored; the session's reader thread sees
// the broken socket and reports the disconnect.

use std::collections::BTreeMap;
use std::io::Write;

use dangeros_prng::BoardRng;
use dangeros_protocol::broker::{BrokerReply, LinkId};
use dangeros_protocol::write_frame;
use tracing::{debug, info, warn};

use crate::error::BrokerError;

/// Broker-local id of a TCP session.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EndpointId(pub u64);

struct Endpoint {
    address: Option<String>,
    writer: Box<dyn Write + Send>,
}

#[derive(Clone, Copy)]
struct Link {
    caller: EndpointId,
    callee: EndpointId,
}

impl Link {
    fn other(&self, end: EndpointId) -> Option<EndpointId> {
        if end == self.caller {
            Some(self.callee)
        } else if end == self.callee {
            Some(self.caller)
        } else {
            None
        }
    }
}

pub struct Registry {
    endpoints: BTreeMap<EndpointId, Endpoint>,
    owners: BTreeMap<String, EndpointId>,
    links: BTreeMap<LinkId, Link>,
    next_endpoint: u64,
    next_link: u64,
    rng: BoardRng,
}

impl Default for Registry {
    fn default() -> Self {
        Self::new(BoardRng::from_clock())
    }
}

impl Registry {
    pub fn new(rng: BoardRng) -> Self {
        Self {
            endpoints: BTreeMap::new(),
            owners: BTreeMap::new(),
            links: BTreeMap::new(),
            next_endpoint: 0,
            next_link: 0,
            rng,
        }
    }

    /// Register a new session. It has no address until `open`.
    pub fn add_endpoint(&mut self, writer: Box<dyn Write + Send>) -> EndpointId {
        self.next_endpoint += 1;
        let id = EndpointId(self.next_endpoint);
        self.endpoints.insert(
            id,
            Endpoint {
                address: None,
                writer,
            },
        );
        id
    }

    pub fn endpoint_count(&self) -> usize {
        self.endpoints.len()
    }

    pub fn link_count(&self) -> usize {
        self.links.len()
    }

    pub fn owner(&self, address: &str) -> Option<EndpointId> {
        self.owners.get(address).copied()
    }

    /// Give `endpoint` an address: the requested one if nobody owns it, or a
    /// fresh ephemeral one.
    pub fn open(
        &mut self,
        endpoint: EndpointId,
        requested: Option<String>,
    ) -> Result<String, BrokerError> {
        match self.endpoints.get(&endpoint) {
            None => return Err(BrokerError::UnknownEndpoint),
            Some(e) if e.address.is_some() => return Err(BrokerError::AlreadyOpen),
            Some(_) => {}
        }

        let address = match requested {
            Some(address) if self.owners.contains_key(&address) => {
                info!(%address, ?endpoint, "claim refused");
                self.reply(
                    endpoint,
                    &BrokerReply::Unavailable {
                        address: address.clone(),
                    },
                );
                return Err(BrokerError::AddressTaken(address));
            }
            Some(address) => address,
            None => loop {
                let candidate = format!("peer-{}", self.rng.token(12));
                if !self.owners.contains_key(&candidate) {
                    break candidate;
                }
            },
        };

        self.owners.insert(address.clone(), endpoint);
        if let Some(e) = self.endpoints.get_mut(&endpoint) {
            e.address = Some(address.clone());
        }
        info!(%address, ?endpoint, "address opened");
        self.reply(
            endpoint,
            &BrokerReply::Opened {
                address: address.clone(),
            },
        );
        Ok(address)
    }

    /// Link `endpoint` to whoever owns `to`.
    pub fn connect(&mut self, endpoint: EndpointId, local: u64, to: &str) -> Result<LinkId, BrokerError> {
        let from = match self.endpoints.get(&endpoint).map(|e| e.address.clone()) {
            Some(Some(address)) => address,
            _ => {
                self.reply(
                    endpoint,
                    &BrokerReply::ConnectFailed {
                        local,
                        reason: "endpoint has no address".into(),
                    },
                );
                return Err(BrokerError::NotOpen);
            }
        };
        let Some(callee) = self.owner(to) else {
            debug!(%from, to, "connect to an unowned address");
            self.reply(
                endpoint,
                &BrokerReply::ConnectFailed {
                    local,
                    reason: format!("no endpoint at {to}"),
                },
            );
            return Err(BrokerError::Unreachable(to.to_owned()));
        };

        self.next_link += 1;
        let link = LinkId(self.next_link);
        self.links.insert(
            link,
            Link {
                caller: endpoint,
                callee,
            },
        );
        debug!(?link, %from, to, "linked");
        self.reply(endpoint, &BrokerReply::ConnectAccepted { local, link });
        self.reply(callee, &BrokerReply::Incoming { link, from });
        self.reply(callee, &BrokerReply::LinkOpened { link });
        self.reply(endpoint, &BrokerReply::LinkOpened { link });
        Ok(link)
    }

    /// Forward `payload` to the other end of `link`.
    pub fn send(&mut self, endpoint: EndpointId, link: LinkId, payload: Vec<u8>) {
        let Some(target) = self.links.get(&link).and_then(|l| l.other(endpoint)) else {
            debug!(?endpoint, ?link, "send on a link the endpoint is not part of");
            return;
        };
        self.reply(target, &BrokerReply::Data { link, payload });
    }

    pub fn close(&mut self, endpoint: EndpointId, link: LinkId) {
        let Some(other) = self.links.get(&link).and_then(|l| l.other(endpoint)) else {
            return;
        };
        self.links.remove(&link);
        self.reply(other, &BrokerReply::LinkClosed { link });
    }

    /// Forget a session: release its address and close its links.
    pub fn remove_endpoint(&mut self, endpoint: EndpointId) {
        let Some(removed) = self.endpoints.remove(&endpoint) else {
            return;
        };
        if let Some(address) = removed.address {
            if self.owners.get(&address) == Some(&endpoint) {
                self.owners.remove(&address);
            }
            info!(%address, ?endpoint, "address released");
        }
        let doomed: Vec<(LinkId, Link)> = self
            .links
            .iter()
            .filter(|(_, l)| l.other(endpoint).is_some())
            .map(|(id, l)| (*id, *l))
            .collect();
        for (link, ends) in doomed {
            self.links.remove(&link);
            if let Some(other) = ends.other(endpoint) {
                self.reply(other, &BrokerReply::LinkClosed { link });
            }
        }
    }

    fn reply(&mut self, endpoint: EndpointId, reply: &BrokerReply) {
        let Some(e) = self.endpoints.get_mut(&endpoint) else {
            return;
        };
        let bytes = match serde_json::to_vec(reply) {
            Ok(bytes) => bytes,
            Err(error) => {
                warn!(%error, "could not encode broker reply");
                return;
            }
        };
        if let Err(error) = write_frame(&mut e.writer, &bytes) {
            warn!(?endpoint, %error, "write to session failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;
    use std::sync::{Arc, Mutex};

    use dangeros_protocol::read_frame;

    use super::*;

    /// A writer the test can read back.
    #[derive(Clone, Default)]
    struct Tap(Arc<Mutex<Vec<u8>>>);

    impl Write for Tap {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    impl Tap {
        fn replies(&self) -> Vec<BrokerReply> {
            let bytes = std::mem::take(&mut *self.0.lock().unwrap());
            let mut cursor = Cursor::new(bytes);
            let mut out = Vec::new();
            while let Ok(frame) = read_frame(&mut cursor) {
                out.push(serde_json::from_slice(&frame).unwrap());
            }
            out
        }
    }

    fn endpoint(registry: &mut Registry) -> (EndpointId, Tap) {
        let tap = Tap::default();
        (registry.add_endpoint(Box::new(tap.clone())), tap)
    }

    #[test]
    fn one_owner_per_address() {
        let mut registry = Registry::new(BoardRng::new(1));
        let (a, tap_a) = endpoint(&mut registry);
        let (b, tap_b) = endpoint(&mut registry);

        assert_eq!(registry.open(a, Some("room".into())).unwrap(), "room");
        assert!(matches!(
            registry.open(b, Some("room".into())),
            Err(BrokerError::AddressTaken(_))
        ));
        assert_eq!(
            tap_a.replies(),
            vec![BrokerReply::Opened {
                address: "room".into()
            }]
        );
        assert_eq!(
            tap_b.replies(),
            vec![BrokerReply::Unavailable {
                address: "room".into()
            }]
        );
        assert_eq!(registry.owner("room"), Some(a));
    }

    #[test]
    fn ephemeral_addresses_are_distinct() {
        let mut registry = Registry::new(BoardRng::new(1));
        let (a, _) = endpoint(&mut registry);
        let (b, _) = endpoint(&mut registry);
        let first = registry.open(a, None).unwrap();
        let second = registry.open(b, None).unwrap();
        assert_ne!(first, second);
        assert!(first.starts_with("peer-"));
    }

    #[test]
    fn linked_endpoints_exchange_data() {
        let mut registry = Registry::new(BoardRng::new(1));
        let (host, tap_host) = endpoint(&mut registry);
        let (guest, tap_guest) = endpoint(&mut registry);
        registry.open(host, Some("room".into())).unwrap();
        let guest_address = registry.open(guest, None).unwrap();
        tap_host.replies();
        tap_guest.replies();

        let link = registry.connect(guest, 7, "room").unwrap();
        assert_eq!(
            tap_guest.replies(),
            vec![
                BrokerReply::ConnectAccepted { local: 7, link },
                BrokerReply::LinkOpened { link },
            ]
        );
        assert_eq!(
            tap_host.replies(),
            vec![
                BrokerReply::Incoming {
                    link,
                    from: guest_address
                },
                BrokerReply::LinkOpened { link },
            ]
        );

        registry.send(guest, link, b"hi".to_vec());
        registry.send(host, link, b"yo".to_vec());
        assert_eq!(
            tap_host.replies(),
            vec![BrokerReply::Data {
                link,
                payload: b"hi".to_vec()
            }]
        );
        assert_eq!(
            tap_guest.replies(),
            vec![BrokerReply::Data {
                link,
                payload: b"yo".to_vec()
            }]
        );
    }

    #[test]
    fn connecting_to_nobody_fails() {
        let mut registry = Registry::new(BoardRng::new(1));
        let (guest, tap) = endpoint(&mut registry);
        registry.open(guest, None).unwrap();
        tap.replies();

        assert!(registry.connect(guest, 3, "empty").is_err());
        assert!(matches!(
            tap.replies().as_slice(),
            [BrokerReply::ConnectFailed { local: 3, .. }]
        ));
    }

    #[test]
    fn removing_an_endpoint_releases_and_closes() {
        let mut registry = Registry::new(BoardRng::new(1));
        let (host, _) = endpoint(&mut registry);
        let (guest, tap_guest) = endpoint(&mut registry);
        registry.open(host, Some("room".into())).unwrap();
        registry.open(guest, None).unwrap();
        let link = registry.connect(guest, 1, "room").unwrap();
        tap_guest.replies();

        registry.remove_endpoint(host);

        assert_eq!(registry.owner("room"), None);
        assert_eq!(registry.link_count(), 0);
        assert_eq!(tap_guest.replies(), vec![BrokerReply::LinkClosed { link }]);

        // The address can be claimed again right away.
        let (next, _) = endpoint(&mut registry);
        assert!(registry.open(next, Some("room".into())).is_ok());
    }

    #[test]
    fn strangers_cannot_use_a_link() {
        let mut registry = Registry::new(BoardRng::new(1));
        let (host, tap_host) = endpoint(&mut registry);
        let (guest, _) = endpoint(&mut registry);
        let (stranger, _) = endpoint(&mut registry);
        registry.open(host, Some("room".into())).unwrap();
        registry.open(guest, None).unwrap();
        registry.open(stranger, None).unwrap();
        let link = registry.connect(guest, 1, "room").unwrap();
        tap_host.replies();

        registry.send(stranger, link, b"spoof".to_vec());
        registry.close(stranger, link);
        assert!(tap_host.replies().is_empty());
        assert_eq!(registry.link_count(), 1);
    }
}
