// Wire messages between a participant and the rendezvous broker.
//
// The broker stands in for the signaling service of a browser peer library:
// it hands out addresses, guarantees that a requested address has at most
// one owner, and carries data between two endpoints once they are linked.
// Each TCP session to the broker is one transport handle (one address).
//
// Exchange, in order of use:
// - `Open` is the first request on a session. The broker answers `Opened`
//   with the granted address, or `Unavailable` when the requested address is
//   already owned (the session is then closed by the broker).
// - `Connect { local, to }` asks for a link to another address. `local` is the
//   caller's own tag for the link; the broker echoes it in `ConnectAccepted`
//   (with the broker's `LinkId`) or `ConnectFailed`. The target gets
//   `Incoming`, then both ends get `LinkOpened`.
// - `Send`/`Data` carry payloads over a link, `Close`/`LinkClosed` tear it
//   down. When a session ends, its address is released and all its links
//   close.
//
// Framed with `framing::write_frame` and JSON-encoded.

use serde::{Deserialize, Serialize};

/// Broker-assigned id of a link between two endpoints.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LinkId(pub u64);

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum BrokerRequest {
    Open { requested: Option<String> },
    Connect { local: u64, to: String },
    Send { link: LinkId, payload: Vec<u8> },
    Close { link: LinkId },
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum BrokerReply {
    Opened { address: String },
    Unavailable { address: String },
    ConnectAccepted { local: u64, link: LinkId },
    ConnectFailed { local: u64, reason: String },
    Incoming { link: LinkId, from: String },
    LinkOpened { link: LinkId },
    Data { link: LinkId, payload: Vec<u8> },
    LinkClosed { link: LinkId },
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;
    use crate::framing::{read_frame, write_frame};

    #[test]
    fn requests_survive_framing() {
        let requests = vec![
            BrokerRequest::Open {
                requested: Some("dangeros-room-night".into()),
            },
            BrokerRequest::Open { requested: None },
            BrokerRequest::Connect {
                local: 4,
                to: "dangeros-room-night".into(),
            },
            BrokerRequest::Send {
                link: LinkId(9),
                payload: br#"{"type":"UNIT_DELETE","id":"a"}"#.to_vec(),
            },
            BrokerRequest::Close { link: LinkId(9) },
        ];

        let mut wire = Vec::new();
        for request in &requests {
            write_frame(&mut wire, &serde_json::to_vec(request).unwrap()).unwrap();
        }
        let mut cursor = Cursor::new(wire);
        for expected in &requests {
            let got: BrokerRequest =
                serde_json::from_slice(&read_frame(&mut cursor).unwrap()).unwrap();
            assert_eq!(&got, expected);
        }
    }

    #[test]
    fn unavailable_names_the_address() {
        let reply = BrokerReply::Unavailable {
            address: "dangeros-room-x".into(),
        };
        let json = serde_json::to_string(&reply).unwrap();
        assert!(json.contains("dangeros-room-x"));
        let back: BrokerReply = serde_json::from_str(&json).unwrap();
        assert_eq!(back, reply);
    }
}
