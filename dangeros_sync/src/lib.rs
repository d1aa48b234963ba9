// dangeros_sync — serverless shared-board synchronization.
//
// A handful of participants edit one board (units on a 7×5 grid, team DP
// counters, a chat log) and every edit shows up on everybody's screen. There
// is no server: participants find each other through a well-known address
// derived from the room name, one of them claims that address and becomes the
// relay, and everyone else connects to it. The relay forwards every edit to
// all other peers. When the relay goes away, the survivors elect a new one by
// staggered timeouts over the last roster they saw.
//
// Module overview:
// - `resolver.rs`:   Room name → relay address.
// - `store.rs`:      `StateStore`, the replicated board and its only mutation
//                    path; publishes local edits through a `Broadcaster`.
// - `negotiator.rs`: Sans-IO state machine for joining, relay election,
//                    rebroadcast, and failover.
// - `transport/`:    The `Transport` trait the negotiator drives, plus the
//                    in-process `LocalNetwork` binding.
// - `node.rs`:       Thread + channel driver around a negotiator, and the
//                    `NodeHandle` the UI talks to.
// - `chat.rs`:       Chat line normalization and dice / attack commands.
// - `wiki.rs`:       PukiWiki export and import of the board.
// - `config.rs`:     Election timing (`NegotiatorConfig`).
// - `error.rs`:      Error enums.
//
// The TCP binding of `Transport` lives in `dangeros_broker`, which also runs
// the rendezvous service it talks to.

pub mod chat;
pub mod config;
pub mod error;
pub mod negotiator;
pub mod node;
pub mod resolver;
pub mod store;
pub mod transport;
pub mod wiki;

pub use config::NegotiatorConfig;
pub use error::{NodeError, SessionError, TransportError};
pub use negotiator::{Negotiator, PeerConnection, Phase, Session};
pub use node::{NodeHandle, NodeSink, NodeView, spawn_node};
pub use store::{Broadcaster, ChangeKind, Mutation, Origin, StateStore, StoreChange};
pub use transport::local::{LocalNetwork, LocalTransport};
pub use transport::{ConnectionId, EventSink, HandleId, Transport, TransportEvent};
