// dangeros_broker — rendezvous service for shared-board participants.
//
// Participants of a room never talk to a server about the board itself; they
// only need somewhere to claim addresses and to open byte pipes to each
// other. This crate provides that as a small TCP broker, plus the
// `Transport` binding that lets a `dangeros_sync` negotiator run over it.
//
// Module overview:
// - `registry.rs`: Address ownership and links between sessions. The core
//                  data structure that `server.rs` drives.
// - `server.rs`:   TCP listener, reader threads (one per session), and the
//                  main event loop, funnelled through an `mpsc` channel into
//                  the single-threaded `Registry`.
// - `client.rs`:   `BrokerTransport`, the participant side: one TCP session
//                  per transport handle.
// - `error.rs`:    `BrokerError`.
//
// Binaries: `broker` (`main.rs`) runs the service; `board` (`bin/board.rs`)
// is a terminal participant.

pub mod client;
pub mod error;
pub mod registry;
pub mod server;

pub use client::BrokerTransport;
pub use error::BrokerError;
pub use server::{BrokerConfig, BrokerHandle, start_broker};
