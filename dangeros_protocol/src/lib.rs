// dangeros_protocol — what participants of a shared board say to each other.
//
// Shared by the sync core (`dangeros_sync`) and the rendezvous broker
// (`dangeros_broker`). No networking and no state machines live here, only
// data and its encoding.
//
// Module overview:
// - `types.rs`:    Ids, addresses, teams, genders, grid coordinates.
// - `unit.rs`:     `Unit` and field-level `UnitPatch` merging.
// - `message.rs`:  `SyncMessage` (the closed set of sync variants),
//                  `BoardState` (the replicated state / snapshot payload),
//                  `ChatMessage`.
// - `codec.rs`:    JSON encode/decode of `SyncMessage`, strict on decode.
// - `framing.rs`:  4-byte length-prefixed frames over `Read`/`Write`.
// - `broker.rs`:   Request/reply messages of the broker's TCP sessions.
//
// JSON everywhere: snapshots are small and human-readable payloads make a
// misbehaving room easy to debug.

pub mod broker;
pub mod codec;
pub mod framing;
pub mod message;
pub mod types;
pub mod unit;

pub use codec::{CodecError, decode, encode};
pub use framing::{FrameError, MAX_FRAME_SIZE, read_frame, write_frame};
pub use message::{BoardState, ChatMessage, SYSTEM_HANDLE, SyncMessage};
pub use types::{
    EntityId, GRID_COLUMNS, GRID_ROWS, Gender, GridPos, PeerAddress, Placement, Team, UnitKind,
};
pub use unit::{Unit, UnitPatch};
