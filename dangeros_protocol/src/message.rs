// Sync messages exchanged between participants of a room.
//
// `SyncMessage` is the closed vocabulary that flows over every connection,
// in both directions:
// - Mutations (`UnitAdd`, `UnitUpdate`, `UnitDelete`, `MessageAdd`,
//   `DpUpdate`) originate at any participant, go to the relay, and the relay
//   forwards them to everyone else.
// - `UserJoin` goes from a freshly connected client to the relay only.
// - `StateSync` and `UsersUpdate` are relay-originated: the snapshot goes to
//   one newly opened connection, the roster to everybody.
//
// On the wire each message is a JSON object tagged with
// `"type": "UNIT_ADD"` etc. (see `codec.rs`). `BoardState` is also the
// payload of `StateSync`, flattened into the same object.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{EntityId, Team};
use crate::unit::{Unit, UnitPatch};

/// Name shown on relay-generated chat notices.
pub const SYSTEM_HANDLE: &str = "SYSTEM";

/// One chat line. Immutable once created.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub id: String,
    pub room_id: String,
    pub handle_name: String,
    pub content: String,
    pub is_system: bool,
    pub created_at: DateTime<Utc>,
}

/// The replicated state of one room.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BoardState {
    pub units: Vec<Unit>,
    pub messages: Vec<ChatMessage>,
    /// DP per team.
    pub counters: BTreeMap<Team, i64>,
    /// Display names of connected participants, in join order.
    pub users: Vec<String>,
}

impl Default for BoardState {
    fn default() -> Self {
        Self {
            units: Vec::new(),
            messages: Vec::new(),
            counters: Team::ALL.into_iter().map(|t| (t, 0)).collect(),
            users: Vec::new(),
        }
    }
}

impl BoardState {
    pub fn unit(&self, id: &EntityId) -> Option<&Unit> {
        self.units.iter().find(|u| &u.id == id)
    }

    pub fn counter(&self, team: Team) -> i64 {
        self.counters.get(&team).copied().unwrap_or(0)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SyncMessage {
    /// A client introduces itself to the relay.
    UserJoin { display_name: String },
    /// Full snapshot for a newly connected client.
    StateSync(BoardState),
    UnitAdd { unit: Unit },
    UnitUpdate { patch: UnitPatch },
    UnitDelete { id: EntityId },
    MessageAdd { message: ChatMessage },
    /// Absolute DP value for a team.
    DpUpdate { team: Team, value: i64 },
    /// Authoritative roster from the relay.
    UsersUpdate { users: Vec<String> },
}

impl SyncMessage {
    /// Variant name as it appears in the `type` tag. Used for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            SyncMessage::UserJoin { .. } => "USER_JOIN",
            SyncMessage::StateSync(_) => "STATE_SYNC",
            SyncMessage::UnitAdd { .. } => "UNIT_ADD",
            SyncMessage::UnitUpdate { .. } => "UNIT_UPDATE",
            SyncMessage::UnitDelete { .. } => "UNIT_DELETE",
            SyncMessage::MessageAdd { .. } => "MESSAGE_ADD",
            SyncMessage::DpUpdate { .. } => "DP_UPDATE",
            SyncMessage::UsersUpdate { .. } => "USERS_UPDATE",
        }
    }

    /// Only the relay may send these. A relay drops them if a client does.
    pub fn is_relay_only(&self) -> bool {
        matches!(
            self,
            SyncMessage::StateSync(_) | SyncMessage::UsersUpdate { .. }
        )
    }
}
