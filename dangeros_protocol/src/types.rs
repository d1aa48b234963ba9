// Core value types shared by every participant.
//
// Ids are plain string newtypes: unit and message ids are minted by whoever
// creates the object (see `dangeros_prng::BoardRng::unit_id`), and peer
// addresses are whatever the transport hands out. Teams and genders serialize
// as the labels the board has always used, which is also what the wiki text
// format prints (see `dangeros_sync::wiki`).

use std::fmt;

use serde::{Deserialize, Serialize};

/// Columns on the board (x in `0..GRID_COLUMNS`).
pub const GRID_COLUMNS: u8 = 7;

/// Rows on the board (y in `0..GRID_ROWS`).
pub const GRID_ROWS: u8 = 5;

/// Id of a unit on the board, unique within a room.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityId(pub String);

impl EntityId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A transport-level address. The relay of a room listens on a well-known
/// one; everybody else gets an ephemeral one.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerAddress(pub String);

impl PeerAddress {
    pub fn new(address: impl Into<String>) -> Self {
        Self(address.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Faction a character belongs to. Each team has its own DP counter.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Team {
    #[serde(rename = "生徒会")]
    StudentCouncil,
    #[serde(rename = "番長G")]
    Banchou,
    #[serde(rename = "転校生")]
    TransferStudent,
    #[serde(rename = "その他")]
    Other,
}

impl Team {
    /// Every team, in board order.
    pub const ALL: [Team; 4] = [
        Team::StudentCouncil,
        Team::Banchou,
        Team::TransferStudent,
        Team::Other,
    ];

    /// The label used on the wire and in exported text.
    pub fn label(self) -> &'static str {
        match self {
            Team::StudentCouncil => "生徒会",
            Team::Banchou => "番長G",
            Team::TransferStudent => "転校生",
            Team::Other => "その他",
        }
    }

    pub fn from_label(label: &str) -> Option<Team> {
        Team::ALL.into_iter().find(|t| t.label() == label)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Gender {
    #[serde(rename = "男")]
    Male,
    #[serde(rename = "女")]
    Female,
    #[serde(rename = "両")]
    Both,
    #[serde(rename = "無")]
    Neither,
}

impl Gender {
    pub fn label(self) -> &'static str {
        match self {
            Gender::Male => "男",
            Gender::Female => "女",
            Gender::Both => "両",
            Gender::Neither => "無",
        }
    }

    pub fn from_label(label: &str) -> Option<Gender> {
        [Gender::Male, Gender::Female, Gender::Both, Gender::Neither]
            .into_iter()
            .find(|g| g.label() == label)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnitKind {
    Character,
    Wall,
}

/// A cell on the board.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct GridPos {
    pub x: u8,
    pub y: u8,
}

impl GridPos {
    /// Returns `None` when the coordinate is off the board.
    pub fn new(x: u8, y: u8) -> Option<GridPos> {
        (x < GRID_COLUMNS && y < GRID_ROWS).then_some(GridPos { x, y })
    }
}

/// Where a patch moves a unit. `Unplaced` takes it off the board, which a
/// bare `Option<GridPos>` in a patch could not express.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Placement {
    Unplaced,
    At(GridPos),
}

impl Placement {
    pub fn position(self) -> Option<GridPos> {
        match self {
            Placement::Unplaced => None,
            Placement::At(pos) => Some(pos),
        }
    }
}
