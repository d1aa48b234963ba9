// Units on the board and partial updates to them.
//
// A `Unit` is either a character (with stats, team, ability) or a wall.
// Anyone in the room can create, edit, or delete a unit. Edits travel as
// `UnitPatch`es: only the fields that changed are set, and `apply` merges
// them into the existing unit field by field. Two patches to different fields
// of the same unit commute; two patches to the same field resolve to whichever
// one a replica applied last.

use serde::{Deserialize, Serialize};

use crate::types::{EntityId, Gender, GridPos, Placement, Team, UnitKind};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Unit {
    pub id: EntityId,
    pub room_id: String,
    pub kind: UnitKind,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gender: Option<Gender>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub team: Option<Team>,
    pub atk: i32,
    pub def: i32,
    pub hp: i32,
    pub max_hp: i32,
    pub mp: i32,
    pub max_mp: i32,
    pub fs_value: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ability_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub activation_rate: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub success_rate: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remarks: Option<String>,
    /// `None` while the unit sits in the unplaced tray.
    pub position: Option<GridPos>,
    pub is_dead: bool,
    pub is_leader: bool,
    pub is_secret: bool,
    pub is_ability_rest: bool,
}

impl Unit {
    /// A fresh, unplaced character with zeroed stats.
    pub fn character(id: EntityId, room_id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id,
            room_id: room_id.into(),
            kind: UnitKind::Character,
            name: name.into(),
            gender: None,
            team: None,
            atk: 0,
            def: 0,
            hp: 0,
            max_hp: 0,
            mp: 0,
            max_mp: 0,
            fs_value: 0,
            ability_name: None,
            activation_rate: None,
            success_rate: None,
            remarks: None,
            position: None,
            is_dead: false,
            is_leader: false,
            is_secret: false,
            is_ability_rest: false,
        }
    }

    /// A wall segment placed at `pos`.
    pub fn wall(id: EntityId, room_id: impl Into<String>, pos: GridPos) -> Self {
        Self {
            kind: UnitKind::Wall,
            position: Some(pos),
            ..Unit::character(id, room_id, "壁")
        }
    }

    /// Dead either by flag or by running out of HP.
    pub fn is_down(&self) -> bool {
        self.is_dead || self.hp <= 0
    }
}

/// Field-level edit of one unit. Unset fields are left alone.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UnitPatch {
    pub id: EntityId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gender: Option<Gender>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub team: Option<Team>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub atk: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub def: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hp: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_hp: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mp: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_mp: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fs_value: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ability_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub activation_rate: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub success_rate: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remarks: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub placement: Option<Placement>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_dead: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_leader: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_secret: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_ability_rest: Option<bool>,
}

impl UnitPatch {
    /// An empty patch for `id`.
    pub fn new(id: EntityId) -> Self {
        Self {
            id,
            ..Self::default()
        }
    }

    /// Patch that only moves the unit.
    pub fn moved(id: EntityId, placement: Placement) -> Self {
        Self {
            placement: Some(placement),
            ..Self::new(id)
        }
    }

    /// Merge the set fields into `unit`. The id is never rewritten.
    pub fn apply(&self, unit: &mut Unit) {
        fn set<T: Clone>(slot: &mut T, value: &Option<T>) {
            if let Some(v) = value {
                *slot = v.clone();
            }
        }
        fn set_opt<T: Clone>(slot: &mut Option<T>, value: &Option<T>) {
            if value.is_some() {
                slot.clone_from(value);
            }
        }

        set(&mut unit.name, &self.name);
        set_opt(&mut unit.gender, &self.gender);
        set_opt(&mut unit.team, &self.team);
        set(&mut unit.atk, &self.atk);
        set(&mut unit.def, &self.def);
        set(&mut unit.hp, &self.hp);
        set(&mut unit.max_hp, &self.max_hp);
        set(&mut unit.mp, &self.mp);
        set(&mut unit.max_mp, &self.max_mp);
        set(&mut unit.fs_value, &self.fs_value);
        set_opt(&mut unit.ability_name, &self.ability_name);
        set_opt(&mut unit.activation_rate, &self.activation_rate);
        set_opt(&mut unit.success_rate, &self.success_rate);
        set_opt(&mut unit.remarks, &self.remarks);
        if let Some(placement) = self.placement {
            unit.position = placement.position();
        }
        set(&mut unit.is_dead, &self.is_dead);
        set(&mut unit.is_leader, &self.is_leader);
        set(&mut unit.is_secret, &self.is_secret);
        set(&mut unit.is_ability_rest, &self.is_ability_rest);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Unit {
        Unit {
            atk: 6,
            def: 14,
            hp: 7,
            max_hp: 7,
            team: Some(Team::Banchou),
            ..Unit::character(EntityId::new("u1"), "room-a", "Alice")
        }
    }

    #[test]
    fn patch_only_touches_set_fields() {
        let mut unit = sample();
        let patch = UnitPatch {
            hp: Some(3),
            is_ability_rest: Some(true),
            ..UnitPatch::new(EntityId::new("u1"))
        };
        patch.apply(&mut unit);

        assert_eq!(unit.hp, 3);
        assert!(unit.is_ability_rest);
        assert_eq!(unit.atk, 6);
        assert_eq!(unit.team, Some(Team::Banchou));
        assert_eq!(unit.name, "Alice");
    }

    #[test]
    fn placement_moves_and_unplaces() {
        let mut unit = sample();
        let pos = GridPos::new(2, 3).unwrap();
        UnitPatch::moved(unit.id.clone(), Placement::At(pos)).apply(&mut unit);
        assert_eq!(unit.position, Some(pos));

        UnitPatch::new(unit.id.clone()).apply(&mut unit);
        assert_eq!(unit.position, Some(pos), "empty patch keeps the position");

        UnitPatch::moved(unit.id.clone(), Placement::Unplaced).apply(&mut unit);
        assert_eq!(unit.position, None);
    }

    #[test]
    fn patch_omits_unset_fields_on_the_wire() {
        let patch = UnitPatch {
            def: Some(2),
            ..UnitPatch::new(EntityId::new("x"))
        };
        let json = serde_json::to_string(&patch).unwrap();
        assert_eq!(json, r#"{"id":"x","def":2}"#);

        let back: UnitPatch = serde_json::from_str(&json).unwrap();
        assert_eq!(back, patch);
    }

    #[test]
    fn zero_hp_counts_as_down() {
        let mut unit = sample();
        assert!(!unit.is_down());
        unit.hp = 0;
        assert!(unit.is_down());
    }
}
