// Replication properties of the state store.
//
// A replica that applies, in order, exactly the messages another replica
// published must end up with the board a plain model of the edits predicts,
// and with the same board as the author. That is all the relay does for
// its clients, so this is the core correctness argument for rebroadcast.
// The second half pins down the documented weak spot: concurrent edits of
// one field leave replicas disagreeing until the next full sync.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use dangeros_protocol::{
    BoardState, EntityId, GridPos, Placement, SyncMessage, Team, Unit, UnitPatch,
};
use dangeros_sync::{Broadcaster, Mutation, Origin, StateStore};
use proptest::prelude::*;

#[derive(Clone, Default)]
struct Wire(Arc<Mutex<Vec<SyncMessage>>>);

impl Broadcaster for Wire {
    fn publish(&self, message: SyncMessage) {
        self.0.lock().unwrap().push(message);
    }
}

impl Wire {
    fn take(&self) -> Vec<SyncMessage> {
        std::mem::take(&mut *self.0.lock().unwrap())
    }
}

#[derive(Clone, Debug)]
enum Op {
    Add(u8, String),
    SetHp(u8, i32),
    Move(u8, Option<(u8, u8)>),
    Delete(u8),
    Dp(usize, i64),
}

fn id(n: u8) -> EntityId {
    EntityId::new(format!("u{n}"))
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        (0u8..4, "[a-z]{1,6}").prop_map(|(n, name)| Op::Add(n, name)),
        (0u8..4, -5i32..20).prop_map(|(n, hp)| Op::SetHp(n, hp)),
        (0u8..4, proptest::option::of((0u8..7, 0u8..5))).prop_map(|(n, at)| Op::Move(n, at)),
        (0u8..4).prop_map(Op::Delete),
        (0usize..4, 0i64..10).prop_map(|(t, v)| Op::Dp(t, v)),
    ]
}

fn mutation(op: Op) -> Mutation {
    match op {
        Op::Add(n, name) => Mutation::AddUnit(Unit::character(id(n), "room-p", name)),
        Op::SetHp(n, hp) => Mutation::UpdateUnit(UnitPatch {
            hp: Some(hp),
            ..UnitPatch::new(id(n))
        }),
        Op::Move(n, at) => {
            let placement = match at.and_then(|(x, y)| GridPos::new(x, y)) {
                Some(pos) => Placement::At(pos),
                None => Placement::Unplaced,
            };
            Mutation::UpdateUnit(UnitPatch::moved(id(n), placement))
        }
        Op::Delete(n) => Mutation::RemoveUnit(id(n)),
        Op::Dp(t, value) => Mutation::SetCounter {
            team: Team::ALL[t],
            value,
        },
    }
}

/// What a board should hold after `ops`, computed without the store: an add
/// only lands on a free id, a patch only touches a live unit, a delete frees
/// the id, and the last DP write per team wins.
#[derive(Debug, Default)]
struct Model {
    units: BTreeMap<EntityId, (String, i32, Option<GridPos>)>,
    counters: BTreeMap<Team, i64>,
}

impl Model {
    fn new() -> Self {
        Self {
            units: BTreeMap::new(),
            counters: Team::ALL.into_iter().map(|t| (t, 0)).collect(),
        }
    }

    fn step(&mut self, op: &Op) {
        match op {
            Op::Add(n, name) => {
                self.units.entry(id(*n)).or_insert((name.clone(), 0, None));
            }
            Op::SetHp(n, hp) => {
                if let Some(unit) = self.units.get_mut(&id(*n)) {
                    unit.1 = *hp;
                }
            }
            Op::Move(n, at) => {
                if let Some(unit) = self.units.get_mut(&id(*n)) {
                    unit.2 = at.and_then(|(x, y)| GridPos::new(x, y));
                }
            }
            Op::Delete(n) => {
                self.units.remove(&id(*n));
            }
            Op::Dp(t, value) => {
                self.counters.insert(Team::ALL[*t], *value);
            }
        }
    }
}

fn board_units(state: &BoardState) -> BTreeMap<EntityId, (String, i32, Option<GridPos>)> {
    state
        .units
        .iter()
        .map(|u| (u.id.clone(), (u.name.clone(), u.hp, u.position)))
        .collect()
}

proptest! {
    #[test]
    fn replay_matches_an_independent_model(
        ops in proptest::collection::vec(op(), 0..40)
    ) {
        let wire = Wire::default();
        let mut author = StateStore::new(Box::new(wire.clone()));
        let mut replica = StateStore::default();
        let mut model = Model::new();

        for op in ops {
            model.step(&op);
            author.apply(mutation(op), Origin::Local);
        }
        for message in wire.take() {
            replica.apply_remote(message);
        }

        let state = replica.state();
        prop_assert_eq!(state.units.len(), model.units.len());
        prop_assert_eq!(board_units(state), model.units);
        prop_assert_eq!(&state.counters, &model.counters);
    }

    #[test]
    fn replaying_published_messages_reproduces_the_board(
        ops in proptest::collection::vec(op(), 0..40)
    ) {
        let wire = Wire::default();
        let mut author = StateStore::new(Box::new(wire.clone()));
        let mut replica = StateStore::default();

        for op in ops {
            author.apply(mutation(op), Origin::Local);
        }
        for message in wire.take() {
            replica.apply_remote(message);
        }

        prop_assert_eq!(replica.snapshot(), author.snapshot());
    }

    #[test]
    fn relayed_replay_is_also_silent(ops in proptest::collection::vec(op(), 0..20)) {
        let wire = Wire::default();
        let mut author = StateStore::new(Box::new(wire.clone()));
        for op in ops {
            author.apply(mutation(op), Origin::Local);
        }
        let published = wire.take();

        let echo = Wire::default();
        let mut replica = StateStore::new(Box::new(echo.clone()));
        for message in published {
            replica.apply_remote(message);
        }
        prop_assert!(echo.take().is_empty());
    }
}

#[test]
fn concurrent_edits_diverge_until_a_full_sync() {
    let base = {
        let mut state = BoardState::default();
        state.units.push(Unit::character(id(0), "room-p", "Kiri"));
        state
    };
    let mut left = StateStore::default();
    let mut right = StateStore::default();
    left.replace(base.clone());
    right.replace(base);

    let from_a = SyncMessage::UnitUpdate {
        patch: UnitPatch {
            atk: Some(3),
            ..UnitPatch::new(id(0))
        },
    };
    let from_b = SyncMessage::UnitUpdate {
        patch: UnitPatch {
            atk: Some(7),
            ..UnitPatch::new(id(0))
        },
    };

    // Same two messages, opposite delivery order.
    left.apply_remote(from_a.clone());
    left.apply_remote(from_b.clone());
    right.apply_remote(from_b);
    right.apply_remote(from_a);

    assert_eq!(left.state().unit(&id(0)).unwrap().atk, 7);
    assert_eq!(right.state().unit(&id(0)).unwrap().atk, 3);

    right.apply_remote(SyncMessage::StateSync(left.snapshot()));
    assert_eq!(right.snapshot(), left.snapshot());
}

#[test]
fn patches_to_different_fields_commute() {
    let mut left = StateStore::default();
    let mut right = StateStore::default();
    for store in [&mut left, &mut right] {
        store.add_unit(Unit::character(id(1), "room-p", "Rin"), Origin::Remote);
    }
    let hp = SyncMessage::UnitUpdate {
        patch: UnitPatch {
            hp: Some(4),
            ..UnitPatch::new(id(1))
        },
    };
    let moved = SyncMessage::UnitUpdate {
        patch: UnitPatch::moved(id(1), Placement::At(GridPos { x: 2, y: 3 })),
    };

    left.apply_remote(hp.clone());
    left.apply_remote(moved.clone());
    right.apply_remote(moved);
    right.apply_remote(hp);

    assert_eq!(left.snapshot(), right.snapshot());
}
