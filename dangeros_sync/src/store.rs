// The replicated board state and its single mutation path.
//
// Every change, whether the local user made it or it arrived over the wire,
// goes through one of the `StateStore` operations below. Each operation
// applies the change right away (optimistic apply, no round trip to the
// relay) and then, only for `Origin::Local`, hands the equivalent
// `SyncMessage` to the injected `Broadcaster`. Messages decoded from the wire
// are applied with `Origin::Remote` and therefore can never be published
// again, which is what keeps relays and clients from echoing each other.
//
// The broadcaster is swapped by the negotiator whenever its role changes
// (client → the relay connection, relay → every peer, offline → nowhere).
//
// Consistency: last write wins, per field, in delivery order at each replica.
// Two replicas may disagree for a while after concurrent edits of the same
// field; the next `STATE_SYNC` a replica receives settles it.

use std::sync::mpsc::{self, Receiver, Sender};

use dangeros_protocol::{BoardState, ChatMessage, EntityId, SyncMessage, Team, Unit, UnitPatch};

/// Who caused a change.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Origin {
    /// The local user; the change is published.
    Local,
    /// Decoded from a connection; applied only.
    Remote,
}

/// Where locally originated changes go.
pub trait Broadcaster: Send {
    fn publish(&self, message: SyncMessage);
}

/// Drops everything. Used while no session exists.
pub struct Discard;

impl Broadcaster for Discard {
    fn publish(&self, _message: SyncMessage) {}
}

/// What part of the state changed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChangeKind {
    Units,
    Messages,
    Counters,
    Users,
    /// The whole replica was overwritten or cleared.
    Replaced,
}

/// Sent to subscribers after every applied change.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StoreChange {
    pub revision: u64,
    pub kind: ChangeKind,
}

/// A local edit requested by the UI.
#[derive(Clone, Debug, PartialEq)]
pub enum Mutation {
    AddUnit(Unit),
    UpdateUnit(UnitPatch),
    RemoveUnit(EntityId),
    AppendMessage(ChatMessage),
    SetCounter { team: Team, value: i64 },
}

pub struct StateStore {
    state: BoardState,
    broadcaster: Box<dyn Broadcaster>,
    subscribers: Vec<Sender<StoreChange>>,
    revision: u64,
}

impl Default for StateStore {
    fn default() -> Self {
        Self::new(Box::new(Discard))
    }
}

impl StateStore {
    pub fn new(broadcaster: Box<dyn Broadcaster>) -> Self {
        Self {
            state: BoardState::default(),
            broadcaster,
            subscribers: Vec::new(),
            revision: 0,
        }
    }

    pub fn state(&self) -> &BoardState {
        &self.state
    }

    pub fn snapshot(&self) -> BoardState {
        self.state.clone()
    }

    /// Incremented on every applied change.
    pub fn revision(&self) -> u64 {
        self.revision
    }

    pub fn set_broadcaster(&mut self, broadcaster: Box<dyn Broadcaster>) {
        self.broadcaster = broadcaster;
    }

    /// Get notified after each change. Dropping the receiver unsubscribes.
    pub fn subscribe(&mut self) -> Receiver<StoreChange> {
        let (tx, rx) = mpsc::channel();
        self.subscribers.push(tx);
        rx
    }

    /// Append `unit` unless a unit with the same id exists.
    pub fn add_unit(&mut self, unit: Unit, origin: Origin) {
        if self.state.unit(&unit.id).is_none() {
            self.state.units.push(unit.clone());
            self.notify(ChangeKind::Units);
        }
        self.publish(origin, || SyncMessage::UnitAdd { unit });
    }

    /// Merge `patch` into the unit with its id. No-op when absent.
    pub fn update_unit(&mut self, patch: UnitPatch, origin: Origin) {
        if let Some(unit) = self.state.units.iter_mut().find(|u| u.id == patch.id) {
            patch.apply(unit);
            self.notify(ChangeKind::Units);
        }
        self.publish(origin, || SyncMessage::UnitUpdate { patch });
    }

    pub fn remove_unit(&mut self, id: EntityId, origin: Origin) {
        let before = self.state.units.len();
        self.state.units.retain(|u| u.id != id);
        if self.state.units.len() != before {
            self.notify(ChangeKind::Units);
        }
        self.publish(origin, || SyncMessage::UnitDelete { id });
    }

    pub fn append_message(&mut self, message: ChatMessage, origin: Origin) {
        self.state.messages.push(message.clone());
        self.notify(ChangeKind::Messages);
        self.publish(origin, || SyncMessage::MessageAdd { message });
    }

    /// Set a team's DP to an absolute value.
    pub fn set_counter(&mut self, team: Team, value: i64, origin: Origin) {
        self.state.counters.insert(team, value);
        self.notify(ChangeKind::Counters);
        self.publish(origin, || SyncMessage::DpUpdate { team, value });
    }

    /// Add a name to the roster if it is not there yet. Never published:
    /// only the relay announces rosters, through `set_users`.
    pub fn add_user(&mut self, name: &str) -> bool {
        if self.state.users.iter().any(|u| u == name) {
            return false;
        }
        self.state.users.push(name.to_owned());
        self.notify(ChangeKind::Users);
        true
    }

    /// Replace the roster wholesale.
    pub fn set_users(&mut self, users: Vec<String>, origin: Origin) {
        self.state.users.clone_from(&users);
        self.notify(ChangeKind::Users);
        self.publish(origin, || SyncMessage::UsersUpdate { users });
    }

    /// Overwrite the whole replica with a relay snapshot.
    pub fn replace(&mut self, snapshot: BoardState) {
        self.state = snapshot;
        self.notify(ChangeKind::Replaced);
    }

    /// Drop everything, e.g. after leaving a room.
    pub fn clear(&mut self) {
        self.replace(BoardState::default());
    }

    /// Apply a local edit and publish it.
    pub fn apply(&mut self, mutation: Mutation, origin: Origin) {
        match mutation {
            Mutation::AddUnit(unit) => self.add_unit(unit, origin),
            Mutation::UpdateUnit(patch) => self.update_unit(patch, origin),
            Mutation::RemoveUnit(id) => self.remove_unit(id, origin),
            Mutation::AppendMessage(message) => self.append_message(message, origin),
            Mutation::SetCounter { team, value } => self.set_counter(team, value, origin),
        }
    }

    /// Apply a message decoded from a connection.
    pub fn apply_remote(&mut self, message: SyncMessage) {
        match message {
            SyncMessage::UserJoin { display_name } => {
                self.add_user(&display_name);
            }
            SyncMessage::StateSync(snapshot) => self.replace(snapshot),
            SyncMessage::UnitAdd { unit } => self.add_unit(unit, Origin::Remote),
            SyncMessage::UnitUpdate { patch } => self.update_unit(patch, Origin::Remote),
            SyncMessage::UnitDelete { id } => self.remove_unit(id, Origin::Remote),
            SyncMessage::MessageAdd { message } => self.append_message(message, Origin::Remote),
            SyncMessage::DpUpdate { team, value } => self.set_counter(team, value, Origin::Remote),
            SyncMessage::UsersUpdate { users } => self.set_users(users, Origin::Remote),
        }
    }

    fn publish(&self, origin: Origin, message: impl FnOnce() -> SyncMessage) {
        if origin == Origin::Local {
            self.broadcaster.publish(message());
        }
    }

    fn notify(&mut self, kind: ChangeKind) {
        self.revision += 1;
        let change = StoreChange {
            revision: self.revision,
            kind,
        };
        self.subscribers.retain(|tx| tx.send(change).is_ok());
    }
}
