// Session negotiation: who is the relay of a room, and what everybody does
// when that changes.
//
// `Negotiator` is a sans-IO state machine. It owns a `Transport` and the
// `StateStore`, and is driven entirely by method calls: `join`/`leave`/
// `submit` from the UI, `handle_event` for transport completions, and
// `poll_timers` once `next_deadline` has passed. Every call carries `now`, so
// tests can step time explicitly; the threaded driver lives in `node.rs`.
//
// Phases:
//
//   Idle ──join──▶ Probing ──relay answers──▶ Client
//                    │                          │ relay lost
//                    │ join timeout             ▼
//                    ▼                       Migrating ──probe answers──▶ Client
//               RelayPending ◀──backoff elapsed──┘
//                    │ claim granted        claim refused
//                    ▼                      (retry as client after a delay)
//                  Relay                        ──▶ Probing
//
// There is no consensus here. The only arbiter is the transport's rule that
// an address has one owner: whoever's claim of the relay address is granted
// is the relay. Everything else is timing. A joiner waits `join_timeout`
// for the relay before claiming; after a relay loss, each client waits
// `index_in_roster * migration_step` before claiming and meanwhile keeps
// dialing the relay address, so the first-listed survivor takes over and the
// rest simply reconnect to it. A refused claim always means "someone else
// won", and the loser goes back to being a client.
//
// Rebroadcast: the relay applies every mutation it receives and forwards the
// identical message to every other open peer. Clients never forward; their
// only connection is the relay. On `USER_JOIN` the relay updates the roster
// and immediately pushes `USERS_UPDATE` to all peers, the joiner included.

use std::collections::BTreeMap;
use std::sync::mpsc::{self, Receiver, Sender};
use std::time::Instant;

use chrono::Utc;
use dangeros_prng::BoardRng;
use dangeros_protocol::{ChatMessage, PeerAddress, SYSTEM_HANDLE, SyncMessage, codec};
use tracing::{debug, info, warn};

use crate::config::NegotiatorConfig;
use crate::error::{SessionError, TransportError};
use crate::resolver::{resolve, room_id};
use crate::store::{Broadcaster, Mutation, Origin, StateStore, StoreChange};
use crate::transport::{ConnectionId, HandleId, Transport, TransportEvent};

/// Per-process session record, readable by the UI.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Session {
    pub display_name: String,
    pub room_id: Option<String>,
    pub room_name: Option<String>,
    pub is_relay: bool,
    pub is_connected: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Phase {
    Idle,
    /// Dialing the relay address, or waiting to retry.
    Probing,
    /// Connected to the relay.
    Client,
    /// Claiming the relay address.
    RelayPending,
    Relay,
    /// Lost the relay; waiting out the backoff.
    Migrating,
}

/// A client connection held by the relay.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PeerConnection {
    pub conn: ConnectionId,
    pub remote: PeerAddress,
    /// Known once the peer's `USER_JOIN` arrives.
    pub display_name: Option<String>,
    pub open: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum HandleRole {
    /// Ephemeral address, used to dial the relay.
    Probe,
    /// The relay address itself.
    Claim,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum ClaimCause {
    JoinTimeout,
    Migration,
}

struct OwnedHandle {
    id: HandleId,
    role: HandleRole,
}

/// Our connection to the relay (client side).
#[derive(Clone, Copy, Debug)]
struct Upstream {
    conn: ConnectionId,
    open: bool,
}

#[derive(Default)]
struct Timers {
    /// The current handle has not reported `Opened` yet.
    open: Option<Instant>,
    join: Option<Instant>,
    retry: Option<Instant>,
    probe: Option<Instant>,
    migrate: Option<Instant>,
}

impl Timers {
    fn next(&self) -> Option<Instant> {
        [self.open, self.join, self.retry, self.probe, self.migrate]
            .into_iter()
            .flatten()
            .min()
    }
}

fn take_due(slot: &mut Option<Instant>, now: Instant) -> bool {
    if slot.is_some_and(|at| at <= now) {
        *slot = None;
        true
    } else {
        false
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Route {
    Relay,
    Peers,
    Nowhere,
}

struct Outgoing {
    route: Route,
    message: SyncMessage,
}

/// The store's broadcaster. Each role change installs a new one with the
/// route for that role; anything already queued keeps the route it was
/// published under.
struct Outbox {
    route: Route,
    tx: Sender<Outgoing>,
}

impl Broadcaster for Outbox {
    fn publish(&self, message: SyncMessage) {
        let _ = self.tx.send(Outgoing {
            route: self.route,
            message,
        });
    }
}

pub struct Negotiator<T: Transport> {
    config: NegotiatorConfig,
    transport: T,
    session: Session,
    phase: Phase,
    relay_address: Option<PeerAddress>,
    handle: Option<OwnedHandle>,
    upstream: Option<Upstream>,
    peers: BTreeMap<ConnectionId, PeerConnection>,
    timers: Timers,
    claim_cause: ClaimCause,
    store: StateStore,
    outbox_tx: Sender<Outgoing>,
    outbox_rx: Receiver<Outgoing>,
    rng: BoardRng,
}

impl<T: Transport> Negotiator<T> {
    pub fn new(config: NegotiatorConfig, transport: T) -> Self {
        Self::with_rng(config, transport, BoardRng::from_clock())
    }

    pub fn with_rng(config: NegotiatorConfig, transport: T, rng: BoardRng) -> Self {
        let (outbox_tx, outbox_rx) = mpsc::channel();
        let mut negotiator = Self {
            config,
            transport,
            session: Session::default(),
            phase: Phase::Idle,
            relay_address: None,
            handle: None,
            upstream: None,
            peers: BTreeMap::new(),
            timers: Timers::default(),
            claim_cause: ClaimCause::JoinTimeout,
            store: StateStore::default(),
            outbox_tx,
            outbox_rx,
            rng,
        };
        negotiator.set_route(Route::Nowhere);
        negotiator
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn store(&self) -> &StateStore {
        &self.store
    }

    pub fn subscribe(&mut self) -> Receiver<StoreChange> {
        self.store.subscribe()
    }

    pub fn config(&self) -> &NegotiatorConfig {
        &self.config
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    /// The relay address of the joined room.
    pub fn relay_address(&self) -> Option<&PeerAddress> {
        self.relay_address.as_ref()
    }

    /// Client connections (relay only).
    pub fn peers(&self) -> impl Iterator<Item = &PeerConnection> {
        self.peers.values()
    }

    /// The open connection to the relay (client only).
    pub fn upstream(&self) -> Option<ConnectionId> {
        self.upstream.filter(|u| u.open).map(|u| u.conn)
    }

    /// When `poll_timers` next has work to do.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.timers.next()
    }

    /// Start participating in `room_name` as `display_name`.
    pub fn join(
        &mut self,
        display_name: &str,
        room_name: &str,
        now: Instant,
    ) -> Result<(), SessionError> {
        if self.phase != Phase::Idle || self.handle.is_some() {
            return Err(SessionError::AlreadyJoined(
                self.session.room_name.clone().unwrap_or_default(),
            ));
        }
        let display_name = display_name.trim();
        let room_name = room_name.trim();
        let address = resolve(room_name)?;
        if display_name.is_empty() {
            return Err(SessionError::EmptyDisplayName);
        }

        info!(room = room_name, name = display_name, "joining room");
        self.session = Session {
            display_name: display_name.to_owned(),
            room_id: Some(room_id(room_name)),
            room_name: Some(room_name.to_owned()),
            is_relay: false,
            is_connected: false,
        };
        self.relay_address = Some(address);
        self.store.add_user(display_name);
        self.start_probe(now);
        Ok(())
    }

    /// Leave the room: drop the handle and every connection, forget the
    /// session and the board.
    pub fn leave(&mut self) {
        if self.phase == Phase::Idle && self.handle.is_none() {
            return;
        }
        info!(room = ?self.session.room_name, "leaving room");
        self.clear_timers();
        self.drop_handle();
        self.session = Session::default();
        self.relay_address = None;
        self.set_phase(Phase::Idle);
        self.set_route(Route::Nowhere);
        self.store.clear();
        while self.outbox_rx.try_recv().is_ok() {}
    }

    /// Apply a local edit and send it wherever our role sends things.
    pub fn submit(&mut self, mutation: Mutation) {
        self.store.apply(mutation, Origin::Local);
        self.flush_outbox();
    }

    /// Mint a fresh id for a unit or chat line.
    pub fn mint_id(&mut self) -> String {
        self.rng.unit_id()
    }

    pub fn rng_mut(&mut self) -> &mut BoardRng {
        &mut self.rng
    }

    pub fn handle_event(&mut self, event: TransportEvent, now: Instant) {
        match event {
            TransportEvent::Opened { handle, address } => self.on_opened(handle, &address, now),
            TransportEvent::OpenFailed { handle, error } => {
                self.on_open_failed(handle, &error, now);
            }
            TransportEvent::Incoming {
                handle,
                conn,
                remote,
            } => self.on_incoming(handle, conn, remote),
            TransportEvent::ConnectionOpened { conn } => self.on_connection_opened(conn),
            TransportEvent::Data { conn, payload } => self.on_data(conn, &payload),
            TransportEvent::ConnectionClosed { conn } => self.on_connection_lost(conn, None, now),
            TransportEvent::ConnectionError { conn, error } => {
                self.on_connection_lost(conn, Some(&error), now);
            }
        }
        self.flush_outbox();
    }

    /// Fire every timer that is due at `now`.
    pub fn poll_timers(&mut self, now: Instant) {
        if take_due(&mut self.timers.open, now) {
            warn!(
                phase = ?self.phase,
                timeout_ms = self.config.open_timeout_ms,
                "transport never answered the open; retrying"
            );
            self.retry_later(now);
        }
        if take_due(&mut self.timers.join, now) {
            self.on_join_timeout(now);
        }
        if take_due(&mut self.timers.retry, now) {
            debug!("retrying as client");
            self.start_probe(now);
        }
        if take_due(&mut self.timers.probe, now) {
            self.migration_probe(now);
        }
        if take_due(&mut self.timers.migrate, now) && self.phase == Phase::Migrating {
            info!("migration backoff elapsed; claiming relay address");
            self.claim(ClaimCause::Migration, now);
        }
        self.flush_outbox();
    }

    // --- transitions ---

    fn start_probe(&mut self, now: Instant) {
        self.clear_timers();
        self.drop_handle();
        let id = self.transport.open(None);
        self.timers.open = Some(now + self.config.open_timeout());
        self.handle = Some(OwnedHandle {
            id,
            role: HandleRole::Probe,
        });
        self.session.is_connected = false;
        self.session.is_relay = false;
        self.set_phase(Phase::Probing);
        self.set_route(Route::Nowhere);
    }

    fn claim(&mut self, cause: ClaimCause, now: Instant) {
        let Some(address) = self.relay_address.clone() else {
            return;
        };
        self.clear_timers();
        self.drop_handle();
        let id = self.transport.open(Some(&address));
        self.timers.open = Some(now + self.config.open_timeout());
        self.handle = Some(OwnedHandle {
            id,
            role: HandleRole::Claim,
        });
        self.claim_cause = cause;
        self.session.is_connected = false;
        self.set_phase(Phase::RelayPending);
        self.set_route(Route::Nowhere);
    }

    fn become_client(&mut self) {
        self.clear_timers();
        self.set_phase(Phase::Client);
        self.session.is_connected = true;
        self.session.is_relay = false;
        self.set_route(Route::Relay);
        info!(name = %self.session.display_name, "connected to relay");

        if let Some(conn) = self.upstream() {
            let hello = SyncMessage::UserJoin {
                display_name: self.session.display_name.clone(),
            };
            self.send_to(conn, &hello);
        }
    }

    fn become_relay(&mut self) {
        self.set_phase(Phase::Relay);
        self.session.is_connected = true;
        self.session.is_relay = true;
        self.set_route(Route::Peers);
        info!(
            name = %self.session.display_name,
            address = ?self.relay_address,
            "now the relay"
        );

        // Nobody is connected to a freshly claimed address, so the roster
        // starts over from us; peers re-announce themselves on connect.
        let me = self.session.display_name.clone();
        if self.store.state().users != [me.clone()] {
            self.store.set_users(vec![me.clone()], Origin::Local);
        }

        if self.claim_cause == ClaimCause::Migration {
            let notice = ChatMessage {
                id: format!("system-{}", self.rng.unit_id()),
                room_id: self.session.room_id.clone().unwrap_or_default(),
                handle_name: SYSTEM_HANDLE.to_owned(),
                content: format!("{me} is now the host."),
                is_system: true,
                created_at: Utc::now(),
            };
            self.store.append_message(notice, Origin::Local);
        }
    }

    fn start_migration(&mut self, now: Instant) {
        self.clear_timers();
        self.session.is_connected = false;
        self.set_phase(Phase::Migrating);
        self.set_route(Route::Nowhere);

        let position = self
            .store
            .state()
            .users
            .iter()
            .position(|u| *u == self.session.display_name);
        let wait = self.config.migration_wait(position);
        warn!(
            ?position,
            wait_ms = wait.as_millis() as u64,
            "lost the relay; migrating"
        );

        if wait.is_zero() {
            self.claim(ClaimCause::Migration, now);
            return;
        }
        self.timers.migrate = Some(now + wait);
        self.migration_probe(now);
    }

    /// Dial the relay address to find out whether somebody already took over.
    fn migration_probe(&mut self, now: Instant) {
        if self.phase != Phase::Migrating || self.upstream.is_some() {
            return;
        }
        if !self.dial_relay() {
            self.schedule_probe(now);
        }
    }

    fn schedule_probe(&mut self, now: Instant) {
        let at = now + self.config.migration_probe_interval();
        // Never probe past the point where we claim anyway.
        if self.timers.migrate.is_none_or(|deadline| at < deadline) {
            self.timers.probe = Some(at);
        }
    }

    fn on_join_timeout(&mut self, now: Instant) {
        if self.phase == Phase::Probing && self.upstream().is_none() {
            info!(
                timeout_ms = self.config.join_timeout_ms,
                "no relay answered; claiming the relay address"
            );
            self.claim(ClaimCause::JoinTimeout, now);
        }
    }

    // --- transport events ---

    fn on_opened(&mut self, handle: HandleId, address: &PeerAddress, now: Instant) {
        let Some(role) = self.current_handle_role(handle) else {
            debug!(?handle, "open event for a discarded handle");
            return;
        };
        self.timers.open = None;
        match role {
            HandleRole::Probe => {
                debug!(%address, "probe handle open");
                if self.phase == Phase::Probing {
                    self.dial_relay();
                    self.timers.join = Some(now + self.config.join_timeout());
                }
            }
            HandleRole::Claim => self.become_relay(),
        }
    }

    fn on_open_failed(&mut self, handle: HandleId, error: &TransportError, now: Instant) {
        let Some(role) = self.current_handle_role(handle) else {
            debug!(?handle, "open failure for a discarded handle");
            return;
        };
        match role {
            HandleRole::Claim => {
                info!(%error, "relay address claimed by someone else; retrying as client");
            }
            HandleRole::Probe => warn!(%error, "could not open transport handle; retrying"),
        }
        self.retry_later(now);
    }

    /// Give up on the current handle and dial again as a client after
    /// `claim_retry_delay`.
    fn retry_later(&mut self, now: Instant) {
        self.clear_timers();
        self.drop_handle();
        self.session.is_connected = false;
        self.session.is_relay = false;
        self.set_phase(Phase::Probing);
        self.set_route(Route::Nowhere);
        self.timers.retry = Some(now + self.config.claim_retry_delay());
    }

    fn on_incoming(&mut self, handle: HandleId, conn: ConnectionId, remote: PeerAddress) {
        if self.phase != Phase::Relay || self.current_handle_role(handle) != Some(HandleRole::Claim)
        {
            debug!(?conn, %remote, "ignoring incoming connection outside relay role");
            return;
        }
        info!(?conn, %remote, "peer connecting");
        self.peers.insert(
            conn,
            PeerConnection {
                conn,
                remote,
                display_name: None,
                open: false,
            },
        );
    }

    fn on_connection_opened(&mut self, conn: ConnectionId) {
        if let Some(up) = self.upstream.as_mut().filter(|u| u.conn == conn) {
            up.open = true;
            if matches!(self.phase, Phase::Probing | Phase::Migrating) {
                self.become_client();
            }
            return;
        }
        if let Some(peer) = self.peers.get_mut(&conn) {
            peer.open = true;
            let snapshot = SyncMessage::StateSync(self.store.snapshot());
            self.send_to(conn, &snapshot);
            return;
        }
        debug!(?conn, "open event for an unknown connection");
    }

    fn on_data(&mut self, conn: ConnectionId, payload: &[u8]) {
        let message = match codec::decode(payload) {
            Ok(message) => message,
            Err(error) => {
                warn!(?conn, %error, "dropping malformed message");
                return;
            }
        };

        if self.upstream().is_some_and(|up| up == conn) {
            debug!(kind = message.kind(), "from relay");
            self.store.apply_remote(message);
        } else if self.phase == Phase::Relay && self.peers.contains_key(&conn) {
            self.relay_receive(conn, message);
        } else {
            debug!(?conn, kind = message.kind(), "data on an unknown connection");
        }
    }

    fn relay_receive(&mut self, from: ConnectionId, message: SyncMessage) {
        match message {
            SyncMessage::UserJoin { display_name } => {
                info!(?from, name = %display_name, "participant joined");
                if let Some(peer) = self.peers.get_mut(&from) {
                    peer.display_name = Some(display_name.clone());
                }
                self.store.add_user(&display_name);
                let roster = SyncMessage::UsersUpdate {
                    users: self.store.state().users.clone(),
                };
                self.fan_out(None, &roster);
            }
            message if message.is_relay_only() => {
                warn!(?from, kind = message.kind(), "client sent a relay-only message");
            }
            message => {
                debug!(?from, kind = message.kind(), "forwarding");
                self.store.apply_remote(message.clone());
                self.fan_out(Some(from), &message);
            }
        }
    }

    fn on_connection_lost(
        &mut self,
        conn: ConnectionId,
        error: Option<&TransportError>,
        now: Instant,
    ) {
        if let Some(up) = self.upstream.filter(|u| u.conn == conn) {
            self.upstream = None;
            match self.phase {
                Phase::Client if up.open => self.start_migration(now),
                Phase::Migrating => {
                    debug!(?error, "relay address not answering yet");
                    self.schedule_probe(now);
                }
                _ => debug!(?error, "relay dial failed; waiting for the join timeout"),
            }
            return;
        }

        let Some(peer) = self.peers.remove(&conn) else {
            debug!(?conn, "close event for an unknown connection");
            return;
        };
        info!(?conn, name = ?peer.display_name, ?error, "peer left");
        if self.phase != Phase::Relay {
            return;
        }
        let Some(name) = peer.display_name else {
            return;
        };
        let still_here = name == self.session.display_name
            || self
                .peers
                .values()
                .any(|p| p.display_name.as_deref() == Some(name.as_str()));
        if !still_here {
            let users: Vec<String> = self
                .store
                .state()
                .users
                .iter()
                .filter(|u| **u != name)
                .cloned()
                .collect();
            self.store.set_users(users, Origin::Local);
        }
    }

    // --- plumbing ---

    fn current_handle_role(&self, handle: HandleId) -> Option<HandleRole> {
        self.handle
            .as_ref()
            .filter(|h| h.id == handle)
            .map(|h| h.role)
    }

    /// Dial the relay address from the current handle.
    fn dial_relay(&mut self) -> bool {
        let (Some(handle), Some(address)) =
            (self.handle.as_ref().map(|h| h.id), self.relay_address.clone())
        else {
            return false;
        };
        match self.transport.connect(handle, &address) {
            Ok(conn) => {
                debug!(?conn, %address, "dialing relay");
                self.upstream = Some(Upstream { conn, open: false });
                true
            }
            Err(error) => {
                warn!(%error, "could not dial the relay address");
                false
            }
        }
    }

    fn drop_handle(&mut self) {
        if let Some(handle) = self.handle.take() {
            self.transport.destroy(handle.id);
        }
        self.upstream = None;
        self.peers.clear();
    }

    fn clear_timers(&mut self) {
        self.timers = Timers::default();
    }

    fn set_phase(&mut self, phase: Phase) {
        if self.phase != phase {
            debug!(from = ?self.phase, to = ?phase, "phase change");
            self.phase = phase;
        }
    }

    fn set_route(&mut self, route: Route) {
        self.store.set_broadcaster(Box::new(Outbox {
            route,
            tx: self.outbox_tx.clone(),
        }));
    }

    fn flush_outbox(&mut self) {
        while let Ok(Outgoing { route, message }) = self.outbox_rx.try_recv() {
            match route {
                Route::Relay => match self.upstream() {
                    Some(conn) => self.send_to(conn, &message),
                    None => debug!(kind = message.kind(), "relay unreachable; kept local"),
                },
                Route::Peers => self.fan_out(None, &message),
                Route::Nowhere => debug!(kind = message.kind(), "offline; kept local"),
            }
        }
    }

    fn send_to(&mut self, conn: ConnectionId, message: &SyncMessage) {
        let bytes = match codec::encode(message) {
            Ok(bytes) => bytes,
            Err(error) => {
                warn!(%error, "could not encode message");
                return;
            }
        };
        if let Err(error) = self.transport.send(conn, &bytes) {
            warn!(?conn, %error, kind = message.kind(), "send failed");
        }
    }

    /// Send to every open peer except `except`.
    fn fan_out(&mut self, except: Option<ConnectionId>, message: &SyncMessage) {
        let bytes = match codec::encode(message) {
            Ok(bytes) => bytes,
            Err(error) => {
                warn!(%error, "could not encode message");
                return;
            }
        };
        let targets: Vec<ConnectionId> = self
            .peers
            .values()
            .filter(|p| p.open && Some(p.conn) != except)
            .map(|p| p.conn)
            .collect();
        for conn in targets {
            if let Err(error) = self.transport.send(conn, &bytes) {
                warn!(?conn, %error, kind = message.kind(), "fan-out send failed");
            }
        }
    }
}

impl<T: Transport> Drop for Negotiator<T> {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            self.transport.destroy(handle.id);
        }
    }
}
