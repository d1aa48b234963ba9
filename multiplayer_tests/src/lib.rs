// Test harnesses for multi-participant scenarios.
//
// Two harnesses, matching the two ways the sync layer runs:
//
// - `Cluster`: several `Negotiator`s over one in-process `LocalNetwork`,
//   driven by hand on a virtual clock. Nothing runs unless the test says so,
//   which makes races (two joiners timing out on the same tick, a relay
//   vanishing mid-conversation) reproducible. Time advances in `TICK` steps;
//   after each step every member's timers are polled and all queued
//   transport events are delivered until the network is quiet.
//
// - `TestNode`: a real threaded node (`spawn_node`) over a real
//   `BrokerTransport`, with synchronous polling wrappers for use against a
//   broker started in the test. Only the waiting loops are test-specific.
//
// See `tests/` for the scenarios.

use std::net::SocketAddr;
use std::sync::mpsc::{self, Receiver};
use std::thread;
use std::time::{Duration, Instant};

use chrono::Utc;
use dangeros_broker::BrokerTransport;
use dangeros_prng::BoardRng;
use dangeros_protocol::BoardState;
use dangeros_sync::chat::compose_message;
use dangeros_sync::{
    LocalNetwork, LocalTransport, Mutation, Negotiator, NegotiatorConfig, NodeHandle, NodeView,
    Phase, TransportEvent, spawn_node,
};

/// Virtual clock resolution of a `Cluster`.
pub const TICK: Duration = Duration::from_millis(10);

/// Default timeout for blocking waits on a `TestNode`.
const POLL_TIMEOUT: Duration = Duration::from_secs(10);

/// Sleep duration between poll attempts.
const POLL_INTERVAL: Duration = Duration::from_millis(10);

struct Member {
    name: String,
    negotiator: Negotiator<LocalTransport>,
    events: Receiver<TransportEvent>,
    phases: Vec<Phase>,
}

impl Member {
    fn record_phase(&mut self) {
        let phase = self.negotiator.phase();
        if self.phases.last() != Some(&phase) {
            self.phases.push(phase);
        }
    }
}

/// Participants on one `LocalNetwork`, stepped on a virtual clock.
pub struct Cluster {
    net: LocalNetwork,
    config: NegotiatorConfig,
    members: Vec<Option<Member>>,
    now: Instant,
}

impl Default for Cluster {
    fn default() -> Self {
        Self::new()
    }
}

impl Cluster {
    pub fn new() -> Self {
        Self::with_config(NegotiatorConfig::default())
    }

    pub fn with_config(config: NegotiatorConfig) -> Self {
        Self {
            net: LocalNetwork::new(),
            config,
            members: Vec::new(),
            now: Instant::now(),
        }
    }

    pub fn network(&self) -> &LocalNetwork {
        &self.net
    }

    pub fn now(&self) -> Instant {
        self.now
    }

    /// Add a participant (not yet joined). Returns its index.
    pub fn add(&mut self, name: &str) -> usize {
        let (tx, rx) = mpsc::channel();
        let index = self.members.len();
        let negotiator = Negotiator::with_rng(
            self.config.clone(),
            self.net.transport(tx),
            BoardRng::new(index as u64 + 1),
        );
        self.members.push(Some(Member {
            name: name.to_owned(),
            negotiator,
            events: rx,
            phases: vec![Phase::Idle],
        }));
        index
    }

    /// Join `who` to `room` at the current instant. Does not deliver events.
    pub fn join(&mut self, who: usize, room: &str) {
        let now = self.now;
        let member = self.member_mut(who);
        let name = member.name.clone();
        member
            .negotiator
            .join(&name, room, now)
            .expect("join rejected");
        member.record_phase();
    }

    /// `add` + `join` + `settle`.
    pub fn spawn(&mut self, name: &str, room: &str) -> usize {
        let who = self.add(name);
        self.join(who, room);
        self.settle();
        who
    }

    pub fn leave(&mut self, who: usize) {
        let member = self.member_mut(who);
        member.negotiator.leave();
        member.record_phase();
        self.settle();
    }

    /// Drop a participant without a goodbye; its connections close.
    pub fn kill(&mut self, who: usize) {
        self.members[who] = None;
        self.settle();
    }

    pub fn submit(&mut self, who: usize, mutation: Mutation) {
        let member = self.member_mut(who);
        member.negotiator.submit(mutation);
        member.record_phase();
        self.settle();
    }

    /// Post a chat line the way the board's chat box does (dice and attack
    /// notation expanded). Returns false when there was nothing to send.
    pub fn say(&mut self, who: usize, text: &str) -> bool {
        let member = self.member_mut(who);
        let session = member.negotiator.session().clone();
        let Some(message) =
            compose_message(&session, text, member.negotiator.rng_mut(), Utc::now())
        else {
            return false;
        };
        self.submit(who, Mutation::AppendMessage(message));
        true
    }

    /// Deliver queued events until every participant is quiet.
    pub fn settle(&mut self) {
        let now = self.now;
        loop {
            let mut busy = false;
            for member in self.members.iter_mut().flatten() {
                while let Ok(event) = member.events.try_recv() {
                    member.negotiator.handle_event(event, now);
                    member.record_phase();
                    busy = true;
                }
            }
            if !busy {
                break;
            }
        }
    }

    /// Advance the clock by `by`, one `TICK` at a time.
    pub fn advance(&mut self, by: Duration) {
        let target = self.now + by;
        while self.now < target {
            self.now = (self.now + TICK).min(target);
            self.poll_all();
        }
    }

    /// Advance until `done` holds or `limit` has elapsed. Returns whether
    /// `done` became true.
    pub fn run_until(&mut self, limit: Duration, mut done: impl FnMut(&Cluster) -> bool) -> bool {
        let deadline = self.now + limit;
        while !done(self) {
            if self.now >= deadline {
                return false;
            }
            self.now += TICK;
            self.poll_all();
        }
        true
    }

    fn poll_all(&mut self) {
        let now = self.now;
        for member in self.members.iter_mut().flatten() {
            member.negotiator.poll_timers(now);
            member.record_phase();
        }
        self.settle();
    }

    pub fn negotiator(&self, who: usize) -> &Negotiator<LocalTransport> {
        &self.member(who).negotiator
    }

    pub fn phase(&self, who: usize) -> Phase {
        self.member(who).negotiator.phase()
    }

    pub fn state(&self, who: usize) -> &BoardState {
        self.member(who).negotiator.store().state()
    }

    pub fn users(&self, who: usize) -> Vec<String> {
        self.state(who).users.clone()
    }

    /// Every phase `who` has been in, in order, without repeats.
    pub fn phase_history(&self, who: usize) -> &[Phase] {
        &self.member(who).phases
    }

    /// Indexes of live members currently acting as relay.
    pub fn relays(&self) -> Vec<usize> {
        self.live()
            .filter(|&i| self.phase(i) == Phase::Relay)
            .collect()
    }

    pub fn live(&self) -> impl Iterator<Item = usize> + '_ {
        self.members
            .iter()
            .enumerate()
            .filter(|(_, m)| m.is_some())
            .map(|(i, _)| i)
    }

    /// True when every live joined member is a relay or connected client and
    /// all of them hold the same board.
    pub fn converged(&self) -> bool {
        let joined: Vec<usize> = self
            .live()
            .filter(|&i| self.phase(i) != Phase::Idle)
            .collect();
        let Some(&first) = joined.first() else {
            return true;
        };
        self.relays().len() == 1
            && joined
                .iter()
                .all(|&i| matches!(self.phase(i), Phase::Relay | Phase::Client))
            && joined.iter().all(|&i| self.state(i) == self.state(first))
    }

    fn member(&self, who: usize) -> &Member {
        self.members[who].as_ref().expect("member was killed")
    }

    fn member_mut(&mut self, who: usize) -> &mut Member {
        self.members[who].as_mut().expect("member was killed")
    }
}

/// A threaded participant talking to a real broker.
pub struct TestNode {
    pub name: String,
    node: NodeHandle,
}

impl TestNode {
    pub fn start(broker: SocketAddr, name: &str, config: NegotiatorConfig) -> Self {
        let node = spawn_node(config, |sink| BrokerTransport::new(broker, sink));
        Self {
            name: name.to_owned(),
            node,
        }
    }

    pub fn join(&self, room: &str) {
        self.node.join(&self.name, room).expect("join rejected");
    }

    pub fn submit(&self, mutation: Mutation) {
        self.node.submit(mutation).expect("node stopped");
    }

    pub fn say(&self, text: &str) {
        self.node.say(text).expect("node stopped");
    }

    pub fn view(&self) -> NodeView {
        self.node.view().expect("node stopped")
    }

    /// Block until `done` holds for this node's view.
    pub fn wait_for(&self, what: &str, done: impl Fn(&NodeView) -> bool) -> NodeView {
        let start = Instant::now();
        loop {
            let view = self.view();
            if done(&view) {
                return view;
            }
            assert!(start.elapsed() < POLL_TIMEOUT, "{}: timed out waiting for {what}", self.name);
            thread::sleep(POLL_INTERVAL);
        }
    }

    /// Leave the room and stop the node thread.
    pub fn stop(self) {
        self.node.stop();
    }
}

/// Election timing shrunk for threaded tests.
pub fn fast_config() -> NegotiatorConfig {
    NegotiatorConfig {
        join_timeout_ms: 150,
        migration_step_ms: 150,
        migration_fallback_ms: 600,
        migration_probe_interval_ms: 30,
        claim_retry_delay_ms: 50,
        open_timeout_ms: 2000,
    }
}
