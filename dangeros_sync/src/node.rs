// Threaded driver for a `Negotiator`.
//
// Architecture: one node thread with a central `mpsc` channel.
//
// - **Transport threads** (whatever the binding runs) push completions into
//   the channel through `NodeSink`, wrapped as `NodeEvent::Transport`.
// - **UI threads** talk to the node through a `NodeHandle`, which sends
//   `NodeEvent::Command`s; queries carry their own reply channel.
// - **Node thread**: owns the `Negotiator` and is the only code that touches
//   it. Uses `recv_timeout` up to the negotiator's next deadline as its timer,
//   so there is no separate timer thread; when nothing is scheduled it simply
//   blocks on `recv`.
//
// Shutdown: `NodeHandle::stop` (or dropping the handle) sends
// `NodeEvent::Shutdown`; the node leaves the room, which releases the relay
// address if it held it, and exits.

use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::thread;
use std::time::Instant;

use chrono::Utc;
use dangeros_protocol::BoardState;
use tracing::{debug, info};

use crate::chat;
use crate::config::NegotiatorConfig;
use crate::error::NodeError;
use crate::negotiator::{Negotiator, Phase, Session};
use crate::store::{Mutation, StoreChange};
use crate::transport::{EventSink, Transport, TransportEvent};
use crate::wiki;

/// Everything the node thread reacts to.
pub enum NodeEvent {
    Transport(TransportEvent),
    Command(Command),
    Shutdown,
}

pub enum Command {
    Join {
        display_name: String,
        room_name: String,
        reply: Sender<Result<(), NodeError>>,
    },
    Leave,
    Submit(Mutation),
    /// A raw chat line; dice and attack commands are expanded.
    Say(String),
    ImportWiki {
        text: String,
        reply: Sender<usize>,
    },
    ExportWiki(Sender<String>),
    View(Sender<NodeView>),
    Subscribe(Sender<Receiver<StoreChange>>),
}

/// A copy of what the UI renders.
#[derive(Clone, Debug, PartialEq)]
pub struct NodeView {
    pub session: Session,
    pub phase: Phase,
    pub state: BoardState,
}

/// Feeds transport events into a node's channel.
#[derive(Clone)]
pub struct NodeSink(Sender<NodeEvent>);

impl EventSink for NodeSink {
    fn deliver(&self, event: TransportEvent) {
        let _ = self.0.send(NodeEvent::Transport(event));
    }
}

pub struct NodeHandle {
    tx: Sender<NodeEvent>,
    thread: Option<thread::JoinHandle<()>>,
}

/// Start a node thread. `make_transport` receives the sink the transport
/// must deliver its events to.
pub fn spawn_node<T, F>(config: NegotiatorConfig, make_transport: F) -> NodeHandle
where
    T: Transport + Send + 'static,
    F: FnOnce(NodeSink) -> T,
{
    let (tx, rx) = mpsc::channel();
    let transport = make_transport(NodeSink(tx.clone()));
    let negotiator = Negotiator::new(config, transport);
    let thread = thread::spawn(move || run_node(negotiator, rx));
    NodeHandle {
        tx,
        thread: Some(thread),
    }
}

impl NodeHandle {
    pub fn join(&self, display_name: &str, room_name: &str) -> Result<(), NodeError> {
        let (reply, answer) = mpsc::channel();
        self.command(Command::Join {
            display_name: display_name.to_owned(),
            room_name: room_name.to_owned(),
            reply,
        })?;
        answer.recv().map_err(|_| NodeError::Stopped)?
    }

    pub fn leave(&self) -> Result<(), NodeError> {
        self.command(Command::Leave)
    }

    pub fn submit(&self, mutation: Mutation) -> Result<(), NodeError> {
        self.command(Command::Submit(mutation))
    }

    pub fn say(&self, text: &str) -> Result<(), NodeError> {
        self.command(Command::Say(text.to_owned()))
    }

    /// Import characters and DP from wiki text. Returns how many changes
    /// were applied.
    pub fn import_wiki(&self, text: &str) -> Result<usize, NodeError> {
        let (reply, answer) = mpsc::channel();
        self.command(Command::ImportWiki {
            text: text.to_owned(),
            reply,
        })?;
        answer.recv().map_err(|_| NodeError::Stopped)
    }

    pub fn export_wiki(&self) -> Result<String, NodeError> {
        let (reply, answer) = mpsc::channel();
        self.command(Command::ExportWiki(reply))?;
        answer.recv().map_err(|_| NodeError::Stopped)
    }

    pub fn view(&self) -> Result<NodeView, NodeError> {
        let (reply, answer) = mpsc::channel();
        self.command(Command::View(reply))?;
        answer.recv().map_err(|_| NodeError::Stopped)
    }

    pub fn subscribe(&self) -> Result<Receiver<StoreChange>, NodeError> {
        let (reply, answer) = mpsc::channel();
        self.command(Command::Subscribe(reply))?;
        answer.recv().map_err(|_| NodeError::Stopped)
    }

    /// Leave the room and wait for the node thread to exit.
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn command(&self, command: Command) -> Result<(), NodeError> {
        self.tx
            .send(NodeEvent::Command(command))
            .map_err(|_| NodeError::Stopped)
    }

    fn shutdown(&mut self) {
        let _ = self.tx.send(NodeEvent::Shutdown);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for NodeHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Main node loop. Runs until `Shutdown` arrives.
fn run_node<T: Transport>(mut negotiator: Negotiator<T>, rx: Receiver<NodeEvent>) {
    info!("node started");
    loop {
        let received = match negotiator.next_deadline() {
            Some(deadline) => {
                match rx.recv_timeout(deadline.saturating_duration_since(Instant::now())) {
                    Ok(event) => Some(event),
                    Err(RecvTimeoutError::Timeout) => None,
                    Err(RecvTimeoutError::Disconnected) => break,
                }
            }
            None => match rx.recv() {
                Ok(event) => Some(event),
                Err(_) => break,
            },
        };

        if let Some(event) = received {
            if !dispatch(&mut negotiator, event) {
                break;
            }
            // Drain whatever else arrived while we were busy.
            let mut stopping = false;
            while let Ok(event) = rx.try_recv() {
                if !dispatch(&mut negotiator, event) {
                    stopping = true;
                    break;
                }
            }
            if stopping {
                break;
            }
        }
        negotiator.poll_timers(Instant::now());
    }
    negotiator.leave();
    info!("node stopped");
}

/// Handle one event. Returns false on shutdown.
fn dispatch<T: Transport>(negotiator: &mut Negotiator<T>, event: NodeEvent) -> bool {
    match event {
        NodeEvent::Transport(event) => negotiator.handle_event(event, Instant::now()),
        NodeEvent::Command(command) => run_command(negotiator, command),
        NodeEvent::Shutdown => return false,
    }
    true
}

fn run_command<T: Transport>(negotiator: &mut Negotiator<T>, command: Command) {
    match command {
        Command::Join {
            display_name,
            room_name,
            reply,
        } => {
            let result = negotiator
                .join(&display_name, &room_name, Instant::now())
                .map_err(NodeError::from);
            let _ = reply.send(result);
        }
        Command::Leave => negotiator.leave(),
        Command::Submit(mutation) => negotiator.submit(mutation),
        Command::Say(text) => {
            let session = negotiator.session().clone();
            match chat::compose_message(&session, &text, negotiator.rng_mut(), Utc::now()) {
                Some(message) => negotiator.submit(Mutation::AppendMessage(message)),
                None => debug!("ignoring blank chat line"),
            }
        }
        Command::ImportWiki { text, reply } => {
            let room_id = negotiator.session().room_id.clone().unwrap_or_default();
            let imported = wiki::import(&text, &room_id, negotiator.rng_mut());
            let count = imported.len();
            for change in imported {
                negotiator.submit(change.into_mutation());
            }
            info!(count, "imported wiki text");
            let _ = reply.send(count);
        }
        Command::ExportWiki(reply) => {
            let _ = reply.send(wiki::export(negotiator.store().state()));
        }
        Command::View(reply) => {
            let _ = reply.send(NodeView {
                session: negotiator.session().clone(),
                phase: negotiator.phase(),
                state: negotiator.store().snapshot(),
            });
        }
        Command::Subscribe(reply) => {
            let _ = reply.send(negotiator.subscribe());
        }
    }
}
