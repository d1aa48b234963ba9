// Terminal participant for a shared board.
//
// Joins a room through a broker and reads commands from stdin. Lines that do
// not start with `/` are chat (so `2d6` and `15 => 5` work as they do on the
// board's chat panel). A watcher thread prints new chat lines and role
// changes as they happen.
//
// Usage:
//   board --room <ROOM> --name <NAME> [--broker <ADDR>] [--config <FILE>]
//
// Commands:
//   /who                      roster and our role
//   /board                    the board as wiki text
//   /add <name> [team]        new unplaced character (team label, e.g. 生徒会)
//   /wall <x> <y>             wall segment at a cell (0-based)
//   /move <id> <x> <y>        place a unit
//   /unplace <id>             take a unit off the grid
//   /hp <id> <value>          set a unit's HP
//   /del <id>                 delete a unit
//   /dp <team> <value>        set a team's DP
//   /import <file>            read characters and DP from wiki text
//   /leave, /quit

use std::io::BufRead;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use anyhow::{Context, bail};
use clap::Parser;
use dangeros_broker::BrokerTransport;
use dangeros_prng::BoardRng;
use dangeros_protocol::{EntityId, GridPos, Placement, Team, Unit, UnitPatch};
use dangeros_sync::{ChangeKind, Mutation, NegotiatorConfig, NodeHandle, spawn_node};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "board", about = "Join a shared board from the terminal")]
struct Args {
    /// Broker to rendezvous through.
    #[arg(long, default_value = "127.0.0.1:7979")]
    broker: SocketAddr,
    #[arg(long)]
    room: String,
    /// Display name shown to the others.
    #[arg(long)]
    name: String,
    /// Election timing overrides (JSON).
    #[arg(long)]
    config: Option<PathBuf>,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let config = match &args.config {
        Some(path) => NegotiatorConfig::load(path)
            .with_context(|| format!("reading {}", path.display()))?,
        None => NegotiatorConfig::default(),
    };

    let broker = args.broker;
    let node = spawn_node(config, |sink| BrokerTransport::new(broker, sink));
    node.join(&args.name, &args.room)?;
    println!("joining {} as {} (type /help)", args.room, args.name);

    let done = AtomicBool::new(false);
    thread::scope(|scope| {
        scope.spawn(|| watch(&node, &done));
        let result = repl(&node);
        done.store(true, Ordering::SeqCst);
        result
    })?;

    node.stop();
    Ok(())
}

/// Print chat lines and role changes until `done`.
fn watch(node: &NodeHandle, done: &AtomicBool) {
    let Ok(changes) = node.subscribe() else {
        return;
    };
    let mut shown = 0;
    let mut phase = None;
    while !done.load(Ordering::SeqCst) {
        let Ok(change) = changes.recv_timeout(Duration::from_millis(200)) else {
            continue;
        };
        let Ok(view) = node.view() else {
            return;
        };
        if phase != Some(view.phase) {
            phase = Some(view.phase);
            println!("-- {:?}", view.phase);
        }
        if matches!(change.kind, ChangeKind::Messages | ChangeKind::Replaced) {
            for message in view.state.messages.iter().skip(shown) {
                println!("[{}] {}", message.handle_name, message.content);
            }
            shown = view.state.messages.len();
        }
    }
}

fn repl(node: &NodeHandle) -> anyhow::Result<()> {
    let mut rng = BoardRng::from_clock();
    let stdin = std::io::stdin();
    for line in stdin.lock().lines() {
        let line = line?;
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if !line.starts_with('/') {
            node.say(line)?;
            continue;
        }
        let words: Vec<&str> = line.split_whitespace().collect();
        match run(node, &mut rng, &words) {
            Ok(true) => {}
            Ok(false) => break,
            Err(error) => println!("!! {error}"),
        }
    }
    Ok(())
}

/// Run one slash command. Returns false to quit.
fn run(node: &NodeHandle, rng: &mut BoardRng, words: &[&str]) -> anyhow::Result<bool> {
    let view = node.view()?;
    let room_id = view.session.room_id.clone().unwrap_or_default();
    match words {
        ["/quit"] => return Ok(false),
        ["/leave"] => {
            node.leave()?;
            return Ok(false);
        }
        ["/help"] => println!("/who /board /add /wall /move /unplace /hp /del /dp /import /quit"),
        ["/who"] => {
            println!(
                "{} ({:?}, relay: {})",
                view.session.display_name, view.phase, view.session.is_relay
            );
            for user in &view.state.users {
                println!("  {user}");
            }
        }
        ["/board"] => print!("{}", node.export_wiki()?),
        ["/add", name, rest @ ..] => {
            let mut unit = Unit::character(EntityId::new(rng.unit_id()), room_id, *name);
            if let Some(label) = rest.first() {
                unit.team = Some(team(label)?);
            }
            println!("added {}", unit.id);
            node.submit(Mutation::AddUnit(unit))?;
        }
        ["/wall", x, y] => {
            let unit = Unit::wall(EntityId::new(rng.unit_id()), room_id, cell(x, y)?);
            node.submit(Mutation::AddUnit(unit))?;
        }
        ["/move", id, x, y] => {
            let placement = Placement::At(cell(x, y)?);
            node.submit(Mutation::UpdateUnit(UnitPatch::moved(EntityId::new(*id), placement)))?;
        }
        ["/unplace", id] => {
            let patch = UnitPatch::moved(EntityId::new(*id), Placement::Unplaced);
            node.submit(Mutation::UpdateUnit(patch))?;
        }
        ["/hp", id, value] => {
            let patch = UnitPatch {
                hp: Some(value.parse().context("hp must be a number")?),
                ..UnitPatch::new(EntityId::new(*id))
            };
            node.submit(Mutation::UpdateUnit(patch))?;
        }
        ["/del", id] => node.submit(Mutation::RemoveUnit(EntityId::new(*id)))?,
        ["/dp", label, value] => node.submit(Mutation::SetCounter {
            team: team(label)?,
            value: value.parse().context("DP must be a number")?,
        })?,
        ["/import", path] => {
            let text = std::fs::read_to_string(path).with_context(|| format!("reading {path}"))?;
            println!("imported {} changes", node.import_wiki(&text)?);
        }
        _ => bail!("unknown command {:?}; try /help", words.first().unwrap_or(&"")),
    }
    Ok(true)
}

fn team(label: &str) -> anyhow::Result<Team> {
    Team::from_label(label).with_context(|| {
        let labels: Vec<&str> = Team::ALL.iter().map(|t| t.label()).collect();
        format!("unknown team {label:?}; one of {}", labels.join(", "))
    })
}

fn cell(x: &str, y: &str) -> anyhow::Result<GridPos> {
    let x: u8 = x.parse().context("x must be a number")?;
    let y: u8 = y.parse().context("y must be a number")?;
    GridPos::new(x, y).with_context(|| format!("({x}, {y}) is off the board"))
}
