// End-to-end: real node threads talking through a real broker over TCP.
//
// Uses `fast_config` so elections take a fraction of a second, then runs the
// same story the in-process scenarios check, with wall-clock time and
// sockets in between: host, join, edit, crash the relay, fail over.

use dangeros_broker::{BrokerConfig, start_broker};
use dangeros_protocol::{EntityId, Team, Unit};
use dangeros_sync::{Mutation, Phase};
use multiplayer_tests::{TestNode, fast_config};

const ROOM: &str = "rooftop";

#[test]
fn host_join_edit_and_fail_over() {
    let (broker, addr) = start_broker(BrokerConfig {
        port: 0,
        ..BrokerConfig::default()
    })
    .unwrap();

    let alice = TestNode::start(addr, "Alice", fast_config());
    alice.join(ROOM);
    alice.wait_for("Alice to host", |v| v.phase == Phase::Relay);

    let bob = TestNode::start(addr, "Bob", fast_config());
    bob.join(ROOM);
    bob.wait_for("Bob to connect", |v| v.phase == Phase::Client && v.state.users.len() == 2);
    let carol = TestNode::start(addr, "Carol", fast_config());
    carol.join(ROOM);
    carol.wait_for("Carol to connect", |v| {
        v.phase == Phase::Client && v.state.users.len() == 3
    });

    // Edits from a client reach the relay and the other client.
    let id = EntityId::new("kite00001");
    bob.submit(Mutation::AddUnit(Unit::character(id.clone(), ROOM, "Kite")));
    carol.submit(Mutation::SetCounter {
        team: Team::Other,
        value: 4,
    });
    alice.say("3d6");
    for node in [&alice, &bob, &carol] {
        node.wait_for("the edits", |v| {
            v.state.unit(&id).is_some()
                && v.state.counter(Team::Other) == 4
                && v.state.messages.len() == 1
        });
    }
    let view = bob.view();
    let roll = &view.state.messages[0];
    assert!(roll.is_system);
    assert_eq!(roll.handle_name, "Alice");

    // Take the relay down: Bob is next in line.
    alice.stop();
    let bob_view = bob.wait_for("Bob to take over", |v| v.phase == Phase::Relay);
    assert!(bob_view.session.is_relay);
    let carol_view = carol.wait_for("Carol to follow Bob", |v| {
        v.phase == Phase::Client && v.state.users == ["Bob", "Carol"]
    });
    assert!(carol_view.state.unit(&id).is_some());
    assert_eq!(carol_view.state.counter(Team::Other), 4);
    assert_eq!(
        carol_view.state.messages.last().map(|m| m.content.as_str()),
        Some("Bob is now the host.")
    );

    carol.stop();
    bob.stop();
    broker.stop();
}

#[test]
fn simultaneous_joiners_through_the_broker() {
    let (broker, addr) = start_broker(BrokerConfig {
        port: 0,
        ..BrokerConfig::default()
    })
    .unwrap();

    let nodes: Vec<TestNode> = ["Dana", "Eli", "Fay"]
        .into_iter()
        .map(|name| TestNode::start(addr, name, fast_config()))
        .collect();
    for node in &nodes {
        node.join(ROOM);
    }

    for node in &nodes {
        node.wait_for("the room to settle", |v| {
            matches!(v.phase, Phase::Relay | Phase::Client) && v.state.users.len() == 3
        });
    }
    let relays = nodes
        .iter()
        .filter(|n| n.view().phase == Phase::Relay)
        .count();
    assert_eq!(relays, 1);

    for node in nodes {
        node.stop();
    }
    broker.stop();
}
