//! Node-loss handling: synthetic peer closure and dead-proxy broadcast.

use quay_integration_tests::{connect, Router};
use quay_ports::{PortError, UserMessageEvent};

#[test]
fn lost_node_simulates_peer_closure() {
    let router = Router::new();
    let node_a = router.create_node();
    let node_b = router.create_node();
    let (x, _y) = connect(&node_a, &node_b);

    router.disconnect(node_b.name());
    node_a.lost_connection_to_node(node_b.name()).unwrap();

    let status = node_a.get_status(&x).unwrap();
    assert!(status.peer_closed);
    // Messages that will never arrive are not waited for.
    assert_eq!(node_a.get_message(&x).unwrap_err(), PortError::PeerClosed);
}

#[test]
fn messages_still_on_the_wire_are_abandoned() {
    let router = Router::new();
    let node_a = router.create_node();
    let node_b = router.create_node();
    let (x, y) = connect(&node_a, &node_b);

    node_b
        .send_user_message(&y, UserMessageEvent::new(b"made it".to_vec()))
        .unwrap();
    router.flush();
    let message = node_a.get_message(&x).unwrap().unwrap();
    assert_eq!(message.payload(), b"made it");

    // This one is still on the wire when the link dies; node loss is a
    // broken pipe, not a graceful close, and nothing waits for it.
    node_b
        .send_user_message(&y, UserMessageEvent::new(b"lost".to_vec()))
        .unwrap();
    router.disconnect(node_b.name());
    router.drop_pending();
    node_a.lost_connection_to_node(node_b.name()).unwrap();

    assert_eq!(node_a.get_message(&x).unwrap_err(), PortError::PeerClosed);
}

#[test]
fn dead_proxy_is_erased_and_broadcast() {
    let router = Router::new();
    let node_a = router.create_node();
    let node_b = router.create_node();
    let node_c = router.create_node();
    let (x, _y) = connect(&node_a, &node_b);

    let (p, q) = node_a.create_port_pair().unwrap();

    // A port on node C that believes q@A is its peer, standing in for a
    // receiving port somewhere behind the proxy.
    let r = node_c.create_uninitialized_port().unwrap();
    node_c
        .initialize_port(&r, node_a.name(), q.name())
        .unwrap();

    // Start transferring q to node B, but stop once q has become a proxy:
    // deliver the carrying message and the PortAccepted reply, nothing
    // more.
    let mut message = UserMessageEvent::new(Vec::new());
    message.attach_port(q.name());
    node_a.send_user_message(&x, message).unwrap();
    assert!(router.step());
    assert!(router.step());

    // Node B dies with the rest of the handshake on the wire.
    router.disconnect(node_b.name());
    router.drop_pending();
    node_a.lost_connection_to_node(node_b.name()).unwrap();

    // The stranded proxy cannot notify anyone through the normal protocol,
    // so it is erased outright...
    assert_eq!(
        node_a.get_port(&q.name()).unwrap_err(),
        PortError::UnknownPort
    );
    // ...its local peer observes closure through the same sweep...
    assert!(node_a.get_status(&p).unwrap().peer_closed);
    assert_eq!(node_a.get_message(&p).unwrap_err(), PortError::PeerClosed);

    // ...and its death is broadcast so ports on other nodes can run the
    // same closure logic independently.
    router.flush();
    assert!(node_c.get_status(&r).unwrap().peer_closed);
    assert_eq!(node_c.get_message(&r).unwrap_err(), PortError::PeerClosed);
}
