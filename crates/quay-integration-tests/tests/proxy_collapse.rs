//! Port transfer and proxy-chain collapse.
//!
//! Sending a port inside a message leaves a proxy at its old home. These
//! tests pin down the two properties the proxy protocol exists for: no
//! message is lost while the port is in motion, and the proxy itself
//! disappears once it has forwarded the last message it is owed.

use quay_integration_tests::{connect, Router};
use quay_ports::{PortError, UserMessageEvent};

#[test]
fn transferred_port_reconnects_directly() {
    let router = Router::new();
    let node_a = router.create_node();
    let node_b = router.create_node();
    let (x, y) = connect(&node_a, &node_b);

    // A local pair on node A; q will be shipped to node B.
    let (p, q) = node_a.create_port_pair().unwrap();

    let mut message = UserMessageEvent::new(b"here, have a port".to_vec());
    message.attach_port(q.name());
    node_a.send_user_message(&x, message).unwrap();
    router.flush();

    let received = node_b.get_message(&y).unwrap().unwrap();
    assert_eq!(received.ports().len(), 1);
    let q_at_b = node_b.get_port(&received.ports()[0]).unwrap();

    // The transferred port got a new name at its new home, and the old
    // name no longer exists anywhere on node A.
    assert_ne!(q_at_b.name(), q.name());
    assert_eq!(
        node_a.get_port(&q.name()).unwrap_err(),
        PortError::UnknownPort
    );

    // p now talks straight to node B.
    assert!(node_a.get_status(&p).unwrap().peer_remote);
    node_a
        .send_user_message(&p, UserMessageEvent::new(b"direct line".to_vec()))
        .unwrap();
    router.flush();
    let message = node_b.get_message(&q_at_b).unwrap().unwrap();
    assert_eq!(message.payload(), b"direct line");
}

#[test]
fn no_message_lost_during_transfer() {
    let router = Router::new();
    let node_a = router.create_node();
    let node_b = router.create_node();
    let (x, y) = connect(&node_a, &node_b);

    let (p, q) = node_a.create_port_pair().unwrap();

    // Messages queued on q before the transfer...
    node_a
        .send_user_message(&p, UserMessageEvent::new(vec![1]))
        .unwrap();
    node_a
        .send_user_message(&p, UserMessageEvent::new(vec![2]))
        .unwrap();

    let mut message = UserMessageEvent::new(Vec::new());
    message.attach_port(q.name());
    node_a.send_user_message(&x, message).unwrap();

    // ...and one sent while the transfer is still in flight.
    node_a
        .send_user_message(&p, UserMessageEvent::new(vec![3]))
        .unwrap();
    router.flush();

    let received = node_b.get_message(&y).unwrap().unwrap();
    let q_at_b = node_b.get_port(&received.ports()[0]).unwrap();

    // Everything arrives at the new location, exactly once, in order.
    for expected in 1..=3u8 {
        let message = node_b.get_message(&q_at_b).unwrap().unwrap();
        assert_eq!(message.payload(), &[expected]);
    }
    assert!(node_b.get_message(&q_at_b).unwrap().is_none());
}

#[test]
fn chained_transfers_still_deliver() {
    let router = Router::new();
    let node_a = router.create_node();
    let node_b = router.create_node();
    let node_c = router.create_node();
    let (ab_x, ab_y) = connect(&node_a, &node_b);
    let (bc_x, bc_y) = connect(&node_b, &node_c);

    let (p, q) = node_a.create_port_pair().unwrap();

    // Hop 1: q moves A -> B.
    let mut message = UserMessageEvent::new(Vec::new());
    message.attach_port(q.name());
    node_a.send_user_message(&ab_x, message).unwrap();
    router.flush();
    let received = node_b.get_message(&ab_y).unwrap().unwrap();
    let q_at_b = node_b.get_port(&received.ports()[0]).unwrap();

    // Hop 2: q moves on, B -> C.
    let mut message = UserMessageEvent::new(Vec::new());
    message.attach_port(q_at_b.name());
    node_b.send_user_message(&bc_x, message).unwrap();
    router.flush();
    let received = node_c.get_message(&bc_y).unwrap().unwrap();
    let q_at_c = node_c.get_port(&received.ports()[0]).unwrap();

    // Both waypoints have collapsed out of existence.
    assert_eq!(
        node_a.get_port(&q.name()).unwrap_err(),
        PortError::UnknownPort
    );
    assert_eq!(
        node_b.get_port(&q_at_b.name()).unwrap_err(),
        PortError::UnknownPort
    );

    node_a
        .send_user_message(&p, UserMessageEvent::new(b"twice removed".to_vec()))
        .unwrap();
    router.flush();
    let message = node_c.get_message(&q_at_c).unwrap().unwrap();
    assert_eq!(message.payload(), b"twice removed");

    // And the channel still works backwards.
    node_c
        .send_user_message(&q_at_c, UserMessageEvent::new(b"echo".to_vec()))
        .unwrap();
    router.flush();
    let message = node_a.get_message(&p).unwrap().unwrap();
    assert_eq!(message.payload(), b"echo");
}

#[test]
fn closing_unread_transfer_closes_the_port_inside() {
    let router = Router::new();
    let node_a = router.create_node();
    let node_b = router.create_node();
    let (x, y) = connect(&node_a, &node_b);

    let (p, q) = node_a.create_port_pair().unwrap();

    let mut message = UserMessageEvent::new(Vec::new());
    message.attach_port(q.name());
    node_a.send_user_message(&x, message).unwrap();
    router.flush();

    // B never reads the message; closing y must close the port it carried,
    // all the way back to p's point of view.
    node_b.close_port(&y).unwrap();
    router.flush();

    assert!(node_a.get_status(&p).unwrap().peer_closed);
    assert_eq!(node_a.get_message(&p).unwrap_err(), PortError::PeerClosed);
}
