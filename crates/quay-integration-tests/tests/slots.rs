//! Slot multiplexing across nodes.

use quay_integration_tests::{connect, Router};
use quay_ports::{SlotRef, UserMessageEvent, PEER_ALLOCATED_SLOT_ID_BIT};

#[test]
fn slot_streams_cross_nodes() {
    let router = Router::new();
    let node_a = router.create_node();
    let node_b = router.create_node();
    let (x, y) = connect(&node_a, &node_b);

    // The slot id travels out of band; the peer registers it under the
    // bit-flipped alias.
    let slot = node_a.allocate_slot(&x);
    assert!(node_b.add_slot_from_peer(&y, slot));
    let y_slot = slot ^ PEER_ALLOCATED_SLOT_ID_BIT;

    node_a
        .send_user_message_on_slot(
            &SlotRef::new(x.clone(), slot),
            UserMessageEvent::new(b"sub-channel".to_vec()),
        )
        .unwrap();
    node_a
        .send_user_message(&x, UserMessageEvent::new(b"main channel".to_vec()))
        .unwrap();
    router.flush();

    // The default slot cannot read past the slot message in front of it.
    assert!(node_b.get_message(&y).unwrap().is_none());

    let message = node_b
        .get_slot_message(&SlotRef::new(y.clone(), y_slot), None)
        .unwrap()
        .unwrap();
    assert_eq!(message.payload(), b"sub-channel");
    let message = node_b.get_message(&y).unwrap().unwrap();
    assert_eq!(message.payload(), b"main channel");
}

#[test]
fn closing_a_slot_discards_its_queued_messages() {
    let router = Router::new();
    let node_a = router.create_node();
    let node_b = router.create_node();
    let (x, y) = connect(&node_a, &node_b);

    let slot = node_a.allocate_slot(&x);
    assert!(node_b.add_slot_from_peer(&y, slot));
    let y_slot = slot ^ PEER_ALLOCATED_SLOT_ID_BIT;

    node_a
        .send_user_message_on_slot(
            &SlotRef::new(x.clone(), slot),
            UserMessageEvent::new(b"never read".to_vec()),
        )
        .unwrap();
    node_a
        .send_user_message(&x, UserMessageEvent::new(b"still wanted".to_vec()))
        .unwrap();
    router.flush();

    // B closes the slot with messages still queued for it; the port stays
    // open and the default stream is unblocked.
    node_b
        .close_port_slot(&SlotRef::new(y.clone(), y_slot))
        .unwrap();
    let message = node_b.get_message(&y).unwrap().unwrap();
    assert_eq!(message.payload(), b"still wanted");

    // A's side of that slot sees the closure.
    router.flush();
    let status = node_a
        .get_slot_status(&SlotRef::new(x.clone(), slot))
        .unwrap();
    assert!(status.peer_closed);
    assert!(!node_a.get_status(&x).unwrap().peer_closed);
}

#[test]
fn late_messages_for_a_closed_slot_are_dropped() {
    let router = Router::new();
    let node_a = router.create_node();
    let node_b = router.create_node();
    let (x, y) = connect(&node_a, &node_b);

    let slot = node_a.allocate_slot(&x);
    assert!(node_b.add_slot_from_peer(&y, slot));
    let y_slot = slot ^ PEER_ALLOCATED_SLOT_ID_BIT;

    node_b
        .close_port_slot(&SlotRef::new(y.clone(), y_slot))
        .unwrap();
    router.flush();

    // A has not yet noticed and keeps sending on the slot; those messages
    // must not wedge the default stream on B.
    node_a
        .send_user_message_on_slot(
            &SlotRef::new(x.clone(), slot),
            UserMessageEvent::new(b"into the void".to_vec()),
        )
        .unwrap();
    node_a
        .send_user_message(&x, UserMessageEvent::new(b"gets through".to_vec()))
        .unwrap();
    router.flush();

    let message = node_b.get_message(&y).unwrap().unwrap();
    assert_eq!(message.payload(), b"gets through");
}
