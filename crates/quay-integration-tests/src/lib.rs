//! In-memory multi-node test harness.
//!
//! A [`Router`] stands in for the transport layer: it owns a set of nodes,
//! queues every event a node emits, and delivers them in FIFO order when
//! asked — which preserves per-sender ordering, the only guarantee the
//! routing core demands of a real transport. Delivery is pull-based so a
//! test can stop mid-protocol and yank a node, the way a real network
//! fails.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, Weak};

use quay_ports::{Event, Node, NodeDelegate, NodeName, PortName, PortRef, SlotId, SlotRef};

#[derive(Default)]
struct RouterInner {
    nodes: HashMap<NodeName, Arc<Node>>,
    pending: VecDeque<(NodeName, Event)>,
    notifications: Vec<(NodeName, PortName, SlotId)>,
}

/// Routes events between in-process nodes.
#[derive(Default)]
pub struct Router {
    inner: Mutex<RouterInner>,
}

/// Install a `RUST_LOG`-filtered subscriber once, so protocol traces show
/// up under `cargo test -- --nocapture`.
pub fn init_tracing() {
    use std::sync::Once;
    static ONCE: Once = Once::new();
    ONCE.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

impl Router {
    pub fn new() -> Arc<Self> {
        init_tracing();
        Arc::new(Self::default())
    }

    /// Create a node wired into this router.
    pub fn create_node(self: &Arc<Self>) -> Arc<Node> {
        let name = NodeName::random();
        let delegate = Arc::new(RouterDelegate {
            router: Arc::downgrade(self),
            node: name,
        });
        let node = Arc::new(Node::new(name, delegate));
        self.inner.lock().unwrap().nodes.insert(name, node.clone());
        node
    }

    /// Deliver one pending event. Returns false when the queue is empty.
    pub fn step(&self) -> bool {
        let next = self.inner.lock().unwrap().pending.pop_front();
        let Some((to_node, event)) = next else {
            return false;
        };
        let node = self.inner.lock().unwrap().nodes.get(&to_node).cloned();
        if let Some(node) = node {
            // Errors are a node's own business; a transport just delivers.
            let _ = node.accept_event(event);
        }
        true
    }

    /// Deliver events until the graph goes quiet.
    pub fn flush(&self) {
        while self.step() {}
    }

    /// Simulate losing a node: it stops being routable and everything
    /// addressed to it is dropped.
    pub fn disconnect(&self, name: NodeName) {
        let mut inner = self.inner.lock().unwrap();
        inner.nodes.remove(&name);
        inner.pending.retain(|(to_node, _)| *to_node != name);
    }

    /// Drop every undelivered event, as if the wire was cut mid-flight.
    pub fn drop_pending(&self) {
        self.inner.lock().unwrap().pending.clear();
    }

    pub fn pending_count(&self) -> usize {
        self.inner.lock().unwrap().pending.len()
    }

    /// Slot-status notifications observed so far, as (node, port, slot).
    pub fn notifications(&self) -> Vec<(NodeName, PortName, SlotId)> {
        self.inner.lock().unwrap().notifications.clone()
    }

    pub fn clear_notifications(&self) {
        self.inner.lock().unwrap().notifications.clear();
    }
}

struct RouterDelegate {
    router: Weak<Router>,
    node: NodeName,
}

impl NodeDelegate for RouterDelegate {
    fn forward_event(&self, to_node: NodeName, event: Event) {
        if let Some(router) = self.router.upgrade() {
            router.inner.lock().unwrap().pending.push_back((to_node, event));
        }
    }

    fn broadcast_event(&self, event: Event) {
        if let Some(router) = self.router.upgrade() {
            let mut inner = router.inner.lock().unwrap();
            let others: Vec<NodeName> = inner
                .nodes
                .keys()
                .filter(|name| **name != self.node)
                .copied()
                .collect();
            for to_node in others {
                inner.pending.push_back((to_node, event.clone()));
            }
        }
    }

    fn slot_status_changed(&self, slot: SlotRef) {
        if let Some(router) = self.router.upgrade() {
            router
                .inner
                .lock()
                .unwrap()
                .notifications
                .push((self.node, slot.port().name(), slot.slot_id()));
        }
    }
}

/// Peer two uninitialized ports across (or within) nodes, the way a real
/// embedder bootstraps its first cross-node channel out of band.
pub fn connect(node_a: &Node, node_b: &Node) -> (PortRef, PortRef) {
    let a = node_a.create_uninitialized_port().unwrap();
    let b = node_b.create_uninitialized_port().unwrap();
    node_a
        .initialize_port(&a, node_b.name(), b.name())
        .unwrap();
    node_b
        .initialize_port(&b, node_a.name(), a.name())
        .unwrap();
    (a, b)
}
