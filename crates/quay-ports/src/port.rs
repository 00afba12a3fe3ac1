//! Per-endpoint port state.
//!
//! A port is one end of a message channel. Its durable identity is its
//! [`PortName`]; everything else — where its peer lives, whether it still
//! terminates locally or merely forwards — changes over its lifetime. All
//! mutable state lives behind the port's lock; peer-address changes
//! additionally go through the node-wide table so the reverse peer index
//! stays consistent (see [`crate::node`]).

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};

use crate::event::Event;
use crate::name::{NodeName, PortName};
use crate::queue::MessageQueue;

/// An independently-sequenced sub-channel within a port.
pub type SlotId = u64;

/// The slot every initialized port starts with.
pub const DEFAULT_SLOT_ID: SlotId = 0;

/// Distinguishes "my slot ids" from "your slot ids" without a handshake:
/// each side allocates ids with the bit clear and flips it when naming the
/// peer's slots.
pub const PEER_ALLOCATED_SLOT_ID_BIT: SlotId = 1 << 63;

/// Sequence number carried by the first user message a port sends.
pub const INITIAL_SEQUENCE_NUM: u64 = 1;

/// Opaque embedder state attachable to a port.
pub trait UserData: Send + Sync + 'static {
    fn as_any(&self) -> &dyn Any;
}

/// Where a port is in its life cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortState {
    /// Allocated a name but no peer yet.
    Uninitialized,
    /// Terminates locally; the embedder reads messages from it.
    Receiving,
    /// Mid-transfer: inbound messages accumulate until the destination
    /// confirms the port exists there.
    Buffering,
    /// No longer terminates locally; forwards everything to its peer and
    /// removes itself once the last expected message has passed through.
    Proxying,
    /// Terminal. By the time anyone observes this outside the lock, the
    /// port is already gone from the node's table.
    Closed,
}

/// Per-slot sequencing state.
#[derive(Debug, Clone)]
pub(crate) struct Slot {
    /// Whether reads on this slot may trigger status notifications yet.
    /// Ports arriving inside a message stay quiet until the embedder has
    /// actually read that message.
    pub can_signal: bool,
    pub peer_closed: bool,
    pub last_sequence_num_sent: u64,
    pub last_sequence_num_to_receive: u64,
}

impl Slot {
    fn new(can_signal: bool) -> Self {
        Self {
            can_signal,
            peer_closed: false,
            last_sequence_num_sent: 0,
            last_sequence_num_to_receive: 0,
        }
    }
}

/// The mutable half of a port. Only ever touched through its lock.
pub(crate) struct Port {
    pub state: PortState,
    pub peer_node_name: NodeName,
    pub peer_port_name: PortName,
    pub next_sequence_num_to_send: u64,
    pub last_sequence_num_to_receive: u64,
    pub peer_closed: bool,
    /// Set once the proxy knows its final inbound bound; together with an
    /// exhausted queue this licenses self-destruction.
    pub remove_proxy_on_last_message: bool,
    pub message_queue: MessageQueue,
    pub slots: HashMap<SlotId, Slot>,
    next_slot_id: SlotId,
    pub user_data: Option<Arc<dyn UserData>>,
    /// A control event owed to another node, deliverable only once this
    /// port (as a proxy) is finally removed. Produced when an ObserveProxy
    /// lands on a port that is itself still a proxy.
    pub send_on_proxy_removal: Option<(NodeName, Event)>,
}

impl Port {
    pub fn new(next_sequence_num_to_send: u64, next_sequence_num_to_receive: u64) -> Self {
        Self {
            state: PortState::Uninitialized,
            peer_node_name: NodeName::INVALID,
            peer_port_name: PortName::INVALID,
            next_sequence_num_to_send,
            last_sequence_num_to_receive: 0,
            peer_closed: false,
            remove_proxy_on_last_message: false,
            message_queue: MessageQueue::new(next_sequence_num_to_receive),
            slots: HashMap::new(),
            next_slot_id: 1,
            user_data: None,
            send_on_proxy_removal: None,
        }
    }

    /// Whether this port (scoped to `slot_id`) can still legitimately be
    /// handed more messages. False once the port is closed, or once every
    /// message up to the known final sequence number has been seen.
    pub fn can_accept_more_messages(&self, slot_id: SlotId) -> bool {
        let next_sequence_num = self.message_queue.next_sequence_num();
        if self.state == PortState::Closed {
            return false;
        }
        if (self.peer_closed || self.remove_proxy_on_last_message)
            && self.last_sequence_num_to_receive == next_sequence_num - 1
        {
            return false;
        }

        let Some(slot) = self.slots.get(&slot_id) else {
            return false;
        };
        !slot.peer_closed || slot.last_sequence_num_to_receive >= next_sequence_num
    }

    /// Open the default slot; done when a port becomes receiving.
    pub fn init_default_slot(&mut self, can_signal: bool) {
        self.slots.insert(DEFAULT_SLOT_ID, Slot::new(can_signal));
    }

    /// Open a new locally-allocated slot and return its id.
    pub fn allocate_slot(&mut self) -> SlotId {
        let slot_id = self.next_slot_id;
        self.next_slot_id += 1;
        self.slots.insert(slot_id, Slot::new(true));
        slot_id
    }

    /// Register a slot the peer allocated, under its local alias. Returns
    /// false if that alias is already open.
    pub fn add_slot_from_peer(&mut self, peer_slot_id: SlotId) -> bool {
        let local_slot_id = peer_slot_id ^ PEER_ALLOCATED_SLOT_ID_BIT;
        if self.slots.contains_key(&local_slot_id) {
            return false;
        }
        self.slots.insert(local_slot_id, Slot::new(true));
        true
    }
}

/// Shared storage for one port's locked state.
pub(crate) struct PortHandle {
    pub(crate) lock: Mutex<Port>,
}

impl PortHandle {
    pub fn new(port: Port) -> Arc<Self> {
        Arc::new(Self { lock: Mutex::new(port) })
    }
}

/// A reference to a port: its name plus a handle keeping the underlying
/// storage alive. Operations racing with the port's removal from the node
/// observe [`PortState::Closed`] instead of dangling.
#[derive(Clone)]
pub struct PortRef {
    name: PortName,
    handle: Arc<PortHandle>,
}

impl PortRef {
    pub(crate) fn new(name: PortName, handle: Arc<PortHandle>) -> Self {
        Self { name, handle }
    }

    pub fn name(&self) -> PortName {
        self.name
    }

    pub(crate) fn handle(&self) -> &Arc<PortHandle> {
        &self.handle
    }
}

impl fmt::Debug for PortRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("PortRef").field(&self.name).finish()
    }
}

/// A reference to one slot of one port.
#[derive(Clone, Debug)]
pub struct SlotRef {
    port: PortRef,
    slot_id: SlotId,
}

impl SlotRef {
    pub fn new(port: PortRef, slot_id: SlotId) -> Self {
        Self { port, slot_id }
    }

    pub fn port(&self) -> &PortRef {
        &self.port
    }

    pub fn slot_id(&self) -> SlotId {
        self.slot_id
    }
}
