//! Events exchanged between nodes.
//!
//! Every event names the port that should process it. That target is
//! rewritten at each forwarding hop to be the *receiver's* port name, never
//! the sender's, so an event can cross any number of proxies without either
//! end knowing the chain's shape.
//!
//! Only [`Event::UserMessage`] is sequence-ordered; the rest are control
//! plane and carry whatever sequence bounds they need inside themselves.
//! Everything here is serde-serializable so a transport can pick its own
//! encoding; the core never serializes events itself.

use serde::{Deserialize, Serialize};

use crate::name::{NodeName, PortName};
use crate::port::{SlotId, DEFAULT_SLOT_ID};

/// A message or control signal routed between ports.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Event {
    /// Application payload, possibly carrying ports.
    UserMessage(UserMessageEvent),
    /// A transferred port has been instantiated at its destination; the
    /// referring port may begin proxying.
    PortAccepted(PortAcceptedEvent),
    /// A port announces it has become a proxy and names its replacement.
    ObserveProxy(ObserveProxyEvent),
    /// Reply to [`Event::ObserveProxy`]: the sequence bound at which the
    /// proxy may remove itself, or a request to retry the handshake.
    ObserveProxyAck(ObserveProxyAckEvent),
    /// A peer closed; no messages beyond the carried bound will arrive.
    ObserveClosure(ObserveClosureEvent),
    /// Subject of a cross-node [`merge`](crate::Node::merge_ports).
    MergePort(MergePortEvent),
    /// A single slot closed while the port itself stays open.
    SlotClosed(SlotClosedEvent),
}

impl Event {
    /// The port this event is addressed to.
    pub fn port_name(&self) -> PortName {
        match self {
            Event::UserMessage(e) => e.port_name,
            Event::PortAccepted(e) => e.port_name,
            Event::ObserveProxy(e) => e.port_name,
            Event::ObserveProxyAck(e) => e.port_name,
            Event::ObserveClosure(e) => e.port_name,
            Event::MergePort(e) => e.port_name,
            Event::SlotClosed(e) => e.port_name,
        }
    }

    /// Readdress the event; done at every forwarding hop.
    pub fn set_port_name(&mut self, name: PortName) {
        match self {
            Event::UserMessage(e) => e.port_name = name,
            Event::PortAccepted(e) => e.port_name = name,
            Event::ObserveProxy(e) => e.port_name = name,
            Event::ObserveProxyAck(e) => e.port_name = name,
            Event::ObserveClosure(e) => e.port_name = name,
            Event::MergePort(e) => e.port_name = name,
            Event::SlotClosed(e) => e.port_name = name,
        }
    }
}

/// Snapshot of a port's addressing and sequencing state.
///
/// Carried alongside a transferred port so the receiving node can
/// instantiate an equivalent port with no further round trip.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PortDescriptor {
    pub peer_node_name: NodeName,
    pub peer_port_name: PortName,
    /// Who is introducing this port to its destination. Wiped to the invalid
    /// sentinel once the port has been accepted, so an event forwarded across
    /// further local hops does not accept it twice.
    pub referring_node_name: NodeName,
    pub referring_port_name: PortName,
    pub next_sequence_num_to_send: u64,
    pub next_sequence_num_to_receive: u64,
    pub last_sequence_num_to_receive: u64,
    pub peer_closed: bool,
}

/// Application payload addressed to one port's slot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserMessageEvent {
    port_name: PortName,
    slot_id: SlotId,
    // 0 = not yet stamped by the sending port; a wire-only sentinel.
    sequence_num: u64,
    ports: Vec<PortName>,
    port_descriptors: Vec<PortDescriptor>,
    payload: Vec<u8>,
}

impl UserMessageEvent {
    /// A fresh unaddressed, unstamped message around an opaque payload.
    pub fn new(payload: Vec<u8>) -> Self {
        Self {
            port_name: PortName::INVALID,
            slot_id: DEFAULT_SLOT_ID,
            sequence_num: 0,
            ports: Vec::new(),
            port_descriptors: Vec::new(),
            payload,
        }
    }

    /// Attach a port to be transferred along with this message. The port
    /// must be a receiving port with only its default slot, and must not be
    /// the sending port or its peer; the node enforces this at send time.
    pub fn attach_port(&mut self, port: PortName) {
        self.ports.push(port);
        self.port_descriptors.push(PortDescriptor::default());
    }

    pub fn port_name(&self) -> PortName {
        self.port_name
    }

    pub(crate) fn set_port_name(&mut self, name: PortName) {
        self.port_name = name;
    }

    pub fn slot_id(&self) -> SlotId {
        self.slot_id
    }

    pub(crate) fn set_slot_id(&mut self, slot_id: SlotId) {
        self.slot_id = slot_id;
    }

    /// The sender-assigned sequence number, absent until stamped at send
    /// time (and cleared again when the message is read, so it may be
    /// retransmitted from another port).
    pub fn sequence_num(&self) -> Option<u64> {
        (self.sequence_num != 0).then_some(self.sequence_num)
    }

    pub(crate) fn set_sequence_num(&mut self, sequence_num: u64) {
        self.sequence_num = sequence_num;
    }

    pub(crate) fn clear_sequence_num(&mut self) {
        self.sequence_num = 0;
    }

    /// Names of the ports travelling inside this message.
    pub fn ports(&self) -> &[PortName] {
        &self.ports
    }

    pub fn port_descriptors(&self) -> &[PortDescriptor] {
        &self.port_descriptors
    }

    pub(crate) fn set_transferred_port(&mut self, index: usize, name: PortName, descriptor: PortDescriptor) {
        self.ports[index] = name;
        self.port_descriptors[index] = descriptor;
    }

    pub(crate) fn wipe_referrer(&mut self, index: usize) {
        self.port_descriptors[index].referring_node_name = NodeName::INVALID;
        self.port_descriptors[index].referring_port_name = PortName::INVALID;
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn into_payload(self) -> Vec<u8> {
        self.payload
    }

    /// Size accounted against the receiving queue.
    pub fn num_bytes(&self) -> usize {
        self.payload.len()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortAcceptedEvent {
    pub port_name: PortName,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObserveProxyEvent {
    /// Invalid when broadcast to announce a dead proxy; there is no single
    /// target port in that case.
    pub port_name: PortName,
    pub proxy_node_name: NodeName,
    pub proxy_port_name: PortName,
    pub proxy_target_node_name: NodeName,
    pub proxy_target_port_name: PortName,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObserveProxyAckEvent {
    pub port_name: PortName,
    /// `None` asks the proxy to restart its ObserveProxy handshake: the
    /// responder was itself a proxy and could not compute a final bound.
    pub last_sequence_num: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObserveClosureEvent {
    pub port_name: PortName,
    pub last_sequence_num: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MergePortEvent {
    pub port_name: PortName,
    pub new_port_name: PortName,
    pub new_port_descriptor: PortDescriptor,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SlotClosedEvent {
    pub port_name: PortName,
    pub slot_id: SlotId,
    pub last_sequence_num: u64,
}
