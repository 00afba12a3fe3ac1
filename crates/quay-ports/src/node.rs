//! The routing engine.
//!
//! A [`Node`] owns every port in one routing domain and runs the event
//! state machine that keeps the cross-node port graph consistent: user
//! messages queue and release in sequence order, transferred ports turn
//! into proxies that collapse out of the path once drained, and closures
//! propagate far enough that no port is ever left waiting on a peer that
//! can no longer speak.
//!
//! # Locking
//!
//! One node-wide lock guards the port table and the reverse peer index;
//! per-port locks guard everything else. The node lock is always taken
//! first (see [`crate::lock`]), every peer-address rewrite goes through
//! [`NodeState`] so the reverse index cannot drift, and the delegate is
//! only ever called with no locks held — it may re-enter the node.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::{debug, error, trace, warn};

use crate::error::{PortError, Result};
use crate::event::{
    Event, MergePortEvent, ObserveClosureEvent, ObserveProxyAckEvent, ObserveProxyEvent,
    PortAcceptedEvent, PortDescriptor, SlotClosedEvent, UserMessageEvent,
};
use crate::lock::{self, MultiPortGuard};
use crate::name::{NodeName, PortName};
use crate::port::{
    Port, PortHandle, PortRef, PortState, SlotId, SlotRef, UserData, DEFAULT_SLOT_ID,
    INITIAL_SEQUENCE_NUM, PEER_ALLOCATED_SLOT_ID_BIT,
};
use crate::queue::MessageFilter;

/// How the node ships events to the rest of the graph and surfaces status
/// changes to the embedder. Implementations are called with no node or port
/// locks held and may re-enter the [`Node`] freely.
pub trait NodeDelegate: Send + Sync {
    /// Deliver an event to a specific node (possibly this one). Must
    /// preserve per-sender ordering for user messages.
    fn forward_event(&self, to_node: NodeName, event: Event);

    /// Deliver an event to every known peer node. Only used to announce
    /// proxies orphaned by a lost node.
    fn broadcast_event(&self, event: Event);

    /// Reads on this slot may now observe something new.
    fn slot_status_changed(&self, slot: SlotRef);
}

/// Observable state of one port slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotStatus {
    pub has_messages: bool,
    pub receiving_messages: bool,
    pub peer_closed: bool,
    pub peer_remote: bool,
    pub queued_message_count: usize,
    pub queued_num_bytes: usize,
}

/// Status of a port's default slot.
pub type PortStatus = SlotStatus;

/// What a node tolerates still being open at shutdown.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownPolicy {
    DontAllowLocalPorts,
    AllowLocalPorts,
}

/// The port table and reverse peer index, guarded by one mutex.
///
/// Peer-address mutation lives on methods of this struct, so rewriting a
/// port's peer without holding the node lock is not expressible.
struct NodeState {
    ports: HashMap<PortName, Arc<PortHandle>>,
    /// Which local ports currently claim a given remote port as their peer.
    /// Consulted when a whole node drops out and its peers must observe
    /// synthetic closure.
    peer_port_maps: HashMap<NodeName, HashMap<PortName, HashMap<PortName, PortRef>>>,
}

impl NodeState {
    fn add_port(&mut self, port_name: PortName, handle: Arc<PortHandle>) -> Result<PortRef> {
        if self.ports.contains_key(&port_name) {
            return Err(PortError::PortExists);
        }
        let port_ref = PortRef::new(port_name, handle.clone());
        let (peer_node_name, peer_port_name) = {
            let port = port_ref.lock();
            (port.peer_node_name, port.peer_port_name)
        };
        if peer_port_name.is_valid() {
            self.peer_port_maps
                .entry(peer_node_name)
                .or_default()
                .entry(peer_port_name)
                .or_default()
                .insert(port_name, port_ref.clone());
        }
        self.ports.insert(port_name, handle);
        Ok(port_ref)
    }

    fn update_port_peer_address(
        &mut self,
        port_ref: &PortRef,
        port: &mut Port,
        peer_node_name: NodeName,
        peer_port_name: PortName,
    ) {
        self.remove_from_peer_port_map(port_ref.name(), port.peer_node_name, port.peer_port_name);
        port.peer_node_name = peer_node_name;
        port.peer_port_name = peer_port_name;
        if peer_port_name.is_valid() {
            self.peer_port_maps
                .entry(peer_node_name)
                .or_default()
                .entry(peer_port_name)
                .or_default()
                .insert(port_ref.name(), port_ref.clone());
        }
    }

    fn remove_from_peer_port_map(
        &mut self,
        local_port_name: PortName,
        peer_node_name: NodeName,
        peer_port_name: PortName,
    ) {
        if !peer_port_name.is_valid() {
            return;
        }
        let Some(node_map) = self.peer_port_maps.get_mut(&peer_node_name) else {
            return;
        };
        if let Some(local_ports) = node_map.get_mut(&peer_port_name) {
            local_ports.remove(&local_port_name);
            if local_ports.is_empty() {
                node_map.remove(&peer_port_name);
            }
        }
        if node_map.is_empty() {
            self.peer_port_maps.remove(&peer_node_name);
        }
    }

    fn swap_port_peers(
        &mut self,
        port0_ref: &PortRef,
        port0: &mut Port,
        port1_ref: &PortRef,
        port1: &mut Port,
    ) {
        self.remove_from_peer_port_map(port0_ref.name(), port0.peer_node_name, port0.peer_port_name);
        self.remove_from_peer_port_map(port1_ref.name(), port1.peer_node_name, port1.peer_port_name);
        std::mem::swap(&mut port0.peer_node_name, &mut port1.peer_node_name);
        std::mem::swap(&mut port0.peer_port_name, &mut port1.peer_port_name);
        for (port_ref, port) in [(port0_ref, &*port0), (port1_ref, &*port1)] {
            if port.peer_port_name.is_valid() {
                self.peer_port_maps
                    .entry(port.peer_node_name)
                    .or_default()
                    .entry(port.peer_port_name)
                    .or_default()
                    .insert(port_ref.name(), port_ref.clone());
            }
        }
    }
}

/// One routing domain: the owner of a set of ports and the executor of the
/// event-acceptance state machine. All methods take `&self` and are safe to
/// call from any number of threads at once.
pub struct Node {
    name: NodeName,
    delegate: Arc<dyn NodeDelegate>,
    state: Mutex<NodeState>,
}

impl Node {
    pub fn new(name: NodeName, delegate: Arc<dyn NodeDelegate>) -> Self {
        Self {
            name,
            delegate,
            state: Mutex::new(NodeState {
                ports: HashMap::new(),
                peer_port_maps: HashMap::new(),
            }),
        }
    }

    pub fn name(&self) -> NodeName {
        self.name
    }

    fn lock_state(&self) -> MutexGuard<'_, NodeState> {
        lock::assert_no_ports_held();
        self.state.lock().unwrap()
    }

    fn delegate(&self) -> &dyn NodeDelegate {
        lock::assert_no_ports_held();
        self.delegate.as_ref()
    }

    /// Whether the node could go away right now without stranding anything.
    pub fn can_shutdown_cleanly(&self, policy: ShutdownPolicy) -> bool {
        let state = self.lock_state();
        if policy == ShutdownPolicy::DontAllowLocalPorts {
            return state.ports.is_empty();
        }
        // Entirely local receiving ports are tolerated; anything remote or
        // mid-protocol is not.
        state.ports.iter().all(|(name, handle)| {
            let port_ref = PortRef::new(*name, handle.clone());
            let port = port_ref.lock();
            port.peer_node_name == self.name || port.state == PortState::Receiving
        })
    }

    /// Look up a live port by name.
    pub fn get_port(&self, port_name: &PortName) -> Result<PortRef> {
        let state = self.lock_state();
        let handle = state.ports.get(port_name).ok_or(PortError::UnknownPort)?;
        Ok(PortRef::new(*port_name, handle.clone()))
    }

    /// Allocate a named port with no peer. It cannot be used until
    /// [`initialize_port`](Self::initialize_port) gives it one.
    pub fn create_uninitialized_port(&self) -> Result<PortRef> {
        let port_name = PortName::random();
        let handle = PortHandle::new(Port::new(INITIAL_SEQUENCE_NUM, INITIAL_SEQUENCE_NUM));
        self.add_port_with_name(port_name, handle)
    }

    /// Point an uninitialized port at its peer and open it for business.
    pub fn initialize_port(
        &self,
        port_ref: &PortRef,
        peer_node_name: NodeName,
        peer_port_name: PortName,
    ) -> Result<()> {
        {
            let mut state = self.lock_state();
            let mut port = port_ref.lock();
            if port.state != PortState::Uninitialized {
                return Err(PortError::PortStateUnexpected);
            }
            port.state = PortState::Receiving;
            state.update_port_peer_address(port_ref, &mut port, peer_node_name, peer_port_name);
            port.init_default_slot(true);
        }

        self.delegate()
            .slot_status_changed(SlotRef::new(port_ref.clone(), DEFAULT_SLOT_ID));
        Ok(())
    }

    /// Create two local ports already peered with each other.
    pub fn create_port_pair(&self) -> Result<(PortRef, PortRef)> {
        let port0 = self.create_uninitialized_port()?;
        let port1 = self.create_uninitialized_port()?;
        self.initialize_port(&port0, self.name, port1.name())?;
        self.initialize_port(&port1, self.name, port0.name())?;
        Ok((port0, port1))
    }

    pub fn set_user_data(&self, port_ref: &PortRef, user_data: Arc<dyn UserData>) -> Result<()> {
        let mut port = port_ref.lock();
        if port.state == PortState::Closed {
            return Err(PortError::PortStateUnexpected);
        }
        port.user_data = Some(user_data);
        Ok(())
    }

    pub fn get_user_data(&self, port_ref: &PortRef) -> Result<Option<Arc<dyn UserData>>> {
        let port = port_ref.lock();
        if port.state == PortState::Closed {
            return Err(PortError::PortStateUnexpected);
        }
        Ok(port.user_data.clone())
    }

    /// Close a port. Its peer learns the final sequence number so it can
    /// drain what is already in flight before reporting closure.
    pub fn close_port(&self, port_ref: &PortRef) -> Result<()> {
        self.close_port_or_slot(port_ref, None)
    }

    /// Close one slot. Closing the last remaining slot closes the port.
    pub fn close_port_slot(&self, slot_ref: &SlotRef) -> Result<()> {
        self.close_port_or_slot(slot_ref.port(), Some(slot_ref.slot_id()))
    }

    pub fn get_status(&self, port_ref: &PortRef) -> Result<PortStatus> {
        self.get_slot_status(&SlotRef::new(port_ref.clone(), DEFAULT_SLOT_ID))
    }

    pub fn get_slot_status(&self, slot_ref: &SlotRef) -> Result<SlotStatus> {
        let port = slot_ref.port().lock();
        if port.state != PortState::Receiving {
            return Err(PortError::PortStateUnexpected);
        }
        let peer_closed = if port.peer_closed {
            true
        } else {
            port.slots
                .get(&slot_ref.slot_id())
                .ok_or(PortError::PortStateUnexpected)?
                .peer_closed
        };
        Ok(SlotStatus {
            has_messages: port.message_queue.has_next_message(slot_ref.slot_id()),
            receiving_messages: port.can_accept_more_messages(slot_ref.slot_id()),
            peer_closed,
            peer_remote: port.peer_node_name != self.name,
            queued_message_count: port.message_queue.queued_message_count(),
            queued_num_bytes: port.message_queue.queued_num_bytes(),
        })
    }

    /// Read the next in-order message from the default slot. `Ok(None)`
    /// means nothing is readable yet; [`PortError::PeerClosed`] means
    /// nothing will ever be again.
    pub fn get_message(&self, port_ref: &PortRef) -> Result<Option<UserMessageEvent>> {
        self.get_slot_message(&SlotRef::new(port_ref.clone(), DEFAULT_SLOT_ID), None)
    }

    pub fn get_slot_message(
        &self,
        slot_ref: &SlotRef,
        filter: Option<&mut dyn MessageFilter>,
    ) -> Result<Option<UserMessageEvent>> {
        trace!(port = %slot_ref.port().name(), node = %self.name, "get_message");

        let mut peer_closed = false;
        let mut message = None;
        {
            let mut port = slot_ref.port().lock();
            // A port that has been sent away should no longer be read from;
            // treat that like any other wrong-state use.
            if port.state != PortState::Receiving {
                return Err(PortError::PortStateUnexpected);
            }
            // Let the embedder drain everything already delivered before it
            // hears that the peer closed.
            if port.can_accept_more_messages(slot_ref.slot_id()) {
                message = port
                    .message_queue
                    .get_next_message(Some(slot_ref.slot_id()), filter);
            } else {
                peer_closed = true;
            }
        }

        if let Some(message) = message.as_mut() {
            // Ports delivered inside this message may signal from now on:
            // the embedder has demonstrably read the message carrying them,
            // so it can plausibly act on their status changes.
            for i in 0..message.ports().len() {
                let name = message.ports()[i];
                match self.get_port(&name) {
                    Ok(new_port_ref) => {
                        let mut port = new_port_ref.lock();
                        debug_assert_eq!(port.state, PortState::Receiving);
                        if let Some(slot) = port.slots.get_mut(&DEFAULT_SLOT_ID) {
                            slot.can_signal = true;
                        }
                    }
                    Err(_) => debug_assert!(false, "delivered port missing from this node"),
                }
            }

            // The embedder may retransmit this message from another port;
            // it will be restamped there.
            message.clear_sequence_num();

            // Reading may have exposed messages for slots that no longer
            // exist; drop those and wake whichever slot is now at the front.
            let slot_to_notify = self.flush_unreadable_messages(slot_ref.port());
            if let Some(slot_id) = slot_to_notify {
                if slot_id != slot_ref.slot_id() {
                    self.delegate()
                        .slot_status_changed(SlotRef::new(slot_ref.port().clone(), slot_id));
                }
            }
        }

        if peer_closed {
            return Err(PortError::PeerClosed);
        }
        Ok(message)
    }

    /// Send a message (and any attached ports) from this port to its peer.
    pub fn send_user_message(&self, port_ref: &PortRef, message: UserMessageEvent) -> Result<()> {
        self.send_user_message_on_slot(&SlotRef::new(port_ref.clone(), DEFAULT_SLOT_ID), message)
    }

    pub fn send_user_message_on_slot(
        &self,
        slot_ref: &SlotRef,
        message: UserMessageEvent,
    ) -> Result<()> {
        let attached_ports: Vec<PortName> = message.ports().to_vec();
        let result = self.send_user_message_internal(slot_ref, message);
        if result.is_err() {
            // A failed send must not leak the ports it carried. The sending
            // port itself may appear in the list (invalid, but possible);
            // leave it alone.
            for name in attached_ports {
                if name == slot_ref.port().name() {
                    continue;
                }
                if let Ok(attached) = self.get_port(&name) {
                    let _ = self.close_port(&attached);
                }
            }
        }
        result
    }

    fn send_user_message_internal(
        &self,
        slot_ref: &SlotRef,
        mut message: UserMessageEvent,
    ) -> Result<()> {
        if message.ports().contains(&slot_ref.port().name()) {
            return Err(PortError::CannotSendSelf);
        }

        if slot_ref.slot_id() != DEFAULT_SLOT_ID {
            message.set_slot_id(slot_ref.slot_id() ^ PEER_ALLOCATED_SLOT_ID_BIT);
        }

        let target_node = self.prepare_to_forward_user_message(
            slot_ref,
            PortState::Receiving,
            false,
            &mut message,
        )?;

        // Beyond this point there is no useful error to report: the message
        // is committed to the sequence, so any failure is a transport
        // failure the embedder cannot act on.
        if target_node != self.name {
            self.delegate()
                .forward_event(target_node, Event::UserMessage(message));
            return Ok(());
        }

        if let Err(error) = self.accept_event(Event::UserMessage(message)) {
            debug!(node = %self.name, %error, "local delivery failed");
        }
        Ok(())
    }

    /// Open a new sub-channel on this port. The id is meaningful to the
    /// peer only after it mirrors it via
    /// [`add_slot_from_peer`](Self::add_slot_from_peer).
    pub fn allocate_slot(&self, port_ref: &PortRef) -> SlotId {
        port_ref.lock().allocate_slot()
    }

    /// Register a slot the peer allocated. Returns false if already known.
    pub fn add_slot_from_peer(&self, port_ref: &PortRef, peer_slot_id: SlotId) -> bool {
        port_ref.lock().add_slot_from_peer(peer_slot_id)
    }

    /// Splice this port's channel together with a port on another node.
    /// Both sides proxy and collapse away, leaving their former peers
    /// talking directly.
    pub fn merge_ports(
        &self,
        port_ref: &PortRef,
        destination_node_name: NodeName,
        destination_port_name: PortName,
    ) -> Result<()> {
        let new_port_name;
        let new_port_descriptor;
        {
            let mut state = self.lock_state();
            let mut port = port_ref.lock();
            if port.state != PortState::Receiving {
                return Err(PortError::PortStateUnexpected);
            }
            debug!(
                port = %port_ref.name(), node = %self.name,
                to_port = %destination_port_name, to_node = %destination_node_name,
                "sending MergePort",
            );
            // Ship the port-to-merge over to the destination so the splice
            // happens atomically there.
            let (name, descriptor) =
                self.convert_to_proxy(&mut state, port_ref, &mut port, destination_node_name);
            new_port_name = name;
            new_port_descriptor = descriptor;
        }

        if new_port_descriptor.peer_node_name == self.name && destination_node_name != self.name {
            // The locally retained peer of the new proxy should notice that
            // its peer is now remote.
            if let Ok(local_peer) = self.get_port(&new_port_descriptor.peer_port_name) {
                self.delegate()
                    .slot_status_changed(SlotRef::new(local_peer, DEFAULT_SLOT_ID));
            }
        }

        self.delegate().forward_event(
            destination_node_name,
            Event::MergePort(MergePortEvent {
                port_name: destination_port_name,
                new_port_name,
                new_port_descriptor,
            }),
        );
        Ok(())
    }

    /// Splice two local receiving ports together.
    pub fn merge_local_ports(&self, port0_ref: &PortRef, port1_ref: &PortRef) -> Result<()> {
        debug!(port0 = %port0_ref.name(), port1 = %port1_ref.name(), node = %self.name, "merging local ports");
        self.merge_ports_internal(port0_ref, port1_ref, true)
    }

    /// The transport can no longer reach `node_name`, permanently. Every
    /// local port peered there observes immediate closure.
    pub fn lost_connection_to_node(&self, node_name: NodeName) -> Result<()> {
        debug!(node = %self.name, lost = %node_name, "observing lost connection to node");
        self.destroy_all_ports_with_peer(node_name, None);
        Ok(())
    }

    /// Apply an event from the transport (or from this node itself, when a
    /// delegate routes locally).
    pub fn accept_event(&self, event: Event) -> Result<()> {
        match event {
            Event::UserMessage(event) => self.on_user_message(event),
            Event::PortAccepted(event) => self.on_port_accepted(event),
            Event::ObserveProxy(event) => self.on_observe_proxy(event),
            Event::ObserveProxyAck(event) => self.on_observe_proxy_ack(event),
            Event::ObserveClosure(event) => self.on_observe_closure(event),
            Event::MergePort(event) => self.on_merge_port(event),
            Event::SlotClosed(event) => self.on_slot_closed(event),
        }
    }

    fn add_port_with_name(&self, port_name: PortName, handle: Arc<PortHandle>) -> Result<PortRef> {
        let mut state = self.lock_state();
        let port_ref = state.add_port(port_name, handle).map_err(|error| {
            // A name collision suggests a broken random source.
            error!(port = %port_name, node = %self.name, "refusing to add duplicate port");
            error
        })?;
        debug!(port = %port_name, node = %self.name, "created port");
        Ok(port_ref)
    }

    fn close_port_or_slot(&self, port_ref: &PortRef, slot_id: Option<SlotId>) -> Result<()> {
        let mut undelivered_messages = Vec::new();
        let mut peer_node_name = NodeName::INVALID;
        let mut peer_port_name = PortName::INVALID;
        let mut last_sequence_num = 0;
        let mut was_initialized = false;
        let mut port_closed = false;
        {
            let mut port = port_ref.lock();
            match port.state {
                PortState::Uninitialized => port_closed = true,
                PortState::Receiving => {
                    was_initialized = true;
                    match slot_id {
                        Some(id) if !port.slots.contains_key(&id) => {
                            return Err(PortError::PortStateUnexpected);
                        }
                        Some(id) if port.slots.len() > 1 => {
                            // Closing one of several slots leaves the port
                            // itself open.
                            if let Some(slot) = port.slots.remove(&id) {
                                last_sequence_num = slot.last_sequence_num_sent;
                            }
                            undelivered_messages =
                                port.message_queue.take_all_leading_messages_for_slot(id);
                        }
                        _ => {
                            // No slot named, or the last slot: the port goes.
                            port.state = PortState::Closed;
                            port_closed = true;
                            // The peer gets our final sequence number so it
                            // can consume everything in flight before
                            // reporting closure.
                            last_sequence_num = port.next_sequence_num_to_send - 1;
                            undelivered_messages = port.message_queue.take_all_messages();
                        }
                    }
                    peer_node_name = port.peer_node_name;
                    peer_port_name = port.peer_port_name;
                }
                _ => return Err(PortError::PortStateUnexpected),
            }
        }

        if port_closed {
            self.erase_port(port_ref.name());
        }

        let mut slot_to_notify = None;
        if was_initialized {
            if port_closed {
                debug!(
                    port = %port_ref.name(), node = %self.name,
                    peer = %peer_port_name, peer_node = %peer_node_name,
                    last_sequence_num, "sending ObserveClosure",
                );
                self.delegate().forward_event(
                    peer_node_name,
                    Event::ObserveClosure(ObserveClosureEvent {
                        port_name: peer_port_name,
                        last_sequence_num,
                    }),
                );
            } else if let Some(slot_id) = slot_id {
                self.delegate().forward_event(
                    peer_node_name,
                    Event::SlotClosed(SlotClosedEvent {
                        port_name: peer_port_name,
                        slot_id,
                        last_sequence_num,
                    }),
                );
                slot_to_notify = self.flush_unreadable_messages(port_ref);
            }
            // Undelivered messages may carry ports; close those too rather
            // than leaking them.
            self.discard_unread_messages(undelivered_messages);
        }

        if let Some(slot_id) = slot_to_notify {
            self.delegate()
                .slot_status_changed(SlotRef::new(port_ref.clone(), slot_id));
        }
        Ok(())
    }

    fn on_user_message(&self, mut message: UserMessageEvent) -> Result<()> {
        let port_name = message.port_name();
        trace!(
            sequence_num = ?message.sequence_num(), port = %port_name, node = %self.name,
            num_ports = message.ports().len(), "OnUserMessage",
        );

        // Bind every newly referenced port to this node even if the message
        // ends up rejected: once the message is forwarded, the next hop must
        // still be able to address them, and if it is rejected the fresh
        // ports are simply closed below.
        for i in 0..message.ports().len() {
            let name = message.ports()[i];
            let descriptor = message.port_descriptors()[i].clone();
            if descriptor.referring_node_name == NodeName::INVALID {
                // Already accepted on a previous local hop.
                self.get_port(&name)?;
            } else {
                self.accept_port(name, &descriptor)?;
                // Wiping the referrer lets the event cross further local
                // hops without accepting the port twice.
                message.wipe_referrer(i);
            }
        }

        let receiving_port_ref = self.get_port(&port_name).ok();
        let mut slot_with_next_message = None;
        let mut message_accepted = false;
        let mut should_forward_messages = false;
        let mut message = Some(message);
        if let Some(port_ref) = &receiving_port_ref {
            let mut port = port_ref.lock();
            if let Some(msg) = message.take() {
                let slot_id = msg.slot_id();
                // Reject spurious messages beyond the last expected one.
                if port.can_accept_more_messages(slot_id) {
                    message_accepted = true;
                    slot_with_next_message = port.message_queue.accept_message(msg);
                    match port.state {
                        PortState::Buffering => slot_with_next_message = None,
                        PortState::Proxying => {
                            slot_with_next_message = None;
                            should_forward_messages = true;
                        }
                        _ => {
                            let can_signal = port
                                .slots
                                .get(&slot_id)
                                .map_or(false, |slot| slot.can_signal);
                            if !can_signal {
                                slot_with_next_message = None;
                            }
                        }
                    }
                } else {
                    message = Some(msg);
                }
            }
        }

        if should_forward_messages {
            if let Some(port_ref) = &receiving_port_ref {
                self.forward_user_messages_from_proxy(port_ref)?;
                self.try_remove_proxy(port_ref);
            }
        }

        if !message_accepted {
            debug!(port = %port_name, node = %self.name, "message not accepted");
            if let Some(msg) = message {
                // Close whatever ports it carried so nothing is orphaned.
                self.discard_ports(&msg);

                if let Some(port_ref) = &receiving_port_ref {
                    {
                        // The queue still has to know about the sequence
                        // number, or everything behind it stays blocked.
                        let mut port = port_ref.lock();
                        port.message_queue.ignore_message(&msg);
                    }
                    // Discarding may have unblocked a later queued message.
                    slot_with_next_message = self.flush_unreadable_messages(port_ref);
                }
            }
        }

        if let Some(slot_id) = slot_with_next_message {
            if let Some(port_ref) = receiving_port_ref {
                self.delegate()
                    .slot_status_changed(SlotRef::new(port_ref, slot_id));
            }
        }
        Ok(())
    }

    fn on_port_accepted(&self, event: PortAcceptedEvent) -> Result<()> {
        let port_ref = self.get_port(&event.port_name)?;
        debug!(port = %port_ref.name(), node = %self.name, "PortAccepted");
        self.begin_proxying(&port_ref)
    }

    fn on_observe_proxy(&self, mut event: ObserveProxyEvent) -> Result<()> {
        if event.port_name == PortName::INVALID {
            // A broadcast announcing a dead proxy. Ports whose peer it was
            // treat this as peer closure; proxies behind it will erase
            // themselves and broadcast their own death in turn.
            self.destroy_all_ports_with_peer(event.proxy_node_name, Some(event.proxy_port_name));
            return Ok(());
        }

        // The port may already have been closed locally; its ObserveClosure
        // will settle the proxy instead.
        let Ok(port_ref) = self.get_port(&event.port_name) else {
            debug!(port = %event.port_name, node = %self.name, "ObserveProxy for unknown port");
            return Ok(());
        };

        debug!(
            port = %port_ref.name(), node = %self.name,
            proxy = %event.proxy_port_name, proxy_node = %event.proxy_node_name,
            target = %event.proxy_target_port_name, target_node = %event.proxy_target_node_name,
            "ObserveProxy",
        );

        let mut slots_to_update = Vec::new();
        let mut event_to_forward: Option<(NodeName, Event)> = None;
        {
            let mut state = self.lock_state();
            let mut port = port_ref.lock();

            if port.peer_node_name == event.proxy_node_name
                && port.peer_port_name == event.proxy_port_name
            {
                if port.state == PortState::Receiving {
                    // Skip the proxy: talk to its target directly, and tell
                    // it the last sequence number it has to wait for.
                    state.update_port_peer_address(
                        &port_ref,
                        &mut port,
                        event.proxy_target_node_name,
                        event.proxy_target_port_name,
                    );
                    event_to_forward = Some((
                        event.proxy_node_name,
                        Event::ObserveProxyAck(ObserveProxyAckEvent {
                            port_name: event.proxy_port_name,
                            last_sequence_num: Some(port.next_sequence_num_to_send - 1),
                        }),
                    ));
                    slots_to_update.extend(port.slots.keys().copied());
                } else {
                    // As a proxy ourselves we cannot name a final sequence
                    // number; some other port may still be sending to our
                    // peer. Ask the observed proxy to redo the handshake,
                    // but only once we are gone, or the two of us would
                    // bounce this off each other in a busy loop.
                    debug!(
                        proxy = %event.proxy_port_name, proxy_node = %event.proxy_node_name,
                        node = %self.name, "delaying ObserveProxyAck until proxy removal",
                    );
                    port.send_on_proxy_removal = Some((
                        event.proxy_node_name,
                        Event::ObserveProxyAck(ObserveProxyAckEvent {
                            port_name: event.proxy_port_name,
                            last_sequence_num: None,
                        }),
                    ));
                }
            } else {
                // Not about our peer; pass it around the cycle until it
                // reaches the port that refers to the proxy.
                let target_node = port.peer_node_name;
                event.port_name = port.peer_port_name;
                event_to_forward = Some((target_node, Event::ObserveProxy(event)));
            }
        }

        if let Some((target_node, event)) = event_to_forward {
            self.delegate().forward_event(target_node, event);
        }
        for slot_id in slots_to_update {
            self.delegate()
                .slot_status_changed(SlotRef::new(port_ref.clone(), slot_id));
        }
        Ok(())
    }

    fn on_observe_proxy_ack(&self, event: ObserveProxyAckEvent) -> Result<()> {
        debug!(
            port = %event.port_name, node = %self.name,
            last_sequence_num = ?event.last_sequence_num, "ObserveProxyAck",
        );

        // The port may have observed closure first and gone away; fine.
        let port_ref = self.get_port(&event.port_name)?;

        let try_remove_proxy_immediately;
        {
            let mut port = port_ref.lock();
            if port.state != PortState::Proxying {
                warn!(port = %port_ref.name(), node = %self.name, state = ?port.state, "ObserveProxyAck for a non-proxy");
                return Err(PortError::PortStateUnexpected);
            }

            match event.last_sequence_num {
                Some(last_sequence_num) => {
                    // Removable once the last addressed message has been
                    // received and forwarded.
                    port.remove_proxy_on_last_message = true;
                    port.last_sequence_num_to_receive = last_sequence_num;
                    try_remove_proxy_immediately = true;
                }
                // The responder could not compute a bound; run the
                // handshake again.
                None => try_remove_proxy_immediately = false,
            }
        }

        if try_remove_proxy_immediately {
            self.try_remove_proxy(&port_ref);
        } else {
            self.initiate_proxy_removal(&port_ref);
        }
        Ok(())
    }

    fn on_observe_closure(&self, mut event: ObserveClosureEvent) -> Result<()> {
        // Fine if the port is already gone; it was closed on this side too.
        let Ok(port_ref) = self.get_port(&event.port_name) else {
            return Ok(());
        };

        let mut slots_to_update = Vec::new();
        let peer_node_name;
        let peer_port_name;
        let mut try_remove_proxy = false;
        {
            let mut port = port_ref.lock();

            port.peer_closed = true;
            port.last_sequence_num_to_receive = event.last_sequence_num;

            debug!(
                port = %port_ref.name(), node = %self.name, state = ?port.state,
                last_sequence_num = event.last_sequence_num, "ObserveClosure",
            );

            // Always forwarded, even past the receiving port that actually
            // cares: beyond it the event only reaches dead-end proxies,
            // which need it to learn they can go away.
            // TODO: a dedicated event for that sweep would read better than
            // reusing ObserveClosure from a port that is not closed.
            if port.state == PortState::Receiving {
                slots_to_update.extend(port.slots.keys().copied());
                event.last_sequence_num = port.next_sequence_num_to_send - 1;
            } else {
                // Not yet at the receiving peer; forward as-is, and see
                // about removing ourselves if we are a proxy, since our
                // peer cannot take part in removal anymore.
                port.remove_proxy_on_last_message = true;
                if port.state == PortState::Proxying {
                    try_remove_proxy = true;
                }
            }

            peer_node_name = port.peer_node_name;
            peer_port_name = port.peer_port_name;
        }

        if try_remove_proxy {
            self.try_remove_proxy(&port_ref);
        }

        event.port_name = peer_port_name;
        self.delegate()
            .forward_event(peer_node_name, Event::ObserveClosure(event));

        for slot_id in slots_to_update {
            self.delegate()
                .slot_status_changed(SlotRef::new(port_ref.clone(), slot_id));
        }
        Ok(())
    }

    fn on_merge_port(&self, event: MergePortEvent) -> Result<()> {
        let port_ref = self.get_port(&event.port_name).ok();

        debug!(
            port = %event.port_name, node = %self.name,
            new_port = %event.new_port_name,
            peer = %event.new_port_descriptor.peer_port_name,
            peer_node = %event.new_port_descriptor.peer_node_name,
            "MergePort",
        );

        // Accept the new port first regardless; failing to do so would
        // strand its peer receiving port indefinitely.
        if self
            .accept_port(event.new_port_name, &event.new_port_descriptor)
            .is_err()
        {
            if let Some(port_ref) = port_ref {
                let _ = self.close_port(&port_ref);
            }
            return Err(PortError::PortStateUnexpected);
        }

        let new_port_ref = self.get_port(&event.new_port_name).ok();
        match (port_ref, new_port_ref) {
            (Some(port_ref), Some(new_port_ref)) => {
                self.merge_ports_internal(&port_ref, &new_port_ref, false)
            }
            (None, Some(new_port_ref)) => {
                let _ = self.close_port(&new_port_ref);
                Err(PortError::UnknownPort)
            }
            (Some(port_ref), None) => {
                let _ = self.close_port(&port_ref);
                Err(PortError::UnknownPort)
            }
            (None, None) => Err(PortError::UnknownPort),
        }
    }

    fn on_slot_closed(&self, event: SlotClosedEvent) -> Result<()> {
        // Fine if the port is already gone.
        let Ok(port_ref) = self.get_port(&event.port_name) else {
            return Ok(());
        };

        let local_slot_id = if event.slot_id == DEFAULT_SLOT_ID {
            DEFAULT_SLOT_ID
        } else {
            event.slot_id ^ PEER_ALLOCATED_SLOT_ID_BIT
        };

        {
            let mut port = port_ref.lock();
            // The local slot may have been closed already; nothing to do.
            let Some(slot) = port.slots.get_mut(&local_slot_id) else {
                return Ok(());
            };
            slot.peer_closed = true;
            slot.last_sequence_num_to_receive = event.last_sequence_num;
        }

        self.delegate()
            .slot_status_changed(SlotRef::new(port_ref, local_slot_id));
        Ok(())
    }

    fn merge_ports_internal(
        &self,
        port0_ref: &PortRef,
        port1_ref: &PortRef,
        allow_close_on_bad_state: bool,
    ) -> Result<()> {
        if port0_ref.name() == port1_ref.name() {
            return Err(PortError::PortStateUnexpected);
        }
        {
            let mut state = self.lock_state();
            let port_refs = [port0_ref.clone(), port1_ref.clone()];
            let mut locker = MultiPortGuard::lock(&port_refs);
            let (port0, port1) = locker.pair_mut(port0_ref, port1_ref);

            // Merging requires both ports receiving, not each other's peer,
            // and never having sent a user message.
            let mergeable = port0.state == PortState::Receiving
                && port1.state == PortState::Receiving
                && !(port0.peer_node_name == self.name
                    && port0.peer_port_name == port1_ref.name())
                && !(port1.peer_node_name == self.name
                    && port1.peer_port_name == port0_ref.name())
                && port0.next_sequence_num_to_send == INITIAL_SEQUENCE_NUM
                && port1.next_sequence_num_to_send == INITIAL_SEQUENCE_NUM;

            if !mergeable {
                // Only close a port that was at least properly receiving;
                // abruptly closing a proxy would corrupt the graph.
                let close_port0 =
                    port0.state == PortState::Receiving || allow_close_on_bad_state;
                let close_port1 =
                    port1.state == PortState::Receiving || allow_close_on_bad_state;
                drop(locker);
                drop(state);
                if close_port0 {
                    let _ = self.close_port(port0_ref);
                }
                if close_port1 {
                    let _ = self.close_port(port1_ref);
                }
                return Err(PortError::PortStateUnexpected);
            }

            // Each port adopts the other's peer, and both become proxies.
            state.swap_port_peers(port0_ref, port0, port1_ref, port1);
            port0.state = PortState::Proxying;
            port1.state = PortState::Proxying;
            if port0.peer_closed {
                port0.remove_proxy_on_last_message = true;
            }
            if port1.peer_closed {
                port1.remove_proxy_on_last_message = true;
            }
        }

        // Flush whatever was already queued on the new proxies; on success,
        // complete the merge by starting proxy removal on both ends.
        if self.forward_user_messages_from_proxy(port0_ref).is_ok()
            && self.forward_user_messages_from_proxy(port1_ref).is_ok()
        {
            for port_ref in [port0_ref, port1_ref] {
                let (try_remove_proxy_immediately, closure_event) = {
                    let port = port_ref.lock();
                    debug_assert_eq!(port.state, PortState::Proxying);
                    let immediately = port.remove_proxy_on_last_message;
                    // With either end of the cycle already closed, an
                    // ObserveClosure is propagated instead of a handshake.
                    let closure = (immediately || port.peer_closed).then(|| {
                        (
                            port.peer_node_name,
                            Event::ObserveClosure(ObserveClosureEvent {
                                port_name: port.peer_port_name,
                                last_sequence_num: port.last_sequence_num_to_receive,
                            }),
                        )
                    });
                    (immediately, closure)
                };

                if try_remove_proxy_immediately {
                    self.try_remove_proxy(port_ref);
                } else {
                    self.initiate_proxy_removal(port_ref);
                }

                if let Some((target_node, event)) = closure_event {
                    self.delegate().forward_event(target_node, event);
                }
            }
            return Ok(());
        }

        // Draining failed; undo the peer swap so the graph stays
        // consistent, then close both ends.
        {
            let mut state = self.lock_state();
            let port_refs = [port0_ref.clone(), port1_ref.clone()];
            let mut locker = MultiPortGuard::lock(&port_refs);
            let (port0, port1) = locker.pair_mut(port0_ref, port1_ref);
            state.swap_port_peers(port0_ref, port0, port1_ref, port1);
            port0.remove_proxy_on_last_message = false;
            port1.remove_proxy_on_last_message = false;
            debug_assert_eq!(port0.state, PortState::Proxying);
            debug_assert_eq!(port1.state, PortState::Proxying);
            port0.state = PortState::Receiving;
            port1.state = PortState::Receiving;
        }

        let _ = self.close_port(port0_ref);
        let _ = self.close_port(port1_ref);
        Err(PortError::PortStateUnexpected)
    }

    /// Turn a receiving port into the buffering precursor of a proxy,
    /// snapshotting the descriptor that will recreate it on `to_node`.
    /// Requires both the node lock (peer rewrite) and the port's lock.
    fn convert_to_proxy(
        &self,
        state: &mut NodeState,
        port_ref: &PortRef,
        port: &mut Port,
        to_node_name: NodeName,
    ) -> (PortName, PortDescriptor) {
        let new_port_name = PortName::random();

        // No messages go to the new peer until it is known to exist; until
        // then they accumulate locally.
        debug_assert_eq!(port.state, PortState::Receiving);
        port.state = PortState::Buffering;

        // A proxy for an already-closed peer can go away as soon as it has
        // forwarded its last expected message.
        if port.peer_closed {
            port.remove_proxy_on_last_message = true;
        }

        let descriptor = PortDescriptor {
            peer_node_name: port.peer_node_name,
            peer_port_name: port.peer_port_name,
            referring_node_name: self.name,
            referring_port_name: port_ref.name(),
            next_sequence_num_to_send: port.next_sequence_num_to_send,
            next_sequence_num_to_receive: port.message_queue.next_sequence_num(),
            last_sequence_num_to_receive: port.last_sequence_num_to_receive,
            peer_closed: port.peer_closed,
        };

        // The local port now points at the port's future home, so local
        // sends already head the right way.
        state.update_port_peer_address(port_ref, port, to_node_name, new_port_name);

        (new_port_name, descriptor)
    }

    /// Instantiate a port described by a descriptor, then tell the referrer
    /// it may begin proxying.
    fn accept_port(&self, port_name: PortName, descriptor: &PortDescriptor) -> Result<()> {
        let mut port = Port::new(
            descriptor.next_sequence_num_to_send,
            descriptor.next_sequence_num_to_receive,
        );
        port.state = PortState::Receiving;
        port.peer_node_name = descriptor.peer_node_name;
        port.peer_port_name = descriptor.peer_port_name;
        port.last_sequence_num_to_receive = descriptor.last_sequence_num_to_receive;
        port.peer_closed = descriptor.peer_closed;

        // Transferred ports always arrive with exactly the default slot;
        // multi-slot ports are not transferrable. The slot stays quiet
        // until the embedder reads the message that delivered the port.
        port.init_default_slot(false);
        if let Some(slot) = port.slots.get_mut(&DEFAULT_SLOT_ID) {
            slot.peer_closed = descriptor.peer_closed;
            slot.last_sequence_num_to_receive = descriptor.last_sequence_num_to_receive;
            slot.last_sequence_num_sent = descriptor.next_sequence_num_to_send - 1;
        }

        debug!(
            port = %port_name, node = %self.name,
            peer_closed = descriptor.peer_closed,
            last_sequence_num_to_receive = descriptor.last_sequence_num_to_receive,
            "accepting port",
        );

        self.add_port_with_name(port_name, PortHandle::new(port))?;

        self.delegate().forward_event(
            descriptor.referring_node_name,
            Event::PortAccepted(PortAcceptedEvent {
                port_name: descriptor.referring_port_name,
            }),
        );
        Ok(())
    }

    /// Stamp, validate and (for remote targets) proxy-convert a message's
    /// attachments, locking the forwarding port and every attached port
    /// simultaneously. Returns the node the event must be delivered to.
    fn prepare_to_forward_user_message(
        &self,
        forwarding_slot_ref: &SlotRef,
        expected_state: PortState,
        ignore_closed_peer: bool,
        message: &mut UserMessageEvent,
    ) -> Result<NodeName> {
        let target_node_name;
        let mut local_peers_to_notify = Vec::new();
        {
            let mut state = self.lock_state();

            let mut port_refs = Vec::with_capacity(message.ports().len() + 1);
            port_refs.push(forwarding_slot_ref.port().clone());
            for name in message.ports() {
                // Attached ports are always bound to this node by now.
                let Some(handle) = state.ports.get(name) else {
                    return Err(PortError::UnknownPort);
                };
                port_refs.push(PortRef::new(*name, handle.clone()));
            }
            let mut locker = MultiPortGuard::lock(&port_refs);

            let forwarding_port = locker.port_mut(forwarding_slot_ref.port());
            target_node_name = forwarding_port.peer_node_name;
            let target_is_remote = target_node_name != self.name;

            if forwarding_port.state != expected_state {
                return Err(PortError::PortStateUnexpected);
            }
            if forwarding_port.peer_closed && !ignore_closed_peer {
                return Err(PortError::PeerClosed);
            }

            // A proxy forwards messages that are already stamped; fresh
            // sends take the port's next outgoing number.
            if message.sequence_num().is_none() {
                message.set_sequence_num(forwarding_port.next_sequence_num_to_send);
            }
            let forwarding_peer_port_name = forwarding_port.peer_port_name;

            if !message.ports().is_empty() {
                // Attached ports must be receiving, single-slot, distinct,
                // and not the sender's own peer.
                for (i, attached_ref) in port_refs[1..].iter().enumerate() {
                    if port_refs[1..][..i]
                        .iter()
                        .any(|other| other.name() == attached_ref.name())
                    {
                        return Err(PortError::PortStateUnexpected);
                    }
                    let attached_port = locker.port_mut(attached_ref);
                    if attached_port.state != PortState::Receiving
                        || attached_port.slots.len() != 1
                        || !attached_port.slots.contains_key(&DEFAULT_SLOT_ID)
                    {
                        return Err(PortError::PortStateUnexpected);
                    }
                    if attached_ref.name() == forwarding_peer_port_name {
                        return Err(PortError::CannotSendPeer);
                    }
                }

                if target_is_remote {
                    // Only an event actually leaving the node pays for proxy
                    // conversion; intra-node hops carry their ports as-is,
                    // which avoids a great deal of churn for events that hop
                    // locally once or twice before going remote (or never).
                    for (i, attached_ref) in port_refs[1..].iter().enumerate() {
                        let attached_port = locker.port_mut(attached_ref);
                        let (new_name, descriptor) = self.convert_to_proxy(
                            &mut state,
                            attached_ref,
                            attached_port,
                            target_node_name,
                        );
                        message.set_transferred_port(i, new_name, descriptor);
                    }
                }
            }

            // The message is definitely going out; commit the sequence.
            let forwarding_port = locker.port_mut(forwarding_slot_ref.port());
            let sequence_num_sent = forwarding_port.next_sequence_num_to_send;
            if let Some(slot) = forwarding_port
                .slots
                .get_mut(&forwarding_slot_ref.slot_id())
            {
                slot.last_sequence_num_sent = sequence_num_sent;
            }
            forwarding_port.next_sequence_num_to_send += 1;

            message.set_port_name(forwarding_peer_port_name);
            trace!(
                sequence_num = ?message.sequence_num(),
                from = %forwarding_slot_ref.port().name(), node = %self.name,
                to = %forwarding_peer_port_name, to_node = %target_node_name,
                "sending message",
            );

            if target_is_remote {
                for descriptor in message.port_descriptors() {
                    if descriptor.peer_node_name == self.name {
                        local_peers_to_notify.push(descriptor.peer_port_name);
                    }
                }
            }
        }

        // Local peers of just-converted ports get a status update so they
        // notice their peer went remote.
        for peer_port_name in local_peers_to_notify {
            if let Ok(local_peer) = self.get_port(&peer_port_name) {
                self.delegate()
                    .slot_status_changed(SlotRef::new(local_peer, DEFAULT_SLOT_ID));
            }
        }

        Ok(target_node_name)
    }

    /// A buffering port's destination confirmed; start forwarding.
    fn begin_proxying(&self, port_ref: &PortRef) -> Result<()> {
        {
            let mut port = port_ref.lock();
            if port.state != PortState::Buffering {
                warn!(port = %port_ref.name(), node = %self.name, state = ?port.state, "PortAccepted for a port that is not buffering");
                return Err(PortError::PortStateUnexpected);
            }
            port.state = PortState::Proxying;
        }

        self.forward_user_messages_from_proxy(port_ref)?;

        let (try_remove_proxy_immediately, closure_event) = {
            let port = port_ref.lock();
            if port.state != PortState::Proxying {
                error!(port = %port_ref.name(), node = %self.name, state = ?port.state, "proxy state changed out from under us");
                return Err(PortError::PortStateUnexpected);
            }
            let immediately = port.remove_proxy_on_last_message;
            // Closure was already known before the transfer completed;
            // propagate it to our peer rather than starting a handshake.
            let closure = immediately.then(|| {
                (
                    port.peer_node_name,
                    Event::ObserveClosure(ObserveClosureEvent {
                        port_name: port.peer_port_name,
                        last_sequence_num: port.last_sequence_num_to_receive,
                    }),
                )
            });
            (immediately, closure)
        };

        if try_remove_proxy_immediately {
            self.try_remove_proxy(port_ref);
            if let Some((target_node, event)) = closure_event {
                self.delegate().forward_event(target_node, event);
            }
        } else {
            self.initiate_proxy_removal(port_ref);
        }
        Ok(())
    }

    /// Drain a proxy's queue toward its peer, strictly in sequence order so
    /// the queue's next-sequence bookkeeping keeps telling us whether the
    /// proxy has seen everything it is owed.
    fn forward_user_messages_from_proxy(&self, port_ref: &PortRef) -> Result<()> {
        loop {
            let message = {
                let mut port = port_ref.lock();
                port.message_queue.get_next_message(None, None)
            };
            let Some(mut message) = message else {
                return Ok(());
            };

            let target_node = self.prepare_to_forward_user_message(
                &SlotRef::new(port_ref.clone(), DEFAULT_SLOT_ID),
                PortState::Proxying,
                true,
                &mut message,
            )?;
            self.delegate()
                .forward_event(target_node, Event::UserMessage(message));
        }
    }

    /// Announce this proxy to the graph so the port referring to it can
    /// skip the hop. Answered by ObserveProxyAck, or by ObserveClosure if
    /// the peer closed in the meantime.
    fn initiate_proxy_removal(&self, port_ref: &PortRef) {
        let (peer_node_name, peer_port_name) = {
            let port = port_ref.lock();
            (port.peer_node_name, port.peer_port_name)
        };

        self.delegate().forward_event(
            peer_node_name,
            Event::ObserveProxy(ObserveProxyEvent {
                port_name: peer_port_name,
                proxy_node_name: self.name,
                proxy_port_name: port_ref.name(),
                proxy_target_node_name: peer_node_name,
                proxy_target_port_name: peer_port_name,
            }),
        );
    }

    /// Erase a proxy once its removal bound is known and every message up
    /// to that bound has been received and forwarded. Never drops messages:
    /// if more are owed, the proxy stays until they pass through.
    fn try_remove_proxy(&self, port_ref: &PortRef) {
        let mut should_erase = false;
        let mut removal_event = None;
        {
            let mut port = port_ref.lock();
            debug_assert_eq!(port.state, PortState::Proxying);

            // ObserveProxyAck not seen yet; nothing licenses removal.
            if !port.remove_proxy_on_last_message {
                return;
            }

            if !port.can_accept_more_messages(DEFAULT_SLOT_ID) {
                should_erase = true;
                removal_event = port.send_on_proxy_removal.take();
            } else {
                debug!(port = %port_ref.name(), node = %self.name, "proxy waiting for more messages");
            }
        }

        if should_erase {
            self.erase_port(port_ref.name());
        }

        // A deferred ack owed from an ObserveProxy that caught us mid-chain.
        if let Some((target_node, event)) = removal_event {
            self.delegate().forward_event(target_node, event);
        }
    }

    /// Treat every local port peered with `node_name` (narrowed to one peer
    /// port if given) as having observed immediate peer closure. Proxies
    /// among them cannot notify anyone locally, so they are erased outright
    /// and their death broadcast for the rest of the graph to react to.
    fn destroy_all_ports_with_peer(&self, node_name: NodeName, port_name: Option<PortName>) {
        let mut ports_to_notify: Vec<PortRef> = Vec::new();
        let mut dead_proxies_to_broadcast: Vec<PortName> = Vec::new();
        let mut undelivered_messages: Vec<UserMessageEvent> = Vec::new();

        {
            let state = self.lock_state();
            let Some(node_peer_port_map) = state.peer_port_maps.get(&node_name) else {
                return;
            };

            let peer_port_sets: Vec<&HashMap<PortName, PortRef>> = match port_name {
                Some(peer_port_name) => match node_peer_port_map.get(&peer_port_name) {
                    Some(local_ports) => vec![local_ports],
                    None => return,
                },
                None => node_peer_port_map.values().collect(),
            };

            for local_ports in peer_port_sets {
                // Almost always a single entry; several appear only
                // transiently while extra ports bypass proxies waiting to
                // be torn down.
                for local_port_ref in local_ports.values() {
                    let mut port = local_port_ref.lock();

                    if !port.peer_closed {
                        // Akin to a broken pipe: messages that will never
                        // arrive are not waited for.
                        port.peer_closed = true;
                        port.last_sequence_num_to_receive =
                            port.message_queue.next_sequence_num() - 1;

                        if port.state == PortState::Receiving {
                            ports_to_notify.push(local_port_ref.clone());
                        }
                    }

                    // A proxy with no live peer cannot run the normal
                    // removal handshake. Erase it and broadcast its death
                    // so ports further down the chain run this same logic.
                    if port.state != PortState::Receiving {
                        dead_proxies_to_broadcast.push(local_port_ref.name());
                        undelivered_messages.extend(port.message_queue.take_all_messages());
                    }
                }
            }
        }

        for proxy_name in &dead_proxies_to_broadcast {
            self.erase_port(*proxy_name);
            debug!(port = %proxy_name, node = %self.name, "forcibly deleted port");
        }

        // Wake receiving slots that just observed simulated peer closure.
        for port_ref in &ports_to_notify {
            let slots_to_update: Vec<SlotId> = {
                let port = port_ref.lock();
                port.slots.keys().copied().collect()
            };
            for slot_id in slots_to_update {
                self.delegate()
                    .slot_status_changed(SlotRef::new(port_ref.clone(), slot_id));
            }
        }

        for proxy_name in dead_proxies_to_broadcast {
            self.delegate().broadcast_event(Event::ObserveProxy(ObserveProxyEvent {
                port_name: PortName::INVALID,
                proxy_node_name: self.name,
                proxy_port_name: proxy_name,
                proxy_target_node_name: NodeName::INVALID,
                proxy_target_port_name: PortName::INVALID,
            }));

            // The port pointing at this dead proxy may live on this very
            // node. Recursion depth is bounded by the proxy chain, which
            // eager collapse keeps short.
            self.destroy_all_ports_with_peer(self.name, Some(proxy_name));
        }

        self.discard_unread_messages(undelivered_messages);
    }

    /// Remove a port from the table and the peer index. Queued messages are
    /// dropped only after every lock is released; payload drop runs
    /// embedder code.
    fn erase_port(&self, port_name: PortName) {
        let handle;
        {
            let mut state = self.lock_state();
            let Some(removed) = state.ports.remove(&port_name) else {
                return;
            };
            let port_ref = PortRef::new(port_name, removed.clone());
            let (peer_node_name, peer_port_name) = {
                let port = port_ref.lock();
                (port.peer_node_name, port.peer_port_name)
            };
            state.remove_from_peer_port_map(port_name, peer_node_name, peer_port_name);
            handle = removed;
        }

        let leftover_messages = {
            let port_ref = PortRef::new(port_name, handle);
            let mut port = port_ref.lock();
            port.message_queue.take_all_messages()
        };
        drop(leftover_messages);

        debug!(port = %port_name, node = %self.name, "deleted port");
    }

    /// Close the ports attached to each message, then drop the messages —
    /// all with no locks held.
    fn discard_unread_messages(&self, messages: Vec<UserMessageEvent>) {
        lock::assert_no_ports_held();
        for message in &messages {
            self.discard_ports(message);
        }
    }

    fn discard_ports(&self, message: &UserMessageEvent) {
        for name in message.ports() {
            if let Ok(port_ref) = self.get_port(name) {
                let _ = self.close_port(&port_ref);
            }
        }
    }

    /// Drop leading queued messages whose slot no longer exists, and say
    /// which slot (if any) now has a readable message. Returns `None` when
    /// nothing was flushed.
    fn flush_unreadable_messages(&self, port_ref: &PortRef) -> Option<SlotId> {
        let mut unread_messages = Vec::new();
        let mut slot_to_notify = None;
        {
            let mut port = port_ref.lock();
            while let Some(next_message_slot) = port.message_queue.next_message_slot() {
                if port.slots.contains_key(&next_message_slot) {
                    // Still a live slot; leave the message and report it.
                    slot_to_notify = Some(next_message_slot);
                    break;
                }
                let flushed = port
                    .message_queue
                    .take_all_leading_messages_for_slot(next_message_slot);
                unread_messages.extend(flushed);
            }
        }

        if unread_messages.is_empty() {
            return None;
        }
        self.discard_unread_messages(unread_messages);
        slot_to_notify
    }
}

impl Drop for Node {
    fn drop(&mut self) {
        let state = self.state.lock().unwrap();
        if !state.ports.is_empty() {
            warn!(node = %self.name, live_ports = state.ports.len(), "unclean shutdown");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::Mutex;

    use super::*;

    /// Queues every event; tests pump them back into the node, which is
    /// what a real transport does for self-addressed traffic.
    #[derive(Default)]
    struct TestDelegate {
        events: Mutex<VecDeque<(NodeName, Event)>>,
        notified_slots: Mutex<Vec<(PortName, SlotId)>>,
    }

    impl TestDelegate {
        fn take_event(&self) -> Option<(NodeName, Event)> {
            self.events.lock().unwrap().pop_front()
        }
    }

    impl NodeDelegate for TestDelegate {
        fn forward_event(&self, to_node: NodeName, event: Event) {
            self.events.lock().unwrap().push_back((to_node, event));
        }

        fn broadcast_event(&self, _event: Event) {}

        fn slot_status_changed(&self, slot: SlotRef) {
            self.notified_slots
                .lock()
                .unwrap()
                .push((slot.port().name(), slot.slot_id()));
        }
    }

    fn test_node() -> (Node, Arc<TestDelegate>) {
        let delegate = Arc::new(TestDelegate::default());
        let node = Node::new(NodeName::random(), delegate.clone());
        (node, delegate)
    }

    fn pump(node: &Node, delegate: &TestDelegate) {
        while let Some((to_node, event)) = delegate.take_event() {
            assert_eq!(to_node, node.name(), "single-node test routed off-node");
            let _ = node.accept_event(event);
        }
    }

    fn send(node: &Node, port: &PortRef, payload: &[u8]) -> Result<()> {
        node.send_user_message(port, UserMessageEvent::new(payload.to_vec()))
    }

    #[test]
    fn round_trip() {
        let (node, delegate) = test_node();
        let (a, b) = node.create_port_pair().unwrap();

        send(&node, &a, b"hello").unwrap();
        pump(&node, &delegate);

        let message = node.get_message(&b).unwrap().unwrap();
        assert_eq!(message.payload(), b"hello");
        // Sequence number is cleared on read so the message could be
        // retransmitted elsewhere.
        assert_eq!(message.sequence_num(), None);

        assert!(node.get_message(&b).unwrap().is_none());
    }

    #[test]
    fn messages_arrive_in_order() {
        let (node, delegate) = test_node();
        let (a, b) = node.create_port_pair().unwrap();

        for i in 0..5u8 {
            send(&node, &a, &[i]).unwrap();
        }
        pump(&node, &delegate);

        for i in 0..5u8 {
            let message = node.get_message(&b).unwrap().unwrap();
            assert_eq!(message.payload(), &[i]);
        }
        assert!(node.get_message(&b).unwrap().is_none());
    }

    #[test]
    fn close_propagates_to_peer() {
        let (node, delegate) = test_node();
        let (a, b) = node.create_port_pair().unwrap();

        send(&node, &a, b"last words").unwrap();
        node.close_port(&a).unwrap();
        pump(&node, &delegate);

        // Everything in flight is still readable...
        let status = node.get_status(&b).unwrap();
        assert!(status.peer_closed);
        assert!(status.has_messages);
        assert!(node.get_message(&b).unwrap().is_some());

        // ...and only then does the closure surface.
        assert_eq!(node.get_message(&b).unwrap_err(), PortError::PeerClosed);
    }

    #[test]
    fn close_is_not_repeatable_by_name() {
        let (node, delegate) = test_node();
        let (a, _b) = node.create_port_pair().unwrap();
        let name = a.name();

        node.close_port(&a).unwrap();
        pump(&node, &delegate);

        assert_eq!(node.get_port(&name).unwrap_err(), PortError::UnknownPort);
    }

    #[test]
    fn cannot_send_port_over_itself() {
        let (node, _delegate) = test_node();
        let (a, _b) = node.create_port_pair().unwrap();

        let mut message = UserMessageEvent::new(Vec::new());
        message.attach_port(a.name());
        assert_eq!(
            node.send_user_message(&a, message),
            Err(PortError::CannotSendSelf)
        );
        // The sender must not have been closed by failure cleanup.
        assert!(node.get_port(&a.name()).is_ok());
    }

    #[test]
    fn cannot_send_own_peer_and_failure_closes_it() {
        let (node, delegate) = test_node();
        let (a, b) = node.create_port_pair().unwrap();

        let mut message = UserMessageEvent::new(Vec::new());
        message.attach_port(b.name());
        assert_eq!(
            node.send_user_message(&a, message),
            Err(PortError::CannotSendPeer)
        );
        pump(&node, &delegate);

        // The carried port was closed by failure cleanup, and its closure
        // reached the sender.
        assert_eq!(node.get_port(&b.name()).unwrap_err(), PortError::UnknownPort);
        assert!(node.get_status(&a).unwrap().peer_closed);
    }

    #[test]
    fn status_reflects_queue() {
        let (node, delegate) = test_node();
        let (a, b) = node.create_port_pair().unwrap();

        let status = node.get_status(&b).unwrap();
        assert!(!status.has_messages);
        assert!(!status.peer_closed);
        assert!(!status.peer_remote);
        assert!(status.receiving_messages);

        send(&node, &a, &[0; 32]).unwrap();
        pump(&node, &delegate);

        let status = node.get_status(&b).unwrap();
        assert!(status.has_messages);
        assert_eq!(status.queued_message_count, 1);
        assert_eq!(status.queued_num_bytes, 32);
    }

    #[test]
    fn user_data_round_trips_until_close() {
        #[derive(Debug)]
        struct Tag(u32);
        impl UserData for Tag {
            fn as_any(&self) -> &dyn std::any::Any {
                self
            }
        }

        let (node, _delegate) = test_node();
        let (a, _b) = node.create_port_pair().unwrap();

        assert!(node.get_user_data(&a).unwrap().is_none());
        node.set_user_data(&a, Arc::new(Tag(7))).unwrap();
        let data = node.get_user_data(&a).unwrap().unwrap();
        let tag = data.as_any().downcast_ref::<Tag>().unwrap();
        assert_eq!(tag.0, 7);
    }

    #[test]
    fn merge_local_ports_splices_channels() {
        let (node, delegate) = test_node();
        let (a, b) = node.create_port_pair().unwrap();
        let (c, d) = node.create_port_pair().unwrap();

        node.merge_local_ports(&b, &c).unwrap();
        pump(&node, &delegate);

        // The merged ports collapse out of the graph entirely...
        assert_eq!(node.get_port(&b.name()).unwrap_err(), PortError::UnknownPort);
        assert_eq!(node.get_port(&c.name()).unwrap_err(), PortError::UnknownPort);

        // ...leaving a and d directly connected.
        send(&node, &a, b"across the splice").unwrap();
        pump(&node, &delegate);
        let message = node.get_message(&d).unwrap().unwrap();
        assert_eq!(message.payload(), b"across the splice");
    }

    #[test]
    fn merge_rejects_ports_that_already_sent() {
        let (node, delegate) = test_node();
        let (a, b) = node.create_port_pair().unwrap();
        let (c, _d) = node.create_port_pair().unwrap();

        send(&node, &a, b"too late").unwrap();
        pump(&node, &delegate);

        assert_eq!(
            node.merge_local_ports(&a, &c),
            Err(PortError::PortStateUnexpected)
        );
        pump(&node, &delegate);

        // Merge failure closes both offending ports; no half-merged state.
        assert_eq!(node.get_port(&a.name()).unwrap_err(), PortError::UnknownPort);
        assert_eq!(node.get_port(&c.name()).unwrap_err(), PortError::UnknownPort);
        assert!(node.get_status(&b).unwrap().peer_closed);
    }

    #[test]
    fn merge_rejects_peers() {
        let (node, delegate) = test_node();
        let (a, b) = node.create_port_pair().unwrap();

        assert_eq!(
            node.merge_local_ports(&a, &b),
            Err(PortError::PortStateUnexpected)
        );
        pump(&node, &delegate);
    }

    #[test]
    fn shutdown_policies() {
        let (node, delegate) = test_node();
        assert!(node.can_shutdown_cleanly(ShutdownPolicy::DontAllowLocalPorts));

        let (a, b) = node.create_port_pair().unwrap();
        assert!(!node.can_shutdown_cleanly(ShutdownPolicy::DontAllowLocalPorts));
        // A purely local pair is fine under the lenient policy.
        assert!(node.can_shutdown_cleanly(ShutdownPolicy::AllowLocalPorts));

        node.close_port(&a).unwrap();
        node.close_port(&b).unwrap();
        pump(&node, &delegate);
        assert!(node.can_shutdown_cleanly(ShutdownPolicy::DontAllowLocalPorts));
    }

    #[test]
    fn slot_multiplexing_keeps_streams_separate() {
        let (node, delegate) = test_node();
        let (a, b) = node.create_port_pair().unwrap();

        let slot = node.allocate_slot(&a);
        assert!(node.add_slot_from_peer(&b, slot));
        let b_slot = slot ^ PEER_ALLOCATED_SLOT_ID_BIT;

        node.send_user_message_on_slot(
            &SlotRef::new(a.clone(), slot),
            UserMessageEvent::new(b"on the slot".to_vec()),
        )
        .unwrap();
        send(&node, &a, b"on the default").unwrap();
        pump(&node, &delegate);

        // The slot message is first in sequence; the default slot cannot
        // read past it, but its own slot can.
        assert!(node.get_message(&b).unwrap().is_none());
        let message = node
            .get_slot_message(&SlotRef::new(b.clone(), b_slot), None)
            .unwrap()
            .unwrap();
        assert_eq!(message.payload(), b"on the slot");
        let message = node.get_message(&b).unwrap().unwrap();
        assert_eq!(message.payload(), b"on the default");
    }

    #[test]
    fn closing_one_slot_keeps_the_port() {
        let (node, delegate) = test_node();
        let (a, b) = node.create_port_pair().unwrap();

        let slot = node.allocate_slot(&a);
        assert!(node.add_slot_from_peer(&b, slot));
        let b_slot = slot ^ PEER_ALLOCATED_SLOT_ID_BIT;

        node.close_port_slot(&SlotRef::new(a.clone(), slot)).unwrap();
        pump(&node, &delegate);

        // The port survives; the peer's view of that one slot is closed.
        assert!(node.get_port(&a.name()).is_ok());
        let status = node
            .get_slot_status(&SlotRef::new(b.clone(), b_slot))
            .unwrap();
        assert!(status.peer_closed);
        assert!(!node.get_status(&b).unwrap().peer_closed);
    }

    #[test]
    fn closing_last_slot_closes_the_port() {
        let (node, delegate) = test_node();
        let (a, b) = node.create_port_pair().unwrap();

        node.close_port_slot(&SlotRef::new(a.clone(), DEFAULT_SLOT_ID))
            .unwrap();
        pump(&node, &delegate);

        assert_eq!(node.get_port(&a.name()).unwrap_err(), PortError::UnknownPort);
        assert!(node.get_status(&b).unwrap().peer_closed);
    }

    #[test]
    fn closing_port_discards_and_closes_attached_ports() {
        let (node, delegate) = test_node();
        let (a, b) = node.create_port_pair().unwrap();
        let (c, d) = node.create_port_pair().unwrap();

        // Send c to b, but never read it on b; closing b must close c too,
        // which d then observes.
        let mut message = UserMessageEvent::new(Vec::new());
        message.attach_port(c.name());
        node.send_user_message(&a, message).unwrap();
        pump(&node, &delegate);

        node.close_port(&b).unwrap();
        pump(&node, &delegate);

        assert_eq!(node.get_port(&c.name()).unwrap_err(), PortError::UnknownPort);
        assert!(node.get_status(&d).unwrap().peer_closed);
    }

    #[test]
    fn read_enables_signals_on_delivered_ports() {
        let (node, delegate) = test_node();
        let (a, b) = node.create_port_pair().unwrap();
        let (c, d) = node.create_port_pair().unwrap();

        let mut message = UserMessageEvent::new(Vec::new());
        message.attach_port(c.name());
        node.send_user_message(&a, message).unwrap();
        pump(&node, &delegate);

        delegate.notified_slots.lock().unwrap().clear();
        let received = node.get_message(&b).unwrap().unwrap();
        assert_eq!(received.ports(), &[c.name()]);

        // Messages to the delivered port now raise status notifications.
        send(&node, &d, b"ping").unwrap();
        pump(&node, &delegate);
        let notified = delegate.notified_slots.lock().unwrap();
        assert!(notified.contains(&(c.name(), DEFAULT_SLOT_ID)));
    }
}
