//! Quay ports: a port-based message routing core.
//!
//! Ports are paired message endpoints spread across any number of nodes.
//! Sending a message can carry further ports inside it; the carried port's
//! old incarnation lingers briefly as a proxy that forwards in-flight
//! traffic, announces itself to the graph, and collapses away once the last
//! message it is owed has passed through. The result is a cycle of ports
//! that survives concurrent closes, transfers and node loss with strict
//! per-port ordering and no central coordinator.
//!
//! # Design
//!
//! A [`Node`] owns its ports and runs the whole event state machine
//! synchronously under a two-level lock discipline (node-wide table lock,
//! then per-port locks). Transport is somebody else's problem: a
//! [`NodeDelegate`] ships [`Event`]s between nodes and must only guarantee
//! reliable, per-sender-ordered delivery of user messages.
//!
//! ```rust,ignore
//! let node = Node::new(NodeName::random(), delegate);
//! let (a, b) = node.create_port_pair()?;
//! node.send_user_message(&a, UserMessageEvent::new(b"hi".to_vec()))?;
//! let message = node.get_message(&b)?;
//! ```

mod error;
mod event;
mod lock;
mod name;
mod node;
mod port;
mod queue;

pub use error::{PortError, Result};
pub use event::{
    Event, MergePortEvent, ObserveClosureEvent, ObserveProxyAckEvent, ObserveProxyEvent,
    PortAcceptedEvent, PortDescriptor, SlotClosedEvent, UserMessageEvent,
};
pub use name::{NodeName, PortName};
pub use node::{Node, NodeDelegate, PortStatus, ShutdownPolicy, SlotStatus};
pub use port::{
    PortRef, PortState, SlotId, SlotRef, UserData, DEFAULT_SLOT_ID, INITIAL_SEQUENCE_NUM,
    PEER_ALLOCATED_SLOT_ID_BIT,
};
pub use queue::MessageFilter;
