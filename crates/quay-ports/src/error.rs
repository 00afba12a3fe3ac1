//! Error types for quay-ports.

use thiserror::Error;

/// Result type for port operations.
pub type Result<T> = std::result::Result<T, PortError>;

/// Errors surfaced by [`Node`](crate::Node) operations.
///
/// These are the only failures an embedder ever observes; protocol-level
/// oddities from remote nodes (duplicate handshakes, stale observations) are
/// absorbed internally.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum PortError {
    /// The named port does not exist on this node.
    #[error("unknown port")]
    UnknownPort,

    /// A port with this name already exists. Seeing this suggests a broken
    /// random name source rather than anything the caller did.
    #[error("port already exists")]
    PortExists,

    /// The port is not in the right state for the requested operation.
    #[error("port in unexpected state")]
    PortStateUnexpected,

    /// The peer is closed and every in-flight message has been consumed.
    #[error("peer closed")]
    PeerClosed,

    /// A message may not carry the very port it is being sent on.
    #[error("cannot send a port over itself")]
    CannotSendSelf,

    /// A message may not carry the sending port's own peer.
    #[error("cannot send a port to its own peer")]
    CannotSendPeer,

    /// Reserved for unhandled protocol surface; never expected in practice.
    #[error("not implemented")]
    NotImplemented,
}
