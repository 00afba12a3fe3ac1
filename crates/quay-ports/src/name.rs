//! Node and port identity.
//!
//! Names are opaque 128-bit values drawn from the operating system's
//! cryptographic random source. With 128 bits of entropy, names are
//! statistically unique across the whole routing graph: ports address their
//! peers by name alone, so a collision would splice two unrelated message
//! streams together. Nothing else about a name is meaningful.
//!
//! The all-zero name is reserved as the invalid sentinel. It appears on the
//! wire in exactly two places: a broadcast dead-proxy announcement (which has
//! no target port) and the wiped referring-node field of an already-accepted
//! port descriptor.

use std::fmt;
use std::sync::Mutex;

use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};

/// Identifies a node: one routing domain, usually one process.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeName(pub u64, pub u64);

/// Identifies a port within the whole graph (not merely within its node).
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PortName(pub u64, pub u64);

impl NodeName {
    /// The reserved all-zero sentinel.
    pub const INVALID: NodeName = NodeName(0, 0);

    /// Generate a fresh statistically-unique name.
    pub fn random() -> Self {
        let (v1, v2) = random_name_words();
        NodeName(v1, v2)
    }

    /// True for every name except the sentinel.
    pub fn is_valid(&self) -> bool {
        *self != Self::INVALID
    }
}

impl PortName {
    /// The reserved all-zero sentinel.
    pub const INVALID: PortName = PortName(0, 0);

    /// Generate a fresh statistically-unique name.
    pub fn random() -> Self {
        let (v1, v2) = random_name_words();
        PortName(v1, v2)
    }

    /// True for every name except the sentinel.
    pub fn is_valid(&self) -> bool {
        *self != Self::INVALID
    }
}

impl fmt::Debug for NodeName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeName({})", self)
    }
}

impl fmt::Debug for PortName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PortName({})", self)
    }
}

impl fmt::Display for NodeName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Show first 8 hex chars; enough to tell names apart in logs.
        write!(f, "{}...", &hex::encode(self.0.to_be_bytes())[..8])
    }
}

impl fmt::Display for PortName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}...", &hex::encode(self.0.to_be_bytes())[..8])
    }
}

/// How many names each refill of the random cache yields.
const NAME_CACHE_SIZE: usize = 256;

/// Cache of random bytes from which names are carved.
///
/// Amortizes the cost of asking the OS for randomness on platforms where a
/// syscall per name would dominate port creation. Note the cache makes
/// fork()ing after any name has been generated hazardous: both sides of the
/// fork would drain identical bytes.
struct NameCache {
    bytes: [u8; NAME_CACHE_SIZE * 16],
    // Next unconsumed offset; starts exhausted so the first name triggers a fill.
    index: usize,
}

static NAME_CACHE: Mutex<NameCache> = Mutex::new(NameCache {
    bytes: [0; NAME_CACHE_SIZE * 16],
    index: NAME_CACHE_SIZE * 16,
});

fn random_name_words() -> (u64, u64) {
    let mut cache = NAME_CACHE.lock().unwrap();
    if cache.index == cache.bytes.len() {
        OsRng.fill_bytes(&mut cache.bytes);
        cache.index = 0;
    }
    let at = cache.index;
    cache.index += 16;
    let v1 = u64::from_le_bytes(cache.bytes[at..at + 8].try_into().unwrap());
    let v2 = u64::from_le_bytes(cache.bytes[at + 8..at + 16].try_into().unwrap());
    (v1, v2)
}
