//! Port locking discipline.
//!
//! Two rules keep the node deadlock-free:
//!
//! 1. The node-wide table lock is always acquired before any port lock,
//!    never after. A thread-local count of live port guards backs a debug
//!    assertion at every table-lock acquisition.
//! 2. Operations touching several ports at once (forwarding a message with
//!    attachments, merging) take all of their locks through
//!    [`MultiPortGuard`], which orders acquisitions by stable lock identity
//!    and dedupes, so no two threads can lock the same pair in opposite
//!    orders and no port can be locked twice.

use std::cell::Cell;
use std::ops::{Deref, DerefMut};
use std::sync::{Arc, MutexGuard};

use crate::name::PortName;
use crate::port::{Port, PortRef};

thread_local! {
    static PORTS_HELD: Cell<usize> = const { Cell::new(0) };
}

/// Debug check that the calling thread holds no port locks. Call sites are
/// the ones about to take the node-wide lock or call out to the embedder.
pub(crate) fn assert_no_ports_held() {
    PORTS_HELD.with(|held| {
        debug_assert_eq!(
            held.get(),
            0,
            "port lock held on a path that must acquire locks node-first"
        );
    });
}

fn note_acquired(count: usize) {
    PORTS_HELD.with(|held| held.set(held.get() + count));
}

fn note_released(count: usize) {
    PORTS_HELD.with(|held| held.set(held.get() - count));
}

/// Guard over a single port's state.
pub(crate) struct PortGuard<'a> {
    port: MutexGuard<'a, Port>,
}

impl<'a> PortGuard<'a> {
    fn new(port_ref: &'a PortRef) -> Self {
        let port = port_ref.handle().lock.lock().unwrap();
        note_acquired(1);
        Self { port }
    }
}

impl Deref for PortGuard<'_> {
    type Target = Port;

    fn deref(&self) -> &Port {
        &self.port
    }
}

impl DerefMut for PortGuard<'_> {
    fn deref_mut(&mut self) -> &mut Port {
        &mut self.port
    }
}

impl Drop for PortGuard<'_> {
    fn drop(&mut self) {
        note_released(1);
    }
}

impl PortRef {
    pub(crate) fn lock(&self) -> PortGuard<'_> {
        PortGuard::new(self)
    }
}

/// Guard over several ports' state, acquired simultaneously.
pub(crate) struct MultiPortGuard<'a> {
    guards: Vec<(PortName, MutexGuard<'a, Port>)>,
}

impl<'a> MultiPortGuard<'a> {
    pub fn lock(ports: &'a [PortRef]) -> Self {
        let mut order: Vec<&'a PortRef> = ports.iter().collect();
        order.sort_by_key(|r| Arc::as_ptr(r.handle()) as usize);
        order.dedup_by_key(|r| Arc::as_ptr(r.handle()) as usize);

        let mut guards = Vec::with_capacity(order.len());
        for port_ref in order {
            guards.push((port_ref.name(), port_ref.handle().lock.lock().unwrap()));
        }
        note_acquired(guards.len());
        Self { guards }
    }

    /// The locked state of `port_ref`, which must be one of the ports this
    /// guard was constructed over.
    pub fn port_mut(&mut self, port_ref: &PortRef) -> &mut Port {
        self.guards
            .iter_mut()
            .find(|(name, _)| *name == port_ref.name())
            .map(|(_, guard)| &mut **guard)
            .expect("port not covered by this guard")
    }

    /// Both ports at once; they must be distinct.
    pub fn pair_mut(&mut self, a: &PortRef, b: &PortRef) -> (&mut Port, &mut Port) {
        let ia = self.index_of(a.name());
        let ib = self.index_of(b.name());
        assert_ne!(ia, ib, "pair_mut needs two distinct ports");
        if ia < ib {
            let (lo, hi) = self.guards.split_at_mut(ib);
            (&mut *lo[ia].1, &mut *hi[0].1)
        } else {
            let (lo, hi) = self.guards.split_at_mut(ia);
            (&mut *hi[0].1, &mut *lo[ib].1)
        }
    }

    fn index_of(&self, name: PortName) -> usize {
        self.guards
            .iter()
            .position(|(n, _)| *n == name)
            .expect("port not covered by this guard")
    }
}

impl Drop for MultiPortGuard<'_> {
    fn drop(&mut self) {
        note_released(self.guards.len());
    }
}
