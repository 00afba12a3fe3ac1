//! Per-port message reassembly.
//!
//! A port's inbound user messages can arrive out of order whenever delivery
//! paths change mid-stream (a proxy forwarding the backlog races the sender's
//! direct path to the new location). The queue holds early arrivals and
//! releases messages strictly by sender-assigned sequence number, one slot at
//! a time. It also tracks how far the sequence has progressed, which is what
//! lets a proxy decide it has seen the last message it will ever be asked to
//! forward.

use std::collections::BTreeMap;

use tracing::warn;

use crate::event::UserMessageEvent;
use crate::port::SlotId;

/// Embedder-supplied predicate for selective reads.
///
/// A message that does not match stays queued and continues to block the
/// sequence, exactly as if no read had been attempted.
pub trait MessageFilter {
    fn matches(&mut self, message: &UserMessageEvent) -> bool;
}

/// Ordered, reassembling queue of pending user messages for one port.
#[derive(Debug)]
pub(crate) struct MessageQueue {
    // Keyed by sequence number; the first entry is the front of the queue.
    messages: BTreeMap<u64, UserMessageEvent>,
    next_sequence_num: u64,
    total_queued_bytes: usize,
}

impl MessageQueue {
    pub fn new(next_sequence_num: u64) -> Self {
        Self {
            messages: BTreeMap::new(),
            next_sequence_num,
            total_queued_bytes: 0,
        }
    }

    /// The sequence number the next readable message must carry.
    pub fn next_sequence_num(&self) -> u64 {
        self.next_sequence_num
    }

    pub fn queued_message_count(&self) -> usize {
        self.messages.len()
    }

    pub fn queued_num_bytes(&self) -> usize {
        self.total_queued_bytes
    }

    /// The slot of the next in-order message, if it has arrived.
    pub fn next_message_slot(&self) -> Option<SlotId> {
        let (seq, message) = self.messages.first_key_value()?;
        (*seq == self.next_sequence_num).then(|| message.slot_id())
    }

    pub fn has_next_message(&self, slot_id: SlotId) -> bool {
        self.next_message_slot() == Some(slot_id)
    }

    /// Queue an arrived message. Returns the slot of the queue's front
    /// message if one is now (or still) ready to be read.
    pub fn accept_message(&mut self, message: UserMessageEvent) -> Option<SlotId> {
        let sequence_num = match message.sequence_num() {
            Some(n) if n >= self.next_sequence_num && !self.messages.contains_key(&n) => n,
            stale => {
                // A replayed or unstamped message; nothing downstream of a
                // reliable transport should produce one.
                warn!(sequence_num = ?stale, "dropping message with stale or missing sequence number");
                return None;
            }
        };

        self.total_queued_bytes += message.num_bytes();
        self.messages.insert(sequence_num, message);
        self.next_message_slot()
    }

    /// Account for a message that is being discarded instead of queued, so
    /// that the messages behind it are not blocked forever.
    pub fn ignore_message(&mut self, message: &UserMessageEvent) {
        if message.sequence_num() == Some(self.next_sequence_num) {
            self.next_sequence_num += 1;
        }
    }

    /// Pop the next in-order message, if available. With a slot given, only
    /// a front message for that slot is released. With a filter given, a
    /// non-matching front message stays queued.
    pub fn get_next_message(
        &mut self,
        slot_id: Option<SlotId>,
        mut filter: Option<&mut dyn MessageFilter>,
    ) -> Option<UserMessageEvent> {
        {
            let (seq, message) = self.messages.first_key_value()?;
            if *seq != self.next_sequence_num {
                return None;
            }
            if let Some(slot_id) = slot_id {
                if message.slot_id() != slot_id {
                    return None;
                }
            }
            if let Some(filter) = filter.as_mut() {
                if !filter.matches(message) {
                    return None;
                }
            }
        }

        let (_, message) = self.messages.pop_first()?;
        self.next_sequence_num += 1;
        self.total_queued_bytes -= message.num_bytes();
        Some(message)
    }

    /// Drain every queued message, in-order and early arrivals alike. Does
    /// not advance the sequence; only used when the port is going away.
    pub fn take_all_messages(&mut self) -> Vec<UserMessageEvent> {
        self.total_queued_bytes = 0;
        std::mem::take(&mut self.messages).into_values().collect()
    }

    /// Pop the run of consecutive in-order messages at the front of the
    /// queue belonging to `slot_id`, advancing the sequence past them.
    pub fn take_all_leading_messages_for_slot(&mut self, slot_id: SlotId) -> Vec<UserMessageEvent> {
        let mut taken = Vec::new();
        while self.has_next_message(slot_id) {
            if let Some(message) = self.get_next_message(Some(slot_id), None) {
                taken.push(message);
            }
        }
        taken
    }
}
