//! Packet identifier allocation.
//!
//! Packet identifiers are non-zero 16-bit values used by QoS 1/2 PUBLISH,
//! SUBSCRIBE and UNSUBSCRIBE. An identifier must not be handed out again
//! while its exchange is still in flight.

use std::collections::HashSet;

/// Allocates packet identifiers, skipping ids still awaiting an ack.
#[derive(Debug, Default)]
pub struct PacketIdAllocator {
    next_id: u16,
    in_use: HashSet<u16>,
}

impl PacketIdAllocator {
    pub fn new() -> Self {
        Self {
            next_id: 1,
            in_use: HashSet::new(),
        }
    }

    /// Allocate an unused identifier, wrapping through 1..=65535.
    ///
    /// Returns `None` only when every identifier is in flight.
    pub fn allocate(&mut self) -> Option<u16> {
        if self.next_id == 0 {
            self.next_id = 1;
        }
        let start = self.next_id;
        loop {
            let candidate = self.next_id;
            self.advance();
            if self.in_use.insert(candidate) {
                return Some(candidate);
            }
            if self.next_id == start {
                return None;
            }
        }
    }

    /// Return an identifier to the pool once its exchange completes
    /// (PUBACK, PUBCOMP, SUBACK or UNSUBACK received, or the exchange
    /// was abandoned).
    pub fn release(&mut self, id: u16) {
        self.in_use.remove(&id);
    }

    pub fn is_in_use(&self, id: u16) -> bool {
        self.in_use.contains(&id)
    }

    /// Drop all allocations (clean-session connect or teardown).
    pub fn clear(&mut self) {
        self.in_use.clear();
        self.next_id = 1;
    }

    fn advance(&mut self) {
        self.next_id = self.next_id.wrapping_add(1);
        if self.next_id == 0 {
            self.next_id = 1;
        }
    }
}
