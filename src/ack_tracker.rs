//! Single-slot expectation of a per-hop acknowledgement.
//!
//! The reliable transmit path arms the tracker just before putting a
//! unicast frame on the air and then polls `received` while draining the
//! radio. Only an ACK whose source and message id both match the armed
//! expectation can set the flag. The cooperative engine never has two
//! reliable sends in flight, so one slot suffices.

use crate::age;

pub(crate) struct AckTracker {
    expected_neighbor: u8,
    expected_message_id: u8,
    armed: bool,
    received: bool,
    age: u16,
}

impl AckTracker {
    pub(crate) const fn new() -> Self {
        AckTracker {
            expected_neighbor: 0,
            expected_message_id: 0,
            armed: false,
            received: false,
            age: 0,
        }
    }

    /// Starts expecting an ACK from `neighbor` echoing `message_id`,
    /// discarding any previous expectation.
    pub(crate) fn arm(&mut self, neighbor: u8, message_id: u8) {
        self.expected_neighbor = neighbor;
        self.expected_message_id = message_id;
        self.armed = true;
        self.received = false;
        self.age = 0;
    }

    pub(crate) fn disarm(&mut self) {
        self.armed = false;
        self.received = false;
    }

    /// Feeds an incoming ACK to the tracker. Returns true when it satisfied
    /// the armed expectation.
    pub(crate) fn on_ack(&mut self, source: u8, message_id: u8) -> bool {
        if self.armed && self.expected_neighbor == source && self.expected_message_id == message_id {
            self.received = true;
            true
        } else {
            false
        }
    }

    pub(crate) fn received(&self) -> bool {
        self.received
    }

    pub(crate) fn tick(&mut self, steps: u16) {
        if self.armed {
            self.age = age::bump(self.age, steps);
        }
    }
}

#[cfg(all(test, feature = "std"))]
mod tests {
    use super::*;

    #[test]
    fn matching_ack_sets_received() {
        let mut tracker = AckTracker::new();
        tracker.arm(0x02, 42);
        assert!(!tracker.received());
        assert!(tracker.on_ack(0x02, 42));
        assert!(tracker.received());
    }

    #[test]
    fn mismatched_ack_is_ignored() {
        let mut tracker = AckTracker::new();
        tracker.arm(0x02, 42);
        assert!(!tracker.on_ack(0x03, 42));
        assert!(!tracker.on_ack(0x02, 43));
        assert!(!tracker.received());
    }

    #[test]
    fn unarmed_tracker_rejects_everything() {
        let mut tracker = AckTracker::new();
        assert!(!tracker.on_ack(0x00, 0));

        tracker.arm(0x02, 42);
        tracker.disarm();
        assert!(!tracker.on_ack(0x02, 42));
        assert!(!tracker.received());
    }

    #[test]
    fn rearming_resets_the_expectation() {
        let mut tracker = AckTracker::new();
        tracker.arm(0x02, 42);
        assert!(tracker.on_ack(0x02, 42));

        tracker.arm(0x05, 7);
        assert!(!tracker.received());
        assert!(!tracker.on_ack(0x02, 42));
        assert!(tracker.on_ack(0x05, 7));
    }
}
