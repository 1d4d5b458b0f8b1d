//! Staging area for payloads that are waiting on route discovery.
//!
//! A send with no valid route parks its payload here together with the
//! message id reserved for it, so the frame that eventually goes out carries
//! the id the caller was promised. Entries are dropped once dispatched or
//! after `PENDING_EXPIRY_SECS` without a route.

use crate::age;
use crate::MAX_MESSAGE_LEN;

/// A parked outgoing payload. Copied out of the queue for dispatch so the
/// engine can transmit without holding a borrow on the slot.
#[derive(Clone, Copy)]
pub(crate) struct PendingMessage {
    pub(crate) destination: u8,
    pub(crate) message_id: u8,
    pub(crate) payload: [u8; MAX_MESSAGE_LEN],
    pub(crate) payload_len: u8,
    pub(crate) age: u16,
}

impl PendingMessage {
    pub(crate) fn payload(&self) -> &[u8] {
        &self.payload[..self.payload_len as usize]
    }
}

pub(crate) struct PendingQueue<const QUEUE_SIZE: usize> {
    slots: [Option<PendingMessage>; QUEUE_SIZE],
}

impl<const QUEUE_SIZE: usize> PendingQueue<QUEUE_SIZE> {
    pub(crate) const fn new() -> Self {
        PendingQueue { slots: [None; QUEUE_SIZE] }
    }

    /// Parks a payload in the first free slot. Returns false (drop-new)
    /// when the queue is full.
    pub(crate) fn enqueue(&mut self, destination: u8, payload: &[u8], message_id: u8) -> bool {
        let len = payload.len().min(MAX_MESSAGE_LEN);
        for slot in self.slots.iter_mut() {
            if slot.is_none() {
                let mut parked = PendingMessage {
                    destination,
                    message_id,
                    payload: [0u8; MAX_MESSAGE_LEN],
                    payload_len: len as u8,
                    age: 0,
                };
                parked.payload[..len].copy_from_slice(&payload[..len]);
                *slot = Some(parked);
                return true;
            }
        }
        false
    }

    pub(crate) fn get(&self, index: usize) -> Option<PendingMessage> {
        self.slots[index]
    }

    pub(crate) fn release(&mut self, index: usize) {
        self.slots[index] = None;
    }

    pub(crate) fn tick(&mut self, steps: u16) {
        for slot in self.slots.iter_mut().flatten() {
            slot.age = age::bump(slot.age, steps);
        }
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.slots.iter().flatten().count()
    }
}

#[cfg(all(test, feature = "std"))]
mod tests {
    use super::*;
    use crate::PENDING_EXPIRY_SECS;

    #[test]
    fn enqueue_fills_first_free_slot() {
        let mut queue = PendingQueue::<2>::new();
        assert!(queue.enqueue(0x03, b"one", 1));
        assert!(queue.enqueue(0x04, b"two", 2));
        assert_eq!(queue.len(), 2);

        let first = queue.get(0).unwrap();
        assert_eq!(first.destination, 0x03);
        assert_eq!(first.message_id, 1);
        assert_eq!(first.payload(), b"one");
    }

    #[test]
    fn enqueue_drops_new_when_full() {
        let mut queue = PendingQueue::<1>::new();
        assert!(queue.enqueue(0x03, b"one", 1));
        assert!(!queue.enqueue(0x04, b"two", 2));
        assert_eq!(queue.get(0).unwrap().destination, 0x03);
    }

    #[test]
    fn release_frees_the_slot() {
        let mut queue = PendingQueue::<2>::new();
        queue.enqueue(0x03, b"one", 1);
        queue.release(0);
        assert_eq!(queue.len(), 0);
        assert!(queue.enqueue(0x05, b"three", 3));
        assert_eq!(queue.get(0).unwrap().destination, 0x05);
    }

    #[test]
    fn ages_reach_expiry_after_three_discovery_timeouts() {
        let mut queue = PendingQueue::<1>::new();
        queue.enqueue(0x63, b"lost", 9);
        queue.tick(PENDING_EXPIRY_SECS - 1);
        assert!(!crate::age::is_expired(queue.get(0).unwrap().age, PENDING_EXPIRY_SECS));
        queue.tick(1);
        assert!(crate::age::is_expired(queue.get(0).unwrap().age, PENDING_EXPIRY_SECS));
    }
}
