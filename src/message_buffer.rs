//! Circular buffer of delivered DATA frames awaiting the application.
//!
//! Single producer (the protocol engine) and single consumer (the public
//! receive call). When the writer catches up with the reader the oldest
//! frame is dropped.

use crate::age;
use crate::mesh_frame::{MeshHeader, MessageType};
use crate::MAX_MESSAGE_LEN;

#[derive(Clone, Copy)]
struct MessageSlot {
    header: MeshHeader,
    payload: [u8; MAX_MESSAGE_LEN],
    payload_len: u8,
    valid: bool,
    age: u16,
}

/// Metadata of a message handed to the application.
#[derive(Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "std", derive(Debug))]
pub struct ReceivedMessage {
    /// Number of payload bytes copied into the caller's buffer.
    pub length: usize,
    pub source: u8,
    pub destination: u8,
    pub message_id: u8,
}

pub(crate) struct MessageBuffer<const BUFFER_SIZE: usize> {
    slots: [Option<MessageSlot>; BUFFER_SIZE],
    head: usize,
    tail: usize,
}

impl<const BUFFER_SIZE: usize> MessageBuffer<BUFFER_SIZE> {
    pub(crate) const fn new() -> Self {
        MessageBuffer {
            slots: [None; BUFFER_SIZE],
            head: 0,
            tail: 0,
        }
    }

    /// Appends a delivered frame, overwriting the oldest one when full.
    pub(crate) fn push(&mut self, header: &MeshHeader, payload: &[u8]) {
        let mut slot_payload = [0u8; MAX_MESSAGE_LEN];
        let len = payload.len().min(MAX_MESSAGE_LEN);
        slot_payload[..len].copy_from_slice(&payload[..len]);

        self.slots[self.head] = Some(MessageSlot {
            header: *header,
            payload: slot_payload,
            payload_len: len as u8,
            valid: true,
            age: 0,
        });
        self.head = (self.head + 1) % BUFFER_SIZE;
        if self.head == self.tail {
            self.tail = (self.tail + 1) % BUFFER_SIZE;
        }
    }

    /// Drains the oldest DATA frame into `buf`, copying at most `buf.len()`
    /// bytes. Non-DATA slots encountered on the way are discarded.
    pub(crate) fn take(&mut self, buf: &mut [u8]) -> Option<ReceivedMessage> {
        while self.tail != self.head {
            let taken = self.slots[self.tail].take();
            self.tail = (self.tail + 1) % BUFFER_SIZE;
            if let Some(slot) = taken {
                if !slot.valid || slot.header.message_type != MessageType::Data as u8 {
                    continue;
                }
                let length = buf.len().min(slot.payload_len as usize);
                buf[..length].copy_from_slice(&slot.payload[..length]);
                return Some(ReceivedMessage {
                    length,
                    source: slot.header.source,
                    destination: slot.header.destination,
                    message_id: slot.header.message_id,
                });
            }
        }
        None
    }

    /// True when at least one DATA frame is waiting. Does not consume.
    pub(crate) fn has_data(&self) -> bool {
        let mut index = self.tail;
        while index != self.head {
            if let Some(slot) = &self.slots[index] {
                if slot.valid && slot.header.message_type == MessageType::Data as u8 {
                    return true;
                }
            }
            index = (index + 1) % BUFFER_SIZE;
        }
        false
    }

    pub(crate) fn tick(&mut self, steps: u16) {
        for slot in self.slots.iter_mut().flatten() {
            slot.age = age::bump(slot.age, steps);
        }
    }

    #[cfg(test)]
    pub(crate) fn valid_count(&self) -> usize {
        self.slots.iter().flatten().filter(|s| s.valid).count()
    }
}
