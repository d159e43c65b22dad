//! Fixed ring of outgoing messages.
//!
//! Slots between `begin` and `next` are pending. Every other slot is the free
//! region, which still holds messages already written into packets until
//! they are acknowledged, dropped or overwritten. Critical messages are never
//! overwritten while their packet is unacknowledged; the write cursor moves
//! them further into the free region instead.

use std::array;

use super::message::{
    encode_buffer_announcement, Message, MessageKind, MAX_MESSAGE_DATA,
};
use super::window::window_bit;

pub const QUEUE_CAPACITY: usize = 32;
const QUEUE_MASK: usize = QUEUE_CAPACITY - 1;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum QueueError {
    #[error("message queue full: {needed} slots needed, {available} available")]
    Full { needed: usize, available: usize },
    #[error("no reusable slot: free region is held by unacknowledged critical messages")]
    Exhausted,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum Slot {
    #[default]
    Free,
    Pending(Message),
    InFlight { message: Message, packet: u8 },
}

impl Slot {
    pub fn in_flight_message(&self) -> Option<&Message> {
        match self {
            Slot::InFlight { message, .. } => Some(message),
            _ => None,
        }
    }

    fn holds_unacked_critical(&self, acked: u32) -> bool {
        matches!(
            self,
            Slot::InFlight { message, packet }
                if message.critical && acked & window_bit(u32::from(*packet)) == 0
        )
    }

    fn is_reusable(&self, acked: u32) -> bool {
        !matches!(self, Slot::Pending(_)) && !self.holds_unacked_critical(acked)
    }
}

#[derive(Debug)]
pub struct MessageQueue {
    slots: [Slot; QUEUE_CAPACITY],
    begin: usize,
    next: usize,
    len: usize,
    next_id: u8,
}

impl Default for MessageQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl MessageQueue {
    pub fn new() -> Self {
        Self {
            slots: array::from_fn(|_| Slot::Free),
            begin: 0,
            next: 0,
            len: 0,
            next_id: 0,
        }
    }

    /// Number of pending (not yet drained) messages.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn in_flight_count(&self) -> usize {
        self.slots
            .iter()
            .filter(|slot| matches!(slot, Slot::InFlight { .. }))
            .count()
    }

    pub fn slots(&self) -> &[Slot] {
        &self.slots
    }

    pub fn pending(&self) -> impl Iterator<Item = &Message> + '_ {
        (0..self.len).filter_map(move |offset| match &self.slots[(self.begin + offset) & QUEUE_MASK] {
            Slot::Pending(message) => Some(message),
            _ => None,
        })
    }

    fn free_region(&self) -> impl Iterator<Item = usize> + use<> {
        let next = self.next;
        (0..QUEUE_CAPACITY - self.len).map(move |offset| (next + offset) & QUEUE_MASK)
    }

    fn reusable_count(&self, acked: u32) -> usize {
        self.free_region()
            .filter(|&index| self.slots[index].is_reusable(acked))
            .count()
    }

    /// Readies the slot under the write cursor and returns its index.
    ///
    /// An unacknowledged critical message sitting there is swapped into the
    /// first reusable slot further along the free region.
    pub fn next_available_slot(&mut self, acked: u32) -> Result<usize, QueueError> {
        if self.len + 1 >= QUEUE_CAPACITY {
            return Err(QueueError::Full {
                needed: 1,
                available: QUEUE_CAPACITY - 1 - self.len,
            });
        }

        let target = self.next;
        if !self.slots[target].holds_unacked_critical(acked) {
            return Ok(target);
        }

        let reusable = self
            .free_region()
            .skip(1)
            .find(|&index| self.slots[index].is_reusable(acked))
            .ok_or(QueueError::Exhausted)?;

        log::debug!("relocating in-flight critical message from slot {target} to {reusable}");
        self.slots.swap(target, reusable);
        self.slots[target] = Slot::Free;
        Ok(target)
    }

    fn push(&mut self, message: Message, acked: u32) -> Result<(), QueueError> {
        let index = self.next_available_slot(acked)?;
        self.slots[index] = Slot::Pending(message);
        self.next = (self.next + 1) & QUEUE_MASK;
        self.len += 1;
        Ok(())
    }

    /// Splits `payload` into queued messages sharing one fragment id and
    /// returns that id.
    ///
    /// Payloads larger than one message are preceded by a [`MessageKind::BUFFER`]
    /// announcement carrying the total size. Nothing is queued on error.
    pub fn enqueue_fragmented(
        &mut self,
        kind: MessageKind,
        critical: bool,
        payload: &[u8],
        acked: u32,
    ) -> Result<u8, QueueError> {
        let fragmented = payload.len() > MAX_MESSAGE_DATA;
        let needed = if fragmented {
            1 + payload.len().div_ceil(MAX_MESSAGE_DATA)
        } else {
            1
        };

        let available = QUEUE_CAPACITY - 1 - self.len;
        if needed > available {
            return Err(QueueError::Full { needed, available });
        }
        if needed > self.reusable_count(acked) {
            return Err(QueueError::Exhausted);
        }

        let id = self.next_id;
        self.next_id = self.next_id.wrapping_add(1);

        if !fragmented {
            self.push(Message::new(kind, critical, id, 0, payload), acked)?;
            return Ok(id);
        }

        let announcement = encode_buffer_announcement(payload.len() as u32);
        self.push(
            Message::new(MessageKind::BUFFER, critical, id, 0, &announcement),
            acked,
        )?;
        for (chunk, order) in payload.chunks(MAX_MESSAGE_DATA).zip(1u8..) {
            self.push(Message::new(kind, critical, id, order, chunk), acked)?;
        }

        Ok(id)
    }

    /// Pops pending messages for the packet with window index `packet`
    /// while they fit in `capacity` bytes.
    pub fn drain_for_packet(&mut self, capacity: usize, packet: u8) -> DrainForPacket<'_> {
        DrainForPacket {
            queue: self,
            remaining: capacity,
            packet,
        }
    }

    /// Slots carried by `packet`, oldest first.
    pub(crate) fn in_flight(&self, packet: u8) -> Vec<usize> {
        self.free_region()
            .filter(|&index| {
                matches!(&self.slots[index], Slot::InFlight { packet: p, .. } if *p == packet)
            })
            .collect()
    }

    pub(crate) fn release(&mut self, index: usize) -> Option<Message> {
        match std::mem::take(&mut self.slots[index]) {
            Slot::InFlight { message, .. } => Some(message),
            other => {
                self.slots[index] = other;
                None
            }
        }
    }

    /// Moves in-flight `indices` (oldest first) back to the front of the
    /// pending region, ahead of anything not yet sent, keeping their order.
    pub(crate) fn requeue(&mut self, indices: &[usize]) -> usize {
        let mut moved = 0;
        for &index in indices.iter().rev() {
            if !matches!(self.slots[index], Slot::InFlight { .. }) {
                continue;
            }
            let target = (self.begin + QUEUE_CAPACITY - 1) & QUEUE_MASK;
            if index != target {
                self.slots.swap(index, target);
            }
            if let Slot::InFlight { message, .. } = std::mem::take(&mut self.slots[target]) {
                self.slots[target] = Slot::Pending(message);
            }
            self.begin = target;
            self.len += 1;
            moved += 1;
        }
        moved
    }
}

pub struct DrainForPacket<'a> {
    queue: &'a mut MessageQueue,
    remaining: usize,
    packet: u8,
}

impl Iterator for DrainForPacket<'_> {
    type Item = Message;

    fn next(&mut self) -> Option<Message> {
        if self.queue.len == 0 {
            return None;
        }

        let begin = self.queue.begin;
        let message = match &self.queue.slots[begin] {
            Slot::Pending(message) if message.wire_size() <= self.remaining => message.clone(),
            _ => return None,
        };

        self.queue.slots[begin] = Slot::InFlight {
            message: message.clone(),
            packet: self.packet,
        };
        self.queue.begin = (begin + 1) & QUEUE_MASK;
        self.queue.len -= 1;
        self.remaining -= message.wire_size();
        Some(message)
    }
}
