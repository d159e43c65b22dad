use std::collections::{BTreeMap, VecDeque};

use super::message::{decode_buffer_announcement, MessageKind, MessageView, MAX_MESSAGE_DATA};
use super::queue::QUEUE_CAPACITY;
use super::sequence::sequence_greater_than_u8;

const MAX_PARTIAL_GROUPS: usize = 8;
/// Largest payload a sender can fit in its queue alongside the announcement.
pub const MAX_REASSEMBLED_SIZE: usize = (QUEUE_CAPACITY - 2) * MAX_MESSAGE_DATA;

/// A complete application payload handed to the caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub kind: MessageKind,
    pub critical: bool,
    pub fragment_id: u8,
    pub data: Vec<u8>,
}

#[derive(Debug, Default)]
struct Partial {
    total: Option<usize>,
    kind: Option<MessageKind>,
    critical: bool,
    fragments: BTreeMap<u8, Vec<u8>>,
    received: usize,
}

impl Partial {
    fn is_complete(&self) -> bool {
        let Some(total) = self.total else {
            return false;
        };
        self.received == total
            && self
                .fragments
                .keys()
                .copied()
                .eq(1..=self.fragments.len() as u8)
    }
}

/// Fragment ids whose critical payload was already delivered in the
/// current generation of the sender's 8-bit id counter.
#[derive(Debug, Default, Clone, Copy)]
struct IdSet([u64; 4]);

impl IdSet {
    fn contains(&self, id: u8) -> bool {
        self.0[usize::from(id >> 6)] & (1 << (id & 63)) != 0
    }

    fn insert(&mut self, id: u8) {
        self.0[usize::from(id >> 6)] |= 1 << (id & 63);
    }

    fn remove(&mut self, id: u8) {
        self.0[usize::from(id >> 6)] &= !(1 << (id & 63));
    }
}

/// Joins announced fragment groups and filters critical messages that were
/// resent after their first copy already arrived.
///
/// Ids are ordered with half-range comparison against the newest id seen.
/// Moving the newest id forward starts a new generation for every id it
/// passes, so a recycled id is never mistaken for a resend.
#[derive(Debug, Default)]
pub struct Reassembler {
    partial: BTreeMap<u8, Partial>,
    partial_order: VecDeque<u8>,
    newest_id: Option<u8>,
    delivered_critical: IdSet,
    duplicates: u64,
    discarded: u64,
}

impl Reassembler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn duplicates(&self) -> u64 {
        self.duplicates
    }

    pub fn discarded(&self) -> u64 {
        self.discarded
    }

    pub fn pending_groups(&self) -> usize {
        self.partial.len()
    }

    pub fn accept(&mut self, message: &MessageView<'_>) -> Option<Delivery> {
        let id = message.fragment_id;
        self.observe_id(id);

        if message.critical && self.delivered_critical.contains(id) {
            log::debug!("duplicate critical message id {id} order {}", message.order);
            self.duplicates += 1;
            return None;
        }

        if message.order == 0 && message.kind == MessageKind::BUFFER {
            return self.announce(message);
        }

        if message.order == 0 {
            let delivery = Delivery {
                kind: message.kind,
                critical: message.critical,
                fragment_id: id,
                data: message.data.to_vec(),
            };
            self.complete(&delivery);
            return Some(delivery);
        }

        let partial = self.group(id);
        if partial.fragments.contains_key(&message.order) {
            self.duplicates += 1;
            return None;
        }
        partial.kind.get_or_insert(message.kind);
        partial.critical |= message.critical;
        partial.received += message.data.len();
        partial.fragments.insert(message.order, message.data.to_vec());

        self.try_finish(id)
    }

    fn announce(&mut self, message: &MessageView<'_>) -> Option<Delivery> {
        let id = message.fragment_id;
        let total = match decode_buffer_announcement(message.data) {
            Ok(total) => total as usize,
            Err(err) => {
                log::debug!("bad buffer announcement for id {id}: {err}");
                self.discarded += 1;
                return None;
            }
        };
        if total > MAX_REASSEMBLED_SIZE {
            log::debug!("announced size {total} for id {id} exceeds {MAX_REASSEMBLED_SIZE}");
            self.discarded += 1;
            return None;
        }

        let partial = self.group(id);
        if partial.total.is_some_and(|known| known != total) {
            *partial = Partial::default();
        }
        partial.total = Some(total);
        partial.critical |= message.critical;

        self.try_finish(id)
    }

    fn group(&mut self, id: u8) -> &mut Partial {
        if !self.partial.contains_key(&id) {
            if self.partial.len() >= MAX_PARTIAL_GROUPS
                && let Some(oldest) = self.partial_order.pop_front()
            {
                log::debug!("abandoning incomplete fragment group {oldest}");
                self.partial.remove(&oldest);
                self.discarded += 1;
            }
            self.partial_order.push_back(id);
        }
        self.partial.entry(id).or_default()
    }

    fn try_finish(&mut self, id: u8) -> Option<Delivery> {
        if !self.partial.get(&id).is_some_and(Partial::is_complete) {
            return None;
        }
        let partial = self.partial.remove(&id)?;
        self.partial_order.retain(|&pending| pending != id);

        let mut data = Vec::with_capacity(partial.received);
        for fragment in partial.fragments.into_values() {
            data.extend_from_slice(&fragment);
        }
        let delivery = Delivery {
            kind: partial.kind.unwrap_or(MessageKind::DATA),
            critical: partial.critical,
            fragment_id: id,
            data,
        };
        self.complete(&delivery);
        Some(delivery)
    }

    /// Advances the newest id, forgetting everything recorded for the ids
    /// in between since the sender is now reusing them.
    fn observe_id(&mut self, id: u8) {
        let Some(newest) = self.newest_id else {
            self.newest_id = Some(id);
            return;
        };
        if !sequence_greater_than_u8(id, newest) {
            return;
        }

        let mut reused = newest;
        while reused != id {
            reused = reused.wrapping_add(1);
            self.delivered_critical.remove(reused);
            if self.partial.remove(&reused).is_some() {
                log::debug!("dropping stale fragment group {reused}");
                self.partial_order.retain(|&pending| pending != reused);
                self.discarded += 1;
            }
        }
        self.newest_id = Some(id);
    }

    fn complete(&mut self, delivery: &Delivery) {
        if delivery.critical {
            self.delivered_critical.insert(delivery.fragment_id);
        }
    }
}
