//! Decides what happens to the messages of a packet once its window slot is
//! about to be reused: delivered, requeued (critical) or dropped.

use super::events::{MessageInfo, ProtocolEvent};
use super::queue::MessageQueue;
use super::window::{window_bit, window_index, WINDOW_SIZE};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketSlotState {
    Unsent,
    SentCritical,
    SentNonCritical,
    Acknowledged,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LostPacket {
    pub sequence: u32,
    pub critical: bool,
    pub requeued: usize,
    pub dropped: usize,
}

#[derive(Debug, Clone, Default)]
pub struct RetransmitPolicy {
    /// Shadow of the acked window: set where the sent packet carried a
    /// critical message.
    critical: u32,
    used: u32,
}

impl RetransmitPolicy {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn slot_state(&self, index: u32, acked: u32) -> PacketSlotState {
        let bit = window_bit(index);
        if self.used & bit == 0 {
            PacketSlotState::Unsent
        } else if acked & bit != 0 {
            PacketSlotState::Acknowledged
        } else if self.critical & bit != 0 {
            PacketSlotState::SentCritical
        } else {
            PacketSlotState::SentNonCritical
        }
    }

    pub fn critical_bits(&self) -> u32 {
        self.critical
    }

    pub fn on_sent(&mut self, sequence: u32, critical: bool) {
        let bit = window_bit(window_index(sequence));
        self.used |= bit;
        if critical {
            self.critical |= bit;
        } else {
            self.critical &= !bit;
        }
    }

    /// Releases the messages of every packet in `newly_acked`.
    pub fn on_acked(
        &mut self,
        newly_acked: u32,
        queue: &mut MessageQueue,
        events: &mut Vec<ProtocolEvent>,
    ) -> usize {
        let mut delivered = 0;
        for index in 0..WINDOW_SIZE {
            let bit = window_bit(index);
            if newly_acked & bit == 0 || self.used & bit == 0 {
                continue;
            }
            delivered += release_delivered(queue, index as u8, events);
        }
        delivered
    }

    /// Inspects the slot that `next_sequence` is about to take over, i.e. the
    /// packet sent one full window earlier.
    ///
    /// Returns the loss if that packet was never acknowledged. Its critical
    /// messages go back to the front of the queue, the rest are dropped.
    pub fn check_window(
        &mut self,
        next_sequence: u32,
        acked: u32,
        queue: &mut MessageQueue,
        events: &mut Vec<ProtocolEvent>,
    ) -> Option<LostPacket> {
        let index = window_index(next_sequence);
        let state = self.slot_state(index, acked);

        let bit = window_bit(index);
        self.used &= !bit;
        self.critical &= !bit;

        match state {
            PacketSlotState::Unsent => None,
            PacketSlotState::Acknowledged => {
                release_delivered(queue, index as u8, events);
                None
            }
            PacketSlotState::SentCritical | PacketSlotState::SentNonCritical => {
                let sequence = next_sequence.wrapping_sub(WINDOW_SIZE);
                let critical = state == PacketSlotState::SentCritical;
                events.push(ProtocolEvent::PacketLost { sequence, critical });

                let carried = queue.in_flight(index as u8);
                let (critical_slots, other_slots): (Vec<usize>, Vec<usize>) =
                    carried.into_iter().partition(|&slot| {
                        queue.slots()[slot]
                            .in_flight_message()
                            .is_some_and(|message| message.critical)
                    });

                for &slot in &critical_slots {
                    if let Some(message) = queue.slots()[slot].in_flight_message() {
                        events.push(ProtocolEvent::MessageRequeued(MessageInfo::from(message)));
                    }
                }
                let requeued = queue.requeue(&critical_slots);

                let mut dropped = 0;
                for slot in other_slots {
                    if let Some(message) = queue.release(slot) {
                        events.push(ProtocolEvent::MessageDropped(MessageInfo::from(&message)));
                        dropped += 1;
                    }
                }

                if critical {
                    log::warn!(
                        "packet {sequence} lost, requeued {requeued} critical message(s)"
                    );
                } else {
                    log::debug!("packet {sequence} lost, dropped {dropped} message(s)");
                }

                Some(LostPacket {
                    sequence,
                    critical,
                    requeued,
                    dropped,
                })
            }
        }
    }
}

fn release_delivered(
    queue: &mut MessageQueue,
    packet: u8,
    events: &mut Vec<ProtocolEvent>,
) -> usize {
    let mut delivered = 0;
    for slot in queue.in_flight(packet) {
        if let Some(message) = queue.release(slot) {
            events.push(ProtocolEvent::MessageDelivered(MessageInfo::from(&message)));
            delivered += 1;
        }
    }
    delivered
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::message::MessageKind;
    use crate::net::protocol::PAYLOAD_CAPACITY;
    use crate::net::tracking::AckTracker;
    use std::time::Instant;

    struct Sender {
        acks: AckTracker,
        policy: RetransmitPolicy,
        queue: MessageQueue,
        events: Vec<ProtocolEvent>,
    }

    impl Sender {
        fn new() -> Self {
            Self {
                acks: AckTracker::new(),
                policy: RetransmitPolicy::new(),
                queue: MessageQueue::new(),
                events: Vec::new(),
            }
        }

        fn send(&mut self, now: Instant) -> (Option<LostPacket>, u32, Vec<Vec<u8>>) {
            let next = self.acks.sequence().wrapping_add(1);
            let lost = self.policy.check_window(
                next,
                self.acks.acked(),
                &mut self.queue,
                &mut self.events,
            );
            let sequence = self.acks.next_sequence(now);
            let messages: Vec<_> = self
                .queue
                .drain_for_packet(PAYLOAD_CAPACITY, window_index(sequence) as u8)
                .collect();
            let critical = messages.iter().any(|m| m.critical);
            self.policy.on_sent(sequence, critical);
            (lost, sequence, messages.into_iter().map(|m| m.data).collect())
        }

        fn enqueue(&mut self, data: &[u8], critical: bool) {
            self.queue
                .enqueue_fragmented(MessageKind::DATA, critical, data, self.acks.acked())
                .unwrap();
        }
    }

    #[test]
    fn test_slot_states() {
        let mut policy = RetransmitPolicy::new();
        assert_eq!(policy.slot_state(4, 0), PacketSlotState::Unsent);

        policy.on_sent(4, true);
        policy.on_sent(5, false);
        assert_eq!(policy.slot_state(4, 0), PacketSlotState::SentCritical);
        assert_eq!(policy.slot_state(5, 0), PacketSlotState::SentNonCritical);
        assert_eq!(policy.slot_state(4, 1 << 4), PacketSlotState::Acknowledged);
        assert_eq!(policy.critical_bits(), 1 << 4);
    }

    #[test]
    fn test_unacked_bit_flagged_one_window_later() {
        let mut sender = Sender::new();
        let now = Instant::now();

        for _ in 0..37 {
            let (lost, sequence, _) = sender.send(now);
            assert!(lost.is_none(), "unexpected loss before slot reuse at {sequence}");

            // peer acknowledges everything except sequence 5
            let acked = !0 & !window_bit(5);
            if sequence >= 5 {
                sender.acks.fold_ack(sequence, acked, now);
            } else {
                sender.acks.fold_ack(sequence, !0, now);
            }
        }

        let (lost, sequence, _) = sender.send(now);
        assert_eq!(sequence, 37);
        // checked while sequence was 36: slot (36 + 1) & 31 == 5, packet 36 - 31
        let lost = lost.unwrap();
        assert_eq!(lost.sequence, 5);
        assert!(!lost.critical);

        let flagged: Vec<_> = sender
            .events
            .iter()
            .filter_map(|e| match e {
                ProtocolEvent::PacketLost { sequence, .. } => Some(*sequence),
                _ => None,
            })
            .collect();
        assert_eq!(flagged, vec![5]);
    }

    #[test]
    fn test_critical_message_resent_when_never_acked() {
        let mut sender = Sender::new();
        let now = Instant::now();

        sender.enqueue(b"must arrive", true);
        let (_, first, carried) = sender.send(now);
        assert_eq!(first, 0);
        assert_eq!(carried, vec![b"must arrive".to_vec()]);

        let mut resent_at = None;
        for _ in 0..40 {
            let (lost, sequence, carried) = sender.send(now);
            if !carried.is_empty() {
                assert_eq!(lost.map(|l| l.sequence), Some(0));
                assert_eq!(carried, vec![b"must arrive".to_vec()]);
                resent_at = Some(sequence);
                break;
            }
        }

        assert_eq!(resent_at, Some(32));
        assert!(sender
            .events
            .iter()
            .any(|e| matches!(e, ProtocolEvent::MessageRequeued(info) if info.critical)));
    }

    #[test]
    fn test_requeued_critical_goes_before_unsent() {
        let mut sender = Sender::new();
        let now = Instant::now();

        sender.enqueue(b"first", true);
        sender.send(now);
        for _ in 0..31 {
            sender.send(now);
        }
        sender.enqueue(b"second", false);

        let (lost, sequence, carried) = sender.send(now);
        assert_eq!(sequence, 32);
        assert_eq!(lost.map(|l| l.requeued), Some(1));
        assert_eq!(carried, vec![b"first".to_vec(), b"second".to_vec()]);
    }

    #[test]
    fn test_lost_non_critical_is_dropped() {
        let mut sender = Sender::new();
        let now = Instant::now();

        sender.enqueue(b"best effort", false);
        sender.send(now);
        for _ in 0..31 {
            sender.send(now);
        }

        let (lost, _, carried) = sender.send(now);
        let lost = lost.unwrap();
        assert_eq!((lost.sequence, lost.critical, lost.dropped), (0, false, 1));
        assert!(carried.is_empty());
        assert!(sender
            .events
            .iter()
            .any(|e| matches!(e, ProtocolEvent::MessageDropped(_))));
    }

    #[test]
    fn test_acked_messages_are_released_as_delivered() {
        let mut sender = Sender::new();
        let now = Instant::now();

        sender.enqueue(b"ok", true);
        let (_, sequence, _) = sender.send(now);

        if let crate::net::tracking::AckFold::Applied { newly_acked } =
            sender.acks.fold_ack(sequence, !0, now)
        {
            let released = sender
                .policy
                .on_acked(newly_acked, &mut sender.queue, &mut sender.events);
            assert_eq!(released, 1);
        } else {
            panic!("ack not applied");
        }

        assert_eq!(sender.queue.in_flight_count(), 0);
        assert!(sender
            .events
            .iter()
            .any(|e| matches!(e, ProtocolEvent::MessageDelivered(info) if info.len == 2)));
    }
}
