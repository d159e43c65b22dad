use std::time::Instant;

use super::sequence::sequence_greater_than;
use super::window::{merge_bit, window_bit, window_index, window_mask, WINDOW_SIZE};

/// Outcome of recording a peer sequence number.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Received {
    /// Newer than anything seen, folded into the window.
    New,
    /// Newer, but a full window or more ahead; only the newest bit is known now.
    Resync { gap: u32 },
    /// Older but still inside the window and not seen before.
    Late,
    Duplicate,
    /// Older than the window can represent.
    Stale,
}

impl Received {
    pub fn is_accepted(self) -> bool {
        matches!(self, Received::New | Received::Resync { .. } | Received::Late)
    }
}

/// Peer sequences we have received, acknowledged back in every packet we send.
#[derive(Debug, Clone)]
pub struct ReceiveTracker {
    sequence: u32,
    received: u32,
    synced: bool,
}

impl Default for ReceiveTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl ReceiveTracker {
    pub fn new() -> Self {
        Self {
            sequence: u32::MAX,
            received: !0,
            synced: false,
        }
    }

    pub fn record(&mut self, sequence: u32) -> Received {
        let first = !self.synced;
        if first || sequence_greater_than(sequence, self.sequence) {
            let delta = sequence.wrapping_sub(self.sequence);
            self.received = merge_bit(
                self.received,
                window_index(sequence),
                window_index(self.sequence),
                delta,
            );
            self.sequence = sequence;
            self.synced = true;

            return if delta >= WINDOW_SIZE && !first {
                Received::Resync { gap: delta }
            } else {
                Received::New
            };
        }

        if sequence == self.sequence {
            return Received::Duplicate;
        }

        let behind = self.sequence.wrapping_sub(sequence);
        if behind >= WINDOW_SIZE {
            return Received::Stale;
        }

        let bit = window_bit(window_index(sequence));
        if self.received & bit != 0 {
            Received::Duplicate
        } else {
            self.received |= bit;
            Received::Late
        }
    }

    pub fn ack_data(&self) -> (u32, u32) {
        (self.sequence, self.received)
    }

    pub fn last_sequence(&self) -> u32 {
        self.sequence
    }
}

/// Result of folding a peer's ack header into our acked window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckFold {
    /// Bits that flipped to acknowledged with this header.
    Applied { newly_acked: u32 },
    /// Our sequence is a full window or more past the ack; nothing is known.
    Desync { gap: u32 },
    /// The peer acked a sequence we have not sent yet.
    Ahead,
    /// Older than an ack already applied.
    Stale,
}

/// Our outgoing sequence and which of the last 32 packets the peer acknowledged.
#[derive(Debug, Clone)]
pub struct AckTracker {
    sequence: u32,
    acked: u32,
    last_ack: Option<u32>,
    sent_at: [Option<Instant>; WINDOW_SIZE as usize],
    srtt: f32,
    rtt_var: f32,
    rtt_samples: u64,
}

impl Default for AckTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl AckTracker {
    pub fn new() -> Self {
        Self {
            sequence: u32::MAX,
            acked: !0,
            last_ack: None,
            sent_at: [None; WINDOW_SIZE as usize],
            srtt: 100.0,
            rtt_var: 50.0,
            rtt_samples: 0,
        }
    }

    /// Advances to the sequence of the packet about to be sent.
    pub fn next_sequence(&mut self, now: Instant) -> u32 {
        self.sequence = self.sequence.wrapping_add(1);
        let index = window_index(self.sequence);
        self.acked &= !window_bit(index);
        self.sent_at[index as usize] = Some(now);
        self.sequence
    }

    pub fn fold_ack(&mut self, ack: u32, ack_bitfield: u32, now: Instant) -> AckFold {
        if sequence_greater_than(ack, self.sequence) {
            return AckFold::Ahead;
        }
        if self
            .last_ack
            .is_some_and(|last| sequence_greater_than(last, ack))
        {
            return AckFold::Stale;
        }
        self.last_ack = Some(ack);

        let gap = self.sequence.wrapping_sub(ack);
        if gap >= WINDOW_SIZE {
            self.acked = 0;
            return AckFold::Desync { gap };
        }

        let acked = ack_bitfield & window_mask(window_index(ack), window_index(self.sequence));
        let newly_acked = acked & !self.acked;
        self.acked = acked;

        for index in 0..WINDOW_SIZE {
            if newly_acked & window_bit(index) == 0 {
                continue;
            }
            if let Some(sent) = self.sent_at[index as usize].take() {
                let rtt = now.saturating_duration_since(sent).as_secs_f32() * 1000.0;
                self.update_rtt(rtt);
            }
        }

        AckFold::Applied { newly_acked }
    }

    fn update_rtt(&mut self, rtt: f32) {
        const ALPHA: f32 = 0.125;
        const BETA: f32 = 0.25;

        let diff = (rtt - self.srtt).abs();
        self.rtt_var = (1.0 - BETA) * self.rtt_var + BETA * diff;
        self.srtt = (1.0 - ALPHA) * self.srtt + ALPHA * rtt;
        self.rtt_samples += 1;
    }

    pub fn is_acked(&self, index: u32) -> bool {
        self.acked & window_bit(index) != 0
    }

    pub fn acked(&self) -> u32 {
        self.acked
    }

    pub fn sequence(&self) -> u32 {
        self.sequence
    }

    pub fn srtt(&self) -> f32 {
        self.srtt
    }

    pub fn rtt_var(&self) -> f32 {
        self.rtt_var
    }

    pub fn rtt_samples(&self) -> u64 {
        self.rtt_samples
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_receive_tracker_bitfield() {
        let mut tracker = ReceiveTracker::new();

        for seq in 0..3 {
            assert_eq!(tracker.record(seq), Received::New);
        }

        let (ack, bitfield) = tracker.ack_data();
        assert_eq!(ack, 2);
        assert_eq!(bitfield, !0);
    }

    #[test]
    fn test_receive_tracker_marks_gaps() {
        let mut tracker = ReceiveTracker::new();

        tracker.record(0);
        tracker.record(3);

        let (ack, bitfield) = tracker.ack_data();
        assert_eq!(ack, 3);
        assert_eq!(bitfield & 0b1111, 0b1001);
        // bits outside the arc still describe the initial "all received" history
        assert_eq!(bitfield >> 4, !0 >> 4);
    }

    #[test]
    fn test_receive_tracker_out_of_order() {
        let mut tracker = ReceiveTracker::new();

        tracker.record(0);
        tracker.record(3);
        assert_eq!(tracker.record(1), Received::Late);
        assert_eq!(tracker.record(2), Received::Late);

        let (ack, bitfield) = tracker.ack_data();
        assert_eq!(ack, 3);
        assert_eq!(bitfield & 0b1111, 0b1111);
    }

    #[test]
    fn test_duplicate_detection() {
        let mut tracker = ReceiveTracker::new();

        assert_eq!(tracker.record(1), Received::New);
        assert_eq!(tracker.record(1), Received::Duplicate);
        assert_eq!(tracker.record(2), Received::New);
        assert_eq!(tracker.record(1), Received::Duplicate);
    }

    #[test]
    fn test_receive_tracker_stale_and_resync() {
        let mut tracker = ReceiveTracker::new();

        tracker.record(10);
        assert_eq!(tracker.record(100), Received::Resync { gap: 90 });
        assert_eq!(tracker.ack_data(), (100, window_bit(window_index(100))));
        assert_eq!(tracker.record(60), Received::Stale);
        assert!(!Received::Stale.is_accepted());
    }

    #[test]
    fn test_receive_tracker_first_packet_after_wrap() {
        let mut tracker = ReceiveTracker::new();
        assert_eq!(tracker.record(0), Received::New);
        assert_eq!(tracker.ack_data(), (0, !0));
    }

    #[test]
    fn test_ack_tracker_sequence_starts_at_zero() {
        let mut tracker = AckTracker::new();
        let now = Instant::now();

        assert_eq!(tracker.next_sequence(now), 0);
        assert!(!tracker.is_acked(0));
        assert!(tracker.is_acked(1));
        assert_eq!(tracker.next_sequence(now), 1);
    }

    #[test]
    fn test_ack_fold_masks_unsent_arc() {
        let mut tracker = AckTracker::new();
        let now = Instant::now();
        for _ in 0..8 {
            tracker.next_sequence(now);
        }

        // peer saw up to 5 and claims everything in its field
        let fold = tracker.fold_ack(5, !0, now);

        assert_eq!(fold, AckFold::Applied { newly_acked: 0b11_1111 });
        assert!(tracker.is_acked(5));
        assert!(!tracker.is_acked(6));
        assert!(!tracker.is_acked(7));
    }

    #[test]
    fn test_ack_fold_ignores_ahead_and_stale() {
        let mut tracker = AckTracker::new();
        let now = Instant::now();
        for _ in 0..4 {
            tracker.next_sequence(now);
        }

        assert_eq!(tracker.fold_ack(9, !0, now), AckFold::Ahead);
        assert!(matches!(tracker.fold_ack(3, !0, now), AckFold::Applied { .. }));
        assert_eq!(tracker.fold_ack(2, 0, now), AckFold::Stale);
        assert!(tracker.is_acked(3));
    }

    #[test]
    fn test_ack_fold_desync_clears_window() {
        let mut tracker = AckTracker::new();
        let now = Instant::now();
        for _ in 0..40 {
            tracker.next_sequence(now);
        }

        assert_eq!(tracker.fold_ack(2, !0, now), AckFold::Desync { gap: 37 });
        assert_eq!(tracker.acked(), 0);
    }

    #[test]
    fn test_ack_tracker_rtt() {
        let mut tracker = AckTracker::new();
        let sent = Instant::now();

        tracker.next_sequence(sent);
        tracker.fold_ack(0, !0, sent + Duration::from_millis(40));

        assert_eq!(tracker.rtt_samples(), 1);
        assert!(tracker.srtt() < 100.0);
        assert!((tracker.srtt() - 92.5).abs() < 0.01);
    }

    #[test]
    fn test_rtt_sampled_once_per_packet() {
        let mut tracker = AckTracker::new();
        let sent = Instant::now();

        tracker.next_sequence(sent);
        tracker.next_sequence(sent);
        tracker.fold_ack(0, !0 & !window_bit(1), sent + Duration::from_millis(10));
        tracker.fold_ack(1, !0, sent + Duration::from_millis(20));

        assert_eq!(tracker.rtt_samples(), 2);
    }
}
