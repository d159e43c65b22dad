use std::sync::atomic::{AtomicU64, Ordering};

/// Outbound impairment applied by [`LossyTransport`](super::simulator::LossyTransport).
#[derive(Debug, Clone, Default)]
pub struct PacketLossSimulation {
    pub enabled: bool,
    /// Percentage of datagrams dropped, `0.0..=100.0`.
    pub loss_percent: f32,
    pub min_latency_ms: u32,
    pub max_latency_ms: u32,
    pub jitter_ms: u32,
}

impl PacketLossSimulation {
    pub fn with_loss(loss_percent: f32) -> Self {
        Self {
            enabled: true,
            loss_percent,
            ..Default::default()
        }
    }

    pub fn should_drop(&self) -> bool {
        if !self.enabled || self.loss_percent <= 0.0 {
            return false;
        }
        rand_unit() * 100.0 < self.loss_percent
    }

    pub fn delay_ms(&self) -> u32 {
        if !self.enabled || self.max_latency_ms == 0 {
            return 0;
        }
        let base = self.min_latency_ms;
        let range = self.max_latency_ms.saturating_sub(self.min_latency_ms);
        let jitter = if self.jitter_ms > 0 {
            (rand_unit() * self.jitter_ms as f32) as u32
        } else {
            0
        };
        base + (rand_unit() * range as f32) as u32 + jitter
    }
}

#[derive(Debug, Clone, Default)]
pub struct NetworkStats {
    pub packets_sent: u64,
    pub packets_received: u64,
    pub packets_lost: u64,
    pub packets_duplicate: u64,
    pub packets_malformed: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub messages_sent: u64,
    pub messages_received: u64,
    pub messages_delivered: u64,
    pub messages_requeued: u64,
    pub messages_dropped: u64,
    pub send_errors: u64,
    pub rtt_ms: f32,
    pub rtt_variance: f32,
    pub packet_loss_percent: f32,
}

impl NetworkStats {
    pub fn update_loss_percent(&mut self) {
        self.packet_loss_percent = if self.packets_sent == 0 {
            0.0
        } else {
            self.packets_lost as f32 / self.packets_sent as f32 * 100.0
        };
    }

    /// Adds the counters of `other`; RTT fields keep the larger value.
    pub fn accumulate(&mut self, other: &NetworkStats) {
        self.packets_sent += other.packets_sent;
        self.packets_received += other.packets_received;
        self.packets_lost += other.packets_lost;
        self.packets_duplicate += other.packets_duplicate;
        self.packets_malformed += other.packets_malformed;
        self.bytes_sent += other.bytes_sent;
        self.bytes_received += other.bytes_received;
        self.messages_sent += other.messages_sent;
        self.messages_received += other.messages_received;
        self.messages_delivered += other.messages_delivered;
        self.messages_requeued += other.messages_requeued;
        self.messages_dropped += other.messages_dropped;
        self.send_errors += other.send_errors;
        self.rtt_ms = self.rtt_ms.max(other.rtt_ms);
        self.rtt_variance = self.rtt_variance.max(other.rtt_variance);
        self.update_loss_percent();
    }
}

/// Uniform value in `0.0..1.0`.
pub fn rand_unit() -> f32 {
    (rand_u64() >> 40) as f32 / (1u64 << 24) as f32
}

pub fn rand_u64() -> u64 {
    use std::collections::hash_map::DefaultHasher;
    use std::hash::{Hash, Hasher};
    use std::time::Instant;

    static COUNTER: AtomicU64 = AtomicU64::new(0);

    let mut hasher = DefaultHasher::new();
    Instant::now().hash(&mut hasher);
    COUNTER.fetch_add(1, Ordering::Relaxed).hash(&mut hasher);
    hasher.finish()
}
