use std::thread;
use std::time::{Duration, Instant};

/// Sleep granularity left to spin out at the end of a tick.
const SLEEP_SLACK: Duration = Duration::from_millis(1);

/// Paces a loop at a fixed number of ticks per second.
#[derive(Debug, Clone)]
pub struct TickPacer {
    tick_rate: u32,
    interval: Duration,
    next_tick: Instant,
    ticks: u64,
}

impl TickPacer {
    pub fn new(tick_rate: u32, now: Instant) -> Self {
        let tick_rate = tick_rate.max(1);
        Self {
            tick_rate,
            interval: Duration::from_secs(1) / tick_rate,
            next_tick: now,
            ticks: 0,
        }
    }

    pub fn tick_rate(&self) -> u32 {
        self.tick_rate
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn ticks(&self) -> u64 {
        self.ticks
    }

    pub fn remaining(&self, now: Instant) -> Duration {
        self.next_tick.saturating_duration_since(now)
    }

    pub fn is_due(&self, now: Instant) -> bool {
        now >= self.next_tick
    }

    /// Marks a tick as started at `now` and schedules the next one. A loop
    /// that fell more than a tick behind resumes from `now` instead of
    /// bursting to catch up.
    pub fn advance(&mut self, now: Instant) {
        self.next_tick += self.interval;
        if now > self.next_tick + self.interval {
            self.next_tick = now + self.interval;
        }
        self.ticks += 1;
    }

    /// Sleeps until the next tick is due and returns the tick's start time.
    pub fn wait(&mut self) -> Instant {
        loop {
            let remaining = self.remaining(Instant::now());
            if remaining <= SLEEP_SLACK {
                break;
            }
            thread::sleep(remaining - SLEEP_SLACK);
        }
        while !self.is_due(Instant::now()) {
            std::hint::spin_loop();
        }

        let now = Instant::now();
        self.advance(now);
        now
    }
}
