//! Exponentially-decaying byte-rate estimator, ported from
//! `original_source/src/bittorrent/rate_counter.h`.

use std::time::{Duration, Instant};

pub struct RateCounter {
    period: Duration,
    start: Instant,
    rate_since: Instant,
    amount: f32,
}

impl RateCounter {
    pub fn new() -> Self {
        let now = Instant::now();
        Self {
            period: Duration::from_millis(100),
            start: now,
            rate_since: now,
            amount: 0.0,
        }
    }

    pub fn update(&mut self, bytes: f32) {
        self.amount += bytes;
        self.normalize();
    }

    /// Current rate, per second (not per internal period).
    pub fn rate(&self) -> f32 {
        let now = Instant::now();
        if now.duration_since(self.start) < self.period {
            return self.amount;
        }
        self.amount / Self::seconds(now.duration_since(self.rate_since))
    }

    fn normalize(&mut self) {
        let now = Instant::now();
        if now.duration_since(self.start) < self.period {
            return;
        }
        self.amount *= Self::seconds(self.period) / Self::seconds(now.duration_since(self.rate_since));
        self.rate_since = now - self.period;
    }

    fn seconds(d: Duration) -> f32 {
        d.as_secs_f32()
    }
}

impl Default for RateCounter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn rate_is_zero_initially() {
        let rc = RateCounter::new();
        assert_eq!(rc.rate(), 0.0);
    }

    #[test]
    fn rate_reflects_updates() {
        let mut rc = RateCounter::new();
        rc.update(1000.0);
        assert!(rc.rate() > 0.0);
    }
}
