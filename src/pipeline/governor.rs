//! Output pacing and measured throughput.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// Sliding-window FPS meter plus the advisory sleep toward the target rate.
#[derive(Debug)]
pub struct RateGovernor {
    window: VecDeque<f64>,
    capacity: usize,
    last: Instant,
}

impl RateGovernor {
    pub fn new(capacity: usize) -> Self {
        Self::starting_at(capacity, Instant::now())
    }

    pub fn starting_at(capacity: usize, start: Instant) -> Self {
        let capacity = capacity.max(1);
        Self {
            window: VecDeque::with_capacity(capacity),
            capacity,
            last: start,
        }
    }

    /// Record a cycle completing now and return the running mean FPS.
    pub fn record(&mut self) -> f64 {
        self.record_at(Instant::now())
    }

    pub fn record_at(&mut self, now: Instant) -> f64 {
        let elapsed = now.saturating_duration_since(self.last).as_secs_f64();
        self.last = now;
        if elapsed > 0.0 {
            if self.window.len() == self.capacity {
                self.window.pop_front();
            }
            self.window.push_back(1.0 / elapsed);
        }
        self.running_fps()
    }

    /// Arithmetic mean of the window; `0.0` before the first sample.
    pub fn running_fps(&self) -> f64 {
        if self.window.is_empty() {
            return 0.0;
        }
        self.window.iter().sum::<f64>() / self.window.len() as f64
    }

    pub fn samples(&self) -> usize {
        self.window.len()
    }
}

/// Sleep between emitted frames for a target rate.
pub fn pacing_delay(target_fps: u32) -> Duration {
    if target_fps == 0 {
        return Duration::ZERO;
    }
    Duration::from_secs_f64(1.0 / f64::from(target_fps))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mean_of_instantaneous_rates() {
        let start = Instant::now();
        let mut governor = RateGovernor::starting_at(30, start);
        assert_eq!(governor.running_fps(), 0.0);
        let fps = governor.record_at(start + Duration::from_millis(100));
        assert!((fps - 10.0).abs() < 1e-6);
        let fps = governor.record_at(start + Duration::from_millis(150));
        assert!((fps - 15.0).abs() < 1e-6);
    }

    #[test]
    fn window_keeps_only_latest_samples() {
        let start = Instant::now();
        let mut governor = RateGovernor::starting_at(3, start);
        let mut t = start;
        for _ in 0..5 {
            t += Duration::from_millis(500);
            governor.record_at(t);
        }
        for _ in 0..3 {
            t += Duration::from_millis(100);
            governor.record_at(t);
        }
        assert_eq!(governor.samples(), 3);
        assert!((governor.running_fps() - 10.0).abs() < 1e-6);
    }

    #[test]
    fn zero_interval_adds_no_sample() {
        let start = Instant::now();
        let mut governor = RateGovernor::starting_at(30, start);
        governor.record_at(start);
        assert_eq!(governor.samples(), 0);
    }

    #[test]
    fn pacing_is_reciprocal_of_target() {
        assert_eq!(pacing_delay(10), Duration::from_millis(100));
        assert_eq!(pacing_delay(0), Duration::ZERO);
    }
}
