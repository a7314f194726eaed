//! Hub cycle accounting.
//!
//! Every accounting pass records how much of the last cadence period the hub
//! spent busy.  Cycle time and duty cycle are smoothed with an exponentially
//! weighted moving average (`new = 0.5 * sample + 0.5 * previous`); the first
//! sample is taken as-is.

use std::time::{Duration, Instant};

/// Default period between accounting passes.
pub const DEFAULT_CADENCE: Duration = Duration::from_millis(1000);

const WEIGHT: f64 = 0.5;

#[derive(Debug, Clone)]
pub struct CycleMetrics {
    cadence: Duration,
    cycle_count: u64,
    cycle_time_ms: f64,
    duty_cycle: f64,
    started: Instant,
}

impl CycleMetrics {
    pub fn new(cadence: Duration) -> Self {
        Self {
            cadence,
            cycle_count: 0,
            cycle_time_ms: 0.0,
            duty_cycle: 0.0,
            started: Instant::now(),
        }
    }

    /// Record one cycle in which the hub was busy for `busy` out of
    /// `elapsed`.
    pub fn record(&mut self, busy: Duration, elapsed: Duration) {
        let busy_ms = busy.as_secs_f64() * 1000.0;
        let duty = if elapsed.is_zero() {
            0.0
        } else {
            (busy.as_secs_f64() / elapsed.as_secs_f64()).min(1.0)
        };
        if self.cycle_count == 0 {
            self.cycle_time_ms = busy_ms;
            self.duty_cycle = duty;
        } else {
            self.cycle_time_ms = WEIGHT * busy_ms + (1.0 - WEIGHT) * self.cycle_time_ms;
            self.duty_cycle = WEIGHT * duty + (1.0 - WEIGHT) * self.duty_cycle;
        }
        self.cycle_count += 1;
    }

    pub fn cadence(&self) -> Duration {
        self.cadence
    }

    pub fn cycle_count(&self) -> u64 {
        self.cycle_count
    }

    /// Smoothed busy time per cycle, in milliseconds.
    pub fn cycle_time_ms(&self) -> f64 {
        self.cycle_time_ms
    }

    /// Smoothed busy fraction in `[0, 1]`.
    pub fn duty_cycle(&self) -> f64 {
        self.duty_cycle
    }

    /// Time since the metrics were created.
    pub fn uptime(&self) -> Duration {
        self.started.elapsed()
    }
}

impl Default for CycleMetrics {
    fn default() -> Self {
        Self::new(DEFAULT_CADENCE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_sample_is_taken_as_is() {
        let mut metrics = CycleMetrics::default();
        metrics.record(Duration::from_millis(100), Duration::from_millis(1000));
        assert_eq!(metrics.cycle_count(), 1);
        assert!((metrics.cycle_time_ms() - 100.0).abs() < 1e-9);
        assert!((metrics.duty_cycle() - 0.1).abs() < 1e-9);
    }

    #[test]
    fn later_samples_are_averaged_with_half_weight() {
        let mut metrics = CycleMetrics::default();
        metrics.record(Duration::from_millis(100), Duration::from_millis(1000));
        metrics.record(Duration::from_millis(300), Duration::from_millis(1000));
        assert!((metrics.cycle_time_ms() - 200.0).abs() < 1e-9);
        assert!((metrics.duty_cycle() - 0.2).abs() < 1e-9);
        metrics.record(Duration::ZERO, Duration::from_millis(1000));
        assert!((metrics.cycle_time_ms() - 100.0).abs() < 1e-9);
        assert_eq!(metrics.cycle_count(), 3);
    }

    #[test]
    fn duty_cycle_is_capped_and_tolerates_zero_elapsed() {
        let mut metrics = CycleMetrics::new(Duration::from_millis(50));
        metrics.record(Duration::from_millis(80), Duration::from_millis(50));
        assert!((metrics.duty_cycle() - 1.0).abs() < 1e-9);

        let mut metrics = CycleMetrics::new(Duration::from_millis(50));
        metrics.record(Duration::from_millis(5), Duration::ZERO);
        assert_eq!(metrics.duty_cycle(), 0.0);
        assert_eq!(metrics.cadence(), Duration::from_millis(50));
    }
}
