//! [`Watchdog`] – stalled-lane detection.
//!
//! The hub calls [`Watchdog::released`] whenever a lane hands it a request
//! and [`Watchdog::ready`] when the lane's subsystem finishes with it.  A
//! lane that stays busy longer than the threshold is *stalled*: its
//! subsystem never answered and every request behind it is stuck.
//!
//! Call [`Watchdog::check_all`] from the hub's accounting pass to obtain the
//! stalled lanes.  Nothing is cancelled; the report is a diagnostic.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::sequencer::Lane;

// ────────────────────────────────────────────────────────────────────────────
// Public types
// ────────────────────────────────────────────────────────────────────────────

/// State reported for a single lane.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LaneHealth {
    /// Nothing in flight.
    Idle,
    /// A request is in flight and still within the threshold.
    Busy,
    /// A request has been in flight longer than the threshold.
    Stalled,
}

// ────────────────────────────────────────────────────────────────────────────
// Watchdog
// ────────────────────────────────────────────────────────────────────────────

/// Tracks how long each lane has had a request in flight.
///
/// # Example
///
/// ```
/// use std::time::Duration;
/// use bert_kernel::{Lane, LaneHealth, Watchdog};
///
/// let mut wd = Watchdog::new(Duration::from_secs(10));
/// wd.released(Lane::Motor);
/// assert_eq!(wd.health(Lane::Motor), LaneHealth::Busy);
///
/// wd.ready(Lane::Motor);
/// assert_eq!(wd.health(Lane::Motor), LaneHealth::Idle);
/// ```
pub struct Watchdog {
    threshold: Duration,
    busy_since: HashMap<Lane, Instant>,
}

impl Watchdog {
    pub fn new(threshold: Duration) -> Self {
        Self { threshold, busy_since: HashMap::new() }
    }

    pub fn threshold(&self) -> Duration {
        self.threshold
    }

    /// Record that `lane` released a request.  Restarts the lane's clock
    /// if it was already busy.
    pub fn released(&mut self, lane: Lane) {
        self.busy_since.insert(lane, Instant::now());
    }

    /// Record that `lane`'s subsystem is ready again.
    pub fn ready(&mut self, lane: Lane) {
        self.busy_since.remove(&lane);
    }

    /// Forget every lane, as after a reset.
    pub fn clear(&mut self) {
        self.busy_since.clear();
    }

    pub fn health(&self, lane: Lane) -> LaneHealth {
        match self.busy_since.get(&lane) {
            None => LaneHealth::Idle,
            Some(since) if since.elapsed() <= self.threshold => LaneHealth::Busy,
            Some(_) => LaneHealth::Stalled,
        }
    }

    /// Stalled lanes and how long each has been busy, in lane order.
    pub fn check_all(&self) -> Vec<(Lane, Duration)> {
        let mut stalled: Vec<(Lane, Duration)> = self
            .busy_since
            .iter()
            .map(|(lane, since)| (*lane, since.elapsed()))
            .filter(|(_, busy)| *busy > self.threshold)
            .collect();
        stalled.sort_by_key(|(lane, _)| *lane);
        stalled
    }
}
