//! Liveness Watchdog
//!
//! Tracks when the last valid sample arrived and decides when the published
//! reading should be flagged as stale. The periodic tick that drives
//! [`LivenessWatchdog::check`] is owned by the session, one per connection.

use std::time::Duration;
use tokio::time::Instant;

pub const DEFAULT_STALE_THRESHOLD: Duration = Duration::from_secs(3);
/// Fine enough that staleness is published within 50 ms of the threshold.
pub const DEFAULT_TICK_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Liveness {
    Fresh,
    /// Transitioned to stale on this check.
    BecameStale,
    /// Was already stale.
    Stale,
}

#[derive(Debug)]
pub struct LivenessWatchdog {
    threshold: Duration,
    last_arrival: Instant,
    stale: bool,
}

impl LivenessWatchdog {
    /// Arm the watchdog; `armed_at` counts as the first arrival so a device
    /// that never sends data still goes stale.
    pub fn new(threshold: Duration, armed_at: Instant) -> Self {
        Self {
            threshold,
            last_arrival: armed_at,
            stale: false,
        }
    }

    /// A valid sample arrived. Returns `true` if this cleared staleness.
    pub fn record_arrival(&mut self, at: Instant) -> bool {
        self.last_arrival = at;
        std::mem::replace(&mut self.stale, false)
    }

    pub fn check(&mut self, now: Instant) -> Liveness {
        let silent_for = now.saturating_duration_since(self.last_arrival);
        if silent_for <= self.threshold {
            return Liveness::Fresh;
        }
        if self.stale {
            Liveness::Stale
        } else {
            self.stale = true;
            Liveness::BecameStale
        }
    }

    pub fn threshold(&self) -> Duration {
        self.threshold
    }
}
