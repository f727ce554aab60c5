//! Waypoint counters

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

/// Point-in-time snapshot of a waypoint's counters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WaypointStats {
    /// Poll turns run
    pub polls: u64,

    /// Sends accepted for submission
    pub sends_submitted: u64,

    /// Sends the transport reported as successful
    pub sends_completed: u64,

    /// Sends that failed at submission or completion
    pub sends_failed: u64,

    /// Messages handed to receive handlers
    pub receives_completed: u64,

    /// Receives that completed with a failure (e.g. truncation)
    pub receives_failed: u64,

    /// Receives armed again after a completion
    pub rearms: u64,

    /// Poll turns that ended with more than the backlog high-water mark in flight
    pub backlog_advisories: u64,

    /// Highest number of operations in flight after any poll turn
    pub peak_in_flight: u64,

    /// Operations in flight right now
    pub in_flight: u64,

    /// Receives outstanding right now (0 or 1)
    pub outstanding_receives: u64,
}

#[derive(Debug, Default)]
pub(crate) struct Counters {
    pub polls: AtomicU64,
    pub sends_submitted: AtomicU64,
    pub sends_completed: AtomicU64,
    pub sends_failed: AtomicU64,
    pub receives_completed: AtomicU64,
    pub receives_failed: AtomicU64,
    pub rearms: AtomicU64,
    pub backlog_advisories: AtomicU64,
    pub peak_in_flight: AtomicU64,
}

impl Counters {
    pub fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn observe_in_flight(&self, in_flight: usize) {
        self.peak_in_flight
            .fetch_max(in_flight as u64, Ordering::Relaxed);
    }

    pub fn snapshot(&self, in_flight: usize, outstanding_receives: usize) -> WaypointStats {
        WaypointStats {
            polls: self.polls.load(Ordering::Relaxed),
            sends_submitted: self.sends_submitted.load(Ordering::Relaxed),
            sends_completed: self.sends_completed.load(Ordering::Relaxed),
            sends_failed: self.sends_failed.load(Ordering::Relaxed),
            receives_completed: self.receives_completed.load(Ordering::Relaxed),
            receives_failed: self.receives_failed.load(Ordering::Relaxed),
            rearms: self.rearms.load(Ordering::Relaxed),
            backlog_advisories: self.backlog_advisories.load(Ordering::Relaxed),
            peak_in_flight: self.peak_in_flight.load(Ordering::Relaxed),
            in_flight: in_flight as u64,
            outstanding_receives: outstanding_receives as u64,
        }
    }
}

impl WaypointStats {
    /// Sends submitted but not yet completed either way
    pub fn sends_pending(&self) -> u64 {
        self.sends_submitted
            .saturating_sub(self.sends_completed + self.sends_failed)
    }
}
