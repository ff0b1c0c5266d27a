//! Per-request timing milestones.
//!
//! Two clock domains are captured deliberately: `start_time` is monotonic
//! (milliseconds since process start, immune to wall-clock adjustment) while
//! every `*_timestamp` field is wall-clock milliseconds since the Unix
//! epoch. The two are never comparable and never equal.

use once_cell::sync::Lazy;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::time::Instant;

static PROCESS_START: Lazy<Instant> = Lazy::new(Instant::now);

/// Monotonic milliseconds since process start.
pub fn monotonic_ms() -> u64 {
    PROCESS_START.elapsed().as_millis() as u64
}

/// Wall-clock milliseconds since the Unix epoch.
pub fn wall_ms() -> u64 {
    chrono::Utc::now().timestamp_millis().max(0) as u64
}

/// Timing milestones attached 1:1 to a request record.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct TimingEvents {
    /// Monotonic clock, process-relative.
    pub start_time: u64,
    /// Wall clock, captured at the same instant as `start_time`.
    pub start_timestamp: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub body_received_timestamp: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub headers_sent_timestamp: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_sent_timestamp: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub aborted_timestamp: Option<u64>,
}

/// Records milestones for one request.
///
/// Every mark is idempotent: the first call wins, later calls for the same
/// milestone are no-ops. Marks are rejected after an abort has been
/// recorded, and an abort is rejected once the response has been fully
/// sent, so a record can never claim both terminal outcomes.
#[derive(Debug)]
pub struct TimingTracker {
    events: Mutex<TimingEvents>,
}

impl TimingTracker {
    /// Captures `start_time`/`start_timestamp` for a request whose head was
    /// just observed.
    pub fn start() -> Self {
        let events = TimingEvents {
            start_time: monotonic_ms(),
            start_timestamp: wall_ms(),
            ..TimingEvents::default()
        };
        TimingTracker {
            events: Mutex::new(events),
        }
    }

    pub fn mark_body_received(&self) {
        let mut events = self.events.lock();
        if events.aborted_timestamp.is_some() || events.body_received_timestamp.is_some() {
            return;
        }
        events.body_received_timestamp = Some(next_stamp(events.start_timestamp));
    }

    pub fn mark_headers_sent(&self) {
        let mut events = self.events.lock();
        if events.aborted_timestamp.is_some() || events.headers_sent_timestamp.is_some() {
            return;
        }
        let floor = events
            .body_received_timestamp
            .unwrap_or(events.start_timestamp);
        events.headers_sent_timestamp = Some(next_stamp(floor));
    }

    pub fn mark_response_sent(&self) {
        let mut events = self.events.lock();
        if events.aborted_timestamp.is_some() || events.response_sent_timestamp.is_some() {
            return;
        }
        let floor = events
            .headers_sent_timestamp
            .unwrap_or(events.start_timestamp);
        events.response_sent_timestamp = Some(next_stamp(floor));
    }

    pub fn mark_aborted(&self) {
        let mut events = self.events.lock();
        if events.aborted_timestamp.is_some() {
            return;
        }
        // A fully sent response is authoritative; a late disconnect is not
        // an abort.
        if events.headers_sent_timestamp.is_some() && events.response_sent_timestamp.is_some() {
            return;
        }
        events.aborted_timestamp = Some(next_stamp(events.start_timestamp));
    }

    /// Snapshot of the milestones recorded so far.
    pub fn snapshot(&self) -> TimingEvents {
        self.events.lock().clone()
    }
}

// Wall stamps must be strictly ordered even when two milestones land inside
// the same millisecond tick.
fn next_stamp(floor: u64) -> u64 {
    wall_ms().max(floor + 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clocks_live_in_distinct_domains() {
        let tracker = TimingTracker::start();
        let events = tracker.snapshot();
        assert_ne!(events.start_time, events.start_timestamp);
        // Epoch milliseconds dwarf process-relative milliseconds.
        assert!(events.start_timestamp > events.start_time);
    }

    #[test]
    fn response_milestones_are_strictly_ordered() {
        let tracker = TimingTracker::start();
        tracker.mark_body_received();
        tracker.mark_headers_sent();
        tracker.mark_response_sent();
        let events = tracker.snapshot();
        let body = events.body_received_timestamp.unwrap();
        let headers = events.headers_sent_timestamp.unwrap();
        let sent = events.response_sent_timestamp.unwrap();
        assert!(events.start_timestamp < body);
        assert!(body < headers);
        assert!(headers < sent);
        assert!(events.aborted_timestamp.is_none());
    }

    #[test]
    fn marks_are_idempotent() {
        let tracker = TimingTracker::start();
        tracker.mark_body_received();
        let first = tracker.snapshot().body_received_timestamp;
        tracker.mark_body_received();
        assert_eq!(tracker.snapshot().body_received_timestamp, first);
    }

    #[test]
    fn abort_excludes_response_milestones() {
        let tracker = TimingTracker::start();
        tracker.mark_aborted();
        tracker.mark_headers_sent();
        tracker.mark_response_sent();
        let events = tracker.snapshot();
        assert!(events.aborted_timestamp.is_some());
        assert!(events.headers_sent_timestamp.is_none());
        assert!(events.response_sent_timestamp.is_none());
        assert!(events.aborted_timestamp.unwrap() > events.start_timestamp);
    }

    #[test]
    fn abort_is_rejected_after_full_response() {
        let tracker = TimingTracker::start();
        tracker.mark_headers_sent();
        tracker.mark_response_sent();
        tracker.mark_aborted();
        let events = tracker.snapshot();
        assert!(events.aborted_timestamp.is_none());
        assert!(events.response_sent_timestamp.is_some());
    }

    #[test]
    fn abort_is_idempotent() {
        let tracker = TimingTracker::start();
        tracker.mark_aborted();
        let first = tracker.snapshot().aborted_timestamp;
        tracker.mark_aborted();
        assert_eq!(tracker.snapshot().aborted_timestamp, first);
    }
}
