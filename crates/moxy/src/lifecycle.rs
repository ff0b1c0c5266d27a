//! Per-request lifecycle tracking.
//!
//! One [`RequestSession`] exists per in-flight request and owns everything
//! that must be settled exactly once: the timing milestones, the matched
//! rule's budget lease, and the terminal event. The terminal outcome is
//! guarded by a single atomic flag, so a request produces either one
//! `response` event or one `abort` event, never both and never two of
//! either. Dropping an unfinished session counts as an abort, which is how
//! a client disconnect is observed: the connection task is dropped, the
//! session drops with it, and the abort path runs.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

use crate::events::{Body, ProxyEvent, RequestRecord, ResponseRecord};
use crate::handlers::ReplyAction;
use crate::hub::NotificationHub;
use crate::metrics::{ABORTS_TOTAL, REQUESTS_TOTAL, RESPONSES_TOTAL};
use crate::rules::RuleLease;
use crate::timing::TimingTracker;

/// Tracks one request from head arrival to its terminal event.
pub struct RequestSession {
    record: Mutex<RequestRecord>,
    timing: TimingTracker,
    finished: AtomicBool,
    lease: Mutex<Option<RuleLease>>,
    seen_logged: AtomicBool,
    hub: Arc<NotificationHub>,
}

impl RequestSession {
    /// Open a session for a request whose head was just parsed, and publish
    /// the `request-initiated` event. The record's body is absent at this
    /// point by construction. A lease from head-only matching is attached
    /// before publishing, so early subscribers already see the rule id.
    pub fn begin(
        hub: Arc<NotificationHub>,
        mut record: RequestRecord,
        lease: Option<RuleLease>,
    ) -> Self {
        let timing = TimingTracker::start();
        record.body = None;
        if let Some(lease) = &lease {
            record.matched_rule_id = Some(lease.rule_id().to_string());
        }
        record.timing_events = timing.snapshot();
        REQUESTS_TOTAL.with_label_values(&[&record.method]).inc();
        debug!(request_id = %record.id, method = %record.method, url = %record.url, "request initiated");
        hub.publish(ProxyEvent::RequestInitiated(record.clone()));
        RequestSession {
            record: Mutex::new(record),
            timing,
            finished: AtomicBool::new(false),
            lease: Mutex::new(lease),
            seen_logged: AtomicBool::new(false),
            hub,
        }
    }

    pub fn request_id(&self) -> String {
        self.record.lock().id.clone()
    }

    /// Attach the matched rule's budget lease. The record carries the rule
    /// id from here on.
    pub fn attach_lease(&self, lease: RuleLease) {
        {
            let mut record = self.record.lock();
            record.matched_rule_id = Some(lease.rule_id().to_string());
        }
        *self.lease.lock() = Some(lease);
        self.log_seen_if_ready();
    }

    /// Action of the matched rule, if one is attached.
    pub fn action(&self) -> Option<crate::handlers::HandlerAction> {
        self.lease.lock().as_ref().map(RuleLease::action)
    }

    /// Record the fully buffered body and publish the `request` event.
    pub fn complete_body(&self, raw: &[u8], content_encoding: Option<&str>) {
        self.timing.mark_body_received();
        let snapshot = {
            let mut record = self.record.lock();
            record.body = Some(Body::from_wire(raw, content_encoding));
            record.timing_events = self.timing.snapshot();
            record.clone()
        };
        self.hub.publish(ProxyEvent::Request(snapshot));
        self.log_seen_if_ready();
    }

    /// Snapshot of the record as currently known.
    pub fn record(&self) -> RequestRecord {
        let mut record = self.record.lock().clone();
        record.timing_events = self.timing.snapshot();
        record
    }

    /// Settle the session with a response: stamps the send milestones,
    /// commits the rule's budget slot and publishes the `response` event.
    /// Returns `None` if the session already reached a terminal state.
    pub fn respond(&self, reply: &ReplyAction) -> Option<ResponseRecord> {
        if self.finished.swap(true, Ordering::SeqCst) {
            return None;
        }
        self.timing.mark_headers_sent();
        self.timing.mark_response_sent();

        let (id, tags) = {
            let record = self.record.lock();
            (record.id.clone(), record.tags.clone())
        };
        let content_encoding = reply.header_value("content-encoding").map(str::to_string);
        let body = if reply.body.is_empty() {
            None
        } else {
            Some(Body::from_wire(&reply.body, content_encoding.as_deref()))
        };
        let response = ResponseRecord {
            id,
            status_code: reply.status,
            status_message: reply
                .status_message
                .clone()
                .or_else(|| canonical_reason(reply.status).map(str::to_string))
                .unwrap_or_default(),
            headers: reply.headers.clone(),
            body,
            tags,
            timing_events: self.timing.snapshot(),
        };

        if let Some(lease) = self.lease.lock().take() {
            lease.commit();
        }
        RESPONSES_TOTAL
            .with_label_values(&[&reply.status.to_string()])
            .inc();
        debug!(request_id = %response.id, status = reply.status, "response sent");
        self.hub.publish(ProxyEvent::Response(response.clone()));
        Some(response)
    }

    /// Settle the session as aborted. Idempotent, and a no-op after a
    /// response has been recorded. The rule's reserved budget slot is
    /// released, not consumed.
    pub fn abort(&self, reason: &str) {
        if self.finished.swap(true, Ordering::SeqCst) {
            return;
        }
        self.timing.mark_aborted();
        let snapshot = {
            let mut record = self.record.lock();
            record.timing_events = self.timing.snapshot();
            record.clone()
        };
        // Dropping the untaken lease releases the reservation.
        self.lease.lock().take();
        ABORTS_TOTAL.inc();
        info!(request_id = %snapshot.id, reason, "request aborted");
        self.hub.publish(ProxyEvent::Abort(snapshot));
    }

    // The matched rule logs the request once it is completely buffered.
    fn log_seen_if_ready(&self) {
        let lease = self.lease.lock();
        let Some(lease) = lease.as_ref() else { return };
        let record = self.record.lock();
        if record.body.is_none() {
            return;
        }
        if self.seen_logged.swap(true, Ordering::SeqCst) {
            return;
        }
        lease.record_seen(record.clone());
    }
}

impl Drop for RequestSession {
    fn drop(&mut self) {
        // An unfinished session being dropped means the connection task was
        // torn down mid-flight, which is an abort by definition.
        if !self.finished.load(Ordering::SeqCst) {
            self.abort("connection dropped");
        }
    }
}

fn canonical_reason(status: u16) -> Option<&'static str> {
    hyper::StatusCode::from_u16(status)
        .ok()
        .and_then(|s| s.canonical_reason())
}
