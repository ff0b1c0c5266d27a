//! Notification hub: fan-out of lifecycle events to subscribers.
//!
//! Subscribers are either local trait objects invoked inline or bounded
//! channels drained by a remote delivery task. Registration is idempotent
//! per handle and is acknowledged by the time the call returns, so a caller
//! that subscribes before triggering traffic cannot miss events.
//!
//! Backpressure policy: channel subscribers get a bounded queue; when the
//! queue is full the event is dropped for that subscriber and
//! `moxy_events_dropped_total` is incremented, so a slow or disconnected
//! remote subscriber can never block local event producers. A closed
//! receiver unregisters the subscriber on the next publish.

use parking_lot::RwLock;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::events::{EventKind, ProxyEvent};
use crate::metrics::EVENTS_DROPPED_TOTAL;

/// In-process event subscriber, invoked inline on the publishing task.
pub trait EventListener: Send + Sync {
    fn on_event(&self, event: &ProxyEvent);
}

#[derive(Clone)]
enum Sink {
    Listener(Arc<dyn EventListener>),
    Channel(mpsc::Sender<ProxyEvent>),
}

struct SubscriberEntry {
    handle: String,
    kinds: HashSet<EventKind>,
    sink: Sink,
}

/// Subscribable fan-out of lifecycle events for one proxy instance.
#[derive(Default)]
pub struct NotificationHub {
    subscribers: RwLock<Vec<SubscriberEntry>>,
}

impl NotificationHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a local subscriber for the given event kinds.
    ///
    /// Idempotent per handle: re-registering replaces the previous
    /// subscription instead of duplicating deliveries. Once this returns
    /// the subscriber is visible to every subsequent publish.
    pub fn subscribe_listener(
        &self,
        handle: impl Into<String>,
        kinds: &[EventKind],
        listener: Arc<dyn EventListener>,
    ) {
        self.insert(handle.into(), kinds, Sink::Listener(listener));
    }

    /// Register a channel subscriber with a bounded queue and return its
    /// receiving end. Used for remote delivery.
    pub fn subscribe_channel(
        &self,
        handle: impl Into<String>,
        kinds: &[EventKind],
        capacity: usize,
    ) -> mpsc::Receiver<ProxyEvent> {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        self.insert(handle.into(), kinds, Sink::Channel(tx));
        rx
    }

    fn insert(&self, handle: String, kinds: &[EventKind], sink: Sink) {
        let entry = SubscriberEntry {
            handle: handle.clone(),
            kinds: kinds.iter().copied().collect(),
            sink,
        };
        let mut subscribers = self.subscribers.write();
        subscribers.retain(|existing| existing.handle != handle);
        subscribers.push(entry);
        debug!(%handle, "subscriber registered");
    }

    /// Remove a subscriber. Deliveries already dispatched may still
    /// complete; no further events will be delivered.
    pub fn unsubscribe(&self, handle: &str) -> bool {
        let mut subscribers = self.subscribers.write();
        let before = subscribers.len();
        subscribers.retain(|existing| existing.handle != handle);
        before != subscribers.len()
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.read().len()
    }

    /// Deliver an event to every subscriber registered for its kind.
    pub fn publish(&self, event: ProxyEvent) {
        let kind = event.kind();
        // Snapshot the sinks so delivery happens outside the lock and
        // cannot race registration.
        let targets: Vec<(String, Sink)> = self
            .subscribers
            .read()
            .iter()
            .filter(|entry| entry.kinds.contains(&kind))
            .map(|entry| (entry.handle.clone(), entry.sink.clone()))
            .collect();

        let mut closed: Vec<String> = Vec::new();
        for (handle, sink) in targets {
            match sink {
                Sink::Listener(listener) => listener.on_event(&event),
                Sink::Channel(tx) => match tx.try_send(event.clone()) {
                    Ok(()) => {}
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        EVENTS_DROPPED_TOTAL
                            .with_label_values(&[kind.as_str()])
                            .inc();
                        warn!(%handle, kind = %kind, "subscriber queue full, event dropped");
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => {
                        closed.push(handle);
                    }
                },
            }
        }

        for handle in closed {
            debug!(%handle, "subscriber channel closed, unregistering");
            self.unsubscribe(&handle);
        }
    }
}
