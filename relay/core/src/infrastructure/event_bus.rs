// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

// Event Bus - Typed Pub/Sub for Relay Events
//
// Subscribers receive events through bounded per-subscriber channels
// (100 per-kind, 500 for wildcard subscriptions). Publish is non-blocking:
// events overflowing a slow subscriber are dropped for that subscriber only
// and counted, so one stuck UI consumer can never stall the manager's hot
// path. A blocking `publish_wait` variant exists for callers that opt in.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::trace;

use crate::domain::events::{Event, EventKind, EventPayload};

/// Buffer depth for subscriptions filtered to specific kinds.
const FILTERED_BUFFER: usize = 100;
/// Buffer depth for wildcard subscriptions.
const WILDCARD_BUFFER: usize = 500;

static NEXT_SUBSCRIBER_ID: AtomicUsize = AtomicUsize::new(1);

struct Subscriber {
    id: usize,
    /// `None` means wildcard.
    kinds: Option<HashSet<EventKind>>,
    tx: mpsc::Sender<Event>,
    dropped: Arc<AtomicU64>,
}

/// Handle returned by [`EventBus::subscribe`]. Dropping it unsubscribes.
pub struct Subscription {
    id: usize,
    rx: mpsc::Receiver<Event>,
    dropped: Arc<AtomicU64>,
    bus: EventBus,
}

impl Subscription {
    pub async fn recv(&mut self) -> Option<Event> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<Event> {
        self.rx.try_recv().ok()
    }

    /// Events dropped for this subscriber because its buffer was full.
    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.bus.remove_subscriber(self.id);
    }
}

/// Typed pub/sub over bounded per-subscriber channels.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<Mutex<Vec<Subscriber>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self { inner: Arc::new(Mutex::new(Vec::new())) }
    }

    /// Subscribe to specific event kinds.
    pub fn subscribe(&self, kinds: &[EventKind]) -> Subscription {
        self.subscribe_inner(Some(kinds.iter().copied().collect()), FILTERED_BUFFER)
    }

    /// Subscribe to every event kind.
    pub fn subscribe_all(&self) -> Subscription {
        self.subscribe_inner(None, WILDCARD_BUFFER)
    }

    fn subscribe_inner(&self, kinds: Option<HashSet<EventKind>>, buffer: usize) -> Subscription {
        let (tx, rx) = mpsc::channel(buffer);
        let id = NEXT_SUBSCRIBER_ID.fetch_add(1, Ordering::Relaxed);
        let dropped = Arc::new(AtomicU64::new(0));
        self.inner.lock().push(Subscriber {
            id,
            kinds,
            tx,
            dropped: Arc::clone(&dropped),
        });
        Subscription { id, rx, dropped, bus: self.clone() }
    }

    fn remove_subscriber(&self, id: usize) {
        self.inner.lock().retain(|s| s.id != id);
    }

    /// Non-blocking publish. Overflowing subscribers lose this event (counted
    /// against them); closed subscribers are pruned.
    pub fn publish(&self, payload: EventPayload) {
        let event = Event::now(payload);
        let mut subscribers = self.inner.lock();
        subscribers.retain(|sub| {
            if let Some(kinds) = &sub.kinds {
                if !kinds.contains(&event.kind()) {
                    return true;
                }
            }
            match sub.tx.try_send(event.clone()) {
                Ok(()) => true,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    sub.dropped.fetch_add(1, Ordering::Relaxed);
                    trace!(subscriber = sub.id, kind = ?event.kind(), "event dropped for slow subscriber");
                    true
                }
                Err(mpsc::error::TrySendError::Closed(_)) => false,
            }
        });
    }

    /// Blocking publish variant: waits for room in every matching
    /// subscriber's buffer. Only for callers that explicitly opt in; the hot
    /// path always uses [`publish`](Self::publish).
    pub async fn publish_wait(&self, payload: EventPayload) {
        let event = Event::now(payload);
        let targets: Vec<mpsc::Sender<Event>> = {
            let subscribers = self.inner.lock();
            subscribers
                .iter()
                .filter(|sub| {
                    sub.kinds
                        .as_ref()
                        .map_or(true, |kinds| kinds.contains(&event.kind()))
                })
                .map(|sub| sub.tx.clone())
                .collect()
        };
        for tx in targets {
            let _ = tx.send(event.clone()).await;
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.lock().len()
    }

    /// Close every subscriber channel. Pending events remain readable;
    /// subsequent `recv` calls return `None` once drained.
    pub fn shutdown(&self) {
        self.inner.lock().clear();
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::server::ConnectionState;

    fn state_event(server: &str) -> EventPayload {
        EventPayload::ServerStateChanged {
            server_name: server.into(),
            old_state: ConnectionState::Disconnected,
            new_state: ConnectionState::Connecting,
            info: None,
        }
    }

    #[tokio::test]
    async fn publish_reaches_matching_subscribers_only() {
        let bus = EventBus::new();
        let mut state_sub = bus.subscribe(&[EventKind::ServerStateChanged]);
        let mut tools_sub = bus.subscribe(&[EventKind::ToolsUpdated]);

        bus.publish(state_event("a"));

        let got = state_sub.recv().await.unwrap();
        assert_eq!(got.kind(), EventKind::ServerStateChanged);
        assert!(tools_sub.try_recv().is_none());
    }

    #[tokio::test]
    async fn wildcard_receives_everything() {
        let bus = EventBus::new();
        let mut sub = bus.subscribe_all();

        bus.publish(state_event("a"));
        bus.publish(EventPayload::ToolsUpdated { server_name: "a".into(), tool_count: 3 });

        assert_eq!(sub.recv().await.unwrap().kind(), EventKind::ServerStateChanged);
        assert_eq!(sub.recv().await.unwrap().kind(), EventKind::ToolsUpdated);
    }

    #[tokio::test]
    async fn overflow_drops_for_slow_subscriber_only() {
        let bus = EventBus::new();
        let mut slow = bus.subscribe(&[EventKind::ServerStateChanged]);

        for _ in 0..(FILTERED_BUFFER + 10) {
            bus.publish(state_event("a"));
        }
        assert_eq!(slow.dropped_count(), 10);

        // The buffered prefix is still fully readable.
        let mut received = 0;
        while slow.try_recv().is_some() {
            received += 1;
        }
        assert_eq!(received, FILTERED_BUFFER);
    }

    #[tokio::test]
    async fn dropped_subscription_is_pruned_on_next_publish() {
        let bus = EventBus::new();
        let sub = bus.subscribe_all();
        assert_eq!(bus.subscriber_count(), 1);
        drop(sub);
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn shutdown_closes_channels() {
        let bus = EventBus::new();
        let mut sub = bus.subscribe_all();
        bus.shutdown();
        assert!(sub.recv().await.is_none());
    }
}
