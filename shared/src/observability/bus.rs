//! # Event Bus
//!
//! Category-routed, non-blocking publish/subscribe pipeline.
//!
//! ## Contract
//!
//! - [`EventBus::publish`] returns without blocking the caller: delivery
//!   happens on a dispatcher task per event, and each targeted subscriber
//!   runs in its own task so one slow subscriber never delays another.
//! - Smart publishing: events whose category has zero subscribers are
//!   dropped before any delivery work: no task spawn, no formatter cost.
//! - A panic in one subscriber is caught by its task and logged without
//!   affecting the others. A subscriber returning an error is logged; the
//!   bus neither retries nor removes it.
//! - [`EventBus::shutdown`] flips the accepting flag, awaits every in-flight
//!   dispatch, then closes each subscriber. Publishes after shutdown are
//!   dropped with a warning.
//!
//! ## Locking
//!
//! The subscriber map sits behind a reader-writer lock: the publish path
//! takes the read lock only, subscribe/unsubscribe/shutdown take the write
//! lock. Dispatchers hold cloned `Arc`s to the targeted subscribers, so a
//! subscriber added mid-publish is not obligated to receive the event.
//!
//! ## Ordering
//!
//! Events are not globally ordered. A single subscriber sees events in
//! publish order only when they were published from the same producer task.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};

use tokio::sync::Notify;
use tracing::{debug, error, warn};

use super::subscriber::{CategoryFilter, Subscriber};
use super::{Event, EventCategory};

// =============================================================================
// Bus
// =============================================================================

/// The process-wide event bus. Cheap to clone; all clones share state.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

struct BusInner {
    state: RwLock<BusState>,
    in_flight: AtomicUsize,
    drained: Notify,
}

#[derive(Default)]
struct BusState {
    subscribers: HashMap<String, Arc<dyn Subscriber>>,
    by_category: HashMap<EventCategory, Vec<String>>,
    wildcard: Vec<String>,
    shut_down: bool,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(BusInner {
                state: RwLock::new(BusState::default()),
                in_flight: AtomicUsize::new(0),
                drained: Notify::new(),
            }),
        }
    }

    /// Registers a subscriber under its declared categories.
    ///
    /// A second subscriber with the same id replaces the first.
    pub fn subscribe(&self, subscriber: Arc<dyn Subscriber>) {
        let mut state = self.inner.state.write().expect("bus lock poisoned");
        let id = subscriber.id().to_string();
        if state.subscribers.contains_key(&id) {
            Self::remove_routes(&mut state, &id);
        }
        match subscriber.categories() {
            CategoryFilter::All => state.wildcard.push(id.clone()),
            CategoryFilter::Only(categories) => {
                for category in categories {
                    state.by_category.entry(*category).or_default().push(id.clone());
                }
            }
        }
        state.subscribers.insert(id, subscriber);
    }

    /// Removes a subscriber. In-flight deliveries to it still complete.
    pub fn unsubscribe(&self, id: &str) {
        let mut state = self.inner.state.write().expect("bus lock poisoned");
        Self::remove_routes(&mut state, id);
        state.subscribers.remove(id);
    }

    fn remove_routes(state: &mut BusState, id: &str) {
        state.wildcard.retain(|s| s != id);
        for ids in state.by_category.values_mut() {
            ids.retain(|s| s != id);
        }
    }

    /// Publishes an event. Never blocks on subscriber work.
    ///
    /// Must be called from within a tokio runtime; delivery is spawned.
    pub fn publish(&self, event: Event) {
        let category = match event.validate() {
            Ok(category) => category,
            Err(reason) => {
                warn!(reason, event_type = %event.event_type, "dropping invalid event");
                return;
            }
        };

        let targets: Vec<Arc<dyn Subscriber>> = {
            let state = self.inner.state.read().expect("bus lock poisoned");
            if state.shut_down {
                warn!(event_type = %event.event_type, "dropping event published after shutdown");
                return;
            }
            let mut ids: Vec<&String> = state.wildcard.iter().collect();
            if let Some(listed) = state.by_category.get(&category) {
                ids.extend(listed.iter());
            }
            ids.iter()
                .filter_map(|id| state.subscribers.get(*id).cloned())
                .collect()
        };

        // Smart-publishing fast path: nobody listens to this category.
        if targets.is_empty() {
            return;
        }

        self.inner.in_flight.fetch_add(1, Ordering::AcqRel);
        let inner = self.inner.clone();
        let event = Arc::new(event);
        tokio::spawn(async move {
            dispatch(event, targets).await;
            if inner.in_flight.fetch_sub(1, Ordering::AcqRel) == 1 {
                inner.drained.notify_waiters();
            }
        });
    }

    /// Stops accepting events, awaits in-flight dispatches, then closes each
    /// subscriber.
    pub async fn shutdown(&self) {
        let subscribers: Vec<Arc<dyn Subscriber>> = {
            let mut state = self.inner.state.write().expect("bus lock poisoned");
            state.shut_down = true;
            state.subscribers.values().cloned().collect()
        };

        loop {
            let drained = self.inner.drained.notified();
            if self.inner.in_flight.load(Ordering::Acquire) == 0 {
                break;
            }
            drained.await;
        }

        for subscriber in subscribers {
            subscriber.close().await;
        }
        debug!("event bus shut down");
    }

    /// Number of events currently being dispatched. Test hook.
    pub fn in_flight(&self) -> usize {
        self.inner.in_flight.load(Ordering::Acquire)
    }
}

/// Fans one event out to its targets, each on its own task.
async fn dispatch(event: Arc<Event>, targets: Vec<Arc<dyn Subscriber>>) {
    let mut handles = Vec::with_capacity(targets.len());
    for subscriber in targets {
        if !subscriber.accepts_type(&event.event_type) {
            continue;
        }
        let event = event.clone();
        handles.push((
            subscriber.id().to_string(),
            tokio::spawn(async move { subscriber.on_event(&event).await }),
        ));
    }

    for (id, handle) in handles {
        match handle.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                error!(subscriber = %id, error = %e, "subscriber failed to handle event");
            }
            Err(join_err) if join_err.is_panic() => {
                error!(subscriber = %id, "subscriber panicked while handling event");
            }
            Err(join_err) => {
                error!(subscriber = %id, error = %join_err, "subscriber task aborted");
            }
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::{ServiceError, ServiceResult};
    use crate::observability::EventStatus;
    use async_trait::async_trait;
    use std::sync::Mutex;
    use std::time::Duration;

    /// Test double capturing delivered events; optionally slow, failing, or
    /// panicking. The `handled` counter stands in for formatter work.
    struct RecordingSubscriber {
        id: String,
        filter: CategoryFilter,
        received: Mutex<Vec<Event>>,
        handled: AtomicUsize,
        delay: Option<Duration>,
        behavior: Behavior,
    }

    #[derive(Clone, Copy, PartialEq)]
    enum Behavior {
        Ok,
        Error,
        Panic,
    }

    impl RecordingSubscriber {
        fn new(id: &str, categories: &[&str]) -> Arc<Self> {
            let names: Vec<String> = categories.iter().map(|s| s.to_string()).collect();
            Arc::new(Self {
                id: id.to_string(),
                filter: CategoryFilter::from_names(&names),
                received: Mutex::new(Vec::new()),
                handled: AtomicUsize::new(0),
                delay: None,
                behavior: Behavior::Ok,
            })
        }

        fn slow(id: &str, categories: &[&str], delay: Duration) -> Arc<Self> {
            let names: Vec<String> = categories.iter().map(|s| s.to_string()).collect();
            Arc::new(Self {
                id: id.to_string(),
                filter: CategoryFilter::from_names(&names),
                received: Mutex::new(Vec::new()),
                handled: AtomicUsize::new(0),
                delay: Some(delay),
                behavior: Behavior::Ok,
            })
        }

        fn with_behavior(id: &str, categories: &[&str], behavior: Behavior) -> Arc<Self> {
            let names: Vec<String> = categories.iter().map(|s| s.to_string()).collect();
            Arc::new(Self {
                id: id.to_string(),
                filter: CategoryFilter::from_names(&names),
                received: Mutex::new(Vec::new()),
                handled: AtomicUsize::new(0),
                delay: None,
                behavior,
            })
        }

        fn count(&self) -> usize {
            self.handled.load(Ordering::Acquire)
        }
    }

    #[async_trait]
    impl Subscriber for RecordingSubscriber {
        fn id(&self) -> &str {
            &self.id
        }

        fn categories(&self) -> &CategoryFilter {
            &self.filter
        }

        async fn on_event(&self, event: &Event) -> ServiceResult<()> {
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            match self.behavior {
                Behavior::Panic => panic!("subscriber exploded"),
                Behavior::Error => {
                    return Err(ServiceError::server("TST-1", "subscriber error"))
                }
                Behavior::Ok => {}
            }
            self.handled.fetch_add(1, Ordering::AcqRel);
            self.received.lock().unwrap().push(event.clone());
            Ok(())
        }

        async fn close(&self) {}
    }

    fn event(event_type: &str) -> Event {
        Event::new(event_type, "test").with_status(EventStatus::Success)
    }

    #[tokio::test]
    async fn category_routing_delivers_exactly_matching_events() {
        let bus = EventBus::new();
        let sub = RecordingSubscriber::new("console", &["authentication"]);
        bus.subscribe(sub.clone());

        bus.publish(event("auth.started"));
        bus.publish(event("token.issued"));
        bus.shutdown().await;

        // Exactly one event reached the subscriber.
        assert_eq!(sub.count(), 1);
        assert_eq!(sub.received.lock().unwrap()[0].event_type, "auth.started");
    }

    #[tokio::test]
    async fn wildcard_subscriber_sees_every_category() {
        let bus = EventBus::new();
        let sub = RecordingSubscriber::new("everything", &["ALL"]);
        bus.subscribe(sub.clone());

        bus.publish(event("auth.started"));
        bus.publish(event("token.issued"));
        bus.publish(event("flow.step"));
        bus.shutdown().await;

        assert_eq!(sub.count(), 3);
    }

    #[tokio::test]
    async fn publish_does_not_block_on_slow_subscribers() {
        let bus = EventBus::new();
        let slow =
            RecordingSubscriber::slow("slow", &["authentication"], Duration::from_millis(500));
        bus.subscribe(slow.clone());

        let started = std::time::Instant::now();
        for _ in 0..10 {
            bus.publish(event("auth.started"));
        }
        let elapsed = started.elapsed();
        assert!(
            elapsed < Duration::from_millis(100),
            "publish blocked for {:?}",
            elapsed
        );

        bus.shutdown().await;
        assert_eq!(slow.count(), 10);
    }

    #[tokio::test]
    async fn events_without_subscribers_do_no_work() {
        let bus = EventBus::new();
        let sub = RecordingSubscriber::new("authn-only", &["authentication"]);
        bus.subscribe(sub.clone());

        // Tokens category has zero subscribers: dropped before dispatch.
        bus.publish(event("token.issued"));
        assert_eq!(bus.in_flight(), 0);

        bus.shutdown().await;
        assert_eq!(sub.count(), 0);
    }

    #[tokio::test]
    async fn invalid_events_are_rejected_at_publish() {
        let bus = EventBus::new();
        let sub = RecordingSubscriber::new("all", &["ALL"]);
        bus.subscribe(sub.clone());

        let mut bad = event("auth.started");
        bad.component.clear();
        bus.publish(bad);
        bus.publish(event("mystery.unknown-prefix"));
        bus.shutdown().await;

        assert_eq!(sub.count(), 0);
    }

    #[tokio::test]
    async fn subscriber_panic_does_not_affect_others() {
        let bus = EventBus::new();
        let bomber =
            RecordingSubscriber::with_behavior("bomber", &["authentication"], Behavior::Panic);
        let steady = RecordingSubscriber::new("steady", &["authentication"]);
        bus.subscribe(bomber);
        bus.subscribe(steady.clone());

        bus.publish(event("auth.started"));
        bus.shutdown().await;

        assert_eq!(steady.count(), 1);
    }

    #[tokio::test]
    async fn subscriber_errors_are_not_fatal_and_not_retried() {
        let bus = EventBus::new();
        let grumpy =
            RecordingSubscriber::with_behavior("grumpy", &["authentication"], Behavior::Error);
        bus.subscribe(grumpy.clone());

        bus.publish(event("auth.started"));
        bus.publish(event("auth.started"));
        bus.shutdown().await;

        // Still subscribed, still failing, never delivered.
        assert_eq!(grumpy.count(), 0);
    }

    #[tokio::test]
    async fn publish_after_shutdown_is_dropped() {
        let bus = EventBus::new();
        let sub = RecordingSubscriber::new("all", &["ALL"]);
        bus.subscribe(sub.clone());

        bus.shutdown().await;
        bus.publish(event("auth.started"));
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(sub.count(), 0);
    }

    #[tokio::test]
    async fn shutdown_awaits_in_flight_dispatches() {
        let bus = EventBus::new();
        let slow =
            RecordingSubscriber::slow("slow", &["authentication"], Duration::from_millis(200));
        bus.subscribe(slow.clone());

        bus.publish(event("auth.started"));
        bus.shutdown().await;

        // Delivery completed before shutdown returned.
        assert_eq!(slow.count(), 1);
    }

    #[tokio::test]
    async fn unsubscribe_stops_future_deliveries() {
        let bus = EventBus::new();
        let sub = RecordingSubscriber::new("console", &["authentication"]);
        bus.subscribe(sub.clone());

        bus.publish(event("auth.started"));
        bus.unsubscribe("console");
        bus.publish(event("auth.started"));
        bus.shutdown().await;

        assert_eq!(sub.count(), 1);
    }
}
