//! Instance-scoped event bus with string-filtered observers.
//!
//! Observers subscribe with the list of event-type names they care about.
//! Dispatch is concurrent: every matching observer runs as its own task
//! and the emitter awaits all of them, so per-observer delivery follows
//! emit order while cross-observer ordering stays unspecified. Observer
//! panics are logged and swallowed; they never reach the emitter.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;

use super::types::AgentEvent;

// ---------------------------------------------------------------------------
// Observer trait + adapters
// ---------------------------------------------------------------------------

/// An event consumer. Implementations must be cheap to clone behind an
/// `Arc` and tolerate concurrent invocation.
#[async_trait]
pub trait Observer: Send + Sync {
    async fn on_event(&self, event: AgentEvent);
}

/// Adapter running a synchronous closure on a blocking worker so it never
/// stalls the emitter.
pub struct SyncObserver<F>
where
    F: Fn(AgentEvent) + Send + Sync + 'static,
{
    callback: Arc<F>,
}

impl<F> SyncObserver<F>
where
    F: Fn(AgentEvent) + Send + Sync + 'static,
{
    pub fn new(callback: F) -> Self {
        Self {
            callback: Arc::new(callback),
        }
    }
}

#[async_trait]
impl<F> Observer for SyncObserver<F>
where
    F: Fn(AgentEvent) + Send + Sync + 'static,
{
    async fn on_event(&self, event: AgentEvent) {
        let callback = Arc::clone(&self.callback);
        if let Err(e) = tokio::task::spawn_blocking(move || callback(event)).await {
            log::error!("Sync observer panicked: {e}");
        }
    }
}

/// Adapter forwarding events into an unbounded channel; convenient for
/// streaming UIs and tests.
pub struct ChannelObserver {
    sender: tokio::sync::mpsc::UnboundedSender<AgentEvent>,
}

impl ChannelObserver {
    pub fn new(sender: tokio::sync::mpsc::UnboundedSender<AgentEvent>) -> Self {
        Self { sender }
    }
}

#[async_trait]
impl Observer for ChannelObserver {
    async fn on_event(&self, event: AgentEvent) {
        // A closed receiver just means the consumer went away.
        let _ = self.sender.send(event);
    }
}

// ---------------------------------------------------------------------------
// EventBus
// ---------------------------------------------------------------------------

struct Subscription {
    observer: Arc<dyn Observer>,
    event_types: HashSet<String>,
}

/// Routes events to subscribed observers, filtered by event type.
///
/// The bus is not persistent: late subscribers miss prior events.
#[derive(Default)]
pub struct EventBus {
    subscriptions: RwLock<Vec<Subscription>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an observer for the given event-type names.
    pub fn subscribe(&self, observer: Arc<dyn Observer>, event_types: Vec<String>) {
        self.subscriptions.write().push(Subscription {
            observer,
            event_types: event_types.into_iter().collect(),
        });
    }

    /// Remove a previously registered observer (pointer identity).
    pub fn unsubscribe(&self, observer: &Arc<dyn Observer>) {
        self.subscriptions
            .write()
            .retain(|s| !Arc::ptr_eq(&s.observer, observer));
    }

    /// Whether at least one observer listens for `event_type`.
    pub fn has_observer_for(&self, event_type: &str) -> bool {
        self.subscriptions
            .read()
            .iter()
            .any(|s| s.event_types.contains(event_type))
    }

    /// Number of registered observers.
    pub fn observer_count(&self) -> usize {
        self.subscriptions.read().len()
    }

    /// Dispatch an event to every matching observer and await them all.
    pub async fn emit(&self, event: AgentEvent) {
        let event_type = event.event_type();
        let matching: Vec<Arc<dyn Observer>> = {
            let subscriptions = self.subscriptions.read();
            subscriptions
                .iter()
                .filter(|s| s.event_types.contains(event_type))
                .map(|s| Arc::clone(&s.observer))
                .collect()
        };
        if matching.is_empty() {
            return;
        }

        let mut handles = Vec::with_capacity(matching.len());
        for observer in matching {
            let event = event.clone();
            handles.push(tokio::spawn(async move {
                observer.on_event(event).await;
            }));
        }
        for handle in handles {
            if let Err(e) = handle.await {
                log::error!("Observer failed while handling {event_type}: {e}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::types::{CompletionReason, EventMeta};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn task_completed() -> AgentEvent {
        AgentEvent::TaskCompleted {
            meta: EventMeta::new("a", "n", None),
            final_answer: None,
            reason: CompletionReason::Success,
        }
    }

    struct Counter(Arc<AtomicUsize>);

    #[async_trait]
    impl Observer for Counter {
        async fn on_event(&self, _event: AgentEvent) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn test_emit_reaches_matching_observers_only() {
        let bus = EventBus::new();
        let hits = Arc::new(AtomicUsize::new(0));
        bus.subscribe(
            Arc::new(Counter(Arc::clone(&hits))),
            vec!["TaskCompleted".into()],
        );
        bus.subscribe(Arc::new(Counter(Arc::clone(&hits))), vec!["StepStarted".into()]);

        bus.emit(task_completed()).await;
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_observer_panic_does_not_reach_emitter() {
        struct Panicker;
        #[async_trait]
        impl Observer for Panicker {
            async fn on_event(&self, _event: AgentEvent) {
                panic!("observer exploded");
            }
        }

        let bus = EventBus::new();
        let hits = Arc::new(AtomicUsize::new(0));
        bus.subscribe(Arc::new(Panicker), vec!["TaskCompleted".into()]);
        bus.subscribe(
            Arc::new(Counter(Arc::clone(&hits))),
            vec!["TaskCompleted".into()],
        );

        bus.emit(task_completed()).await;
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_unsubscribe_stops_delivery() {
        let bus = EventBus::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let observer: Arc<dyn Observer> = Arc::new(Counter(Arc::clone(&hits)));
        bus.subscribe(Arc::clone(&observer), vec!["TaskCompleted".into()]);

        bus.emit(task_completed()).await;
        bus.unsubscribe(&observer);
        bus.emit(task_completed()).await;
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_sync_observer_runs_off_the_emitter() {
        let bus = EventBus::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let hits_clone = Arc::clone(&hits);
        bus.subscribe(
            Arc::new(SyncObserver::new(move |_event| {
                hits_clone.fetch_add(1, Ordering::SeqCst);
            })),
            vec!["TaskCompleted".into()],
        );

        bus.emit(task_completed()).await;
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }
}
