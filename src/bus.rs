// ABOUTME: Best-effort broadcast bus spanning execution contexts
// ABOUTME: Fire-and-forget fan-out with isolated handler invocation

use std::panic::AssertUnwindSafe;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::message::{BroadcastEvent, EventKind};

/// Default channel depth. Slow subscribers past this lag lose events, which
/// the delivery contract permits.
const BUS_CAPACITY: usize = 128;

/// Handle for one registered handler. Dropping it (or calling
/// [`Subscription::unsubscribe`]) stops delivery; [`Subscription::detach`]
/// keeps the handler alive for the life of the bus.
#[derive(Debug)]
pub struct Subscription {
    handle: Option<JoinHandle<()>>,
}

impl Subscription {
    /// Stop delivering events to this handler.
    pub fn unsubscribe(mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }

    /// Leave the handler registered until the bus itself is dropped.
    pub fn detach(mut self) {
        self.handle = None;
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}

/// Fire-and-forget publish/subscribe channel reachable from every execution
/// unit and the host.
///
/// Delivery is best-effort: no ordering across contexts, at most once per
/// subscriber per send, and no confirmation that anyone received an event.
/// A panicking handler is logged and never breaks delivery to the rest.
#[derive(Debug, Clone)]
pub struct BroadcastBus {
    tx: broadcast::Sender<BroadcastEvent>,
}

impl BroadcastBus {
    /// Create an empty bus.
    #[must_use]
    pub fn new() -> Self {
        let (tx, _rx) = broadcast::channel(BUS_CAPACITY);
        Self { tx }
    }

    /// Publish an event to every subscribed context.
    ///
    /// Never fails; an empty bus simply drops the event.
    pub fn broadcast(&self, event: BroadcastEvent) {
        if self.tx.send(event).is_err() {
            debug!("Broadcast with no subscribers, event dropped");
        }
    }

    /// Register a handler for one class of event.
    ///
    /// The handler runs on its own task so a slow or panicking subscriber
    /// cannot block or break other subscribers.
    pub fn on<F>(&self, kind: EventKind, handler: F) -> Subscription
    where
        F: Fn(BroadcastEvent) + Send + Sync + 'static,
    {
        let mut rx = self.tx.subscribe();
        let handle = tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(event) => {
                        if event.kind() != kind {
                            continue;
                        }
                        let call = AssertUnwindSafe(|| handler(event));
                        if let Err(panic) = std::panic::catch_unwind(call) {
                            warn!(?kind, ?panic, "Broadcast handler panicked, isolating");
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        // Best-effort contract: lagging subscribers lose events.
                        debug!(missed, ?kind, "Subscriber lagged, events dropped");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        Subscription {
            handle: Some(handle),
        }
    }

    /// Raw receiver for contexts that drain events themselves rather than
    /// registering handlers (execution units do this).
    #[must_use]
    pub fn subscribe_raw(&self) -> broadcast::Receiver<BroadcastEvent> {
        self.tx.subscribe()
    }

    /// Number of live subscribers (handlers plus raw receivers).
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for BroadcastBus {
    fn default() -> Self {
        Self::new()
    }
}
