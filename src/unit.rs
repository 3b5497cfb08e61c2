// ABOUTME: Isolated execution units driven purely by message passing
// ABOUTME: One tokio task per unit with an mpsc inbox and a shared event outlet

use std::sync::Arc;

use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::GatewayError;
use crate::message::{RequestMessage, ResponseMessage};

/// Inbox depth per unit. Requests beyond this are refused rather than
/// queued unboundedly.
const UNIT_INBOX_CAPACITY: usize = 64;

/// Failure modes inside a unit's request handling.
#[derive(Debug)]
pub enum UnitError {
    /// The operation failed; the unit stays healthy and keeps serving.
    Op(GatewayError),
    /// The unit is broken and must stop. All of its in-flight requests
    /// will be rejected and the slot enters supervised recovery.
    Fatal(String),
}

impl From<GatewayError> for UnitError {
    fn from(err: GatewayError) -> Self {
        Self::Op(err)
    }
}

/// Events flowing from units back to their owner (pool or strategy).
#[derive(Debug)]
pub enum UnitEvent {
    /// A response to correlate with a pending request.
    Response {
        /// Slot index of the responding unit.
        index: usize,
        /// Response envelope.
        message: ResponseMessage,
    },
    /// The unit hit a fatal error and stopped.
    Fatal {
        /// Slot index of the failed unit.
        index: usize,
        /// Failure description.
        reason: String,
    },
}

/// Behavior plugged into an execution unit.
///
/// Implementations run inside the unit's task and must not share mutable
/// state with other units; anything shared goes through the store or bus.
pub trait UnitHandler: Send + Sync {
    /// Execute one request. `Err(UnitError::Fatal)` stops the unit.
    fn handle(&self, request: RequestMessage) -> BoxFuture<'_, Result<Value, UnitError>>;
}

/// Constructs execution units for pool slots, both at init and during
/// supervised recreation.
pub trait UnitFactory: Send + Sync {
    /// Create the unit for `index`, wiring its events to `events`.
    fn create(
        &self,
        index: usize,
        events: mpsc::Sender<UnitEvent>,
    ) -> BoxFuture<'_, Result<ExecutionUnit, GatewayError>>;
}

/// A single isolated worker: one tokio task consuming typed requests from
/// its inbox, one at a time, in send order.
///
/// The unit owns its handler outright; the only ways in are the inbox and
/// the only ways out are `UnitEvent`s. The pool addresses it by slot index.
#[derive(Debug)]
pub struct ExecutionUnit {
    index: usize,
    inbox: mpsc::Sender<RequestMessage>,
    task: JoinHandle<()>,
}

impl ExecutionUnit {
    /// Spawn a unit around `handler`.
    pub fn spawn(
        index: usize,
        handler: Arc<dyn UnitHandler>,
        events: mpsc::Sender<UnitEvent>,
    ) -> Self {
        let (inbox_tx, mut inbox_rx) = mpsc::channel::<RequestMessage>(UNIT_INBOX_CAPACITY);

        let task = tokio::spawn(async move {
            debug!(index, "Execution unit started");
            while let Some(request) = inbox_rx.recv().await {
                let id = request.id;

                // Liveness probes are answered by the unit itself so the
                // pool can probe slots uniformly regardless of handler.
                if request.op == "ping" {
                    let pong = ResponseMessage::ok(id, json!({ "pong": true }));
                    if events
                        .send(UnitEvent::Response {
                            index,
                            message: pong,
                        })
                        .await
                        .is_err()
                    {
                        break;
                    }
                    continue;
                }

                let outcome = std::panic::AssertUnwindSafe(handler.handle(request))
                    .catch_unwind()
                    .await;

                let event = match outcome {
                    Ok(Ok(data)) => UnitEvent::Response {
                        index,
                        message: ResponseMessage::ok(id, data),
                    },
                    Ok(Err(UnitError::Op(err))) => UnitEvent::Response {
                        index,
                        message: ResponseMessage::err(id, &err),
                    },
                    Ok(Err(UnitError::Fatal(reason))) => UnitEvent::Fatal { index, reason },
                    Err(panic) => UnitEvent::Fatal {
                        index,
                        reason: format!("handler panicked: {panic:?}"),
                    },
                };

                let fatal = matches!(event, UnitEvent::Fatal { .. });
                if events.send(event).await.is_err() {
                    // Owner is gone; nothing left to serve.
                    break;
                }
                if fatal {
                    warn!(index, "Execution unit stopping after fatal error");
                    break;
                }
            }
            debug!(index, "Execution unit stopped");
        });

        Self {
            index,
            inbox: inbox_tx,
            task,
        }
    }

    /// Slot index this unit serves.
    #[must_use]
    pub const fn index(&self) -> usize {
        self.index
    }

    /// Queue a request on the unit's inbox.
    ///
    /// Fails immediately when the unit has stopped or its inbox is full;
    /// the pool maps both to "unit not available".
    pub fn send(&self, request: RequestMessage) -> Result<(), GatewayError> {
        self.inbox
            .try_send(request)
            .map_err(|_| GatewayError::UnitUnavailable(self.index))
    }

    /// Whether the unit's task is still running.
    #[must_use]
    pub fn is_alive(&self) -> bool {
        !self.task.is_finished()
    }

    /// Forcibly stop the unit. In-flight work is dropped.
    pub fn shutdown(&self) {
        self.task.abort();
    }
}

impl Drop for ExecutionUnit {
    fn drop(&mut self) {
        self.task.abort();
    }
}
