// ABOUTME: Single entry point hiding strategy selection behind a uniform API
// ABOUTME: Lifecycle guards, typed operation helpers, and event subscription

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde_json::{json, Value};
use tokio::sync::broadcast;
use tracing::info;

use crate::backend::BackendFactory;
use crate::bus::{BroadcastBus, Subscription};
use crate::capability::{select_strategy, CapabilityProfile, StrategyKind};
use crate::config::GatewayOptions;
use crate::error::GatewayError;
use crate::message::{BroadcastEvent, EventKind, SocketStatus};
use crate::pool::PoolStats;
use crate::socket::{SocketConnector, TungsteniteConnector};
use crate::store::{MemoryStore, SharedStore};
use crate::strategy::{self, GatewayContext, GatewayStrategy};

/// Capability-adaptive gateway to a remote backend.
///
/// At construction the host's capabilities are snapshotted and exactly one
/// concurrency strategy is selected; every subsequent operation delegates to
/// it. Callers see the same API whether requests run on a pool of supervised
/// execution units or inline on their own task.
pub struct Gateway {
    bus: BroadcastBus,
    store: SharedStore,
    kind: StrategyKind,
    strategy: Arc<dyn GatewayStrategy>,
    initialized: AtomicBool,
    terminated: AtomicBool,
}

impl Gateway {
    /// Gateway with default wiring: in-memory store and the production
    /// socket transport.
    #[must_use]
    pub fn new(
        endpoint: impl Into<String>,
        credential_key: impl Into<String>,
        backend_factory: Arc<dyn BackendFactory>,
        options: GatewayOptions,
    ) -> Self {
        Self::with_parts(
            endpoint,
            credential_key,
            backend_factory,
            options,
            Arc::new(MemoryStore::new()),
            Arc::new(TungsteniteConnector),
        )
    }

    /// Gateway with explicit store and socket transport.
    #[must_use]
    pub fn with_parts(
        endpoint: impl Into<String>,
        credential_key: impl Into<String>,
        backend_factory: Arc<dyn BackendFactory>,
        options: GatewayOptions,
        store: SharedStore,
        connector: Arc<dyn SocketConnector>,
    ) -> Self {
        let bus = BroadcastBus::new();
        let profile = options.capability.unwrap_or_else(CapabilityProfile::detect);
        let kind = select_strategy(&profile, options.force_strategy);
        info!(?kind, "Gateway strategy selected");

        let ctx = GatewayContext {
            options,
            endpoint: endpoint.into(),
            credential_key: credential_key.into(),
            bus: bus.clone(),
            store: Arc::clone(&store),
            backend_factory,
            connector,
        };
        let strategy: Arc<dyn GatewayStrategy> = Arc::from(strategy::build(kind, &ctx));

        Self {
            bus,
            store,
            kind,
            strategy,
            initialized: AtomicBool::new(false),
            terminated: AtomicBool::new(false),
        }
    }

    /// Bring the selected strategy up. Resolves only once every execution
    /// context is ready, yielding the session snapshot recovered from the
    /// store; a second call is an error.
    pub async fn init(&self) -> Result<Value, GatewayError> {
        if self.terminated.load(Ordering::SeqCst) {
            return Err(GatewayError::Terminated);
        }
        if self.initialized.swap(true, Ordering::SeqCst) {
            return Err(GatewayError::Construction(
                "gateway already initialized".to_string(),
            ));
        }
        match self.strategy.init().await {
            Ok(snapshot) => Ok(snapshot),
            Err(e) => {
                // Failed init may be retried.
                self.initialized.store(false, Ordering::SeqCst);
                Err(e)
            }
        }
    }

    /// Execute one raw operation against the active strategy.
    pub async fn send(&self, op: &str, payload: Value) -> Result<Value, GatewayError> {
        if self.terminated.load(Ordering::SeqCst) {
            return Err(GatewayError::Terminated);
        }
        if !self.initialized.load(Ordering::SeqCst) {
            return Err(GatewayError::NotInitialized);
        }
        self.strategy.send(op, payload).await
    }

    /// Tear everything down. In-flight requests observe a terminated error;
    /// repeated calls are no-ops.
    pub async fn terminate(&self) {
        if self.terminated.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("Gateway terminating");
        self.strategy.terminate().await;
    }

    /// Register an event handler for one class of broadcast event.
    pub fn on<F>(&self, kind: EventKind, handler: F) -> Subscription
    where
        F: Fn(BroadcastEvent) + Send + Sync + 'static,
    {
        self.bus.on(kind, handler)
    }

    /// Raw receiver over every broadcast event.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<BroadcastEvent> {
        self.bus.subscribe_raw()
    }

    /// Which strategy was selected at construction.
    #[must_use]
    pub const fn strategy_kind(&self) -> StrategyKind {
        self.kind
    }

    /// Data-pool snapshot, when the active strategy has a pool.
    pub async fn pool_stats(&self) -> Option<PoolStats> {
        self.strategy.pool_stats().await
    }

    /// The durable store backing session persistence.
    #[must_use]
    pub fn store(&self) -> &SharedStore {
        &self.store
    }

    // === Typed operation helpers ===

    /// Liveness probe through the data path.
    pub async fn ping(&self) -> Result<Value, GatewayError> {
        self.send("ping", Value::Null).await
    }

    /// Current session snapshot.
    pub async fn get_session(&self) -> Result<Value, GatewayError> {
        self.send("getSession", Value::Null).await
    }

    /// Password sign-in. Fans out an `auth` event on success.
    pub async fn sign_in_with_password(
        &self,
        username: &str,
        password: &str,
    ) -> Result<Value, GatewayError> {
        self.send(
            "signInWithPassword",
            json!({ "username": username, "password": password }),
        )
        .await
    }

    /// End the session. Fans out an `auth` event with a null session.
    pub async fn sign_out(&self) -> Result<Value, GatewayError> {
        self.send("signOut", Value::Null).await
    }

    /// Read rows from `table`; `params` may carry `match` and `limit`.
    pub async fn select(&self, table: &str, params: Value) -> Result<Value, GatewayError> {
        self.send("from.select", Self::with_table(table, params)?)
            .await
    }

    /// Append rows to `table`.
    pub async fn insert(&self, table: &str, params: Value) -> Result<Value, GatewayError> {
        self.send("from.insert", Self::with_table(table, params)?)
            .await
    }

    /// Merge fields into matching rows of `table`.
    pub async fn update(&self, table: &str, params: Value) -> Result<Value, GatewayError> {
        self.send("from.update", Self::with_table(table, params)?)
            .await
    }

    /// Insert or replace rows of `table` by primary key.
    pub async fn upsert(&self, table: &str, params: Value) -> Result<Value, GatewayError> {
        self.send("from.upsert", Self::with_table(table, params)?)
            .await
    }

    /// Remove matching rows from `table`.
    pub async fn delete(&self, table: &str, params: Value) -> Result<Value, GatewayError> {
        self.send("from.delete", Self::with_table(table, params)?)
            .await
    }

    /// Invoke a named remote procedure.
    pub async fn rpc(&self, name: &str, args: Value) -> Result<Value, GatewayError> {
        self.send("rpc", json!({ "name": name, "args": args })).await
    }

    /// Start a change subscription under `key`. Changes arrive as
    /// `realtime` broadcast events.
    pub async fn realtime_subscribe(
        &self,
        key: &str,
        params: Value,
    ) -> Result<Value, GatewayError> {
        let mut payload = params;
        if let Some(obj) = payload.as_object_mut() {
            obj.insert("key".to_string(), json!(key));
        } else {
            payload = json!({ "key": key });
        }
        self.send("realtime.subscribe", payload).await
    }

    /// Stop the change subscription under `key`. Idempotent.
    pub async fn realtime_unsubscribe(&self, key: &str) -> Result<Value, GatewayError> {
        self.send("realtime.unsubscribe", json!({ "key": key })).await
    }

    /// Start a change subscription under `key` and deliver its payloads to
    /// `callback`, already filtered to that key. The returned guard removes
    /// both the subscription and the handler when dropped.
    pub async fn subscribe_changes<F>(
        &self,
        key: &str,
        params: Value,
        callback: F,
    ) -> Result<RealtimeSubscription, GatewayError>
    where
        F: Fn(Value) + Send + Sync + 'static,
    {
        self.realtime_subscribe(key, params).await?;
        let filter_key = key.to_string();
        let handler = self.bus.on(EventKind::Realtime, move |event| {
            if let BroadcastEvent::Realtime { key: event_key, payload } = event {
                if event_key == filter_key {
                    callback(payload);
                }
            }
        });
        Ok(RealtimeSubscription {
            key: key.to_string(),
            strategy: Arc::clone(&self.strategy),
            handler: Some(handler),
            armed: true,
        })
    }

    /// Open the socket channel. With no explicit URL configured, derives one
    /// from the endpoint and the persisted session token.
    pub async fn ws_connect(&self) -> Result<Value, GatewayError> {
        self.send("ws.connect", json!({})).await
    }

    /// Close the socket channel with a normal-closure code.
    pub async fn ws_disconnect(&self) -> Result<Value, GatewayError> {
        self.send("ws.disconnect", Value::Null).await
    }

    /// Send a payload over the open socket channel.
    pub async fn ws_send(&self, data: Value) -> Result<Value, GatewayError> {
        self.send("ws.send", json!({ "data": data })).await
    }

    /// Current socket channel snapshot.
    pub async fn ws_status(&self) -> Result<SocketStatus, GatewayError> {
        let raw = self.send("ws.status", Value::Null).await?;
        Ok(serde_json::from_value(raw)?)
    }

    fn with_table(table: &str, params: Value) -> Result<Value, GatewayError> {
        let mut payload = params;
        if payload.is_null() {
            return Ok(json!({ "table": table }));
        }
        match payload.as_object_mut() {
            Some(obj) => {
                obj.insert("table".to_string(), json!(table));
                Ok(payload)
            }
            None => Err(GatewayError::InvalidPayload(
                "params must be an object".to_string(),
            )),
        }
    }
}

/// Guard for one keyed change subscription opened through
/// [`Gateway::subscribe_changes`].
///
/// Dropping it stops callback delivery immediately and issues the backend
/// unsubscribe in the background; [`RealtimeSubscription::unsubscribe`] does
/// the same synchronously.
pub struct RealtimeSubscription {
    key: String,
    strategy: Arc<dyn GatewayStrategy>,
    handler: Option<Subscription>,
    armed: bool,
}

impl RealtimeSubscription {
    /// Remove the subscription and its handler, waiting for the backend
    /// unsubscribe to complete.
    pub async fn unsubscribe(mut self) -> Result<(), GatewayError> {
        if let Some(handler) = self.handler.take() {
            handler.unsubscribe();
        }
        self.armed = false;
        self.strategy
            .send("realtime.unsubscribe", json!({ "key": self.key }))
            .await?;
        Ok(())
    }
}

impl Drop for RealtimeSubscription {
    fn drop(&mut self) {
        // Dropping the bus handler stops delivery right away; the backend
        // unsubscribe rides on a detached task.
        self.handler.take();
        if self.armed {
            if let Ok(runtime) = tokio::runtime::Handle::try_current() {
                let strategy = Arc::clone(&self.strategy);
                let key = std::mem::take(&mut self.key);
                runtime.spawn(async move {
                    let _ = strategy
                        .send("realtime.unsubscribe", json!({ "key": key }))
                        .await;
                });
            }
        }
    }
}
