// ABOUTME: Operation handlers executed inside execution units (or inline)
// ABOUTME: Data-plane query/mutate/rpc handling and control-plane auth/realtime/socket handling

use std::collections::HashMap;
use std::sync::Arc;

use futures_util::future::BoxFuture;
use serde_json::{json, Value};
use tokio::sync::{mpsc, Mutex, OnceCell};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::backend::{AuthRequest, BackendClient, BackendFactory, ChangeFeed, MutationKind};
use crate::bus::BroadcastBus;
use crate::error::GatewayError;
use crate::message::{BroadcastEvent, RequestMessage};
use crate::socket::{derive_socket_url, SocketManager};
use crate::store::SharedStore;
use crate::unit::{UnitError, UnitHandler};

/// Buffer between a backend change feed and its bus pump.
const REALTIME_SINK_CAPACITY: usize = 32;

/// Lazily initialized backend client, shared or private depending on the
/// strategy. A shared slot makes every handler built around it reuse one
/// client; a fresh slot per handler gives each its own.
pub type ClientSlot = Arc<OnceCell<Arc<dyn BackendClient>>>;

/// Whether `op` belongs on the control plane (auth, realtime, socket) rather
/// than the data pool.
#[must_use]
pub fn is_control_op(op: &str) -> bool {
    matches!(op, "getSession" | "signInWithPassword" | "signOut")
        || op.starts_with("realtime.")
        || op.starts_with("ws.")
}

fn required_str<'a>(payload: &'a Value, field: &str) -> Result<&'a str, UnitError> {
    payload.get(field).and_then(Value::as_str).ok_or_else(|| {
        UnitError::Op(GatewayError::InvalidPayload(format!(
            "missing field: {field}"
        )))
    })
}

/// Connection parameters shared by both handlers.
#[derive(Clone)]
pub struct BackendWiring {
    /// HTTP endpoint of the remote backend.
    pub endpoint: String,
    /// Store key under which session state persists.
    pub credential_key: String,
    /// Durable store for session recovery.
    pub store: SharedStore,
    /// Per-unit client constructor.
    pub factory: Arc<dyn BackendFactory>,
}

impl BackendWiring {
    /// Initialize (or reuse) the client behind `slot`.
    ///
    /// A factory failure is fatal to the surrounding unit: the slot enters
    /// supervised recovery rather than limping along without a backend.
    async fn client(&self, slot: &ClientSlot) -> Result<Arc<dyn BackendClient>, UnitError> {
        slot.get_or_try_init(|| {
            self.factory
                .create(&self.endpoint, &self.credential_key, Arc::clone(&self.store))
        })
        .await
        .map(Arc::clone)
        .map_err(|e| UnitError::Fatal(format!("backend client construction failed: {e}")))
    }
}

/// Data-plane handler: structured queries, mutations, and remote procedures.
///
/// One of these runs inside every data execution unit. The backend client is
/// created on first use so a recreated unit re-establishes its own client
/// (recovering any persisted session from the store) without coordination.
pub struct DataHandler {
    wiring: BackendWiring,
    client: ClientSlot,
}

impl DataHandler {
    /// Handler around `wiring`, using `client` as its client slot.
    #[must_use]
    pub fn new(wiring: BackendWiring, client: ClientSlot) -> Self {
        Self { wiring, client }
    }

    async fn mutate(
        &self,
        kind: MutationKind,
        payload: &Value,
    ) -> Result<Value, UnitError> {
        let client = self.wiring.client(&self.client).await?;
        let table = required_str(payload, "table")?;
        client
            .mutate(kind, table, payload.clone())
            .await
            .map_err(UnitError::Op)
    }
}

impl UnitHandler for DataHandler {
    fn handle(&self, request: RequestMessage) -> BoxFuture<'_, Result<Value, UnitError>> {
        Box::pin(async move {
            match request.op.as_str() {
                "init" => {
                    self.wiring.client(&self.client).await?;
                    Ok(json!({ "ready": true }))
                }
                "from.select" => {
                    let client = self.wiring.client(&self.client).await?;
                    let table = required_str(&request.payload, "table")?;
                    client
                        .query(table, request.payload.clone())
                        .await
                        .map_err(UnitError::Op)
                }
                "from.insert" => self.mutate(MutationKind::Insert, &request.payload).await,
                "from.update" => self.mutate(MutationKind::Update, &request.payload).await,
                "from.upsert" => self.mutate(MutationKind::Upsert, &request.payload).await,
                "from.delete" => self.mutate(MutationKind::Delete, &request.payload).await,
                "rpc" => {
                    let client = self.wiring.client(&self.client).await?;
                    let name = required_str(&request.payload, "name")?;
                    let args = request.payload.get("args").cloned().unwrap_or(Value::Null);
                    client.rpc(name, args).await.map_err(UnitError::Op)
                }
                other => Err(UnitError::Op(GatewayError::UnknownOperation(
                    other.to_string(),
                ))),
            }
        })
    }
}

struct RealtimeEntry {
    feed: ChangeFeed,
    pump: JoinHandle<()>,
}

/// Control-plane handler: auth, change subscriptions, and the socket channel.
///
/// Auth state changes fan out as `auth` events so every context observes
/// them. Change subscriptions are registered in a keyed registry; each one
/// pumps backend notifications onto the bus as `realtime` events until it is
/// unsubscribed or the handler is dropped.
pub struct ControlHandler {
    wiring: BackendWiring,
    client: ClientSlot,
    bus: BroadcastBus,
    socket: SocketManager,
    socket_url: Option<String>,
    feeds: Mutex<HashMap<String, RealtimeEntry>>,
}

impl ControlHandler {
    /// Handler around `wiring` with the given socket manager and an optional
    /// explicit socket URL.
    #[must_use]
    pub fn new(
        wiring: BackendWiring,
        client: ClientSlot,
        bus: BroadcastBus,
        socket: SocketManager,
        socket_url: Option<String>,
    ) -> Self {
        Self {
            wiring,
            client,
            bus,
            socket,
            socket_url,
            feeds: Mutex::new(HashMap::new()),
        }
    }

    async fn authenticate(&self, request: AuthRequest) -> Result<Value, UnitError> {
        let client = self.wiring.client(&self.client).await?;
        client.authenticate(request).await.map_err(UnitError::Op)
    }

    async fn sign_in(&self, payload: &Value) -> Result<Value, UnitError> {
        let username = required_str(payload, "username")?.to_string();
        let password = required_str(payload, "password")?.to_string();
        let result = self
            .authenticate(AuthRequest::SignInWithPassword { username, password })
            .await?;

        let session = result.get("session").cloned().unwrap_or(Value::Null);
        info!("Signed in, broadcasting auth state");
        self.bus.broadcast(BroadcastEvent::Auth { session });
        Ok(result)
    }

    async fn sign_out(&self) -> Result<Value, UnitError> {
        let result = self.authenticate(AuthRequest::SignOut).await?;
        info!("Signed out, broadcasting auth state");
        self.bus.broadcast(BroadcastEvent::Auth {
            session: Value::Null,
        });
        Ok(result)
    }

    async fn realtime_subscribe(&self, payload: &Value) -> Result<Value, UnitError> {
        let key = required_str(payload, "key")?.to_string();
        let client = self.wiring.client(&self.client).await?;

        let (tx, mut rx) = mpsc::channel(REALTIME_SINK_CAPACITY);
        let feed = client
            .subscribe_changes(&key, payload.clone(), tx)
            .await
            .map_err(UnitError::Op)?;

        let bus = self.bus.clone();
        let event_key = key.clone();
        let pump = tokio::spawn(async move {
            while let Some(change) = rx.recv().await {
                bus.broadcast(BroadcastEvent::Realtime {
                    key: event_key.clone(),
                    payload: change,
                });
            }
        });

        // Re-subscribing under an existing key replaces the old feed.
        let previous = self
            .feeds
            .lock()
            .await
            .insert(key.clone(), RealtimeEntry { feed, pump });
        if let Some(entry) = previous {
            debug!(key = %key, "Replacing existing change subscription");
            entry.pump.abort();
            entry.feed.unsubscribe();
        }
        Ok(json!({ "subscribed": key }))
    }

    async fn realtime_unsubscribe(&self, payload: &Value) -> Result<Value, UnitError> {
        let key = required_str(payload, "key")?;
        match self.feeds.lock().await.remove(key) {
            Some(entry) => {
                entry.pump.abort();
                entry.feed.unsubscribe();
                Ok(json!({ "unsubscribed": key }))
            }
            // Unsubscribing an unknown key is idempotent.
            None => Ok(Value::Null),
        }
    }

    async fn ws_connect(&self, payload: &Value) -> Result<Value, UnitError> {
        let explicit = payload
            .get("url")
            .and_then(Value::as_str)
            .map(str::to_string)
            .or_else(|| self.socket_url.clone());

        let url = match explicit {
            Some(url) => url,
            None => {
                // Derived URLs carry the session token, so a signed-in
                // session is a precondition.
                let raw = self
                    .wiring
                    .store
                    .get(&self.wiring.credential_key)
                    .await
                    .ok_or_else(|| {
                        UnitError::Op(GatewayError::NoSession(
                            "socket connect requires a signed-in session".to_string(),
                        ))
                    })?;
                let session: Value = serde_json::from_str(&raw).map_err(GatewayError::from)?;
                let token = session
                    .get("access_token")
                    .and_then(Value::as_str)
                    .ok_or_else(|| {
                        UnitError::Op(GatewayError::NoSession(
                            "persisted session has no access token".to_string(),
                        ))
                    })?;
                derive_socket_url(&self.wiring.endpoint, Some(token)).map_err(UnitError::Op)?
            }
        };

        self.socket.connect(url).await.map_err(UnitError::Op)?;
        Ok(json!({ "connecting": true }))
    }

    async fn ws_send(&self, payload: &Value) -> Result<Value, UnitError> {
        let data = payload.get("data").cloned().ok_or_else(|| {
            UnitError::Op(GatewayError::InvalidPayload(
                "missing field: data".to_string(),
            ))
        })?;
        let text = match data {
            Value::String(s) => s,
            other => serde_json::to_string(&other).map_err(GatewayError::from)?,
        };
        self.socket.send(text).await.map_err(UnitError::Op)?;
        Ok(json!({ "sent": true }))
    }
}

impl UnitHandler for ControlHandler {
    fn handle(&self, request: RequestMessage) -> BoxFuture<'_, Result<Value, UnitError>> {
        Box::pin(async move {
            match request.op.as_str() {
                // Warm-up doubles as the initial session snapshot: whatever
                // session the store recovered is reported back to init().
                "init" => {
                    self.wiring.client(&self.client).await?;
                    self.authenticate(AuthRequest::GetSession).await
                }
                "getSession" => self.authenticate(AuthRequest::GetSession).await,
                "signInWithPassword" => self.sign_in(&request.payload).await,
                "signOut" => self.sign_out().await,
                "realtime.subscribe" => self.realtime_subscribe(&request.payload).await,
                "realtime.unsubscribe" => self.realtime_unsubscribe(&request.payload).await,
                "ws.connect" => self.ws_connect(&request.payload).await,
                "ws.disconnect" => {
                    self.socket.disconnect().await;
                    Ok(Value::Null)
                }
                "ws.send" => self.ws_send(&request.payload).await,
                "ws.status" => {
                    let status = self.socket.status().await;
                    Ok(serde_json::to_value(status).map_err(GatewayError::from)?)
                }
                other => Err(UnitError::Op(GatewayError::UnknownOperation(
                    other.to_string(),
                ))),
            }
        })
    }
}
