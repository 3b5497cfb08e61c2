// ABOUTME: Opaque remote backend collaborator interface
// ABOUTME: Auth/query/mutate/rpc/change-subscription traits plus an in-memory reference backend

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures_util::future::BoxFuture;
use serde_json::{json, Value};
use tokio::sync::{mpsc, RwLock};
use tracing::debug;
use uuid::Uuid;

use crate::error::GatewayError;
use crate::store::SharedStore;

/// Auth operations forwarded verbatim to the backend.
#[derive(Debug, Clone)]
pub enum AuthRequest {
    /// Fetch the current session snapshot, if any.
    GetSession,
    /// Password sign-in.
    SignInWithPassword {
        /// Account identifier.
        username: String,
        /// Account password.
        password: String,
    },
    /// End the current session.
    SignOut,
}

/// Structured data mutation flavors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutationKind {
    /// Append rows.
    Insert,
    /// Merge fields into matching rows.
    Update,
    /// Insert or replace by primary key.
    Upsert,
    /// Remove matching rows.
    Delete,
}

/// Guard for one live change subscription. Dropping it (or calling
/// [`ChangeFeed::unsubscribe`]) stops delivery into the sink.
pub struct ChangeFeed {
    cancel: Option<Box<dyn FnOnce() + Send>>,
}

impl ChangeFeed {
    /// Wrap a cancellation closure.
    #[must_use]
    pub fn new(cancel: impl FnOnce() + Send + 'static) -> Self {
        Self {
            cancel: Some(Box::new(cancel)),
        }
    }

    /// Explicitly stop the subscription.
    pub fn unsubscribe(mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl Drop for ChangeFeed {
    fn drop(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl std::fmt::Debug for ChangeFeed {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChangeFeed")
            .field("active", &self.cancel.is_some())
            .finish()
    }
}

/// The remote backend, treated as an opaque collaborator.
///
/// The gateway never interprets responses beyond success/failure; payloads
/// flow through as raw JSON. Implementations must be safe to call from any
/// execution unit concurrently.
pub trait BackendClient: Send + Sync {
    /// Execute an auth operation.
    fn authenticate(&self, request: AuthRequest) -> BoxFuture<'_, Result<Value, GatewayError>>;

    /// Read rows from `table`. `params` may carry `match` and `limit`.
    fn query(&self, table: &str, params: Value) -> BoxFuture<'_, Result<Value, GatewayError>>;

    /// Mutate rows in `table`.
    fn mutate(
        &self,
        kind: MutationKind,
        table: &str,
        params: Value,
    ) -> BoxFuture<'_, Result<Value, GatewayError>>;

    /// Invoke a named remote procedure.
    fn rpc(&self, name: &str, args: Value) -> BoxFuture<'_, Result<Value, GatewayError>>;

    /// Start a change subscription delivering payloads into `sink`.
    fn subscribe_changes(
        &self,
        key: &str,
        params: Value,
        sink: mpsc::Sender<Value>,
    ) -> BoxFuture<'_, Result<ChangeFeed, GatewayError>>;
}

/// Constructs one backend client per execution unit, so each isolated
/// context owns its connection state.
pub trait BackendFactory: Send + Sync {
    /// Create a client bound to `endpoint`, recovering any persisted session
    /// stored under `credential_key`.
    fn create(
        &self,
        endpoint: &str,
        credential_key: &str,
        store: SharedStore,
    ) -> BoxFuture<'_, Result<Arc<dyn BackendClient>, GatewayError>>;
}

// === In-memory reference backend ===

type ChangeSinks = HashMap<u64, (String, mpsc::Sender<Value>)>;

struct MemoryBackendInner {
    credential_key: String,
    store: SharedStore,
    users: RwLock<HashMap<String, String>>,
    tables: RwLock<HashMap<String, Vec<Value>>>,
    sinks: RwLock<ChangeSinks>,
    next_sink_id: AtomicU64,
}

/// In-memory backend used by the test suite and as a wiring reference.
///
/// Sessions persist through the [`SharedStore`] under the credential key, so
/// a freshly created client (e.g. inside a recreated execution unit) sees
/// the session without re-authenticating — the same recovery path a real
/// remote client would take.
#[derive(Clone)]
pub struct MemoryBackend {
    inner: Arc<MemoryBackendInner>,
}

impl MemoryBackend {
    /// Empty backend bound to `store` under `credential_key`.
    #[must_use]
    pub fn new(credential_key: impl Into<String>, store: SharedStore) -> Self {
        Self {
            inner: Arc::new(MemoryBackendInner {
                credential_key: credential_key.into(),
                store,
                users: RwLock::new(HashMap::new()),
                tables: RwLock::new(HashMap::new()),
                sinks: RwLock::new(HashMap::new()),
                next_sink_id: AtomicU64::new(1),
            }),
        }
    }

    /// Register an account for password sign-in.
    pub async fn register_user(&self, username: &str, password: &str) {
        self.inner
            .users
            .write()
            .await
            .insert(username.to_string(), password.to_string());
    }

    /// Seed a table with rows.
    pub async fn seed_table(&self, table: &str, rows: Vec<Value>) {
        self.inner.tables.write().await.insert(table.to_string(), rows);
    }

    async fn session(&self) -> Option<Value> {
        let raw = self.inner.store.get(&self.inner.credential_key).await?;
        serde_json::from_str(&raw).ok()
    }

    async fn notify(&self, table: &str, event: &str, row: &Value) {
        let payload = json!({
            "event": event,
            "table": table,
            "new": row,
        });
        let sinks = self.inner.sinks.read().await;
        for (target, sink) in sinks.values() {
            if target == table {
                let _ = sink.try_send(payload.clone());
            }
        }
    }
}

fn rows_match(row: &Value, filter: &Value) -> bool {
    match filter.as_object() {
        Some(map) => map.iter().all(|(k, v)| row.get(k) == Some(v)),
        None => true,
    }
}

impl BackendClient for MemoryBackend {
    fn authenticate(&self, request: AuthRequest) -> BoxFuture<'_, Result<Value, GatewayError>> {
        Box::pin(async move {
            match request {
                AuthRequest::GetSession => Ok(json!({
                    "session": self.session().await.unwrap_or(Value::Null),
                })),
                AuthRequest::SignInWithPassword { username, password } => {
                    let users = self.inner.users.read().await;
                    match users.get(&username) {
                        Some(stored) if *stored == password => {
                            let session = json!({
                                "access_token": Uuid::new_v4().to_string(),
                                "user": { "username": username },
                            });
                            let raw = serde_json::to_string(&session)?;
                            self.inner
                                .store
                                .set(&self.inner.credential_key, &raw)
                                .await
                                .map_err(|e| GatewayError::Backend(e.to_string()))?;
                            Ok(json!({ "session": session }))
                        }
                        _ => Err(GatewayError::Backend("invalid credentials".to_string())),
                    }
                }
                AuthRequest::SignOut => {
                    self.inner
                        .store
                        .remove(&self.inner.credential_key)
                        .await
                        .map_err(|e| GatewayError::Backend(e.to_string()))?;
                    Ok(Value::Null)
                }
            }
        })
    }

    fn query(&self, table: &str, params: Value) -> BoxFuture<'_, Result<Value, GatewayError>> {
        let table = table.to_string();
        Box::pin(async move {
            let tables = self.inner.tables.read().await;
            let rows = tables.get(&table).cloned().unwrap_or_default();

            let filter = params.get("match").cloned().unwrap_or(Value::Null);
            let mut selected: Vec<Value> = rows
                .into_iter()
                .filter(|row| filter.is_null() || rows_match(row, &filter))
                .collect();

            if let Some(limit) = params.get("limit").and_then(Value::as_u64) {
                selected.truncate(usize::try_from(limit).unwrap_or(usize::MAX));
            }

            Ok(Value::Array(selected))
        })
    }

    fn mutate(
        &self,
        kind: MutationKind,
        table: &str,
        params: Value,
    ) -> BoxFuture<'_, Result<Value, GatewayError>> {
        let table = table.to_string();
        Box::pin(async move {
            let mut tables = self.inner.tables.write().await;
            let rows = tables.entry(table.clone()).or_default();
            let data = params.get("data").cloned().unwrap_or(Value::Null);
            let filter = params.get("match").cloned().unwrap_or(Value::Null);

            let affected: Vec<Value> = match kind {
                MutationKind::Insert => {
                    let new_rows = match data {
                        Value::Array(items) => items,
                        Value::Null => {
                            return Err(GatewayError::Backend("insert requires data".to_string()))
                        }
                        single => vec![single],
                    };
                    rows.extend(new_rows.clone());
                    new_rows
                }
                MutationKind::Update => {
                    let patch = data
                        .as_object()
                        .ok_or_else(|| GatewayError::Backend("update requires an object".to_string()))?
                        .clone();
                    let mut touched = Vec::new();
                    for row in rows.iter_mut() {
                        if rows_match(row, &filter) {
                            if let Some(obj) = row.as_object_mut() {
                                for (k, v) in &patch {
                                    obj.insert(k.clone(), v.clone());
                                }
                            }
                            touched.push(row.clone());
                        }
                    }
                    touched
                }
                MutationKind::Upsert => {
                    let new_rows = match data {
                        Value::Array(items) => items,
                        Value::Null => {
                            return Err(GatewayError::Backend("upsert requires data".to_string()))
                        }
                        single => vec![single],
                    };
                    for incoming in &new_rows {
                        let id = incoming.get("id").cloned();
                        let existing = id.as_ref().and_then(|id| {
                            rows.iter_mut().find(|row| row.get("id") == Some(id))
                        });
                        match existing {
                            Some(row) => *row = incoming.clone(),
                            None => rows.push(incoming.clone()),
                        }
                    }
                    new_rows
                }
                MutationKind::Delete => {
                    let (removed, kept): (Vec<Value>, Vec<Value>) =
                        rows.drain(..).partition(|row| rows_match(row, &filter));
                    *rows = kept;
                    removed
                }
            };
            drop(tables);

            let event = match kind {
                MutationKind::Insert => "INSERT",
                MutationKind::Update => "UPDATE",
                MutationKind::Upsert => "UPSERT",
                MutationKind::Delete => "DELETE",
            };
            for row in &affected {
                self.notify(&table, event, row).await;
            }

            Ok(Value::Array(affected))
        })
    }

    fn rpc(&self, name: &str, args: Value) -> BoxFuture<'_, Result<Value, GatewayError>> {
        let name = name.to_string();
        Box::pin(async move {
            // The reference backend answers a single built-in procedure;
            // anything else is a backend-side failure, mirroring how a real
            // remote would reject an unknown function.
            match name.as_str() {
                "echo" => Ok(args),
                _ => Err(GatewayError::Backend(format!("unknown function: {name}"))),
            }
        })
    }

    fn subscribe_changes(
        &self,
        key: &str,
        params: Value,
        sink: mpsc::Sender<Value>,
    ) -> BoxFuture<'_, Result<ChangeFeed, GatewayError>> {
        let key = key.to_string();
        Box::pin(async move {
            let table = params
                .get("table")
                .and_then(Value::as_str)
                .ok_or_else(|| GatewayError::Backend("subscription requires a table".to_string()))?
                .to_string();

            let id = self.inner.next_sink_id.fetch_add(1, Ordering::SeqCst);
            self.inner.sinks.write().await.insert(id, (table, sink));
            debug!(key = %key, id, "Change subscription registered");

            let inner = Arc::clone(&self.inner);
            Ok(ChangeFeed::new(move || {
                // Removal is async; hop onto the runtime if one is running.
                if let Ok(handle) = tokio::runtime::Handle::try_current() {
                    handle.spawn(async move {
                        inner.sinks.write().await.remove(&id);
                    });
                }
            }))
        })
    }
}

/// Factory producing [`MemoryBackend`] clients that all share one dataset.
///
/// Each `create` call returns a clone of the same backend, so units see a
/// consistent store the way they would against one remote service.
#[derive(Clone)]
pub struct MemoryBackendFactory {
    backend: MemoryBackend,
}

impl MemoryBackendFactory {
    /// Wrap a prepared backend.
    #[must_use]
    pub fn new(backend: MemoryBackend) -> Self {
        Self { backend }
    }
}

impl BackendFactory for MemoryBackendFactory {
    fn create(
        &self,
        _endpoint: &str,
        _credential_key: &str,
        _store: SharedStore,
    ) -> BoxFuture<'_, Result<Arc<dyn BackendClient>, GatewayError>> {
        let backend = self.backend.clone();
        Box::pin(async move { Ok(Arc::new(backend) as Arc<dyn BackendClient>) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use pretty_assertions::assert_eq;

    fn backend() -> MemoryBackend {
        MemoryBackend::new("sb-auth", Arc::new(MemoryStore::new()))
    }

    #[tokio::test]
    async fn test_sign_in_and_session_recovery() {
        let b = backend();
        b.register_user("kira", "hunter2").await;

        let result = b
            .authenticate(AuthRequest::SignInWithPassword {
                username: "kira".to_string(),
                password: "hunter2".to_string(),
            })
            .await
            .unwrap();
        assert_eq!(result["session"]["user"]["username"], "kira");

        // A second client over the same store sees the session.
        let again = b.authenticate(AuthRequest::GetSession).await.unwrap();
        assert_eq!(again["session"]["user"]["username"], "kira");

        b.authenticate(AuthRequest::SignOut).await.unwrap();
        let cleared = b.authenticate(AuthRequest::GetSession).await.unwrap();
        assert_eq!(cleared["session"], Value::Null);
    }

    #[tokio::test]
    async fn test_bad_password_rejected() {
        let b = backend();
        b.register_user("kira", "hunter2").await;

        let result = b
            .authenticate(AuthRequest::SignInWithPassword {
                username: "kira".to_string(),
                password: "wrong".to_string(),
            })
            .await;
        assert!(matches!(result, Err(GatewayError::Backend(_))));
    }

    #[tokio::test]
    async fn test_query_with_match_and_limit() {
        let b = backend();
        b.seed_table(
            "items",
            vec![
                json!({"id": 1, "color": "red"}),
                json!({"id": 2, "color": "blue"}),
                json!({"id": 3, "color": "red"}),
            ],
        )
        .await;

        let all = b.query("items", json!({})).await.unwrap();
        assert_eq!(all.as_array().unwrap().len(), 3);

        let red = b
            .query("items", json!({"match": {"color": "red"}}))
            .await
            .unwrap();
        assert_eq!(red.as_array().unwrap().len(), 2);

        let limited = b.query("items", json!({"limit": 1})).await.unwrap();
        assert_eq!(limited.as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_mutations() {
        let b = backend();

        b.mutate(
            MutationKind::Insert,
            "items",
            json!({"data": {"id": 1, "color": "red"}}),
        )
        .await
        .unwrap();

        let updated = b
            .mutate(
                MutationKind::Update,
                "items",
                json!({"data": {"color": "green"}, "match": {"id": 1}}),
            )
            .await
            .unwrap();
        assert_eq!(updated[0]["color"], "green");

        b.mutate(
            MutationKind::Upsert,
            "items",
            json!({"data": {"id": 1, "color": "black"}}),
        )
        .await
        .unwrap();
        let rows = b.query("items", json!({})).await.unwrap();
        assert_eq!(rows.as_array().unwrap().len(), 1);
        assert_eq!(rows[0]["color"], "black");

        let removed = b
            .mutate(MutationKind::Delete, "items", json!({"match": {"id": 1}}))
            .await
            .unwrap();
        assert_eq!(removed.as_array().unwrap().len(), 1);
        let rows = b.query("items", json!({})).await.unwrap();
        assert!(rows.as_array().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_change_subscription_delivers_mutations() {
        let b = backend();
        let (tx, mut rx) = mpsc::channel(8);

        let feed = b
            .subscribe_changes("items:all", json!({"table": "items"}), tx)
            .await
            .unwrap();

        b.mutate(
            MutationKind::Insert,
            "items",
            json!({"data": {"id": 7}}),
        )
        .await
        .unwrap();

        let change = rx.recv().await.unwrap();
        assert_eq!(change["event"], "INSERT");
        assert_eq!(change["new"]["id"], 7);

        feed.unsubscribe();
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        b.mutate(
            MutationKind::Insert,
            "items",
            json!({"data": {"id": 8}}),
        )
        .await
        .unwrap();
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_rpc_echo_and_unknown() {
        let b = backend();
        let echoed = b.rpc("echo", json!({"n": 42})).await.unwrap();
        assert_eq!(echoed, json!({"n": 42}));

        let missing = b.rpc("nope", json!({})).await;
        assert!(matches!(missing, Err(GatewayError::Backend(_))));
    }
}
