// ABOUTME: Pooled strategies: control-plane unit plus a pool of data units
// ABOUTME: Shared variant reuses one backend client; dedicated gives every unit its own

use std::sync::Arc;

use futures_util::future::{try_join_all, BoxFuture};
use serde_json::Value;
use tokio::sync::{mpsc, OnceCell};
use tracing::info;

use crate::bus::BroadcastBus;
use crate::capability::StrategyKind;
use crate::error::GatewayError;
use crate::message::BroadcastEvent;
use crate::pool::{PoolSettings, PoolStats, WorkerPool};
use crate::socket::{SocketManager, SocketSettings};
use crate::strategy::handlers::{
    is_control_op, BackendWiring, ClientSlot, ControlHandler, DataHandler,
};
use crate::strategy::{GatewayContext, GatewayStrategy};
use crate::unit::{ExecutionUnit, UnitEvent, UnitFactory};

fn slot_for(shared: Option<&ClientSlot>) -> ClientSlot {
    shared.map_or_else(|| Arc::new(OnceCell::new()), Arc::clone)
}

struct DataUnitFactory {
    wiring: BackendWiring,
    shared: Option<ClientSlot>,
}

impl UnitFactory for DataUnitFactory {
    fn create(
        &self,
        index: usize,
        events: mpsc::Sender<UnitEvent>,
    ) -> BoxFuture<'_, Result<ExecutionUnit, GatewayError>> {
        Box::pin(async move {
            let handler = DataHandler::new(self.wiring.clone(), slot_for(self.shared.as_ref()));
            Ok(ExecutionUnit::spawn(index, Arc::new(handler), events))
        })
    }
}

struct ControlUnitFactory {
    wiring: BackendWiring,
    shared: Option<ClientSlot>,
    bus: BroadcastBus,
    socket: SocketManager,
    socket_url: Option<String>,
}

impl UnitFactory for ControlUnitFactory {
    fn create(
        &self,
        index: usize,
        events: mpsc::Sender<UnitEvent>,
    ) -> BoxFuture<'_, Result<ExecutionUnit, GatewayError>> {
        Box::pin(async move {
            let handler = ControlHandler::new(
                self.wiring.clone(),
                slot_for(self.shared.as_ref()),
                self.bus.clone(),
                self.socket.clone(),
                self.socket_url.clone(),
            );
            Ok(ExecutionUnit::spawn(index, Arc::new(handler), events))
        })
    }
}

/// Pooled arrangement: one supervised control unit (auth, realtime, socket)
/// plus a round-robin pool of data units, all message-passing.
///
/// The shared flavor hands every unit the same lazily-created backend
/// client; the dedicated flavor gives each unit a private one. Both recover
/// crashed units the same way, through the pool's backoff supervision.
pub struct PooledStrategy {
    kind: StrategyKind,
    data_size: usize,
    data: WorkerPool,
    control: WorkerPool,
    socket: SocketManager,
    bus: BroadcastBus,
}

impl PooledStrategy {
    /// Maximal-sharing flavor: one backend client behind every unit.
    #[must_use]
    pub fn shared(ctx: &GatewayContext) -> Self {
        Self::build(ctx, StrategyKind::PooledShared)
    }

    /// Isolated flavor: every unit constructs its own backend client.
    #[must_use]
    pub fn dedicated(ctx: &GatewayContext) -> Self {
        Self::build(ctx, StrategyKind::PooledDedicated)
    }

    fn build(ctx: &GatewayContext, kind: StrategyKind) -> Self {
        let wiring = BackendWiring {
            endpoint: ctx.endpoint.clone(),
            credential_key: ctx.credential_key.clone(),
            store: Arc::clone(&ctx.store),
            factory: Arc::clone(&ctx.backend_factory),
        };
        let socket = SocketManager::new(
            SocketSettings::from(&ctx.options),
            Arc::clone(&ctx.connector),
            ctx.bus.clone(),
        );

        let shared = match kind {
            StrategyKind::PooledShared => Some(Arc::new(OnceCell::new())),
            _ => None,
        };

        let data = WorkerPool::new(
            PoolSettings::from(&ctx.options),
            Arc::new(DataUnitFactory {
                wiring: wiring.clone(),
                shared: shared.clone(),
            }),
        );
        let control = WorkerPool::new(
            PoolSettings {
                size: 1,
                ..PoolSettings::from(&ctx.options)
            },
            Arc::new(ControlUnitFactory {
                wiring,
                shared,
                bus: ctx.bus.clone(),
                socket: socket.clone(),
                socket_url: ctx.options.socket_url.clone(),
            }),
        );

        Self {
            kind,
            data_size: ctx.options.pool_size,
            data,
            control,
            socket,
            bus: ctx.bus.clone(),
        }
    }
}

impl GatewayStrategy for PooledStrategy {
    fn kind(&self) -> StrategyKind {
        self.kind
    }

    fn init(&self) -> BoxFuture<'_, Result<Value, GatewayError>> {
        Box::pin(async move {
            self.control.init().await?;
            self.data.init().await?;

            // Warm every unit's backend client before declaring readiness.
            // The control unit's warm-up reply carries the session snapshot
            // recovered from the store.
            let snapshot = self.control.send_to_unit(0, "init", Value::Null).await?;
            let warmups =
                (0..self.data_size).map(|i| self.data.send_to_unit(i, "init", Value::Null));
            try_join_all(warmups).await?;

            info!(kind = ?self.kind, units = self.data_size, "Pooled strategy ready");
            self.bus.broadcast(BroadcastEvent::Ready);
            Ok(snapshot)
        })
    }

    fn send(&self, op: &str, payload: Value) -> BoxFuture<'_, Result<Value, GatewayError>> {
        let op = op.to_string();
        Box::pin(async move {
            if is_control_op(&op) {
                self.control.send(&op, payload).await
            } else {
                self.data.send(&op, payload).await
            }
        })
    }

    fn terminate(&self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            self.socket.disconnect().await;
            self.control.terminate().await;
            self.data.terminate().await;
        })
    }

    fn pool_stats(&self) -> BoxFuture<'_, Option<PoolStats>> {
        Box::pin(async move { Some(self.data.stats().await) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{
        AuthRequest, BackendClient, BackendFactory, MemoryBackend, MemoryBackendFactory,
    };
    use crate::config::GatewayOptions;
    use crate::socket::TungsteniteConnector;
    use crate::store::{MemoryStore, SharedStore};
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Counts backend client constructions to observe sharing behavior.
    struct CountingFactory {
        inner: MemoryBackendFactory,
        count: AtomicUsize,
    }

    impl CountingFactory {
        fn new(inner: MemoryBackendFactory) -> Self {
            Self {
                inner,
                count: AtomicUsize::new(0),
            }
        }

        fn count(&self) -> usize {
            self.count.load(Ordering::SeqCst)
        }
    }

    impl BackendFactory for CountingFactory {
        fn create(
            &self,
            endpoint: &str,
            credential_key: &str,
            store: SharedStore,
        ) -> BoxFuture<'_, Result<Arc<dyn BackendClient>, GatewayError>> {
            self.count.fetch_add(1, Ordering::SeqCst);
            self.inner.create(endpoint, credential_key, store)
        }
    }

    fn context() -> (GatewayContext, MemoryBackend, Arc<CountingFactory>) {
        let store: SharedStore = Arc::new(MemoryStore::new());
        let backend = MemoryBackend::new("cred", Arc::clone(&store));
        let factory = Arc::new(CountingFactory::new(MemoryBackendFactory::new(
            backend.clone(),
        )));
        let ctx = GatewayContext {
            options: GatewayOptions::default(),
            endpoint: "https://api.example.test".to_string(),
            credential_key: "cred".to_string(),
            bus: BroadcastBus::new(),
            store,
            backend_factory: Arc::clone(&factory) as Arc<dyn BackendFactory>,
            connector: Arc::new(TungsteniteConnector),
        };
        (ctx, backend, factory)
    }

    #[tokio::test]
    async fn test_init_broadcasts_ready() {
        let (ctx, _backend, _factory) = context();
        let mut rx = ctx.bus.subscribe_raw();

        let strategy = PooledStrategy::shared(&ctx);
        strategy.init().await.unwrap();

        assert!(matches!(rx.recv().await.unwrap(), BroadcastEvent::Ready));
        assert_eq!(strategy.kind(), StrategyKind::PooledShared);
    }

    #[tokio::test]
    async fn test_init_returns_session_snapshot() {
        let (ctx, backend, _factory) = context();
        backend.register_user("kira", "hunter2").await;

        // No stored session yet: init reports a null snapshot.
        let strategy = PooledStrategy::shared(&ctx);
        let snapshot = strategy.init().await.unwrap();
        assert_eq!(snapshot["session"], Value::Null);
        strategy.terminate().await;

        // A session persisted in the store surfaces through init directly.
        backend
            .authenticate(AuthRequest::SignInWithPassword {
                username: "kira".to_string(),
                password: "hunter2".to_string(),
            })
            .await
            .unwrap();
        let recovered = PooledStrategy::shared(&ctx);
        let snapshot = recovered.init().await.unwrap();
        assert_eq!(snapshot["session"]["user"]["username"], "kira");
    }

    #[tokio::test]
    async fn test_shared_flavor_constructs_one_client() {
        let (ctx, _backend, factory) = context();
        let strategy = PooledStrategy::shared(&ctx);
        strategy.init().await.unwrap();

        // One client behind the control unit and all three data units.
        assert_eq!(factory.count(), 1);
    }

    #[tokio::test]
    async fn test_dedicated_flavor_constructs_one_client_per_unit() {
        let (ctx, _backend, factory) = context();
        let strategy = PooledStrategy::dedicated(&ctx);
        strategy.init().await.unwrap();

        assert_eq!(factory.count(), ctx.options.pool_size + 1);
    }

    #[tokio::test]
    async fn test_data_ops_round_robin_through_pool() {
        let (ctx, _backend, _factory) = context();
        let strategy = PooledStrategy::shared(&ctx);
        strategy.init().await.unwrap();

        strategy
            .send("from.insert", json!({"table": "t", "data": {"id": 1}}))
            .await
            .unwrap();
        let rows = strategy
            .send("from.select", json!({"table": "t"}))
            .await
            .unwrap();
        assert_eq!(rows.as_array().unwrap().len(), 1);

        let stats = strategy.pool_stats().await.unwrap();
        assert_eq!(stats.size, 3);
        assert_eq!(stats.live_units, 3);
        // Two data ops consumed two round-robin slots.
        assert_eq!(stats.next_index, 2);
    }

    #[tokio::test]
    async fn test_control_ops_route_to_control_unit() {
        let (ctx, backend, _factory) = context();
        backend.register_user("kira", "hunter2").await;

        let strategy = PooledStrategy::shared(&ctx);
        strategy.init().await.unwrap();

        let before = strategy.pool_stats().await.unwrap().next_index;
        let result = strategy
            .send(
                "signInWithPassword",
                json!({"username": "kira", "password": "hunter2"}),
            )
            .await
            .unwrap();
        assert_eq!(result["session"]["user"]["username"], "kira");

        // Control traffic never consumes data-pool slots.
        assert_eq!(strategy.pool_stats().await.unwrap().next_index, before);
    }

    #[tokio::test]
    async fn test_ping_routes_to_data_pool() {
        let (ctx, _backend, _factory) = context();
        let strategy = PooledStrategy::shared(&ctx);
        strategy.init().await.unwrap();

        let pong = strategy.send("ping", Value::Null).await.unwrap();
        assert_eq!(pong["pong"], true);
    }

    #[tokio::test]
    async fn test_terminate_rejects_further_requests() {
        let (ctx, _backend, _factory) = context();
        let strategy = PooledStrategy::shared(&ctx);
        strategy.init().await.unwrap();
        strategy.terminate().await;

        let result = strategy.send("ping", Value::Null).await;
        assert!(matches!(result, Err(GatewayError::Terminated)));
        let result = strategy.send("getSession", Value::Null).await;
        assert!(matches!(result, Err(GatewayError::Terminated)));
    }
}
