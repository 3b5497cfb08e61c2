// ABOUTME: Inline fallback strategy: no execution units, ops run on the caller's task
// ABOUTME: Same operation surface as the pooled arrangements, minus pooling and supervision

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures_util::future::BoxFuture;
use serde_json::{json, Value};
use tokio::sync::OnceCell;
use tracing::info;

use crate::bus::BroadcastBus;
use crate::capability::StrategyKind;
use crate::error::GatewayError;
use crate::message::BroadcastEvent;
use crate::pool::PoolStats;
use crate::socket::{SocketManager, SocketSettings};
use crate::strategy::handlers::{is_control_op, BackendWiring, ControlHandler, DataHandler};
use crate::strategy::{GatewayContext, GatewayStrategy};
use crate::unit::{UnitError, UnitHandler};

/// Degraded arrangement for hosts that cannot run pooled execution units.
///
/// Every operation executes directly on the caller's task against a single
/// pair of handlers. There is no round robin, no crash recovery, and no
/// request timeout beyond what the backend imposes; the operation surface is
/// otherwise identical to the pooled strategies.
pub struct InlineStrategy {
    data: DataHandler,
    control: ControlHandler,
    socket: SocketManager,
    bus: BroadcastBus,
    terminated: AtomicBool,
}

fn lift(err: UnitError) -> GatewayError {
    match err {
        UnitError::Op(e) => e,
        UnitError::Fatal(reason) => GatewayError::UnitCrash { index: 0, reason },
    }
}

impl InlineStrategy {
    /// Build the inline arrangement from shared wiring.
    #[must_use]
    pub fn new(ctx: &GatewayContext) -> Self {
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

        // Inline shares one backend client between both handlers.
        let client = Arc::new(OnceCell::new());
        let data = DataHandler::new(wiring.clone(), Arc::clone(&client));
        let control = ControlHandler::new(
            wiring,
            client,
            ctx.bus.clone(),
            socket.clone(),
            ctx.options.socket_url.clone(),
        );

        Self {
            data,
            control,
            socket,
            bus: ctx.bus.clone(),
            terminated: AtomicBool::new(false),
        }
    }

    async fn call(
        handler: &dyn UnitHandler,
        op: &str,
        payload: Value,
    ) -> Result<Value, GatewayError> {
        handler
            .handle(crate::message::RequestMessage::new(op, payload))
            .await
            .map_err(lift)
    }
}

impl GatewayStrategy for InlineStrategy {
    fn kind(&self) -> StrategyKind {
        StrategyKind::Inline
    }

    fn init(&self) -> BoxFuture<'_, Result<Value, GatewayError>> {
        Box::pin(async move {
            let lift_init = |e| match e {
                GatewayError::UnitCrash { reason, .. } => GatewayError::Construction(reason),
                other => other,
            };
            Self::call(&self.data, "init", Value::Null)
                .await
                .map_err(lift_init)?;
            // The control warm-up reply is the recovered session snapshot.
            let snapshot = Self::call(&self.control, "init", Value::Null)
                .await
                .map_err(lift_init)?;

            info!("Inline strategy ready");
            self.bus.broadcast(BroadcastEvent::Ready);
            Ok(snapshot)
        })
    }

    fn send(&self, op: &str, payload: Value) -> BoxFuture<'_, Result<Value, GatewayError>> {
        let op = op.to_string();
        Box::pin(async move {
            if self.terminated.load(Ordering::SeqCst) {
                return Err(GatewayError::Terminated);
            }
            match op.as_str() {
                "ping" => Ok(json!({ "pong": true })),
                _ if is_control_op(&op) => Self::call(&self.control, &op, payload).await,
                _ => Self::call(&self.data, &op, payload).await,
            }
        })
    }

    fn terminate(&self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            self.terminated.store(true, Ordering::SeqCst);
            self.socket.disconnect().await;
        })
    }

    fn pool_stats(&self) -> BoxFuture<'_, Option<PoolStats>> {
        Box::pin(async move { None })
    }
}
