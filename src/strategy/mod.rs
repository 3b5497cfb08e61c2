// ABOUTME: Interchangeable concurrency arrangements behind the gateway facade
// ABOUTME: Strategy trait, shared wiring context, and kind -> implementation construction

pub mod handlers;
mod inline;
mod pooled;

use std::sync::Arc;

use futures_util::future::BoxFuture;
use serde_json::Value;

pub use inline::InlineStrategy;
pub use pooled::PooledStrategy;

use crate::backend::BackendFactory;
use crate::bus::BroadcastBus;
use crate::capability::StrategyKind;
use crate::config::GatewayOptions;
use crate::error::GatewayError;
use crate::pool::PoolStats;
use crate::socket::SocketConnector;
use crate::store::SharedStore;

/// Wiring handed to whichever strategy gets selected.
#[derive(Clone)]
pub struct GatewayContext {
    /// Tunables for pools, timeouts, and the socket channel.
    pub options: GatewayOptions,
    /// HTTP endpoint of the remote backend.
    pub endpoint: String,
    /// Store key under which session state persists.
    pub credential_key: String,
    /// Cross-context event bus.
    pub bus: BroadcastBus,
    /// Durable key/value store.
    pub store: SharedStore,
    /// Per-unit backend client constructor.
    pub backend_factory: Arc<dyn BackendFactory>,
    /// Socket transport constructor.
    pub connector: Arc<dyn SocketConnector>,
}

/// One concurrency arrangement. The facade selects an implementation once
/// at init and delegates to it for the rest of its life; callers cannot
/// observe which one is active except through `kind()`.
pub trait GatewayStrategy: Send + Sync {
    /// Which arrangement this is.
    fn kind(&self) -> StrategyKind;

    /// Bring the arrangement up. Resolves only when every execution context
    /// is ready to serve, yielding the initial session snapshot recovered
    /// from the store.
    fn init(&self) -> BoxFuture<'_, Result<Value, GatewayError>>;

    /// Execute one operation.
    fn send(&self, op: &str, payload: Value) -> BoxFuture<'_, Result<Value, GatewayError>>;

    /// Tear the arrangement down. Idempotent.
    fn terminate(&self) -> BoxFuture<'_, ()>;

    /// Pool snapshot, when the arrangement has a pool.
    fn pool_stats(&self) -> BoxFuture<'_, Option<PoolStats>>;
}

/// Construct the strategy for `kind`.
#[must_use]
pub fn build(kind: StrategyKind, ctx: &GatewayContext) -> Box<dyn GatewayStrategy> {
    match kind {
        StrategyKind::PooledShared => Box::new(PooledStrategy::shared(ctx)),
        StrategyKind::PooledDedicated => Box::new(PooledStrategy::dedicated(ctx)),
        StrategyKind::Inline => Box::new(InlineStrategy::new(ctx)),
    }
}
