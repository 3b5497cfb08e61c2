// ABOUTME: Capability-adaptive gateway over pooled execution units
// ABOUTME: Strategy selection, round-robin pool with supervised recovery, socket channel, broadcast bus

#![allow(missing_docs)]

pub mod backend;
pub mod bus;
pub mod capability;
pub mod config;
pub mod error;
pub mod facade;
pub mod message;
pub mod pool;
pub mod socket;
pub mod store;
pub mod strategy;
pub mod unit;

pub use backend::{AuthRequest, BackendClient, BackendFactory, ChangeFeed, MutationKind};
pub use bus::{BroadcastBus, Subscription};
pub use capability::{select_strategy, CapabilityProfile, PlatformHint, StrategyKind};
pub use config::GatewayOptions;
pub use error::GatewayError;
pub use facade::{Gateway, RealtimeSubscription};
pub use message::{
    BroadcastEvent, EventKind, ReadyState, RequestId, RequestMessage, ResponseMessage,
    SocketStatus,
};
pub use pool::{PoolSettings, PoolStats, SlotInfo, SlotState, WorkerPool};
pub use socket::{SocketConnector, SocketManager, SocketSettings, TungsteniteConnector};
pub use store::{JsonFileStore, MemoryStore, PersistentStore, SharedStore};
pub use strategy::{GatewayContext, GatewayStrategy};
