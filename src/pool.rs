// ABOUTME: Fixed-size execution unit pool with round-robin dispatch
// ABOUTME: Response correlation, per-request timeout, and supervised slot recovery with backoff

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::{mpsc, oneshot, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::GatewayOptions;
use crate::error::GatewayError;
use crate::message::{RequestId, RequestMessage};
use crate::unit::{ExecutionUnit, UnitEvent, UnitFactory};

/// Depth of the shared unit-event channel.
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Pool-facing subset of the gateway options.
#[derive(Debug, Clone)]
pub struct PoolSettings {
    /// Number of slots.
    pub size: usize,
    /// Ceiling for any single request.
    pub request_timeout: Duration,
    /// Recreation attempts before a slot is abandoned.
    pub max_retry_attempts: u32,
    /// First recreation delay.
    pub retry_base_delay: Duration,
    /// Recreation delay cap.
    pub retry_max_delay: Duration,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self::from(&GatewayOptions::default())
    }
}

impl From<&GatewayOptions> for PoolSettings {
    fn from(opts: &GatewayOptions) -> Self {
        Self {
            size: opts.pool_size,
            request_timeout: opts.request_timeout,
            max_retry_attempts: opts.max_retry_attempts,
            retry_base_delay: opts.retry_base_delay,
            retry_max_delay: opts.retry_max_delay,
        }
    }
}

/// Lifecycle of one pool slot. The slot index is stable for the pool's
/// lifetime; only the unit behind it is replaced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    /// Live unit serving requests.
    Healthy,
    /// Unit crashed; pending requests were rejected.
    Failed,
    /// Recreation scheduled after a backoff delay.
    AwaitingRetry,
    /// Replacement unit being constructed and probed.
    Recreating,
    /// Recovery attempts exhausted; no further automatic recovery.
    Abandoned,
}

/// Observability snapshot of one slot.
#[derive(Debug, Clone)]
pub struct SlotInfo {
    /// Slot index.
    pub index: usize,
    /// Current state.
    pub state: SlotState,
    /// Failed recreation attempts since the last healthy period.
    pub retry_count: u32,
}

/// Observability snapshot of the pool. Not used for correctness.
#[derive(Debug, Clone)]
pub struct PoolStats {
    /// Configured pool size.
    pub size: usize,
    /// Slots currently healthy.
    pub live_units: usize,
    /// Requests awaiting a response.
    pub in_flight: usize,
    /// Slot the next `send` will target.
    pub next_index: usize,
    /// Per-slot detail.
    pub slots: Vec<SlotInfo>,
}

struct PendingRequest {
    tx: oneshot::Sender<Result<Value, GatewayError>>,
    owner: usize,
}

struct UnitSlot {
    state: SlotState,
    unit: Option<ExecutionUnit>,
    retry_count: u32,
    retry_timer: Option<JoinHandle<()>>,
}

impl UnitSlot {
    fn new(unit: ExecutionUnit) -> Self {
        Self {
            state: SlotState::Healthy,
            unit: Some(unit),
            retry_count: 0,
            retry_timer: None,
        }
    }
}

struct PoolInner {
    settings: PoolSettings,
    factory: Arc<dyn UnitFactory>,
    slots: RwLock<Vec<UnitSlot>>,
    pending: Mutex<HashMap<RequestId, PendingRequest>>,
    counter: AtomicU64,
    events_tx: mpsc::Sender<UnitEvent>,
    events_rx: Mutex<Option<mpsc::Receiver<UnitEvent>>>,
    pump: Mutex<Option<JoinHandle<()>>>,
    terminated: AtomicBool,
}

/// `min(base * 2^attempt, cap)` with saturating arithmetic.
fn backoff_delay(base: Duration, cap: Duration, attempt: u32) -> Duration {
    let multiplier = 2u64.saturating_pow(attempt);
    let base_millis = u64::try_from(base.as_millis()).unwrap_or(u64::MAX);
    let delay = Duration::from_millis(base_millis.saturating_mul(multiplier));
    std::cmp::min(delay, cap)
}

/// Pool of parallel execution units with round-robin load balancing.
///
/// Responses are correlated to callers through unique request IDs. A failed
/// unit has its in-flight requests rejected in one pass, then the slot is
/// recreated under exponential backoff until it recovers or exhausts its
/// attempts. Round robin deliberately does not skip dead slots: a request
/// routed to a recovering slot fails immediately with "unit not available",
/// and one routed to an abandoned slot with "exhausted recovery attempts".
#[derive(Clone)]
pub struct WorkerPool {
    inner: Arc<PoolInner>,
}

impl WorkerPool {
    /// Create a stopped pool. Call [`WorkerPool::init`] to spawn units.
    #[must_use]
    pub fn new(settings: PoolSettings, factory: Arc<dyn UnitFactory>) -> Self {
        let (events_tx, events_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            inner: Arc::new(PoolInner {
                settings,
                factory,
                slots: RwLock::new(Vec::new()),
                pending: Mutex::new(HashMap::new()),
                counter: AtomicU64::new(0),
                events_tx,
                events_rx: Mutex::new(Some(events_rx)),
                pump: Mutex::new(None),
                terminated: AtomicBool::new(false),
            }),
        }
    }

    /// Spawn exactly N units, start the response pump, and probe every unit
    /// once. Resolves only after all N liveness probes are acknowledged;
    /// fails fast if any unit cannot be constructed.
    pub async fn init(&self) -> Result<(), GatewayError> {
        let inner = &self.inner;
        if inner.settings.size == 0 {
            return Err(GatewayError::Construction(
                "pool size must be at least 1".to_string(),
            ));
        }
        {
            let slots = inner.slots.read().await;
            if !slots.is_empty() {
                return Err(GatewayError::Construction(
                    "pool already initialized".to_string(),
                ));
            }
        }

        info!(size = inner.settings.size, "Initializing worker pool");

        let mut created = Vec::with_capacity(inner.settings.size);
        for index in 0..inner.settings.size {
            match inner.factory.create(index, inner.events_tx.clone()).await {
                Ok(unit) => created.push(unit),
                Err(e) => {
                    error!(index, error = %e, "Failed to create unit, aborting init");
                    for unit in &created {
                        unit.shutdown();
                    }
                    return Err(e);
                }
            }
        }

        {
            let mut slots = inner.slots.write().await;
            *slots = created.into_iter().map(UnitSlot::new).collect();
        }

        // Pump must run before probes so their responses can settle.
        let rx = inner
            .events_rx
            .lock()
            .await
            .take()
            .ok_or_else(|| GatewayError::Construction("event pump already taken".to_string()))?;
        let pump = tokio::spawn(Self::pump(Arc::clone(inner), rx));
        *inner.pump.lock().await = Some(pump);

        let probes = (0..inner.settings.size).map(|index| self.send_to_unit(index, "ping", Value::Null));
        futures_util::future::try_join_all(probes).await?;

        info!(size = inner.settings.size, "All units ready");
        Ok(())
    }

    /// Dispatch a request to the next unit by round robin.
    ///
    /// The index counter is unbounded and wraps via modulo; it is never
    /// reset while the pool is alive.
    pub async fn send(&self, op: &str, payload: Value) -> Result<Value, GatewayError> {
        let size = self.inner.settings.size as u64;
        if size == 0 {
            return Err(GatewayError::NotInitialized);
        }
        let index = usize::try_from(self.inner.counter.fetch_add(1, Ordering::SeqCst) % size)
            .unwrap_or(0);
        self.send_to_unit(index, op, payload).await
    }

    /// Dispatch a request to a specific slot (liveness probes, targeted
    /// init fan-out).
    pub async fn send_to_unit(
        &self,
        index: usize,
        op: &str,
        payload: Value,
    ) -> Result<Value, GatewayError> {
        let inner = &self.inner;
        if inner.terminated.load(Ordering::SeqCst) {
            return Err(GatewayError::Terminated);
        }

        let message = RequestMessage::new(op, payload);
        let id = message.id;

        let (tx, rx) = oneshot::channel();
        inner
            .pending
            .lock()
            .await
            .insert(id, PendingRequest { tx, owner: index });

        // Hand the message to the unit, backing out the pending entry on
        // any immediate failure.
        let handed_off = {
            let slots = inner.slots.read().await;
            match slots.get(index) {
                Some(slot)
                    if matches!(slot.state, SlotState::Healthy | SlotState::Recreating) =>
                {
                    match &slot.unit {
                        Some(unit) if unit.is_alive() => unit.send(message),
                        _ => Err(GatewayError::UnitUnavailable(index)),
                    }
                }
                // An abandoned slot will never come back; a transiently dead
                // one may still recover.
                Some(slot) if slot.state == SlotState::Abandoned => {
                    Err(GatewayError::ExhaustedRetries(index))
                }
                Some(_) | None => Err(GatewayError::UnitUnavailable(index)),
            }
        };
        if let Err(e) = handed_off {
            inner.pending.lock().await.remove(&id);
            return Err(e);
        }

        match tokio::time::timeout(inner.settings.request_timeout, rx).await {
            Ok(Ok(result)) => result,
            // Pending entry dropped without settling: terminate() ran.
            Ok(Err(_)) => Err(GatewayError::Terminated),
            Err(_) => {
                inner.pending.lock().await.remove(&id);
                let millis =
                    u64::try_from(inner.settings.request_timeout.as_millis()).unwrap_or(u64::MAX);
                warn!(%id, index, "Request timed out");
                Err(GatewayError::RequestTimeout(millis))
            }
        }
    }

    /// Cancel retry timers, stop every unit, drop all pending requests, and
    /// reset the round-robin counter. Callers with requests in flight
    /// observe a `Terminated` error.
    pub async fn terminate(&self) {
        let inner = &self.inner;
        info!("Terminating worker pool");
        inner.terminated.store(true, Ordering::SeqCst);

        if let Some(pump) = inner.pump.lock().await.take() {
            pump.abort();
        }

        {
            let mut slots = inner.slots.write().await;
            for slot in slots.iter_mut() {
                if let Some(timer) = slot.retry_timer.take() {
                    timer.abort();
                }
                if let Some(unit) = slot.unit.take() {
                    unit.shutdown();
                }
                slot.state = SlotState::Failed;
            }
        }

        inner.pending.lock().await.clear();
        inner.counter.store(0, Ordering::SeqCst);
    }

    /// Observability snapshot.
    pub async fn stats(&self) -> PoolStats {
        let inner = &self.inner;
        let slots = inner.slots.read().await;
        let slot_infos: Vec<SlotInfo> = slots
            .iter()
            .enumerate()
            .map(|(index, slot)| SlotInfo {
                index,
                state: slot.state,
                retry_count: slot.retry_count,
            })
            .collect();
        let live_units = slot_infos
            .iter()
            .filter(|s| s.state == SlotState::Healthy)
            .count();
        drop(slots);

        let in_flight = inner.pending.lock().await.len();
        let size = inner.settings.size;
        let next_index = usize::try_from(
            inner.counter.load(Ordering::SeqCst) % std::cmp::max(size as u64, 1),
        )
        .unwrap_or(0);

        PoolStats {
            size,
            live_units,
            in_flight,
            next_index,
            slots: slot_infos,
        }
    }

    // === Internal machinery ===

    async fn pump(inner: Arc<PoolInner>, mut events_rx: mpsc::Receiver<UnitEvent>) {
        while let Some(event) = events_rx.recv().await {
            match event {
                UnitEvent::Response { index, message } => {
                    let entry = inner.pending.lock().await.remove(&message.id);
                    match entry {
                        Some(pending) => {
                            let _ = pending.tx.send(message.into_result());
                        }
                        None => {
                            // Late response after timeout or crash rejection.
                            debug!(id = %message.id, index, "Response for unknown request");
                        }
                    }
                }
                UnitEvent::Fatal { index, reason } => {
                    Self::handle_unit_failure(&inner, index, reason).await;
                }
            }
        }
    }

    /// Failure pass for one slot: reject everything it owned, then move it
    /// into supervised recovery.
    async fn handle_unit_failure(inner: &Arc<PoolInner>, index: usize, reason: String) {
        {
            let mut slots = inner.slots.write().await;
            let Some(slot) = slots.get_mut(index) else {
                return;
            };
            match slot.state {
                SlotState::Healthy => {}
                // Recreation probes report their own failures.
                _ => {
                    debug!(index, %reason, "Fatal event for non-healthy slot ignored");
                    return;
                }
            }
            warn!(index, %reason, "Unit crashed");
            slot.state = SlotState::Failed;
            if let Some(unit) = slot.unit.take() {
                unit.shutdown();
            }
        }

        // Reject all pending requests owned by this slot in one pass.
        let rejected = {
            let mut pending = inner.pending.lock().await;
            let ids: Vec<RequestId> = pending
                .iter()
                .filter(|(_, p)| p.owner == index)
                .map(|(id, _)| *id)
                .collect();
            let mut entries = Vec::with_capacity(ids.len());
            for id in ids {
                if let Some(entry) = pending.remove(&id) {
                    entries.push(entry);
                }
            }
            entries
        };
        let count = rejected.len();
        for entry in rejected {
            let _ = entry.tx.send(Err(GatewayError::UnitCrash {
                index,
                reason: reason.clone(),
            }));
        }
        if count > 0 {
            warn!(index, count, "Rejected in-flight requests for crashed unit");
        }

        Self::schedule_recreation(inner, index).await;
    }

    /// Queue a recreation attempt after the backoff delay, or abandon the
    /// slot once the ceiling is reached.
    async fn schedule_recreation(inner: &Arc<PoolInner>, index: usize) {
        if inner.terminated.load(Ordering::SeqCst) {
            return;
        }

        let mut slots = inner.slots.write().await;
        let Some(slot) = slots.get_mut(index) else {
            return;
        };

        if slot.retry_count >= inner.settings.max_retry_attempts {
            slot.state = SlotState::Abandoned;
            error!(
                index,
                attempts = slot.retry_count,
                "Unit recovery attempts exhausted, slot abandoned"
            );
            return;
        }

        let delay = backoff_delay(
            inner.settings.retry_base_delay,
            inner.settings.retry_max_delay,
            slot.retry_count,
        );
        info!(
            index,
            attempt = slot.retry_count + 1,
            max = inner.settings.max_retry_attempts,
            delay_ms = delay.as_millis(),
            "Scheduling unit recreation"
        );

        slot.state = SlotState::AwaitingRetry;
        if let Some(previous) = slot.retry_timer.take() {
            previous.abort();
        }

        let inner_clone = Arc::clone(inner);
        slot.retry_timer = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            Self::recreate_slot(&inner_clone, index).await;
        }));
    }

    /// Construct a replacement unit and confirm it with a liveness probe.
    fn recreate_slot<'a>(
        inner: &'a Arc<PoolInner>,
        index: usize,
    ) -> futures_util::future::BoxFuture<'a, ()> {
        Box::pin(async move {
        if inner.terminated.load(Ordering::SeqCst) {
            return;
        }

        {
            let mut slots = inner.slots.write().await;
            let Some(slot) = slots.get_mut(index) else {
                return;
            };
            slot.state = SlotState::Recreating;
            slot.retry_timer = None;
        }

        debug!(index, "Recreating unit");
        let outcome = match inner.factory.create(index, inner.events_tx.clone()).await {
            Ok(unit) => {
                {
                    let mut slots = inner.slots.write().await;
                    if let Some(slot) = slots.get_mut(index) {
                        slot.unit = Some(unit);
                    }
                }
                let pool = WorkerPool {
                    inner: Arc::clone(inner),
                };
                pool.send_to_unit(index, "ping", Value::Null).await.map(|_| ())
            }
            Err(e) => Err(e),
        };

        match outcome {
            Ok(()) => {
                let mut slots = inner.slots.write().await;
                if let Some(slot) = slots.get_mut(index) {
                    slot.state = SlotState::Healthy;
                    slot.retry_count = 0;
                }
                info!(index, "Unit recreated successfully");
            }
            Err(e) => {
                warn!(index, error = %e, "Unit recreation failed");
                {
                    let mut slots = inner.slots.write().await;
                    if let Some(slot) = slots.get_mut(index) {
                        if let Some(unit) = slot.unit.take() {
                            unit.shutdown();
                        }
                        slot.state = SlotState::Failed;
                        slot.retry_count = slot.retry_count.saturating_add(1);
                    }
                }
                Self::schedule_recreation(inner, index).await;
            }
        }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::unit::{UnitError, UnitHandler};
    use futures_util::future::BoxFuture;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use tokio::time::Instant;

    /// Handler exposing echo/crash/hang behavior, tagged with its slot.
    struct TestHandler {
        index: usize,
    }

    impl UnitHandler for TestHandler {
        fn handle(&self, request: RequestMessage) -> BoxFuture<'_, Result<Value, UnitError>> {
            let index = self.index;
            Box::pin(async move {
                match request.op.as_str() {
                    "echo" => Ok(json!({ "unit": index, "payload": request.payload })),
                    "slow" => {
                        tokio::time::sleep(Duration::from_millis(100)).await;
                        Ok(json!({ "slow": true }))
                    }
                    "crash" => Err(UnitError::Fatal("crash requested".to_string())),
                    "hang" => {
                        futures_util::future::pending::<()>().await;
                        unreachable!()
                    }
                    other => Err(UnitError::Op(GatewayError::UnknownOperation(
                        other.to_string(),
                    ))),
                }
            })
        }
    }

    /// Factory with a programmable number of upcoming failures, recording
    /// the (paused-clock) time of every creation attempt.
    struct TestFactory {
        fail_next: AtomicU64,
        attempts: Mutex<Vec<(usize, Instant)>>,
    }

    impl TestFactory {
        fn new() -> Self {
            Self {
                fail_next: AtomicU64::new(0),
                attempts: Mutex::new(Vec::new()),
            }
        }

        fn fail_next(&self, n: u64) {
            self.fail_next.store(n, Ordering::SeqCst);
        }

        async fn attempt_times(&self, index: usize) -> Vec<Instant> {
            self.attempts
                .lock()
                .await
                .iter()
                .filter(|(i, _)| *i == index)
                .map(|(_, t)| *t)
                .collect()
        }
    }

    impl UnitFactory for TestFactory {
        fn create(
            &self,
            index: usize,
            events: mpsc::Sender<UnitEvent>,
        ) -> BoxFuture<'_, Result<ExecutionUnit, GatewayError>> {
            Box::pin(async move {
                self.attempts.lock().await.push((index, Instant::now()));
                let remaining = self.fail_next.load(Ordering::SeqCst);
                if remaining > 0 {
                    self.fail_next.store(remaining - 1, Ordering::SeqCst);
                    return Err(GatewayError::Construction(format!(
                        "unit {index} refused to start"
                    )));
                }
                Ok(ExecutionUnit::spawn(
                    index,
                    Arc::new(TestHandler { index }),
                    events,
                ))
            })
        }
    }

    fn settings(size: usize) -> PoolSettings {
        PoolSettings {
            size,
            ..PoolSettings::default()
        }
    }

    async fn ready_pool(size: usize) -> (WorkerPool, Arc<TestFactory>) {
        let factory = Arc::new(TestFactory::new());
        let pool = WorkerPool::new(settings(size), Arc::clone(&factory) as Arc<dyn UnitFactory>);
        pool.init().await.unwrap();
        (pool, factory)
    }

    // ==================== Init Tests ====================

    #[tokio::test]
    async fn test_init_spawns_and_probes_all_units() {
        let (pool, _factory) = ready_pool(3).await;
        let stats = pool.stats().await;
        assert_eq!(stats.size, 3);
        assert_eq!(stats.live_units, 3);
        assert_eq!(stats.in_flight, 0);
    }

    #[tokio::test]
    async fn test_init_single_unit_pool() {
        let (pool, _factory) = ready_pool(1).await;
        assert_eq!(pool.stats().await.live_units, 1);
    }

    #[tokio::test]
    async fn test_init_fails_fast_on_construction_error() {
        let factory = Arc::new(TestFactory::new());
        factory.fail_next(1);
        let pool = WorkerPool::new(settings(3), Arc::clone(&factory) as Arc<dyn UnitFactory>);
        let result = pool.init().await;
        assert!(matches!(result, Err(GatewayError::Construction(_))));
    }

    #[tokio::test]
    async fn test_init_twice_is_an_error() {
        let (pool, _factory) = ready_pool(2).await;
        assert!(matches!(
            pool.init().await,
            Err(GatewayError::Construction(_))
        ));
    }

    #[tokio::test]
    async fn test_zero_size_pool_rejected() {
        let factory = Arc::new(TestFactory::new());
        let pool = WorkerPool::new(settings(0), factory as Arc<dyn UnitFactory>);
        assert!(matches!(
            pool.init().await,
            Err(GatewayError::Construction(_))
        ));
    }

    // ==================== Round Robin Tests ====================

    #[tokio::test]
    async fn test_round_robin_assignment_sequence() {
        let (pool, _factory) = ready_pool(3).await;

        // 7 echo requests over 3 units: [0, 1, 2, 0, 1, 2, 0].
        let mut assigned = Vec::new();
        for i in 0..7 {
            let result = pool.send("echo", json!({ "n": i })).await.unwrap();
            assert_eq!(result["payload"]["n"], i);
            assigned.push(result["unit"].as_u64().unwrap());
        }
        assert_eq!(assigned, vec![0, 1, 2, 0, 1, 2, 0]);
    }

    #[tokio::test]
    async fn test_round_robin_fairness_over_window() {
        let (pool, _factory) = ready_pool(3).await;

        let mut counts = [0u32; 3];
        for _ in 0..12 {
            let result = pool.send("echo", Value::Null).await.unwrap();
            let unit = usize::try_from(result["unit"].as_u64().unwrap()).unwrap();
            counts[unit] += 1;
        }
        assert_eq!(counts, [4, 4, 4]);
    }

    #[tokio::test]
    async fn test_operation_error_does_not_crash_unit() {
        let (pool, _factory) = ready_pool(2).await;

        let result = pool.send("no.such.op", Value::Null).await;
        assert!(result.is_err());
        assert_eq!(pool.stats().await.live_units, 2);
    }

    // ==================== Timeout Tests ====================

    #[tokio::test(start_paused = true)]
    async fn test_request_timeout_is_distinguishable_and_cleans_up() {
        let (pool, _factory) = ready_pool(1).await;

        let result = pool.send("hang", Value::Null).await;
        assert!(matches!(result, Err(GatewayError::RequestTimeout(30_000))));

        // Timed-out request no longer counts as in flight; the unit is not
        // considered crashed.
        let stats = pool.stats().await;
        assert_eq!(stats.in_flight, 0);
        assert_eq!(stats.live_units, 1);
    }

    // ==================== Crash and Recovery Tests ====================

    #[tokio::test(start_paused = true)]
    async fn test_crash_rejects_all_pending_for_that_slot() {
        let (pool, _factory) = ready_pool(1).await;

        // A slow request keeps the unit busy so the crash and three echoes
        // are all pending behind it when the fatal error lands.
        let slow = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.send_to_unit(0, "slow", Value::Null).await })
        };
        tokio::time::sleep(Duration::from_millis(1)).await;

        let mut doomed = Vec::new();
        {
            let pool = pool.clone();
            doomed.push(tokio::spawn(async move {
                pool.send_to_unit(0, "crash", Value::Null).await
            }));
        }
        for _ in 0..3 {
            let pool = pool.clone();
            doomed.push(tokio::spawn(async move {
                pool.send_to_unit(0, "echo", Value::Null).await
            }));
        }
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert_eq!(pool.stats().await.in_flight, 5);

        // The slow request completes normally before the crash is handled.
        assert!(slow.await.unwrap().is_ok());

        // Everything pending behind the crash is rejected in one pass.
        for task in doomed {
            let result = task.await.unwrap();
            assert!(
                matches!(result, Err(GatewayError::UnitCrash { index: 0, .. })),
                "expected UnitCrash, got {result:?}"
            );
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_recovery_backoff_sequence_then_abandonment() {
        let (pool, factory) = ready_pool(1).await;
        factory.fail_next(u64::MAX);

        let start = Instant::now();
        let _ = pool.send_to_unit(0, "crash", Value::Null).await;

        // Allow every retry timer to run to completion.
        tokio::time::sleep(Duration::from_secs(30)).await;

        let times = factory.attempt_times(0).await;
        // attempt 0 is the initial init-time creation.
        let offsets: Vec<u64> = times[1..]
            .iter()
            .map(|t| t.duration_since(start).as_millis() as u64)
            .collect();
        assert_eq!(offsets, vec![1000, 3000, 7000]);

        let stats = pool.stats().await;
        assert_eq!(stats.slots[0].state, SlotState::Abandoned);
        assert_eq!(stats.live_units, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_recovery_success_resets_retry_count() {
        let (pool, factory) = ready_pool(1).await;
        factory.fail_next(1);

        let _ = pool.send_to_unit(0, "crash", Value::Null).await;

        // First recreation (t+1s) fails, second (t+3s) succeeds.
        tokio::time::sleep(Duration::from_secs(5)).await;

        let stats = pool.stats().await;
        assert_eq!(stats.slots[0].state, SlotState::Healthy);
        assert_eq!(stats.slots[0].retry_count, 0);

        let result = pool.send_to_unit(0, "echo", json!(1)).await.unwrap();
        assert_eq!(result["unit"], 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_pool_operates_at_reduced_capacity_after_abandonment() {
        let (pool, factory) = ready_pool(3).await;
        factory.fail_next(u64::MAX);

        let _ = pool.send_to_unit(0, "crash", Value::Null).await;
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(pool.stats().await.live_units, 2);

        // Round robin does not skip the dead slot: a request routed to the
        // abandoned one reports its recovery attempts as exhausted.
        let first = pool.send("echo", Value::Null).await;
        assert!(matches!(first, Err(GatewayError::ExhaustedRetries(0))));

        let second = pool.send("echo", Value::Null).await.unwrap();
        assert_eq!(second["unit"], 1);
        let third = pool.send("echo", Value::Null).await.unwrap();
        assert_eq!(third["unit"], 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dead_slot_errors_distinguish_recovering_from_abandoned() {
        let (pool, factory) = ready_pool(1).await;
        factory.fail_next(u64::MAX);

        let _ = pool.send_to_unit(0, "crash", Value::Null).await;

        // Recovery still scheduled: the slot is merely unavailable.
        let during = pool.send_to_unit(0, "echo", Value::Null).await;
        assert!(matches!(during, Err(GatewayError::UnitUnavailable(0))));

        // Past the last backoff attempt the slot is abandoned for good.
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(pool.stats().await.slots[0].state, SlotState::Abandoned);
        let after = pool.send_to_unit(0, "echo", Value::Null).await;
        assert!(matches!(after, Err(GatewayError::ExhaustedRetries(0))));
    }

    // ==================== Terminate Tests ====================

    #[tokio::test]
    async fn test_terminate_rejects_new_requests() {
        let (pool, _factory) = ready_pool(2).await;
        pool.terminate().await;

        let result = pool.send("echo", Value::Null).await;
        assert!(matches!(result, Err(GatewayError::Terminated)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_terminate_drops_in_flight_requests() {
        let (pool, _factory) = ready_pool(1).await;

        let hanging = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.send("hang", Value::Null).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(pool.stats().await.in_flight, 1);

        pool.terminate().await;

        let result = hanging.await.unwrap();
        assert!(matches!(result, Err(GatewayError::Terminated)));
        assert_eq!(pool.stats().await.in_flight, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_terminate_cancels_retry_timers() {
        let (pool, factory) = ready_pool(1).await;
        factory.fail_next(u64::MAX);

        let _ = pool.send_to_unit(0, "crash", Value::Null).await;
        pool.terminate().await;

        // With the timer cancelled, no further creation attempts happen.
        let before = factory.attempt_times(0).await.len();
        tokio::time::sleep(Duration::from_secs(30)).await;
        let after = factory.attempt_times(0).await.len();
        assert_eq!(before, after);
    }

    // ==================== Stats Tests ====================

    #[tokio::test]
    async fn test_stats_next_index_tracks_counter() {
        let (pool, _factory) = ready_pool(3).await;
        assert_eq!(pool.stats().await.next_index, 0);

        pool.send("echo", Value::Null).await.unwrap();
        assert_eq!(pool.stats().await.next_index, 1);

        pool.send("echo", Value::Null).await.unwrap();
        pool.send("echo", Value::Null).await.unwrap();
        assert_eq!(pool.stats().await.next_index, 0);
    }

    // ==================== Backoff Helper Tests ====================

    #[test]
    fn test_backoff_delay_sequence() {
        let base = Duration::from_secs(1);
        let cap = Duration::from_secs(8);
        assert_eq!(backoff_delay(base, cap, 0), Duration::from_secs(1));
        assert_eq!(backoff_delay(base, cap, 1), Duration::from_secs(2));
        assert_eq!(backoff_delay(base, cap, 2), Duration::from_secs(4));
        assert_eq!(backoff_delay(base, cap, 3), Duration::from_secs(8));
        // Capped from here on, including absurd attempts.
        assert_eq!(backoff_delay(base, cap, 10), Duration::from_secs(8));
        assert_eq!(backoff_delay(base, cap, 200), Duration::from_secs(8));
    }
}
