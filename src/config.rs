// ABOUTME: Configuration for the gateway and its subsystems
// ABOUTME: Strategy override, pool sizing, request/retry timing, socket tuning

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::capability::{CapabilityProfile, StrategyKind};

/// Tunable parameters for the gateway.
///
/// Everything has a sensible default; callers typically override at most
/// `force_strategy` and `pool_size`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayOptions {
    /// Skip capability detection and use this strategy unconditionally.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub force_strategy: Option<StrategyKind>,

    /// Capability snapshot to use instead of detecting the current process.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub capability: Option<CapabilityProfile>,

    /// Number of data execution units in the pool.
    pub pool_size: usize,

    // === Request handling ===
    /// Ceiling for any single pool request.
    #[serde(with = "duration_millis")]
    pub request_timeout: Duration,

    // === Unit recovery ===
    /// Maximum recreation attempts before a slot is abandoned.
    pub max_retry_attempts: u32,

    /// First recreation delay (exponential backoff base).
    #[serde(with = "duration_millis")]
    pub retry_base_delay: Duration,

    /// Recreation delay cap.
    #[serde(with = "duration_millis")]
    pub retry_max_delay: Duration,

    // === Socket channel ===
    /// Explicit socket URL; when unset the URL is derived from the endpoint.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub socket_url: Option<String>,

    /// Interval between liveness probes on an open socket.
    #[serde(with = "duration_millis")]
    pub heartbeat_interval: Duration,

    /// Force-close the socket when no liveness ack arrives within this window.
    #[serde(with = "duration_millis")]
    pub heartbeat_timeout: Duration,

    /// Fixed delay before a reconnect attempt after an abnormal close.
    #[serde(with = "duration_millis")]
    pub reconnect_delay: Duration,

    /// Consecutive abnormal closes tolerated before giving up.
    pub max_reconnect_attempts: u32,
}

impl Default for GatewayOptions {
    fn default() -> Self {
        Self {
            force_strategy: None,
            capability: None,
            pool_size: 3,

            request_timeout: Duration::from_secs(30),

            max_retry_attempts: 3,
            retry_base_delay: Duration::from_secs(1),
            retry_max_delay: Duration::from_secs(8),

            socket_url: None,
            heartbeat_interval: Duration::from_secs(30),
            heartbeat_timeout: Duration::from_secs(60),
            reconnect_delay: Duration::from_secs(3),
            max_reconnect_attempts: 5,
        }
    }
}

/// Serde helper for Duration as milliseconds (u64)
mod duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        u64::try_from(duration.as_millis())
            .unwrap_or(u64::MAX)
            .serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_options() {
        let opts = GatewayOptions::default();
        assert_eq!(opts.pool_size, 3);
        assert_eq!(opts.request_timeout, Duration::from_secs(30));
        assert_eq!(opts.max_retry_attempts, 3);
        assert_eq!(opts.retry_base_delay, Duration::from_secs(1));
        assert_eq!(opts.retry_max_delay, Duration::from_secs(8));
        assert_eq!(opts.reconnect_delay, Duration::from_secs(3));
        assert_eq!(opts.max_reconnect_attempts, 5);
        assert!(opts.force_strategy.is_none());
    }

    #[test]
    fn test_partial_deserialization_uses_defaults() {
        let opts: GatewayOptions =
            serde_json::from_str(r#"{"pool_size": 5, "request_timeout": 1000}"#).unwrap();
        assert_eq!(opts.pool_size, 5);
        assert_eq!(opts.request_timeout, Duration::from_millis(1000));
        assert_eq!(opts.max_reconnect_attempts, 5);
    }

    #[test]
    fn test_force_strategy_roundtrip() {
        let opts = GatewayOptions {
            force_strategy: Some(StrategyKind::Inline),
            ..GatewayOptions::default()
        };
        let encoded = serde_json::to_string(&opts).unwrap();
        let decoded: GatewayOptions = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded.force_strategy, Some(StrategyKind::Inline));
    }
}
