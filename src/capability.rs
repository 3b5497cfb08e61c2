// ABOUTME: Runtime capability snapshot and deterministic strategy selection
// ABOUTME: Pure CapabilityProfile -> StrategyKind mapping with forced override

use serde::{Deserialize, Serialize};

/// Coarse hint about the host platform, used to steer strategy selection
/// away from arrangements known to misbehave there.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum PlatformHint {
    /// No special constraints.
    #[default]
    Generic,
    /// Mobile runtimes where shared execution contexts are unreliable.
    ConstrainedMobile,
    /// Embedded/browser-like hosts with restricted concurrency.
    ConstrainedBrowser,
}

/// Immutable snapshot of what the host runtime supports.
///
/// Captured once at gateway construction and never mutated afterwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapabilityProfile {
    /// Host can run execution units in a context shared across consumers.
    pub supports_shared_execution_context: bool,
    /// Host can run execution units in dedicated isolated contexts.
    pub supports_dedicated_execution_context: bool,
    /// Host supports cross-context broadcast delivery.
    pub supports_broadcast: bool,
    /// Platform constraint hint.
    pub platform_hint: PlatformHint,
}

impl CapabilityProfile {
    /// Snapshot the current process.
    ///
    /// On a multi-threaded runtime both context styles and broadcast are
    /// available; a single hardware thread downgrades to the inline path.
    #[must_use]
    pub fn detect() -> Self {
        let parallel = std::thread::available_parallelism()
            .map(std::num::NonZeroUsize::get)
            .unwrap_or(1)
            > 1;

        Self {
            supports_shared_execution_context: parallel,
            supports_dedicated_execution_context: parallel,
            supports_broadcast: true,
            platform_hint: PlatformHint::Generic,
        }
    }

    /// Profile reporting full support, used as a test fixture and as the
    /// baseline for forced-strategy configurations.
    #[must_use]
    pub const fn full() -> Self {
        Self {
            supports_shared_execution_context: true,
            supports_dedicated_execution_context: true,
            supports_broadcast: true,
            platform_hint: PlatformHint::Generic,
        }
    }
}

impl Default for CapabilityProfile {
    fn default() -> Self {
        Self::detect()
    }
}

/// One of the interchangeable concurrency arrangements behind the gateway.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StrategyKind {
    /// Shared control context plus a pool of data units. Maximal sharing.
    PooledShared,
    /// Dedicated control context plus a pool of data units.
    PooledDedicated,
    /// Everything on the caller's task; zero pooled units.
    Inline,
}

/// Pick the strategy for a capability profile.
///
/// First match wins: shared context + broadcast on a non-mobile platform,
/// then dedicated context + broadcast, then the inline fallback. A forced
/// kind from configuration takes precedence over detection.
#[must_use]
pub fn select_strategy(profile: &CapabilityProfile, forced: Option<StrategyKind>) -> StrategyKind {
    if let Some(kind) = forced {
        return kind;
    }

    if profile.supports_shared_execution_context
        && profile.supports_broadcast
        && profile.platform_hint != PlatformHint::ConstrainedMobile
    {
        StrategyKind::PooledShared
    } else if profile.supports_dedicated_execution_context && profile.supports_broadcast {
        StrategyKind::PooledDedicated
    } else {
        StrategyKind::Inline
    }
}
