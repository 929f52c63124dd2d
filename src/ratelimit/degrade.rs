//! Behaviour when the shared store is slow or unreachable.

use std::sync::Arc;
use std::time::Duration;

use tracing::warn;

use super::decision::AdmissionDecision;
use super::key::BudgetKey;
use crate::store::{CounterStore, StoreError, TimeoutStore};

/// Default bound on a single store call.
pub const DEFAULT_STORE_TIMEOUT: Duration = Duration::from_millis(200);

/// Default retry-after handed out while failing closed.
pub const DEFAULT_FAIL_CLOSED_RETRY_AFTER_SECS: u64 = 60;

/// What to answer when the store cannot be consulted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureMode {
    /// Admit every request.
    Open,
    /// Reject every request with a fixed retry-after.
    Closed {
        /// Seconds handed to the client in `Retry-After`
        retry_after_secs: u64,
    },
}

/// Bounds store calls with a timeout and maps any store failure to a
/// deterministic decision.
///
/// The failure mode is fixed when the policy is built, so a failing request
/// never branches on the kind of error it hit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DegradationPolicy {
    timeout: Duration,
    mode: FailureMode,
}

impl Default for DegradationPolicy {
    fn default() -> Self {
        Self::fail_open(DEFAULT_STORE_TIMEOUT)
    }
}

impl DegradationPolicy {
    /// Admit everything while the store is unavailable.
    pub fn fail_open(timeout: Duration) -> Self {
        Self {
            timeout,
            mode: FailureMode::Open,
        }
    }

    /// Reject everything while the store is unavailable.
    pub fn fail_closed(timeout: Duration, retry_after_secs: u64) -> Self {
        Self {
            timeout,
            mode: FailureMode::Closed {
                retry_after_secs: retry_after_secs.max(1),
            },
        }
    }

    /// Build from the configuration flag.
    pub fn from_flag(fail_open: bool, timeout: Duration, retry_after_secs: u64) -> Self {
        if fail_open {
            Self::fail_open(timeout)
        } else {
            Self::fail_closed(timeout, retry_after_secs)
        }
    }

    /// The per-call store timeout.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// The configured failure mode.
    pub fn mode(&self) -> FailureMode {
        self.mode
    }

    /// Wrap `store` so every call is bounded by this policy's timeout.
    pub fn guard(&self, store: Arc<dyn CounterStore>) -> TimeoutStore<dyn CounterStore> {
        TimeoutStore::new(store, self.timeout)
    }

    /// The decision to use for `key` after the store failed with `err`.
    pub fn fallback(&self, key: &BudgetKey, limit: u64, err: &StoreError) -> AdmissionDecision {
        match self.mode {
            FailureMode::Open => {
                warn!(key = %key, error = %err, "Counter store unavailable, failing open");
                AdmissionDecision {
                    allowed: true,
                    remaining: limit,
                    limit,
                    reset_ms: 0,
                    retry_after_secs: None,
                }
            }
            FailureMode::Closed { retry_after_secs } => {
                warn!(key = %key, error = %err, "Counter store unavailable, failing closed");
                AdmissionDecision::reject(limit, retry_after_secs.saturating_mul(1000))
            }
        }
    }
}
