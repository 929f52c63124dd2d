//! Window policies.
//!
//! Both strategies rely entirely on the store's atomic increment. No
//! in-process lock coordinates requests for the same key: the increment is
//! unconditional and the limit is checked afterwards, so requests racing at
//! the boundary may overshoot the stored count slightly. The overshoot is
//! bounded and tolerated.

use std::time::Duration;

use tracing::{debug, info, warn};

use super::decision::AdmissionDecision;
use super::key::BudgetKey;
use super::rules::{ScopeRule, Strategy};
use crate::error::{FloodgateError, Result};
use crate::store::{CounterStore, StoreError};

/// Value written under a block key. Only its presence and TTL matter.
const BLOCK_MARKER: &str = "1";

/// The admission strategy of one scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowPolicy {
    /// Count requests per fixed window; reject once the count passes `limit`.
    FixedWindow {
        /// Requests allowed per window
        limit: u64,
        /// Window length in milliseconds
        window_ms: u64,
    },
    /// Count points per window; exceeding `limit` writes a block that
    /// rejects every request for the key until it expires.
    Block {
        /// Points allowed per window
        limit: u64,
        /// Window length in milliseconds
        window_ms: u64,
        /// Block length in milliseconds
        block_ms: u64,
    },
}

impl WindowPolicy {
    /// Build the policy a validated rule describes.
    pub fn from_rule(rule: &ScopeRule) -> Result<Self> {
        rule.validate()?;

        match rule.strategy {
            Strategy::FixedWindow => Ok(WindowPolicy::FixedWindow {
                limit: rule.limit,
                window_ms: rule.window_ms,
            }),
            Strategy::Block => {
                let block_ms = rule.block_duration_ms.ok_or_else(|| {
                    FloodgateError::Config(format!(
                        "scope `{}`: block strategy requires block_duration_ms",
                        rule.name
                    ))
                })?;
                Ok(WindowPolicy::Block {
                    limit: rule.limit,
                    window_ms: rule.window_ms,
                    block_ms,
                })
            }
        }
    }

    /// The per-window budget.
    pub fn limit(&self) -> u64 {
        match *self {
            WindowPolicy::FixedWindow { limit, .. } | WindowPolicy::Block { limit, .. } => limit,
        }
    }

    /// The window length.
    pub fn window(&self) -> Duration {
        match *self {
            WindowPolicy::FixedWindow { window_ms, .. } | WindowPolicy::Block { window_ms, .. } => {
                Duration::from_millis(window_ms)
            }
        }
    }

    /// Consume one unit of `key`'s budget and decide whether the request may
    /// proceed.
    ///
    /// Store failures are returned as-is; the caller applies the degradation
    /// policy.
    pub async fn check_and_consume(
        &self,
        store: &dyn CounterStore,
        prefix: &str,
        key: &BudgetKey,
    ) -> std::result::Result<AdmissionDecision, StoreError> {
        match *self {
            WindowPolicy::FixedWindow { limit, window_ms } => {
                fixed_window(store, prefix, key, limit, window_ms).await
            }
            WindowPolicy::Block {
                limit,
                window_ms,
                block_ms,
            } => block(store, prefix, key, limit, window_ms, block_ms).await,
        }
    }
}

async fn fixed_window(
    store: &dyn CounterStore,
    prefix: &str,
    key: &BudgetKey,
    limit: u64,
    window_ms: u64,
) -> std::result::Result<AdmissionDecision, StoreError> {
    let counter_key = key.counter_key(prefix);
    let count = store.incr_and_expire(&counter_key, window_ms).await?;
    let ttl_ms = window_ttl(store, &counter_key, window_ms).await;

    if count <= limit {
        return Ok(AdmissionDecision::admit(limit, count, ttl_ms));
    }

    debug!(key = %key, count, limit, retry_after_ms = ttl_ms, "Fixed window exhausted");
    Ok(AdmissionDecision::reject(limit, ttl_ms))
}

async fn block(
    store: &dyn CounterStore,
    prefix: &str,
    key: &BudgetKey,
    limit: u64,
    window_ms: u64,
    block_ms: u64,
) -> std::result::Result<AdmissionDecision, StoreError> {
    let block_key = key.block_key(prefix);

    // An active block wins regardless of the points left in the window.
    let blocked_for = store.remaining_ttl_ms(&block_key).await?;
    if blocked_for > 0 {
        debug!(key = %key, retry_after_ms = blocked_for, "Key is blocked");
        return Ok(AdmissionDecision::reject(limit, blocked_for));
    }

    let counter_key = key.counter_key(prefix);
    let count = store.incr_and_expire(&counter_key, window_ms).await?;

    if count > limit {
        let placed = store
            .set_if_absent_with_ttl(&block_key, BLOCK_MARKER, block_ms)
            .await?;

        // Another process may have placed the block first; its TTL is then
        // the authoritative retry-after and must not be extended.
        let retry_after_ms = if placed {
            info!(key = %key, count, limit, block_ms, "Budget exceeded, key blocked");
            block_ms
        } else {
            match store.remaining_ttl_ms(&block_key).await {
                Ok(0) | Err(_) => block_ms,
                Ok(ttl) => ttl,
            }
        };

        return Ok(AdmissionDecision::reject(limit, retry_after_ms));
    }

    let ttl_ms = window_ttl(store, &counter_key, window_ms).await;
    Ok(AdmissionDecision::admit(limit, count, ttl_ms))
}

/// Remaining lifetime of a counter that was just incremented.
///
/// A live counter reporting no TTL means the expiry set at creation was lost
/// and the key would otherwise never reset. One repair attempt is made; if
/// that fails too the request proceeds and the failure is only logged.
async fn window_ttl(store: &dyn CounterStore, counter_key: &str, window_ms: u64) -> u64 {
    match store.remaining_ttl_ms(counter_key).await {
        Ok(ttl) if ttl > 0 => ttl,
        Ok(_) => {
            warn!(key = %counter_key, "Counter has no expiry, re-applying window TTL");
            match store.ensure_ttl(counter_key, window_ms).await {
                Ok(_) => window_ms,
                Err(e) => {
                    warn!(key = %counter_key, error = %e, "Failed to re-apply window TTL");
                    window_ms
                }
            }
        }
        Err(e) => {
            warn!(key = %counter_key, error = %e, "Failed to read counter TTL, assuming full window");
            window_ms
        }
    }
}
