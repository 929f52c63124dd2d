//! Per-scope limiter: one rule, its window policy, the guarded store and the
//! degradation policy, resolved once at startup.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{debug, info};

use super::decision::AdmissionDecision;
use super::degrade::DegradationPolicy;
use super::key::{scope_pattern, BudgetKey};
use super::policy::WindowPolicy;
use super::rules::ScopeRule;
use crate::config::FloodgateConfig;
use crate::error::Result;
use crate::store::{CounterStore, StoreError, TimeoutStore};

/// Stored state of one budget key, for operator inspection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyUsage {
    /// Requests counted in the current window
    pub count: u64,
    /// Milliseconds until the window resets
    pub window_ttl_ms: u64,
    /// Milliseconds until an active block expires; 0 when not blocked
    pub block_ttl_ms: u64,
}

/// The rate limiter for a single scope.
pub struct ScopeLimiter {
    rule: ScopeRule,
    policy: WindowPolicy,
    store: TimeoutStore<dyn CounterStore>,
    degradation: DegradationPolicy,
    enabled: bool,
}

impl std::fmt::Debug for ScopeLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScopeLimiter")
            .field("rule", &self.rule)
            .field("policy", &self.policy)
            .field("degradation", &self.degradation)
            .field("enabled", &self.enabled)
            .finish()
    }
}

impl ScopeLimiter {
    /// Create a limiter for `rule`. Fails on an invalid rule.
    pub fn new(
        rule: ScopeRule,
        store: Arc<dyn CounterStore>,
        degradation: DegradationPolicy,
    ) -> Result<Self> {
        let policy = WindowPolicy::from_rule(&rule)?;
        let enabled = rule.enabled;

        Ok(Self {
            store: degradation.guard(store),
            rule,
            policy,
            degradation,
            enabled,
        })
    }

    /// Create a limiter for `rule`, resolving global settings from `config`.
    pub fn from_config(
        rule: ScopeRule,
        config: &FloodgateConfig,
        store: Arc<dyn CounterStore>,
    ) -> Result<Self> {
        let settings = &config.rate_limiting;
        let fail_open = rule.fail_open.unwrap_or(settings.fail_open);
        let degradation = DegradationPolicy::from_flag(
            fail_open,
            config.store.timeout(),
            settings.fail_closed_retry_after_secs,
        );

        let mut limiter = Self::new(rule, store, degradation)?;
        limiter.enabled &= settings.enabled;
        Ok(limiter)
    }

    /// The scope name.
    pub fn scope(&self) -> &str {
        &self.rule.name
    }

    /// The rule this limiter enforces.
    pub fn rule(&self) -> &ScopeRule {
        &self.rule
    }

    /// The window policy in use.
    pub fn policy(&self) -> WindowPolicy {
        self.policy
    }

    /// The degradation policy in use.
    pub fn degradation(&self) -> DegradationPolicy {
        self.degradation
    }

    /// Whether this scope limits at all.
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Derive the budget key for a request in this scope.
    pub fn key_for(&self, client: &str, method: &str, route: &str) -> BudgetKey {
        BudgetKey::derive(&self.rule.name, client, method, route)
    }

    /// Consume one request from `key`'s budget.
    ///
    /// Never fails: store errors and timeouts resolve through the
    /// degradation policy. The whole check, every store call included, is
    /// bounded by the degradation timeout.
    pub async fn check(&self, key: &BudgetKey) -> AdmissionDecision {
        let limit = self.policy.limit();

        if !self.enabled {
            return AdmissionDecision::admit(limit, 0, 0);
        }

        // One deadline for the whole check, on top of the per-call bounds.
        let timeout = self.degradation.timeout();
        let consumed = tokio::time::timeout(
            timeout,
            self.policy
                .check_and_consume(&self.store, &self.rule.key_prefix, key),
        )
        .await
        .unwrap_or(Err(StoreError::Timeout {
            op: "check_and_consume",
            timeout,
        }));

        match consumed {
            Ok(decision) => {
                debug!(
                    key = %key,
                    allowed = decision.allowed,
                    remaining = decision.remaining,
                    "Admission decision made"
                );
                decision
            }
            Err(e) => self.degradation.fallback(key, limit, &e),
        }
    }

    /// Read the stored counter and block state for `key` without consuming.
    pub async fn inspect(&self, key: &BudgetKey) -> std::result::Result<KeyUsage, StoreError> {
        let counter_key = key.counter_key(&self.rule.key_prefix);
        let count = match self.store.get(&counter_key).await? {
            Some(raw) => raw
                .parse()
                .map_err(|_| StoreError::Protocol(format!("counter `{}` is not an integer", counter_key)))?,
            None => 0,
        };

        Ok(KeyUsage {
            count,
            window_ttl_ms: self.store.remaining_ttl_ms(&counter_key).await?,
            block_ttl_ms: self
                .store
                .remaining_ttl_ms(&key.block_key(&self.rule.key_prefix))
                .await?,
        })
    }

    /// Operator reset: delete every counter and block of this scope, or only
    /// those of one client.
    pub async fn reset(&self, client: Option<&str>) -> std::result::Result<u64, StoreError> {
        let pattern = scope_pattern(&self.rule.key_prefix, &self.rule.name, client);
        let deleted = self.store.delete_by_pattern(&pattern).await?;
        info!(scope = %self.rule.name, pattern = %pattern, deleted, "Scope reset");
        Ok(deleted)
    }
}

/// All configured scope limiters, by scope name.
#[derive(Debug, Default)]
pub struct ScopeRegistry {
    limiters: HashMap<String, Arc<ScopeLimiter>>,
}

impl ScopeRegistry {
    /// Build one limiter per configured scope, all sharing `store`.
    pub fn from_config(config: &FloodgateConfig, store: Arc<dyn CounterStore>) -> Result<Self> {
        config.validate()?;

        let mut limiters = HashMap::new();
        for rule in &config.rate_limiting.scopes {
            let limiter = ScopeLimiter::from_config(rule.clone(), config, store.clone())?;
            info!(
                scope = %limiter.scope(),
                strategy = %rule.strategy,
                limit = rule.limit,
                window_ms = rule.window_ms,
                enabled = limiter.is_enabled(),
                "Scope limiter initialized"
            );
            limiters.insert(rule.name.clone(), Arc::new(limiter));
        }

        Ok(Self { limiters })
    }

    /// Look up a scope.
    pub fn get(&self, scope: &str) -> Option<Arc<ScopeLimiter>> {
        self.limiters.get(scope).cloned()
    }

    /// Number of configured scopes.
    pub fn len(&self) -> usize {
        self.limiters.len()
    }

    /// Whether no scope is configured.
    pub fn is_empty(&self) -> bool {
        self.limiters.is_empty()
    }

    /// Iterate scope names.
    pub fn scopes(&self) -> impl Iterator<Item = &str> {
        self.limiters.keys().map(String::as_str)
    }
}
