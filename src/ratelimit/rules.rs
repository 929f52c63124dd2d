//! Per-scope rate limit rules.
//!
//! A scope is an independent policy namespace (global API, login, account
//! creation, ...). Each scope picks its own window strategy, budget and
//! failure behaviour; the same client has an independent budget per scope.

use std::collections::HashSet;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{FloodgateError, Result};

/// Admission strategy for a scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    /// Plain fixed-window counter. An offender may retry once the window rolls.
    #[default]
    FixedWindow,
    /// Point budget per window, escalating to a longer block when exceeded.
    Block,
}

impl std::fmt::Display for Strategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Strategy::FixedWindow => f.write_str("fixed_window"),
            Strategy::Block => f.write_str("block"),
        }
    }
}

/// The rule applied to one scope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScopeRule {
    /// Scope name, used as the first budget key component
    pub name: String,
    /// Requests allowed per window
    pub limit: u64,
    /// Window length in milliseconds
    pub window_ms: u64,
    /// Window strategy
    #[serde(default)]
    pub strategy: Strategy,
    /// Block length in milliseconds; required by [`Strategy::Block`]
    #[serde(default)]
    pub block_duration_ms: Option<u64>,
    /// Prefix for every store key of this scope
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,
    /// Overrides the global fail-open flag for this scope
    #[serde(default)]
    pub fail_open: Option<bool>,
    /// A disabled scope admits everything without touching the store
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_key_prefix() -> String {
    "rl".to_string()
}

fn default_enabled() -> bool {
    true
}

impl ScopeRule {
    /// A fixed-window rule with default prefix and failure behaviour.
    pub fn fixed_window(name: &str, limit: u64, window: Duration) -> Self {
        Self {
            name: name.to_string(),
            limit,
            window_ms: window.as_millis() as u64,
            strategy: Strategy::FixedWindow,
            block_duration_ms: None,
            key_prefix: default_key_prefix(),
            fail_open: None,
            enabled: true,
        }
    }

    /// A block-escalating rule with default prefix and failure behaviour.
    pub fn block(name: &str, limit: u64, window: Duration, block: Duration) -> Self {
        Self {
            strategy: Strategy::Block,
            block_duration_ms: Some(block.as_millis() as u64),
            ..Self::fixed_window(name, limit, window)
        }
    }

    /// Window length.
    pub fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }

    /// Check the rule for values that would silently disable limiting.
    pub fn validate(&self) -> Result<()> {
        validate_segment("scope name", &self.name)?;
        validate_segment("key prefix", &self.key_prefix)?;

        if self.limit == 0 {
            return Err(FloodgateError::Config(format!(
                "scope `{}`: limit must be > 0",
                self.name
            )));
        }

        if self.window_ms == 0 {
            return Err(FloodgateError::Config(format!(
                "scope `{}`: window_ms must be > 0",
                self.name
            )));
        }

        match (self.strategy, self.block_duration_ms) {
            (Strategy::Block, None) | (Strategy::Block, Some(0)) => {
                return Err(FloodgateError::Config(format!(
                    "scope `{}`: block strategy requires a positive block_duration_ms",
                    self.name
                )));
            }
            (Strategy::Block, Some(block_ms)) if block_ms < self.window_ms => {
                warn!(
                    scope = %self.name,
                    block_ms,
                    window_ms = self.window_ms,
                    "Block is shorter than the window; offenders are released before the window rolls"
                );
            }
            (Strategy::FixedWindow, Some(_)) => {
                warn!(
                    scope = %self.name,
                    "block_duration_ms is ignored by the fixed_window strategy"
                );
            }
            _ => {}
        }

        Ok(())
    }
}

/// Validate a set of rules, including name uniqueness across scopes.
pub fn validate_rules(rules: &[ScopeRule]) -> Result<()> {
    let mut seen = HashSet::new();
    for rule in rules {
        rule.validate()?;
        if !seen.insert(rule.name.as_str()) {
            return Err(FloodgateError::Config(format!(
                "scope `{}` is defined more than once",
                rule.name
            )));
        }
    }
    Ok(())
}

fn validate_segment(what: &str, value: &str) -> Result<()> {
    if value.trim().is_empty() {
        return Err(FloodgateError::Config(format!("{} must not be empty", what)));
    }
    if value.contains([':', '*', '?', '[', ']', '\\']) {
        return Err(FloodgateError::Config(format!(
            "{} `{}` must not contain `:` or a glob metacharacter",
            what, value
        )));
    }
    Ok(())
}
