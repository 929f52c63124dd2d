//! The per-request admission outcome.

/// Outcome of one admission check. Built per request and never persisted.
///
/// A rejection is an ordinary decision, not an error: callers match on
/// [`allowed`](Self::allowed) instead of catching anything.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdmissionDecision {
    /// Whether the request may proceed
    pub allowed: bool,
    /// Requests left in the current window, never negative
    pub remaining: u64,
    /// The configured budget for the window
    pub limit: u64,
    /// Milliseconds until the budget resets
    pub reset_ms: u64,
    /// Seconds the client should wait before retrying; set on rejection
    pub retry_after_secs: Option<u64>,
}

impl AdmissionDecision {
    /// An admission with `count` requests consumed out of `limit`.
    pub fn admit(limit: u64, count: u64, reset_ms: u64) -> Self {
        Self {
            allowed: true,
            remaining: limit.saturating_sub(count),
            limit,
            reset_ms,
            retry_after_secs: None,
        }
    }

    /// A rejection with the budget exhausted for `retry_after_ms`.
    pub fn reject(limit: u64, retry_after_ms: u64) -> Self {
        Self {
            allowed: false,
            remaining: 0,
            limit,
            reset_ms: retry_after_ms,
            retry_after_secs: Some(ceil_secs(retry_after_ms)),
        }
    }
}

/// Round milliseconds up to whole seconds, never below one second.
pub(crate) fn ceil_secs(ms: u64) -> u64 {
    ms.div_ceil(1000).max(1)
}
