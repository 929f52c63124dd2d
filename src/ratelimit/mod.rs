//! Rate limiting logic: keys, rules, window policies and scope limiters.

mod decision;
mod degrade;
mod key;
mod limiter;
mod policy;
mod rules;

pub use decision::AdmissionDecision;
pub use degrade::{
    DegradationPolicy, FailureMode, DEFAULT_FAIL_CLOSED_RETRY_AFTER_SECS, DEFAULT_STORE_TIMEOUT,
};
pub use key::{derive_key, scope_pattern, BudgetKey, UNKNOWN};
pub use limiter::{KeyUsage, ScopeLimiter, ScopeRegistry};
pub use policy::WindowPolicy;
pub use rules::{validate_rules, ScopeRule, Strategy};
