//! Budget key derivation.

use tracing::warn;

/// Identity substituted for any missing or blank key component.
pub const UNKNOWN: &str = "unknown";

const BLOCK_SUFFIX: &str = "block";

/// The identifier under which a client's consumption is tracked.
///
/// Rendered as `{scope}:{client}:{method}:{route}`. The same client gets an
/// independent budget per scope and per route template.
///
/// The client component is percent-escaped so it never contains `:` or a
/// glob metacharacter: `::1` is stored as `%3A%3A1`, and a per-client
/// pattern cannot reach into another client's keys.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BudgetKey {
    /// The policy scope this key belongs to
    pub scope: String,
    /// Client identity (authenticated subject or network address)
    pub client: String,
    /// HTTP method
    pub method: String,
    /// Matched route template
    pub route: String,
}

impl BudgetKey {
    /// Derive a budget key. Never fails: blank components degrade to
    /// [`UNKNOWN`] so key derivation cannot block admission.
    pub fn derive(scope: &str, client: &str, method: &str, route: &str) -> Self {
        Self {
            scope: component(scope, "scope"),
            client: escape_client(&component(client, "client")),
            method: component(&method.to_ascii_uppercase(), "method"),
            route: component(route, "route"),
        }
    }

    /// Store key for the request counter, under `prefix`.
    pub fn counter_key(&self, prefix: &str) -> String {
        format!("{}:{}", prefix, self)
    }

    /// Store key for the block marker, under `prefix`.
    pub fn block_key(&self, prefix: &str) -> String {
        format!("{}:{}:{}", prefix, self, BLOCK_SUFFIX)
    }

    /// Whether any component fell back to [`UNKNOWN`].
    pub fn is_degraded(&self) -> bool {
        [&self.scope, &self.client, &self.method, &self.route]
            .iter()
            .any(|c| c.as_str() == UNKNOWN)
    }
}

impl std::fmt::Display for BudgetKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}:{}:{}", self.scope, self.client, self.method, self.route)
    }
}

/// Free-function form of [`BudgetKey::derive`].
pub fn derive_key(scope: &str, client: &str, method: &str, route: &str) -> BudgetKey {
    BudgetKey::derive(scope, client, method, route)
}

/// Glob matching every store key of `scope` under `prefix`, optionally
/// narrowed to one client.
pub fn scope_pattern(prefix: &str, scope: &str, client: Option<&str>) -> String {
    match client {
        Some(client) => format!("{}:{}:{}:*", prefix, scope, escape_client(client.trim())),
        None => format!("{}:{}:*", prefix, scope),
    }
}

/// Percent-escape the characters that would make a client ambiguous inside
/// a key or a glob pattern.
fn escape_client(client: &str) -> String {
    let mut escaped = String::with_capacity(client.len());
    for c in client.chars() {
        match c {
            '%' => escaped.push_str("%25"),
            ':' => escaped.push_str("%3A"),
            '*' => escaped.push_str("%2A"),
            '?' => escaped.push_str("%3F"),
            '[' => escaped.push_str("%5B"),
            ']' => escaped.push_str("%5D"),
            '\\' => escaped.push_str("%5C"),
            _ => escaped.push(c),
        }
    }
    escaped
}

fn component(value: &str, field: &'static str) -> String {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        warn!(field, "Key component missing, falling back to sentinel identity");
        UNKNOWN.to_string()
    } else {
        trimmed.to_string()
    }
}
