//! Request-facing admission gate.
//!
//! A gate derives the budget key from the request, asks its scope limiter
//! for a decision and, when mounted as a tower layer, either lets the
//! request through with `X-RateLimit-*` headers or answers 429 itself.
//! Stacked gates short-circuit: the first one to reject wins and the ones
//! inside it never run.

mod layer;
mod response;

pub use layer::{AdmissionLayer, AdmissionService};
pub use response::{apply_headers, merge_headers, rejection_response, REJECTION_MESSAGE};

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{ConnectInfo, MatchedPath};
use http::{HeaderMap, Request};
use tracing::error;

use crate::ratelimit::{AdmissionDecision, BudgetKey, ScopeLimiter};
use crate::store::StoreError;

/// Identity attached by an upstream auth layer.
///
/// When present it replaces the network address as the client component of
/// the budget key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientIdentity(pub String);

/// Admission gate for one scope.
#[derive(Debug, Clone)]
pub struct AdmissionGate {
    limiter: Arc<ScopeLimiter>,
    trust_proxy_headers: bool,
}

impl AdmissionGate {
    /// Create a gate in front of `limiter`.
    pub fn new(limiter: Arc<ScopeLimiter>) -> Self {
        Self {
            limiter,
            trust_proxy_headers: false,
        }
    }

    /// Prefer `X-Forwarded-For` / `X-Real-IP` over the socket address.
    ///
    /// Only enable behind a proxy that overwrites these headers.
    pub fn trust_proxy_headers(mut self, trust: bool) -> Self {
        self.trust_proxy_headers = trust;
        self
    }

    /// The scope limiter behind this gate.
    pub fn limiter(&self) -> &Arc<ScopeLimiter> {
        &self.limiter
    }

    /// Whether this gate limits at all.
    pub fn is_enabled(&self) -> bool {
        self.limiter.is_enabled()
    }

    /// Wrap this gate as a tower layer.
    pub fn layer(self) -> AdmissionLayer {
        AdmissionLayer::new(self)
    }

    /// Derive the budget key for `request` in this gate's scope.
    pub fn key_for<B>(&self, request: &Request<B>) -> BudgetKey {
        let client = self.client_identity(request);
        let route = request
            .extensions()
            .get::<MatchedPath>()
            .map(|path| path.as_str())
            .unwrap_or_default();

        self.limiter
            .key_for(&client, request.method().as_str(), route)
    }

    /// Decide whether `request` may proceed.
    ///
    /// The key is derived up front, so the returned future does not borrow
    /// the request. The store interaction runs on its own task: dropping
    /// the returned future (a cancelled request) does not abort an
    /// increment that is already under way.
    pub fn admit<B>(
        &self,
        request: &Request<B>,
    ) -> impl Future<Output = AdmissionDecision> + Send + 'static {
        let key = self.key_for(request);
        let limiter = self.limiter.clone();

        async move {
            let task_limiter = limiter.clone();
            let task_key = key.clone();
            let handle = tokio::spawn(async move { task_limiter.check(&task_key).await });

            match handle.await {
                Ok(decision) => decision,
                Err(e) => {
                    error!(key = %key, error = %e, "Admission task failed");
                    let err = StoreError::Unavailable(format!("admission task failed: {}", e));
                    limiter
                        .degradation()
                        .fallback(&key, limiter.policy().limit(), &err)
                }
            }
        }
    }

    fn client_identity<B>(&self, request: &Request<B>) -> String {
        if let Some(ClientIdentity(identity)) = request.extensions().get::<ClientIdentity>() {
            return identity.clone();
        }

        if self.trust_proxy_headers {
            if let Some(forwarded) = forwarded_client(request.headers()) {
                return forwarded;
            }
        }

        request
            .extensions()
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ConnectInfo(addr)| addr.ip().to_string())
            .unwrap_or_default()
    }
}

/// First hop of `X-Forwarded-For`, else `X-Real-IP`.
fn forwarded_client(headers: &HeaderMap) -> Option<String> {
    let forwarded_for = headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(str::trim)
        .filter(|v| !v.is_empty());

    forwarded_for
        .or_else(|| {
            headers
                .get("x-real-ip")
                .and_then(|v| v.to_str().ok())
                .map(str::trim)
                .filter(|v| !v.is_empty())
        })
        .map(str::to_string)
}
