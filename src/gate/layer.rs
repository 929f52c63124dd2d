use std::sync::Arc;
use std::task::{Context, Poll};

use axum::extract::Request;
use axum::response::Response;
use futures::future::BoxFuture;
use tower::{Layer, Service};

use super::response::{merge_headers, rejection_response};
use super::AdmissionGate;

/// Tower layer running an [`AdmissionGate`] in front of the inner service.
#[derive(Debug, Clone)]
pub struct AdmissionLayer {
    gate: Arc<AdmissionGate>,
}

impl AdmissionLayer {
    pub fn new(gate: AdmissionGate) -> Self {
        Self {
            gate: Arc::new(gate),
        }
    }
}

impl<S> Layer<S> for AdmissionLayer {
    type Service = AdmissionService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        AdmissionService {
            inner,
            gate: self.gate.clone(),
        }
    }
}

/// Service produced by [`AdmissionLayer`].
#[derive(Debug, Clone)]
pub struct AdmissionService<S> {
    inner: S,
    gate: Arc<AdmissionGate>,
}

impl<S> Service<Request> for AdmissionService<S>
where
    S: Service<Request, Response = Response> + Clone + Send + 'static,
    S::Future: Send + 'static,
{
    type Response = Response;
    type Error = S::Error;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, request: Request) -> Self::Future {
        // Take the service that was driven to readiness.
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);

        if !self.gate.is_enabled() {
            return Box::pin(inner.call(request));
        }

        let admission = self.gate.admit(&request);

        Box::pin(async move {
            let decision = admission.await;
            if !decision.allowed {
                return Ok(rejection_response(&decision));
            }

            let mut response = inner.call(request).await?;
            merge_headers(response.headers_mut(), &decision);
            Ok(response)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::{DegradationPolicy, ScopeLimiter, ScopeRule};
    use crate::store::testing::DownStore;
    use crate::store::{CounterStore, MemoryStore};
    use axum::body::Body;
    use axum::extract::{ConnectInfo, Path};
    use axum::routing::{get, post};
    use axum::Router;
    use http::StatusCode;
    use std::net::SocketAddr;
    use std::time::Duration;
    use tower::ServiceExt;

    fn limiter(
        scope: &str,
        limit: u64,
        store: Arc<dyn CounterStore>,
        degradation: DegradationPolicy,
    ) -> Arc<ScopeLimiter> {
        let rule = ScopeRule::fixed_window(scope, limit, Duration::from_secs(60));
        Arc::new(ScopeLimiter::new(rule, store, degradation).unwrap())
    }

    fn request(method: &str, uri: &str, peer: [u8; 4]) -> Request {
        let mut request = Request::builder()
            .method(method)
            .uri(uri)
            .body(Body::empty())
            .unwrap();
        request
            .extensions_mut()
            .insert(ConnectInfo(SocketAddr::from((peer, 50000))));
        request
    }

    fn header(response: &Response, name: &str) -> Option<u64> {
        response
            .headers()
            .get(name)
            .map(|v| v.to_str().unwrap().parse().unwrap())
    }

    async fn user(Path(id): Path<String>) -> String {
        id
    }

    #[tokio::test]
    async fn test_admits_then_rejects() {
        let api = limiter("api", 2, Arc::new(MemoryStore::new()), DegradationPolicy::default());
        let app = Router::new()
            .route("/users/:id", get(user))
            .layer(AdmissionGate::new(api).layer());

        let first = app.clone().oneshot(request("GET", "/users/1", [10, 0, 0, 1])).await.unwrap();
        assert_eq!(first.status(), StatusCode::OK);
        assert_eq!(header(&first, "x-ratelimit-limit"), Some(2));
        assert_eq!(header(&first, "x-ratelimit-remaining"), Some(1));

        // Same matched route, different path parameter: one budget.
        let second = app.clone().oneshot(request("GET", "/users/2", [10, 0, 0, 1])).await.unwrap();
        assert_eq!(header(&second, "x-ratelimit-remaining"), Some(0));

        let third = app.clone().oneshot(request("GET", "/users/3", [10, 0, 0, 1])).await.unwrap();
        assert_eq!(third.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(header(&third, "retry-after"), Some(60));

        let other = app.oneshot(request("GET", "/users/1", [10, 0, 0, 2])).await.unwrap();
        assert_eq!(other.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_disabled_gate_passes_through() {
        let rule = ScopeRule {
            enabled: false,
            ..ScopeRule::fixed_window("api", 1, Duration::from_secs(60))
        };
        let api = ScopeLimiter::new(rule, Arc::new(DownStore), DegradationPolicy::default()).unwrap();
        let app = Router::new()
            .route("/users/:id", get(user))
            .layer(AdmissionGate::new(Arc::new(api)).layer());

        for _ in 0..3 {
            let response = app.clone().oneshot(request("GET", "/users/1", [10, 0, 0, 1])).await.unwrap();
            assert_eq!(response.status(), StatusCode::OK);
            assert!(response.headers().get("x-ratelimit-limit").is_none());
        }
    }

    #[tokio::test]
    async fn test_store_down_fail_open_and_closed() {
        let open = limiter("api", 5, Arc::new(DownStore), DegradationPolicy::default());
        let closed = limiter(
            "login",
            5,
            Arc::new(DownStore),
            DegradationPolicy::fail_closed(Duration::from_millis(50), 60),
        );
        let app = Router::new()
            .route("/users/:id", get(user))
            .layer(AdmissionGate::new(open).layer())
            .route("/login", post(|| async { "welcome" }).layer(AdmissionGate::new(closed).layer()));

        let read = app.clone().oneshot(request("GET", "/users/1", [10, 0, 0, 1])).await.unwrap();
        assert_eq!(read.status(), StatusCode::OK);
        assert_eq!(header(&read, "x-ratelimit-remaining"), Some(5));

        let login = app.oneshot(request("POST", "/login", [10, 0, 0, 1])).await.unwrap();
        assert_eq!(login.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(header(&login, "retry-after"), Some(60));
    }

    #[tokio::test]
    async fn test_composed_gates() {
        let store: Arc<dyn CounterStore> = Arc::new(MemoryStore::new());
        let global = limiter("api", 3, store.clone(), DegradationPolicy::default());
        let auth = limiter("auth", 1, store, DegradationPolicy::default());

        let app = Router::new()
            .route(
                "/login",
                post(|| async { "welcome" }).layer(AdmissionGate::new(auth.clone()).layer()),
            )
            .layer(AdmissionGate::new(global.clone()).layer());

        // Both admit; the tighter budget is reported.
        let first = app.clone().oneshot(request("POST", "/login", [10, 0, 0, 1])).await.unwrap();
        assert_eq!(first.status(), StatusCode::OK);
        assert_eq!(header(&first, "x-ratelimit-limit"), Some(1));
        assert_eq!(header(&first, "x-ratelimit-remaining"), Some(0));

        // The inner gate rejects.
        let second = app.clone().oneshot(request("POST", "/login", [10, 0, 0, 1])).await.unwrap();
        assert_eq!(second.status(), StatusCode::TOO_MANY_REQUESTS);

        let third = app.clone().oneshot(request("POST", "/login", [10, 0, 0, 1])).await.unwrap();
        assert_eq!(third.status(), StatusCode::TOO_MANY_REQUESTS);

        // The outer gate is now exhausted and rejects before the inner one runs.
        let fourth = app.oneshot(request("POST", "/login", [10, 0, 0, 1])).await.unwrap();
        assert_eq!(fourth.status(), StatusCode::TOO_MANY_REQUESTS);

        let auth_key = auth.key_for("10.0.0.1", "POST", "/login");
        assert_eq!(auth.inspect(&auth_key).await.unwrap().count, 3);

        let global_key = global.key_for("10.0.0.1", "POST", "/login");
        assert_eq!(global.inspect(&global_key).await.unwrap().count, 4);
    }
}
