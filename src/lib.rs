//! Switchyard - A resilient multi-backend LLM request router
//!
//! This library routes completion requests across interchangeable LLM providers. Providers are
//! ordered by cost tier and ranked by an adaptive health score; failing providers are disabled for
//! a while, correlated families are circuit-broken together, and all of it survives restarts
//! through a debounced state file.

use axum::Router;
use axum::routing::{get, post, put};
use axum_prometheus::{
    GenericMetricLayer, Handle, PrometheusMetricLayerBuilder,
    metrics_exporter_prometheus::PrometheusHandle,
};
use std::borrow::Cow;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::{info, instrument};

pub mod auth;
pub mod backend;
pub mod breaker;
pub mod client;
pub mod clock;
pub mod errors;
pub mod handlers;
pub mod health;
pub mod models;
pub mod persistence;
pub mod registry;
pub mod router;
pub mod sanitizer;
pub mod selection;
pub mod status;

use auth::KeySet;

/// State shared by every HTTP handler
#[derive(Clone, Debug)]
pub struct AppState {
    pub router: router::Router,
    /// Keys accepted on the admin endpoints. `None` leaves them open.
    pub admin_keys: Option<Arc<KeySet>>,
}

impl AppState {
    pub fn new(router: router::Router) -> Self {
        Self {
            router,
            admin_keys: None,
        }
    }

    pub fn with_admin_keys(mut self, keys: KeySet) -> Self {
        self.admin_keys = Some(Arc::new(keys));
        self
    }
}

/// Locks a mutex, carrying on with the data if a previous holder panicked.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

pub(crate) fn read_lock<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

pub(crate) fn write_lock<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}

/// Build the main HTTP router
/// This creates routes for:
/// - `/v1/generate` - Routes a prompt to the best available provider
/// - `/v1/providers` - Redacted provider status
/// - `/admin/*` - Full status, analytics and runtime controls
#[instrument(skip(state))]
pub fn build_router(state: AppState) -> Router {
    info!("Building router");
    Router::new()
        .route("/v1/generate", post(handlers::generate))
        .route("/v1/providers", get(handlers::providers))
        .route("/admin/status", get(handlers::status))
        .route("/admin/analytics", get(handlers::analytics))
        .route("/admin/health", get(handlers::health))
        .route("/admin/stats", get(handlers::stats))
        .route("/admin/selection-mode", put(handlers::set_selection_mode))
        .route("/admin/provider-type", put(handlers::set_provider_type))
        .route("/admin/reset", post(handlers::reset))
        .with_state(state)
}

/// Builds a router for the metrics endpoint.
#[instrument(skip(handle))]
pub fn build_metrics_router(handle: PrometheusHandle) -> Router {
    info!("Building metrics router");
    Router::new().route(
        "/metrics",
        axum::routing::get(move || async move { handle.render() }),
    )
}

type MetricsLayerAndHandle = (
    GenericMetricLayer<'static, PrometheusHandle, Handle>,
    PrometheusHandle,
);

/// Builds a layer and handle for prometheus metrics collection.
///
/// `prefix` names the metrics; it must live for the whole program, as the layer requires.
pub fn build_metrics_layer_and_handle(
    prefix: impl Into<Cow<'static, str>>,
) -> MetricsLayerAndHandle {
    info!("Building metrics layer");
    PrometheusMetricLayerBuilder::new()
        .with_prefix(prefix)
        .enable_response_body_size(true)
        .with_endpoint_label_type(axum_prometheus::EndpointLabel::Exact)
        .with_default_metrics()
        .build_pair()
}

/// Mock backends and HTTP clients for tests.
#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils {
    use crate::backend::{ChatBackend, Completion, CompletionRequest};
    use crate::client::HttpClient;
    use crate::errors::ProviderCallError;
    use async_trait::async_trait;
    use axum::http::StatusCode;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    pub struct MockHttpClient {
        pub requests: Arc<Mutex<Vec<MockRequest>>>,
        response_builder: Arc<dyn Fn() -> axum::response::Response + Send + Sync>,
    }

    #[derive(Debug, Clone)]
    pub struct MockRequest {
        pub method: String,
        pub uri: String,
        pub headers: Vec<(String, String)>,
        pub body: Vec<u8>,
    }

    impl MockHttpClient {
        pub fn new(status: StatusCode, body: &str) -> Self {
            let body = body.to_string();
            Self {
                requests: Arc::new(Mutex::new(Vec::new())),
                response_builder: Arc::new(move || {
                    axum::response::Response::builder()
                        .status(status)
                        .header("content-type", "application/json")
                        .body(axum::body::Body::from(body.clone()))
                        .unwrap()
                }),
            }
        }

        pub fn get_requests(&self) -> Vec<MockRequest> {
            self.requests.lock().unwrap().clone()
        }
    }

    impl std::fmt::Debug for MockHttpClient {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            f.debug_struct("MockHttpClient")
                .field("requests", &self.requests)
                .field("response_builder", &"<closure>")
                .finish()
        }
    }

    impl Clone for MockHttpClient {
        fn clone(&self) -> Self {
            Self {
                requests: Arc::clone(&self.requests),
                response_builder: Arc::clone(&self.response_builder),
            }
        }
    }

    #[async_trait]
    impl HttpClient for MockHttpClient {
        async fn request(
            &self,
            req: axum::extract::Request,
        ) -> Result<axum::response::Response, Box<dyn std::error::Error + Send + Sync>> {
            let method = req.method().to_string();
            let uri = req.uri().to_string();
            let headers = req
                .headers()
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_str().unwrap_or("").to_string()))
                .collect();

            let body = axum::body::to_bytes(req.into_body(), usize::MAX)
                .await
                .map_err(|e| Box::new(e) as Box<dyn std::error::Error + Send + Sync>)?
                .to_vec();

            self.requests.lock().unwrap().push(MockRequest {
                method,
                uri,
                headers,
                body,
            });

            Ok((self.response_builder)())
        }
    }

    /// A backend that replays scripted outcomes, then repeats a fallback forever.
    #[derive(Debug)]
    pub struct ScriptedBackend {
        script: Mutex<VecDeque<Result<Completion, ProviderCallError>>>,
        fallback: Result<Completion, ProviderCallError>,
        calls: AtomicUsize,
    }

    impl ScriptedBackend {
        pub fn sequence(
            script: Vec<Result<Completion, ProviderCallError>>,
            fallback: Result<Completion, ProviderCallError>,
        ) -> Self {
            Self {
                script: Mutex::new(script.into()),
                fallback,
                calls: AtomicUsize::new(0),
            }
        }

        pub fn always_ok(content: &str) -> Self {
            Self::sequence(Vec::new(), Ok(Completion::text(content)))
        }

        pub fn always_err(err: ProviderCallError) -> Self {
            Self::sequence(Vec::new(), Err(err))
        }

        pub fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl ChatBackend for ScriptedBackend {
        async fn complete(
            &self,
            _request: &CompletionRequest<'_>,
        ) -> Result<Completion, ProviderCallError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let next = self.script.lock().unwrap().pop_front();
            next.unwrap_or_else(|| self.fallback.clone())
        }
    }
}
