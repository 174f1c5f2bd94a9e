//! The HTTP surface: metrics, health, readiness, HA status, and dynamic
//! webhook dispatch.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use axum::body::Body;
use axum::extract::State;
use axum::http::{header, Request, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use prometheus::{Encoder, Registry, TextEncoder};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use zen_common::ZenError;
use zen_ingest::{IngesterStore, RouteRegistrar, WebhookHandler};

use crate::ha::HaCoordinator;

/// Webhook route table. Adapters register handlers; the fallback dispatches
/// requests by exact path. An existing path never rebinds.
#[derive(Default)]
pub struct WebhookRouteTable {
    routes: RwLock<HashMap<String, Arc<WebhookHandler>>>,
}

impl RouteRegistrar for WebhookRouteTable {
    fn register(&self, path: &str, handler: Arc<WebhookHandler>) -> Result<(), ZenError> {
        let mut routes = self.routes.write().expect("route table lock");
        if routes.contains_key(path) {
            return Err(ZenError::Validation(format!(
                "webhook path '{path}' is already registered"
            )));
        }
        routes.insert(path.to_string(), handler);
        Ok(())
    }

    fn unregister(&self, path: &str) {
        self.routes.write().expect("route table lock").remove(path);
    }
}

impl WebhookRouteTable {
    fn lookup(&self, path: &str) -> Option<Arc<WebhookHandler>> {
        self.routes.read().expect("route table lock").get(path).cloned()
    }
}

#[derive(Clone)]
pub struct AppState {
    pub registry: Registry,
    pub routes: Arc<WebhookRouteTable>,
    pub store: Arc<IngesterStore>,
    pub ha: Option<Arc<HaCoordinator>>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/metrics", get(metrics_handler))
        .route("/health", get(|| async { "ok" }))
        .route("/ready", get(ready_handler))
        .route("/ha/status", get(ha_status_handler))
        .fallback(webhook_dispatch)
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .with_state(state)
}

pub async fn serve(
    state: AppState,
    host: &str,
    port: u16,
    cancel: CancellationToken,
) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind((host, port)).await?;
    info!(host, port, "HTTP server listening");
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await?;
    Ok(())
}

async fn metrics_handler(State(state): State<AppState>) -> Response {
    let families = state.registry.gather();
    let mut buffer = Vec::new();
    let encoder = TextEncoder::new();
    if let Err(e) = encoder.encode(&families, &mut buffer) {
        warn!(error = %e, "Metric encoding failed");
        return StatusCode::INTERNAL_SERVER_ERROR.into_response();
    }
    (
        [(header::CONTENT_TYPE, encoder.format_type().to_string())],
        buffer,
    )
        .into_response()
}

/// Ready only after the ingester store finished its initial sync.
async fn ready_handler(State(state): State<AppState>) -> Response {
    if state.store.is_synced() {
        (StatusCode::OK, "ready").into_response()
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "syncing").into_response()
    }
}

async fn ha_status_handler(State(state): State<AppState>) -> Response {
    match &state.ha {
        Some(ha) => Json(ha.snapshot()).into_response(),
        None => (StatusCode::NOT_FOUND, "ha disabled").into_response(),
    }
}

/// Everything that is not a built-in route is a candidate webhook path.
async fn webhook_dispatch(State(state): State<AppState>, request: Request<Body>) -> Response {
    if request.method() != axum::http::Method::POST {
        return StatusCode::NOT_FOUND.into_response();
    }
    let path = request.uri().path().to_string();
    let Some(handler) = state.routes.lookup(&path) else {
        return StatusCode::NOT_FOUND.into_response();
    };

    let auth_header = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    let body = match axum::body::to_bytes(request.into_body(), 1024 * 1024).await {
        Ok(bytes) => bytes,
        Err(_) => return StatusCode::BAD_REQUEST.into_response(),
    };

    let response = handler.handle(auth_header.as_deref(), &body);
    StatusCode::from_u16(response.status())
        .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tower::ServiceExt;

    fn test_state() -> AppState {
        AppState {
            registry: Registry::new(),
            routes: Arc::new(WebhookRouteTable::default()),
            store: Arc::new(IngesterStore::new()),
            ha: None,
        }
    }

    #[tokio::test]
    async fn health_is_always_ok() {
        let app = router(test_state());
        let response = app
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn ready_gates_on_store_sync() {
        let state = test_state();
        let store = state.store.clone();
        let app = router(state);

        let response = app
            .clone()
            .oneshot(Request::builder().uri("/ready").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);

        store.mark_synced();
        let response = app
            .oneshot(Request::builder().uri("/ready").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn unknown_webhook_path_is_404() {
        let app = router(test_state());
        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/hooks/ghost")
                    .body(Body::from("{}"))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn route_table_rejects_path_conflicts() {
        // Registering through the trait is what adapter start does; the
        // second registration must fail, not rebind.
        let table = WebhookRouteTable::default();
        assert!(table
            .routes
            .write()
            .unwrap()
            .insert("/hooks/a".to_string(), make_handler())
            .is_none());
        assert!(table.register("/hooks/a", make_handler()).is_err());
        table.unregister("/hooks/a");
        assert!(table.register("/hooks/a", make_handler()).is_ok());
    }

    fn make_handler() -> Arc<WebhookHandler> {
        let metrics = zen_ingest::Metrics::unregistered().unwrap();
        WebhookHandler::unauthenticated("test", "/hooks/a", metrics).0
    }
}
