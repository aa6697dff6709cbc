use axum::{
    body::Body,
    error_handling::HandleErrorLayer,
    http::StatusCode,
    response::Response,
    routing::{get, post},
    BoxError, Router,
};
use nexus_core::config::NexusConfig;
use nexus_credentials::CredentialStore;
use nexus_linker::{ConversationLinker, TaskInvocationCache};
use nexus_storage::{StorageReader, StorageWriter};
use nexus_upstream::UpstreamClient;
use std::any::Any;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tower::ServiceBuilder;
use tower_http::catch_panic::CatchPanicLayer;
use tracing::error;

/// Central shared state — passed as Arc<AppState> to all Axum handlers.
pub struct AppState {
    pub config: NexusConfig,
    pub credentials: CredentialStore,
    pub linker: ConversationLinker<StorageReader>,
    pub upstream: UpstreamClient,
    pub writer: StorageWriter,
    pub reader: StorageReader,
    pub task_cache: Arc<TaskInvocationCache>,
    pub request_timeout: Duration,
}

impl AppState {
    pub fn new(
        config: NexusConfig,
        shutdown: watch::Receiver<bool>,
    ) -> anyhow::Result<Self> {
        let task_cache = Arc::new(TaskInvocationCache::new(config.linker.task_cache_ttl_ms));

        let writer = StorageWriter::spawn(
            &config.storage.path,
            config.storage.clone(),
            task_cache.clone(),
            shutdown,
        )?;
        let reader = StorageReader::open(&config.storage.path)?;

        let credentials = CredentialStore::new(config.credentials.dir.clone(), config.credentials.refresh_skew_secs);
        let upstream = UpstreamClient::new(
            config.upstream.base_url.clone(),
            Duration::from_millis(config.upstream.ttfb_timeout_ms),
            Duration::from_millis(config.upstream.timeout_ms),
        );

        let linker = ConversationLinker::new(
            reader.clone(),
            task_cache.clone(),
            config.linker.task_cache_window_ms,
        );

        let request_timeout = Duration::from_millis(config.server.request_timeout_ms);

        Ok(Self {
            config,
            credentials,
            linker,
            upstream,
            writer,
            reader,
            task_cache,
            request_timeout,
        })
    }
}

/// Assemble the full Axum router. The per-request deadline (spec §4.9 step 8)
/// bounds how long a single `/v1/messages` call may hold a connection slot;
/// `CatchPanicLayer` is the outermost layer so a handler panic still yields a
/// 500 instead of aborting the connection (spec §4.9 step 9).
pub fn build_router(state: Arc<AppState>) -> Router {
    let request_timeout = state.request_timeout;

    Router::new()
        .route("/v1/messages", post(crate::http::messages::handle_messages))
        .route("/health", get(crate::http::health::handle_health))
        .route(
            "/api/token-usage/current",
            get(crate::http::tokens::handle_current_window),
        )
        .route("/api/token-usage/daily", get(crate::http::tokens::handle_daily))
        .with_state(state)
        .layer(
            ServiceBuilder::new()
                .layer(HandleErrorLayer::new(handle_timeout_error))
                .timeout(request_timeout),
        )
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .layer(CatchPanicLayer::custom(handle_panic))
}

async fn handle_timeout_error(err: BoxError) -> (StatusCode, axum::Json<serde_json::Value>) {
    let body = axum::Json(serde_json::json!({
        "error": { "type": "request_timeout", "message": err.to_string() }
    }));
    if err.is::<tower::timeout::error::Elapsed>() {
        (StatusCode::GATEWAY_TIMEOUT, body)
    } else {
        (StatusCode::INTERNAL_SERVER_ERROR, body)
    }
}

fn handle_panic(payload: Box<dyn Any + Send + 'static>) -> Response<Body> {
    let message = panic_message(&payload);
    error!(panic = %message, "request handler panicked");
    let body = serde_json::json!({ "error": { "type": "internal_error", "message": "internal error" } });
    Response::builder()
        .status(StatusCode::INTERNAL_SERVER_ERROR)
        .header(axum::http::header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .expect("static response builds")
}

fn panic_message(payload: &(dyn Any + Send + 'static)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    fn test_config(storage_dir: &std::path::Path, credentials_dir: &std::path::Path) -> NexusConfig {
        let mut config = NexusConfig::default();
        config.storage.path = storage_dir.join("nexus.db").to_str().unwrap().to_string();
        config.credentials.dir = credentials_dir.to_str().unwrap().to_string();
        config
    }

    #[tokio::test]
    async fn health_endpoint_reports_ok() {
        let storage_dir = tempfile::tempdir().unwrap();
        let credentials_dir = tempfile::tempdir().unwrap();
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let state = Arc::new(AppState::new(test_config(storage_dir.path(), credentials_dir.path()), shutdown_rx).unwrap());
        let router = build_router(state);

        let response = router
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), axum::http::StatusCode::OK);
    }

    #[tokio::test]
    async fn token_usage_current_reports_zero_for_unseen_account() {
        let storage_dir = tempfile::tempdir().unwrap();
        let credentials_dir = tempfile::tempdir().unwrap();
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let state = Arc::new(AppState::new(test_config(storage_dir.path(), credentials_dir.path()), shutdown_rx).unwrap());
        let router = build_router(state);

        let response = router
            .oneshot(
                Request::builder()
                    .uri("/api/token-usage/current?accountId=nobody")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), axum::http::StatusCode::OK);
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let value: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(value["total"], 0);
    }
}
