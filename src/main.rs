mod backend;
mod catalog;
mod config;
mod engine;
mod fingerprint;
mod http;
mod jobs;
mod metrics;
mod models;
mod placement;
mod render;
mod security;

use axum::{
    Json, Router,
    extract::{DefaultBodyLimit, Path, State},
    http::{HeaderMap, StatusCode},
    middleware,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use backend::{
    DriveBackend, FolderCache, LocalBackend, ObjectStoreBackend, SyncBackend,
};
use catalog::{CatalogSource, ShopifyCatalog};
use config::{BackendConfig, FingerprintConfig, SyncConfig};
use engine::{HttpImageSource, ReconcileError, Reconciler};
use eyre::WrapErr;
use fingerprint::{FileFingerprints, FingerprintStore, MemoryFingerprints, RedisFingerprints};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use models::{ApiError, ChangeEvent, Summary};
use render::ArtifactRenderer;
use security::{AdminAuth, require_admin_key};
use serde::Serialize;
use serde_json::json;
use std::{net::SocketAddr, sync::Arc};
use tower_http::trace::TraceLayer;
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, fmt};

#[tokio::main]
async fn main() {
    if let Err(err) = run().await {
        error!(target = "vsync.api", "server crashed: {err:?}");
        std::process::exit(1);
    }
}

async fn run() -> eyre::Result<()> {
    let _ = dotenvy::dotenv();
    init_tracing();

    let config = SyncConfig::from_env().wrap_err("invalid configuration")?;
    let http = http::build_client(config.http_timeout, config.http_connect_timeout);

    let backend = build_backend(&config, http.clone())?;
    let fingerprints = build_fingerprints(&config)?;
    let reconciler = Reconciler::new(
        backend,
        fingerprints,
        Arc::new(HttpImageSource::new(http.clone())),
        ArtifactRenderer::new(&config.render),
        config.reconcile.clone(),
    );
    info!(
        target = "vsync.api",
        backend = reconciler.backend_name(),
        concurrency = config.reconcile.concurrency,
        "reconciler ready"
    );

    let queue = config.catalog.clone().map(|catalog_config| {
        let catalog: Arc<dyn CatalogSource> = Arc::new(ShopifyCatalog::new(http.clone(), catalog_config));
        let (queue, _worker) = jobs::JobQueue::spawn(catalog, reconciler.clone(), config.queue_capacity);
        queue
    });
    if queue.is_none() {
        info!(target = "vsync.api", "catalog sweeps disabled; SHOPIFY_STORE_URL not set");
    }

    let prometheus_handle = PrometheusBuilder::new()
        .install_recorder()
        .wrap_err("failed to install prometheus recorder")?;

    let state = AppState {
        reconciler,
        queue,
        prometheus_handle,
        metrics_key: config.metrics_key.clone(),
    };
    let app = router(
        state,
        AdminAuth::new(config.admin_keys.clone()),
        config.request_max_bytes,
    );

    let addr: SocketAddr = ([0, 0, 0, 0], config.port).into();
    info!(target = "vsync.api", "listening on {addr}");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app.into_make_service()).await?;
    Ok(())
}

fn build_backend(config: &SyncConfig, http: reqwest::Client) -> eyre::Result<Arc<dyn SyncBackend>> {
    Ok(match &config.backend {
        BackendConfig::Local { root } => Arc::new(LocalBackend::new(root.clone())),
        BackendConfig::ObjectStore(s3) => Arc::new(
            ObjectStoreBackend::new(s3.clone()).wrap_err("invalid object store settings")?,
        ),
        BackendConfig::Drive(drive) => Arc::new(DriveBackend::new(
            http,
            drive.clone(),
            Arc::new(FolderCache::new()),
        )),
    })
}

fn build_fingerprints(config: &SyncConfig) -> eyre::Result<Arc<dyn FingerprintStore>> {
    Ok(match &config.fingerprints {
        FingerprintConfig::Memory => Arc::new(MemoryFingerprints::new()),
        FingerprintConfig::File { path } => Arc::new(
            FileFingerprints::open(path.clone()).wrap_err("failed to open fingerprint file")?,
        ),
        FingerprintConfig::Redis { url } => Arc::new(RedisFingerprints::new(
            redis::Client::open(url.as_str()).wrap_err("invalid REDIS_URL")?,
        )),
    })
}

fn router(state: AppState, admin: AdminAuth, body_limit: usize) -> Router {
    let protected = Router::new()
        .route("/sync/catalog", post(enqueue_catalog_sweep))
        .route("/jobs/{id}", get(get_job_status))
        .route_layer(middleware::from_fn_with_state(admin, require_admin_key));

    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics_endpoint))
        .route("/webhook", post(webhook))
        .merge(protected)
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(DefaultBodyLimit::max(body_limit))
}

#[derive(Clone)]
struct AppState {
    reconciler: Reconciler,
    queue: Option<jobs::JobQueue>,
    prometheus_handle: PrometheusHandle,
    metrics_key: Option<String>,
}

/// Health and readiness check.
///
/// - Method: `GET`
/// - Path: `/health`
/// - Auth: none
async fn health(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "service": "variant-sync-rs",
        "backend": state.reconciler.backend_name(),
    }))
}

async fn metrics_endpoint(State(state): State<AppState>, headers: HeaderMap) -> Response {
    if let Some(secret) = &state.metrics_key {
        let presented = headers
            .get("X-Metrics-Key")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");
        if presented != secret.as_str() {
            return (StatusCode::UNAUTHORIZED, "unauthorized").into_response();
        }
    }
    (
        [("Content-Type", "text/plain; version=0.0.4")],
        state.prometheus_handle.render(),
    )
        .into_response()
}

#[derive(Debug, Serialize)]
struct WebhookResponse {
    status: &'static str,
    summary: Summary,
}

/// Reconcile every variant of a product change event.
///
/// - Method: `POST`
/// - Path: `/webhook`
/// - Body: a single product or `{ "products": [...] }`
/// - Response: `{ status, summary }` once the event is fully reconciled
async fn webhook(
    State(state): State<AppState>,
    Json(event): Json<ChangeEvent>,
) -> Result<Json<WebhookResponse>, AppError> {
    crate::metrics::inc_requests("/webhook");
    let summary = state.reconciler.reconcile(event).await?;
    Ok(Json(WebhookResponse {
        status: "ok",
        summary,
    }))
}

#[derive(Debug, Serialize)]
struct EnqueueResponse {
    job_id: String,
}

async fn enqueue_catalog_sweep(
    State(state): State<AppState>,
) -> Result<(StatusCode, Json<EnqueueResponse>), AppError> {
    crate::metrics::inc_requests("/sync/catalog");
    let Some(queue) = &state.queue else {
        return Err(AppError::Unavailable(ApiError {
            error: "catalog_not_configured".into(),
            detail: Some("set SHOPIFY_STORE_URL and credentials to enable sweeps".into()),
        }));
    };
    let id = queue.enqueue_sweep().await.map_err(AppError::Unavailable)?;
    Ok((
        StatusCode::ACCEPTED,
        Json(EnqueueResponse {
            job_id: id.to_string(),
        }),
    ))
}

async fn get_job_status(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<jobs::JobInfo>, AppError> {
    let Ok(uuid) = uuid::Uuid::parse_str(&id) else {
        return Err(AppError::InvalidInput("invalid_job_id"));
    };
    let info = match &state.queue {
        Some(queue) => queue.get(uuid).await,
        None => None,
    };
    info.map(Json).ok_or(AppError::NotFound("job_not_found"))
}

#[derive(Debug)]
enum AppError {
    Reconcile(ReconcileError),
    InvalidInput(&'static str),
    NotFound(&'static str),
    Unavailable(ApiError),
}

impl From<ReconcileError> for AppError {
    fn from(value: ReconcileError) -> Self {
        Self::Reconcile(value)
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, payload) = match self {
            AppError::Reconcile(err) => {
                error!(target = "vsync.api", error = %err, "webhook reconciliation failed");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    ApiError {
                        error: "reconcile_failed".into(),
                        detail: Some(err.to_string()),
                    },
                )
            }
            AppError::InvalidInput(code) => (
                StatusCode::BAD_REQUEST,
                ApiError {
                    error: code.into(),
                    detail: None,
                },
            ),
            AppError::NotFound(code) => (
                StatusCode::NOT_FOUND,
                ApiError {
                    error: code.into(),
                    detail: None,
                },
            ),
            AppError::Unavailable(err) => (StatusCode::SERVICE_UNAVAILABLE, err),
        };
        (status, Json(payload)).into_response()
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,tower_http=debug"));
    let _ = fmt().with_env_filter(filter).try_init();
}
