mod catalog;
mod config;
mod http;
mod idempotency;
mod metrics;
mod models;
mod security;
mod sync;

use axum::{
    Json, Router,
    body::Bytes,
    extract::{DefaultBodyLimit, Extension, Path, Query, State, rejection::JsonRejection},
    http::{HeaderMap, StatusCode},
    middleware,
    response::{IntoResponse, Response},
    routing::{delete, get, post},
};
use catalog::{
    NewRemoteProduct, NewSalesChannel, NewSalesChannelView, RemoteProduct, SalesChannel,
    SalesChannelView, ViewAssignment,
};
use config::SyncConfig;
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use models::{
    ApiError, AssignmentRequest, DispatcherStatus, ResyncRequest, ScheduleResponse,
    SyncRequestDetail,
};
use once_cell::sync::Lazy;
use security::{AuthContext, AuthState, require_api_auth};
use serde_json::json;
use idempotency::MemoryReplay;
use std::{net::SocketAddr, sync::Arc, time::Duration};
use sync::{
    dispatcher::{DispatchError, DispatchRun, DispatcherHandle, SyncDispatcher},
    events::ChangeEvent,
    executor::ConfiguredExecutor,
    scheduler::{ScheduleError, SyncScheduler},
    store::{RequestFilter, StoreError},
    types::{SyncRequest, SyncStatus},
};
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, fmt};

static OPENAPI: Lazy<serde_json::Value> = Lazy::new(|| {
    serde_yaml::from_str(include_str!("../docs/openapi.yaml"))
        .unwrap_or_else(|_| json!({"openapi": "3.0.3"}))
});

#[tokio::main]
async fn main() {
    if let Err(err) = run().await {
        error!(target = "pim_sync.api", "server crashed: {err:?}");
        std::process::exit(1);
    }
}

async fn run() -> eyre::Result<()> {
    let _ = dotenvy::dotenv();
    init_tracing();

    let config = SyncConfig::from_env();
    let store =
        sync::store::SyncStore::connect(&config.database_url, config.database_max_connections)
            .await?;
    let scheduler = SyncScheduler::new(
        store.clone(),
        config.policy,
        config.schedule_max_attempts,
    );
    let executor = ConfiguredExecutor::from_config(&config.executor);
    let executor_label = executor.label();
    let (dispatcher, _worker) = SyncDispatcher::new(store, executor, config.dispatch.batch_size)
        .spawn(&config.dispatch, executor_label);
    info!(
        target = "pim_sync.api",
        executor = executor_label,
        automatic_dispatch = config.dispatch.enabled,
        "dispatcher started"
    );

    let prometheus_handle = PrometheusBuilder::new().install_recorder()?;
    let redis = config
        .redis_url
        .as_deref()
        .and_then(|url| redis::Client::open(url).ok());

    let state = AppState {
        scheduler,
        dispatcher,
        idempotency: Arc::new(MemoryReplay::new(Duration::from_secs(
            config.idempotency_ttl_secs,
        ))),
        idempotency_ttl_secs: config.idempotency_ttl_secs,
        redis,
        prometheus_handle,
        metrics_key: config.metrics_key.clone(),
        openapi_key: config.openapi_key.clone(),
    };
    let app = build_router(state, AuthState::from_env(), config.request_max_bytes);

    let addr: SocketAddr = ([0, 0, 0, 0], config.port).into();
    info!(target = "pim_sync.api", "listening on {addr}");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app.into_make_service()).await?;
    Ok(())
}

#[derive(Clone)]
struct AppState {
    scheduler: SyncScheduler,
    dispatcher: DispatcherHandle,
    idempotency: Arc<MemoryReplay<ScheduleResponse>>,
    idempotency_ttl_secs: u64,
    redis: Option<redis::Client>,
    prometheus_handle: PrometheusHandle,
    metrics_key: Option<String>,
    openapi_key: Option<String>,
}

fn build_router(state: AppState, auth: AuthState, body_limit: usize) -> Router {
    let cors = CorsLayer::new()
        .allow_headers(Any)
        .allow_methods(Any)
        .allow_origin(Any);

    let protected = Router::new()
        .route("/channels", post(create_channel).get(list_channels))
        .route("/channels/{id}/views", post(create_view).get(list_views))
        .route(
            "/channels/{id}/remote-products",
            post(create_remote_product).get(list_remote_products),
        )
        .route("/remote-products/{id}", get(get_remote_product))
        .route("/views/{id}/assignments", post(assign_product))
        .route(
            "/views/{id}/assignments/{product_id}",
            delete(unassign_product),
        )
        .route("/events", post(post_event))
        .route("/products/{id}/resync", post(resync_product))
        .route("/sync-requests", get(list_sync_requests))
        .route("/sync-requests/{id}", get(get_sync_request))
        .route("/sync-requests/{id}/retry", post(retry_sync_request))
        .route("/dispatcher", get(dispatcher_status))
        .route("/dispatcher/run", post(run_dispatcher))
        .route_layer(middleware::from_fn_with_state(auth, require_api_auth));

    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics_endpoint))
        .route("/openapi.json", get(openapi_json))
        .route("/docs", get(swagger_ui))
        .merge(protected)
        .with_state(state)
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .layer(DefaultBodyLimit::max(body_limit))
}

/// Health and readiness check.
///
/// - Method: `GET`
/// - Path: `/health`
/// - Auth: none
async fn health() -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "service": "pim-sync-rs",
    }))
}

async fn openapi_json(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<serde_json::Value>, AppError> {
    if let Some(key) = &state.openapi_key
        && header_value(&headers, "X-Docs-Key") != Some(key.as_str())
    {
        return Err(AppError::Unauthorized);
    }
    Ok(Json(OPENAPI.clone()))
}

async fn swagger_ui() -> Response {
    let html = r#"<!doctype html>
<html>
<head>
  <meta charset='utf-8'/>
  <title>PIM Sync API Docs</title>
  <link rel="stylesheet" href="https://unpkg.com/swagger-ui-dist@5/swagger-ui.css" />
</head>
<body>
  <div id="swagger-ui"></div>
  <script src="https://unpkg.com/swagger-ui-dist@5/swagger-ui-bundle.js"></script>
  <script>
    window.onload = () => {
      window.ui = SwaggerUIBundle({ url: '/openapi.json', dom_id: '#swagger-ui' });
    };
  </script>
</body>
</html>"#;
    (
        [(axum::http::header::CONTENT_TYPE, "text/html; charset=utf-8")],
        html,
    )
        .into_response()
}

async fn metrics_endpoint(State(state): State<AppState>, headers: HeaderMap) -> Response {
    if let Some(secret) = &state.metrics_key
        && header_value(&headers, "X-Metrics-Key") != Some(secret.as_str())
    {
        return (StatusCode::UNAUTHORIZED, "unauthorized").into_response();
    }
    (
        [(
            axum::http::header::CONTENT_TYPE,
            "text/plain; version=0.0.4",
        )],
        state.prometheus_handle.render(),
    )
        .into_response()
}

// -------- catalog --------

async fn create_channel(
    State(state): State<AppState>,
    Extension(context): Extension<AuthContext>,
    payload: Result<Json<NewSalesChannel>, JsonRejection>,
) -> Result<(StatusCode, Json<SalesChannel>), AppError> {
    crate::metrics::inc_requests("/channels");
    let Json(payload) = payload?;
    let channel = state
        .scheduler
        .store()
        .create_channel(&context.company_id, &payload)
        .await?;
    info!(
        target = "pim_sync.api",
        company_id = %context.company_id,
        api_key = %context.api_key_id,
        channel_id = channel.id,
        integration = channel.integration.as_str(),
        "sales channel created"
    );
    Ok((StatusCode::CREATED, Json(channel)))
}

async fn list_channels(
    State(state): State<AppState>,
    Extension(context): Extension<AuthContext>,
) -> Result<Json<Vec<SalesChannel>>, AppError> {
    crate::metrics::inc_requests("/channels");
    let channels = state
        .scheduler
        .store()
        .list_channels(&context.company_id)
        .await?;
    Ok(Json(channels))
}

async fn create_view(
    State(state): State<AppState>,
    Extension(context): Extension<AuthContext>,
    Path(channel_id): Path<i64>,
    payload: Result<Json<NewSalesChannelView>, JsonRejection>,
) -> Result<(StatusCode, Json<SalesChannelView>), AppError> {
    crate::metrics::inc_requests("/channels/{id}/views");
    let Json(payload) = payload?;
    let view = state
        .scheduler
        .store()
        .create_view(&context.company_id, channel_id, &payload)
        .await?;
    Ok((StatusCode::CREATED, Json(view)))
}

async fn list_views(
    State(state): State<AppState>,
    Extension(context): Extension<AuthContext>,
    Path(channel_id): Path<i64>,
) -> Result<Json<Vec<SalesChannelView>>, AppError> {
    crate::metrics::inc_requests("/channels/{id}/views");
    let views = state
        .scheduler
        .store()
        .list_views(&context.company_id, channel_id)
        .await?;
    Ok(Json(views))
}

async fn create_remote_product(
    State(state): State<AppState>,
    Extension(context): Extension<AuthContext>,
    Path(channel_id): Path<i64>,
    payload: Result<Json<NewRemoteProduct>, JsonRejection>,
) -> Result<(StatusCode, Json<RemoteProduct>), AppError> {
    crate::metrics::inc_requests("/channels/{id}/remote-products");
    let Json(payload) = payload?;
    let product = state
        .scheduler
        .store()
        .create_remote_product(&context.company_id, channel_id, &payload)
        .await?;
    Ok((StatusCode::CREATED, Json(product)))
}

async fn list_remote_products(
    State(state): State<AppState>,
    Extension(context): Extension<AuthContext>,
    Path(channel_id): Path<i64>,
) -> Result<Json<Vec<RemoteProduct>>, AppError> {
    crate::metrics::inc_requests("/channels/{id}/remote-products");
    let products = state
        .scheduler
        .store()
        .list_remote_products(&context.company_id, channel_id)
        .await?;
    Ok(Json(products))
}

async fn get_remote_product(
    State(state): State<AppState>,
    Extension(context): Extension<AuthContext>,
    Path(id): Path<i64>,
) -> Result<Json<RemoteProduct>, AppError> {
    crate::metrics::inc_requests("/remote-products/{id}");
    let product = state
        .scheduler
        .store()
        .remote_product(&context.company_id, id)
        .await?;
    Ok(Json(product))
}

async fn assign_product(
    State(state): State<AppState>,
    Extension(context): Extension<AuthContext>,
    Path(view_id): Path<i64>,
    payload: Result<Json<AssignmentRequest>, JsonRejection>,
) -> Result<Json<ViewAssignment>, AppError> {
    crate::metrics::inc_requests("/views/{id}/assignments");
    let Json(payload) = payload?;
    let assignment = state
        .scheduler
        .store()
        .assign_product(&context.company_id, view_id, payload.product_id)
        .await?;
    // A newly listed product needs a full push to that view.
    let event = ChangeEvent::ManualResync {
        product_id: payload.product_id,
        view_id: Some(view_id),
    };
    if state.scheduler.notify(&context.company_id, &event).await > 0 {
        state.dispatcher.wake();
    }
    Ok(Json(assignment))
}

async fn unassign_product(
    State(state): State<AppState>,
    Extension(context): Extension<AuthContext>,
    Path((view_id, product_id)): Path<(i64, i64)>,
) -> Result<StatusCode, AppError> {
    crate::metrics::inc_requests("/views/{id}/assignments/{product_id}");
    let removed = state
        .scheduler
        .store()
        .unassign_product(&context.company_id, view_id, product_id)
        .await?;
    if removed {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(StoreError::NotFound("view assignment", product_id).into())
    }
}

// -------- scheduling --------

/// Record a local product change and schedule the sync requests it needs.
///
/// - Method: `POST`
/// - Path: `/events`
/// - Auth: `Authorization: Bearer <key>` or `X-Sync-Key: <key>`
/// - Body: `ChangeEvent` tagged by `kind`
/// - Headers: optional `Idempotency-Key`; a repeated key replays the first
///   response without scheduling again.
async fn post_event(
    State(state): State<AppState>,
    Extension(context): Extension<AuthContext>,
    headers: HeaderMap,
    event: Result<Json<ChangeEvent>, JsonRejection>,
) -> Result<Json<ScheduleResponse>, AppError> {
    crate::metrics::inc_requests("/events");
    let Json(event) = event?;
    let key = header_value(&headers, "Idempotency-Key").map(str::to_string);

    if let Some(key) = &key
        && let Some(existing) = replay(&state, &context.company_id, key).await
    {
        info!(
            target = "pim_sync.api",
            company_id = %context.company_id,
            idempotency_key = %key,
            "event replayed"
        );
        return Ok(Json(existing));
    }

    let outcomes = state
        .scheduler
        .schedule(&context.company_id, &event)
        .await?;
    state.dispatcher.wake();
    let response = ScheduleResponse {
        event: event.kind().to_string(),
        outcomes,
    };
    if let Some(key) = key {
        remember(&state, &context.company_id, key, &response).await;
    }
    Ok(Json(response))
}

async fn replay(state: &AppState, company_id: &str, key: &str) -> Option<ScheduleResponse> {
    if let Some(client) = &state.redis {
        return idempotency::redis_get(client, company_id, key).await;
    }
    state.idempotency.get(company_id, key).await
}

async fn remember(state: &AppState, company_id: &str, key: String, response: &ScheduleResponse) {
    if let Some(client) = &state.redis {
        idempotency::redis_set(client, company_id, &key, response, state.idempotency_ttl_secs)
            .await;
        return;
    }
    state
        .idempotency
        .set(company_id, &key, response.clone())
        .await;
}

/// Manual full resync of one product, optionally limited to one view. The
/// body may be empty.
async fn resync_product(
    State(state): State<AppState>,
    Extension(context): Extension<AuthContext>,
    Path(product_id): Path<i64>,
    body: Bytes,
) -> Result<Json<ScheduleResponse>, AppError> {
    crate::metrics::inc_requests("/products/{id}/resync");
    let request: ResyncRequest = if body.iter().all(u8::is_ascii_whitespace) {
        ResyncRequest::default()
    } else {
        serde_json::from_slice(&body).map_err(|err| AppError::BadRequest(err.to_string()))?
    };
    let event = ChangeEvent::ManualResync {
        product_id,
        view_id: request.view_id,
    };
    let outcomes = state
        .scheduler
        .schedule(&context.company_id, &event)
        .await?;
    state.dispatcher.wake();
    Ok(Json(ScheduleResponse {
        event: event.kind().to_string(),
        outcomes,
    }))
}

async fn list_sync_requests(
    State(state): State<AppState>,
    Extension(context): Extension<AuthContext>,
    Query(filter): Query<RequestFilter>,
) -> Result<Json<Vec<SyncRequest>>, AppError> {
    crate::metrics::inc_requests("/sync-requests");
    let requests = state
        .scheduler
        .store()
        .list_requests(&context.company_id, &filter)
        .await?;
    Ok(Json(requests))
}

async fn get_sync_request(
    State(state): State<AppState>,
    Extension(context): Extension<AuthContext>,
    Path(id): Path<i64>,
) -> Result<Json<SyncRequestDetail>, AppError> {
    crate::metrics::inc_requests("/sync-requests/{id}");
    let store = state.scheduler.store();
    let request = store.request(&context.company_id, id).await?;
    let effective = if request.status == SyncStatus::Skipped {
        Some(store.effective_request(&context.company_id, id).await?)
    } else {
        None
    };
    Ok(Json(SyncRequestDetail { request, effective }))
}

async fn retry_sync_request(
    State(state): State<AppState>,
    Extension(context): Extension<AuthContext>,
    Path(id): Path<i64>,
) -> Result<Json<ScheduleResponse>, AppError> {
    crate::metrics::inc_requests("/sync-requests/{id}/retry");
    let outcomes = state
        .scheduler
        .retry_failed(&context.company_id, id)
        .await?;
    state.dispatcher.wake();
    Ok(Json(ScheduleResponse {
        event: "retry".to_string(),
        outcomes,
    }))
}

// -------- dispatch --------

async fn dispatcher_status(
    State(state): State<AppState>,
    Extension(context): Extension<AuthContext>,
) -> Result<Json<DispatcherStatus>, AppError> {
    crate::metrics::inc_requests("/dispatcher");
    let store = state.scheduler.store();
    Ok(Json(DispatcherStatus {
        stats: state.dispatcher.stats().await,
        pending_total: store.pending_count().await?,
        by_status: store.status_counts(&context.company_id).await?,
    }))
}

async fn run_dispatcher(State(state): State<AppState>) -> Result<Json<DispatchRun>, AppError> {
    crate::metrics::inc_requests("/dispatcher/run");
    Ok(Json(state.dispatcher.run_now().await?))
}

fn header_value<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
}

#[derive(Debug)]
enum AppError {
    Store(StoreError),
    Schedule(ScheduleError),
    Dispatch(DispatchError),
    BadRequest(String),
    Unauthorized,
}

impl From<StoreError> for AppError {
    fn from(value: StoreError) -> Self {
        Self::Store(value)
    }
}

impl From<ScheduleError> for AppError {
    fn from(value: ScheduleError) -> Self {
        Self::Schedule(value)
    }
}

/// Malformed bodies and unknown event kinds answer with the usual error
/// document instead of axum's plain-text rejection.
impl From<JsonRejection> for AppError {
    fn from(value: JsonRejection) -> Self {
        Self::BadRequest(value.body_text())
    }
}

impl From<DispatchError> for AppError {
    fn from(value: DispatchError) -> Self {
        Self::Dispatch(value)
    }
}

fn store_status(err: &StoreError) -> (StatusCode, &'static str) {
    match err {
        StoreError::NotFound(..) => (StatusCode::NOT_FOUND, "not_found"),
        StoreError::Invalid(_) => (StatusCode::BAD_REQUEST, "invalid_input"),
        err if err.is_transient() => (StatusCode::CONFLICT, "conflict"),
        _ => (StatusCode::INTERNAL_SERVER_ERROR, "internal"),
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, code, detail) = match &self {
            AppError::Store(err) => {
                let (status, code) = store_status(err);
                (status, code, err.to_string())
            }
            AppError::Schedule(ScheduleError::Store(err)) => {
                let (status, code) = store_status(err);
                (status, code, err.to_string())
            }
            AppError::Schedule(err @ ScheduleError::NotRetryable { .. }) => {
                (StatusCode::CONFLICT, "not_retryable", err.to_string())
            }
            AppError::Schedule(err @ ScheduleError::Exhausted { .. }) => {
                (StatusCode::CONFLICT, "conflict", err.to_string())
            }
            AppError::Dispatch(err @ DispatchError::Unavailable) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "dispatcher_unavailable",
                err.to_string(),
            ),
            AppError::Dispatch(err @ DispatchError::Failed(_)) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "dispatch_failed",
                err.to_string(),
            ),
            AppError::BadRequest(detail) => {
                (StatusCode::BAD_REQUEST, "invalid_input", detail.clone())
            }
            AppError::Unauthorized => (
                StatusCode::UNAUTHORIZED,
                "unauthorized",
                "missing or wrong docs key".to_string(),
            ),
        };
        if status.is_server_error() {
            error!(target = "pim_sync.api", error = %detail, "request failed");
        }
        (status, Json(ApiError::new(code, detail))).into_response()
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,tower_http=debug"));
    let _ = fmt().with_env_filter(filter).try_init();
}
