//! HTTP API forwarding requests to the engine, plus a live event stream.

use std::convert::Infallible;
use std::future::Future;
use std::net::SocketAddr;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tokio_stream::Stream;
use tokio_stream::StreamExt;
use tokio_stream::wrappers::ReceiverStream;
use tower_http::cors::{Any, CorsLayer};

use crate::classify::Submission;
use crate::engine::Engine;
use crate::error::Error;
use crate::job::JobId;
use crate::queue::QueueSnapshot;

#[derive(Clone)]
struct AppState {
    engine: Engine,
}

/// An engine error rendered as a JSON body with a fitting status code.
struct ApiError(Error);

impl From<Error> for ApiError {
    fn from(e: Error) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match self.0 {
            Error::EmptyUrl
            | Error::Classification { .. }
            | Error::InvalidReorder { .. }
            | Error::NotRetryable { .. } => StatusCode::BAD_REQUEST,
            Error::JobNotFound(_) => StatusCode::NOT_FOUND,
            Error::EngineStopped => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let body = ErrorResponse {
            error: self.0.to_string(),
        };
        (status, Json(body)).into_response()
    }
}

type ApiResult<T> = std::result::Result<Json<T>, ApiError>;

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

#[derive(Serialize)]
struct HealthResponse {
    status: String,
}

#[derive(Serialize)]
struct SubmitResponse {
    id: JobId,
}

#[derive(Serialize)]
struct OkResponse {
    ok: bool,
}

#[derive(Serialize)]
struct CountResponse {
    count: usize,
}

#[derive(Deserialize)]
struct ReorderRequest {
    from: usize,
    to: usize,
}

#[derive(Deserialize)]
struct ConcurrencyRequest {
    #[serde(alias = "maxConcurrent")]
    max_concurrent: usize,
}

const OK: OkResponse = OkResponse { ok: true };

async fn api_health() -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok".to_string(),
    })
}

async fn api_queue(State(state): State<AppState>) -> ApiResult<QueueSnapshot> {
    Ok(Json(state.engine.inspect().await?))
}

async fn api_submit(
    State(state): State<AppState>,
    Json(submission): Json<Submission>,
) -> ApiResult<SubmitResponse> {
    let id = state.engine.submit(submission).await?;
    Ok(Json(SubmitResponse { id }))
}

async fn api_cancel(State(state): State<AppState>, Path(id): Path<JobId>) -> ApiResult<OkResponse> {
    state.engine.cancel(id).await?;
    Ok(Json(OK))
}

async fn api_retry(State(state): State<AppState>, Path(id): Path<JobId>) -> ApiResult<OkResponse> {
    state.engine.retry(id).await?;
    Ok(Json(OK))
}

async fn api_remove(State(state): State<AppState>, Path(id): Path<JobId>) -> ApiResult<OkResponse> {
    state.engine.remove(id).await?;
    Ok(Json(OK))
}

async fn api_pause(State(state): State<AppState>) -> ApiResult<OkResponse> {
    state.engine.pause().await?;
    Ok(Json(OK))
}

async fn api_resume(State(state): State<AppState>) -> ApiResult<OkResponse> {
    state.engine.resume().await?;
    Ok(Json(OK))
}

async fn api_reorder(
    State(state): State<AppState>,
    Json(req): Json<ReorderRequest>,
) -> ApiResult<OkResponse> {
    state.engine.reorder(req.from, req.to).await?;
    Ok(Json(OK))
}

async fn api_retry_failed(State(state): State<AppState>) -> ApiResult<CountResponse> {
    let count = state.engine.retry_all_failed().await?;
    Ok(Json(CountResponse { count }))
}

async fn api_clear_completed(State(state): State<AppState>) -> ApiResult<CountResponse> {
    let count = state.engine.clear_completed().await?;
    Ok(Json(CountResponse { count }))
}

async fn api_concurrency(
    State(state): State<AppState>,
    Json(req): Json<ConcurrencyRequest>,
) -> ApiResult<OkResponse> {
    state.engine.set_max_concurrent(req.max_concurrent).await?;
    Ok(Json(OK))
}

async fn api_events(
    State(state): State<AppState>,
) -> std::result::Result<Sse<impl Stream<Item = std::result::Result<Event, Infallible>>>, ApiError> {
    let rx = state.engine.subscribe().await?;
    let stream = ReceiverStream::new(rx).map(|snapshot| {
        Ok(Event::default()
            .event("queue")
            .json_data(&*snapshot)
            .unwrap_or_else(|e| Event::default().event("error").data(e.to_string())))
    });
    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}

/// Builds the API router around an engine handle.
pub fn router(engine: Engine) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/api/health", get(api_health))
        .route("/api/queue", get(api_queue))
        .route("/api/events", get(api_events))
        .route("/api/downloads", post(api_submit))
        .route("/api/downloads/{id}", delete(api_remove))
        .route("/api/downloads/{id}/cancel", post(api_cancel))
        .route("/api/downloads/{id}/retry", post(api_retry))
        .route("/api/queue/pause", post(api_pause))
        .route("/api/queue/resume", post(api_resume))
        .route("/api/queue/reorder", post(api_reorder))
        .route("/api/queue/retry-failed", post(api_retry_failed))
        .route("/api/queue/clear-completed", post(api_clear_completed))
        .route("/api/queue/concurrency", post(api_concurrency))
        .layer(cors)
        .with_state(AppState { engine })
}

/// Binds the API listener.
///
/// # Errors
///
/// Returns an error if the address is invalid or cannot be bound.
pub async fn bind(host: &str, port: u16) -> crate::Result<TcpListener> {
    let addr: SocketAddr = format!("{host}:{port}").parse().map_err(|e| {
        Error::Io(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            format!("Invalid API address {host}:{port}: {e}"),
        ))
    })?;
    Ok(TcpListener::bind(addr).await?)
}

/// Serves the API until `shutdown` resolves.
///
/// # Errors
///
/// Returns an error if the server fails.
pub async fn serve<F>(listener: TcpListener, engine: Engine, shutdown: F) -> crate::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    if let Ok(addr) = listener.local_addr() {
        log::info!("API listening on http://{addr}");
    }
    axum::serve(listener, router(engine))
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}
