//! HTTP API for the album catalog
//!
//! Plain-text pages:
//! - `GET /album?id=N`: one album
//! - `POST /like` (form `id=N`): add a like, then redirect to the album
//! - `GET /popular`: the most liked albums, numbered
//!
//! JSON:
//! - `GET /api/albums/:id`
//! - `POST /api/albums/:id/like`
//! - `GET /api/popular?limit=K`
//!
//! Health:
//! - `GET /health/live`, `GET /health/ready`

use crate::common::tracing_middleware::request_tracing_middleware;
use crate::common::Error;
use crate::coordinator::album::{Album, AlbumId};
use crate::coordinator::catalog::Coordinator;
use crate::store::Store;
use axum::{
    extract::{rejection::FormRejection, rejection::QueryRejection, Path, Query, State},
    http::StatusCode,
    middleware,
    response::{IntoResponse, Redirect, Response},
    routing::{get, post},
    Form, Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tower_http::trace::TraceLayer;

/// Shared handler state
pub struct AppState<S: Store> {
    pub coordinator: Coordinator<S>,
    /// Albums listed by `GET /popular`
    pub popular_limit: usize,
}

impl<S: Store> Clone for AppState<S> {
    fn clone(&self) -> Self {
        Self {
            coordinator: self.coordinator.clone(),
            popular_limit: self.popular_limit,
        }
    }
}

pub fn create_router<S: Store>(state: AppState<S>) -> Router {
    Router::new()
        // Plain-text pages
        .route("/album", get(show_album::<S>))
        .route("/like", post(add_like::<S>))
        .route("/popular", get(list_popular::<S>))
        // JSON API
        .route("/api/albums/:id", get(api_get_album::<S>))
        .route("/api/albums/:id/like", post(api_like_album::<S>))
        .route("/api/popular", get(api_popular::<S>))
        // Health check endpoints
        .route("/health/live", get(health_live))
        .route("/health/ready", get(health_ready::<S>))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(middleware::from_fn(request_tracing_middleware))
}

#[derive(Debug, Deserialize)]
struct IdParams {
    id: Option<String>,
}

impl IdParams {
    fn album_id(&self) -> Result<AlbumId, Error> {
        match self.id.as_deref() {
            Some(raw) => raw.parse(),
            None => Err(Error::InvalidId(String::new())),
        }
    }
}

/// Plain-text error page: the status line's reason phrase
impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = self.to_http_status();
        if status.is_server_error() {
            tracing::error!(status = status.as_u16(), "{}", self);
        }
        let reason = status.canonical_reason().unwrap_or("Error");
        (status, format!("{reason}\n")).into_response()
    }
}

/// JSON error body for the `/api` routes
pub struct ApiError(pub Error);

impl From<Error> for ApiError {
    fn from(e: Error) -> Self {
        ApiError(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.0.to_http_status();
        if status.is_server_error() {
            tracing::error!(status = status.as_u16(), "{}", self.0);
        }
        (status, Json(json!({ "error": self.0.to_string() }))).into_response()
    }
}

async fn show_album<S: Store>(
    State(state): State<AppState<S>>,
    params: Result<Query<IdParams>, QueryRejection>,
) -> Result<String, Error> {
    let Query(params) = params.map_err(|e| Error::InvalidId(e.body_text()))?;
    let album = state.coordinator.get(params.album_id()?).await?;
    Ok(format!("{album}\n"))
}

async fn add_like<S: Store>(
    State(state): State<AppState<S>>,
    form: Result<Form<IdParams>, FormRejection>,
) -> Result<Redirect, Error> {
    let Form(params) = form.map_err(|e| Error::InvalidId(e.body_text()))?;
    let id = params.album_id()?;
    state.coordinator.like(id).await?;
    Ok(Redirect::to(&format!("/album?id={id}")))
}

async fn list_popular<S: Store>(State(state): State<AppState<S>>) -> Result<String, Error> {
    let albums = state.coordinator.top(state.popular_limit).await?;
    Ok(albums
        .iter()
        .enumerate()
        .map(|(rank, album)| format!("{}) {}\n", rank + 1, album))
        .collect())
}

async fn api_get_album<S: Store>(
    State(state): State<AppState<S>>,
    Path(id): Path<String>,
) -> Result<Json<Album>, ApiError> {
    let album = state.coordinator.get(id.parse()?).await?;
    Ok(Json(album))
}

#[derive(Debug, Serialize, Deserialize)]
pub struct LikeResponse {
    pub id: AlbumId,
    pub likes: u64,
}

async fn api_like_album<S: Store>(
    State(state): State<AppState<S>>,
    Path(id): Path<String>,
) -> Result<Json<LikeResponse>, ApiError> {
    let id: AlbumId = id.parse()?;
    let likes = state.coordinator.like(id).await?;
    Ok(Json(LikeResponse { id, likes }))
}

#[derive(Debug, Deserialize)]
struct PopularQuery {
    limit: Option<usize>,
}

async fn api_popular<S: Store>(
    State(state): State<AppState<S>>,
    query: Result<Query<PopularQuery>, QueryRejection>,
) -> Response {
    let limit = match query {
        Ok(Query(q)) => q.limit.unwrap_or(state.popular_limit),
        Err(e) => {
            return (
                StatusCode::BAD_REQUEST,
                Json(json!({ "error": e.body_text() })),
            )
                .into_response()
        }
    };
    match state.coordinator.top(limit).await {
        Ok(albums) => Json(albums).into_response(),
        Err(e) => ApiError(e).into_response(),
    }
}

/// Liveness probe
async fn health_live() -> impl IntoResponse {
    (StatusCode::OK, Json(json!({ "alive": true })))
}

/// Readiness probe: the store can be reached through the pool
async fn health_ready<S: Store>(State(state): State<AppState<S>>) -> impl IntoResponse {
    match state.coordinator.ping().await {
        Ok(()) => (StatusCode::OK, Json(json!({ "ready": true }))),
        Err(e) => {
            tracing::warn!("Readiness check failed: {}", e);
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({ "ready": false, "reason": e.to_string() })),
            )
        }
    }
}
