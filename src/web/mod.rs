//! Read-only HTTP query surface
//!
//! Every response is served from the last published snapshot; nothing here
//! touches the store or the source.

use crate::core::{Clock, LiveEntity};
use crate::leader::{Role, RoleState};
use crate::poller::{QueryError, SnapshotReader, SnapshotView};
use crate::pool::PoolStats;
use crate::service::FeedService;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;
use std::sync::Arc;
use tower_http::trace::TraceLayer;

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
}

#[derive(Debug)]
pub enum WebError {
    Query(QueryError),
}

impl From<QueryError> for WebError {
    fn from(err: QueryError) -> Self {
        WebError::Query(err)
    }
}

impl IntoResponse for WebError {
    fn into_response(self) -> Response {
        let (status, message, code) = match self {
            WebError::Query(err @ QueryError::Unavailable) => (
                StatusCode::SERVICE_UNAVAILABLE,
                err.to_string(),
                err.code().to_string(),
            ),
            WebError::Query(err @ QueryError::NotFound(_)) => {
                (StatusCode::NOT_FOUND, err.to_string(), err.code().to_string())
            }
        };

        let body = Json(ErrorResponse {
            error: message,
            code,
        });

        (status, body).into_response()
    }
}

pub type Result<T> = std::result::Result<T, WebError>;

#[derive(Clone)]
pub struct AppState {
    reader: SnapshotReader,
    clock: Arc<dyn Clock>,
    role: RoleState,
    service: Arc<FeedService>,
}

impl AppState {
    pub fn new(service: Arc<FeedService>, role: RoleState, clock: Arc<dyn Clock>) -> Self {
        Self {
            reader: service.reader(),
            clock,
            role,
            service,
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    pub role: Role,
    pub poller_running: bool,
    pub snapshot_available: bool,
    pub pool: Option<PoolStats>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/live", get(live))
        .route("/entities/:id", get(entity))
        .route("/health", get(health))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn live(State(state): State<AppState>) -> Result<Json<SnapshotView>> {
    let view = state.reader.read_all(state.clock.now())?;
    Ok(Json(view))
}

async fn entity(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<LiveEntity>> {
    Ok(Json(state.reader.read_one(&id)?))
}

async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        role: state.role.role(),
        poller_running: state.service.is_running().await,
        snapshot_available: state.reader.is_available(),
        pool: state.service.pool_stats().await,
    })
}
