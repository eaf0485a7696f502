//! HTTP API.
//!
//! A thin JSON surface over the engine. Error kinds map onto status codes;
//! messages carry the short human reason and the kind tag, never
//! backing-store specifics.

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use tower_http::cors::CorsLayer;

use exocortex_core::regression::{run_regression, RegressionOptions};
use exocortex_core::{
    ContentType, CreateGoalInput, CreateMemoryInput, Error, MemorySource, SearchQuery, Store,
};

type AppState = Arc<Store>;

struct ApiError(Error);

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            Error::InvalidInput(_) => StatusCode::BAD_REQUEST,
            Error::NotFound(_) => StatusCode::NOT_FOUND,
            Error::Conflict(_) => StatusCode::CONFLICT,
            Error::DecryptionFailed => StatusCode::UNPROCESSABLE_ENTITY,
            Error::Transient(_) => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let message = match status {
            StatusCode::INTERNAL_SERVER_ERROR => "internal error".to_string(),
            _ => self.0.to_string(),
        };
        let body = Json(serde_json::json!({
            "error": { "kind": self.0.kind(), "message": message }
        }));
        (status, body).into_response()
    }
}

pub fn router(store: AppState) -> Router {
    Router::new()
        .route("/api/memories", post(create_memory))
        .route("/api/memories/{id}", get(get_memory).delete(delete_memory))
        .route("/api/memories/{id}/useful", post(mark_useful))
        .route("/api/search", get(search))
        .route("/api/stats", get(stats))
        .route("/api/goals", get(list_goals).post(create_goal))
        .route("/api/contradictions", get(list_contradictions))
        .route("/api/regression/run", post(regression_run))
        .layer(CorsLayer::permissive())
        .with_state(store)
}

pub async fn serve(store: AppState, addr: &str) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router(store)).await?;
    Ok(())
}

async fn create_memory(
    State(store): State<AppState>,
    Json(mut input): Json<CreateMemoryInput>,
) -> Result<Json<serde_json::Value>, ApiError> {
    input.source = MemorySource::Api;
    let store = Arc::clone(&store);
    let result = tokio::task::spawn_blocking(move || store.create_memory(input))
        .await
        .map_err(|e| Error::Transient(e.to_string()))??;
    Ok(Json(serde_json::to_value(result).map_err(Error::from)?))
}

async fn get_memory(
    State(store): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let memory = store
        .get_by_id(&id)?
        .ok_or_else(|| Error::NotFound(id.clone()))?;
    Ok(Json(serde_json::to_value(memory).map_err(Error::from)?))
}

async fn delete_memory(
    State(store): State<AppState>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    store.delete_memory(&id)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn mark_useful(
    State(store): State<AppState>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    store.mark_useful(&id)?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SearchParams {
    q: String,
    limit: Option<usize>,
    offset: Option<usize>,
    tags: Option<String>,
    content_type: Option<String>,
    min_score: Option<f64>,
    include_metadata: Option<bool>,
    compact: Option<bool>,
}

async fn search(
    State(store): State<AppState>,
    Query(params): Query<SearchParams>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let query = SearchQuery {
        query: params.q,
        limit: params.limit.unwrap_or(20).min(200),
        offset: params.offset.unwrap_or(0),
        tags: params
            .tags
            .map(|t| t.split(',').map(|s| s.trim().to_string()).collect())
            .unwrap_or_default(),
        content_type: params.content_type.as_deref().map(ContentType::parse_name),
        min_score: params.min_score,
        include_metadata: params.include_metadata.unwrap_or(false),
        compact: params.compact.unwrap_or(false),
        ..Default::default()
    };

    let store = Arc::clone(&store);
    let results = tokio::task::spawn_blocking(move || store.search(&query))
        .await
        .map_err(|e| Error::Transient(e.to_string()))??;
    Ok(Json(serde_json::to_value(results).map_err(Error::from)?))
}

async fn stats(State(store): State<AppState>) -> Result<Json<serde_json::Value>, ApiError> {
    let stats = store.stats()?;
    Ok(Json(serde_json::to_value(stats).map_err(Error::from)?))
}

async fn list_goals(State(store): State<AppState>) -> Result<Json<serde_json::Value>, ApiError> {
    let goals = store.list_goals(None)?;
    Ok(Json(serde_json::to_value(goals).map_err(Error::from)?))
}

async fn create_goal(
    State(store): State<AppState>,
    Json(input): Json<CreateGoalInput>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let goal = store.create_goal(input)?;
    Ok(Json(serde_json::to_value(goal).map_err(Error::from)?))
}

async fn list_contradictions(
    State(store): State<AppState>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let contradictions = store.list_contradictions(None)?;
    Ok(Json(
        serde_json::to_value(contradictions).map_err(Error::from)?,
    ))
}

async fn regression_run(
    State(store): State<AppState>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let store = Arc::clone(&store);
    let report =
        tokio::task::spawn_blocking(move || run_regression(&store, &RegressionOptions::default()))
            .await
            .map_err(|e| Error::Transient(e.to_string()))??;
    Ok(Json(serde_json::to_value(report).map_err(Error::from)?))
}

// ============================================================================
// TESTS
// ============================================================================
