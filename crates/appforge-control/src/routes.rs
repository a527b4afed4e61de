use appforge_agent::CreateProject;
use appforge_process::{ProjectId, ProjectView};
use axum::{
    Json, Router,
    extract::{
        Path, Query, State,
        rejection::{JsonRejection, QueryRejection},
    },
    http::{StatusCode, header},
    middleware,
    response::IntoResponse,
    routing::{any, get, post},
};
use serde::{Deserialize, Serialize};

use crate::api_error::ApiError;
use crate::state::AppState;
use crate::{logs_ws, preview, request_meta};

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/templates", get(list_templates))
        .route("/projects", get(list_projects).post(create_project))
        .route("/projects/:id/start", post(start_project))
        .route("/projects/:id/stop", post(stop_project))
        .route("/projects/:id/status", get(project_status))
        .route("/projects/:id/logs", get(project_logs))
        .route("/preview/:id", any(preview::forward))
        .route("/preview/:id/", any(preview::forward))
        .route("/preview/:id/*path", any(preview::forward))
        .route("/ws/projects/:id/logs", get(logs_ws::stream_logs))
        .fallback(not_found)
        .layer(middleware::from_fn(request_meta::request_id))
        .with_state(state)
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    ok: bool,
    service: &'static str,
    version: &'static str,
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        ok: true,
        service: env!("CARGO_PKG_NAME"),
        version: env!("CARGO_PKG_VERSION"),
    })
}

async fn not_found() -> ApiError {
    ApiError::new(StatusCode::NOT_FOUND, "not_found", "no such route")
}

async fn list_templates(State(state): State<AppState>) -> Json<Vec<String>> {
    Json(state.manager.list_templates().await)
}

async fn list_projects(State(state): State<AppState>) -> Result<Json<Vec<ProjectView>>, ApiError> {
    Ok(Json(state.manager.list().await?))
}

async fn create_project(
    State(state): State<AppState>,
    payload: Result<Json<CreateProject>, JsonRejection>,
) -> Result<(StatusCode, Json<ProjectView>), ApiError> {
    let Json(req) = payload.map_err(|e| ApiError::invalid_param(e.body_text()))?;
    let view = state.manager.create(req).await?;
    Ok((StatusCode::CREATED, Json(view)))
}

async fn start_project(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<ProjectView>, ApiError> {
    let view = state.manager.start(&ProjectId::from(id.as_str())).await?;
    Ok(Json(view))
}

async fn stop_project(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<ProjectView>, ApiError> {
    let view = state.manager.stop(&ProjectId::from(id.as_str())).await?;
    Ok(Json(view))
}

async fn project_status(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<ProjectView>, ApiError> {
    let view = state.manager.status(&ProjectId::from(id.as_str())).await?;
    Ok(Json(view))
}

#[derive(Debug, Deserialize)]
struct LogsQuery {
    tail: Option<usize>,
}

async fn project_logs(
    State(state): State<AppState>,
    Path(id): Path<String>,
    query: Result<Query<LogsQuery>, QueryRejection>,
) -> Result<impl IntoResponse, ApiError> {
    let Query(q) = query.map_err(|e| ApiError::invalid_param(e.body_text()))?;
    let text = state
        .manager
        .tail_logs(&ProjectId::from(id.as_str()), q.tail)
        .await?;
    Ok(([(header::CONTENT_TYPE, "text/plain; charset=utf-8")], text))
}
