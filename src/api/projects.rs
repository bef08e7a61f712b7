use super::state::ApiState;
use crate::error::StoreError;
use crate::model::{DeletedIndex, Index, IndexClass, Project};

use axum::Json;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

#[derive(Deserialize)]
pub(super) struct RegisterProjectRequest {
    project_id: String,
    index_class: IndexClass,
    build_interval_secs: u64,
}

#[derive(Serialize)]
pub(super) struct ProjectResponse {
    project: Project,
    #[serde(skip_serializing_if = "Option::is_none")]
    deleted: Option<DeletedIndex>,
}

#[derive(Serialize)]
pub(super) struct IndexesResponse {
    project_id: String,
    indexes: Vec<Index>,
}

/// Project ids double as blob key prefixes, so they must be a single segment.
fn valid_project_id(project_id: &str) -> bool {
    !project_id.is_empty()
        && project_id != "."
        && project_id != ".."
        && !project_id.contains(['/', '\\'])
}

fn internal(error: StoreError) -> StatusCode {
    tracing::error!(%error, "metadata store request failed");
    StatusCode::INTERNAL_SERVER_ERROR
}

pub(super) async fn register_project(
    State(state): State<Arc<ApiState>>,
    Json(request): Json<RegisterProjectRequest>,
) -> Result<(StatusCode, Json<ProjectResponse>), StatusCode> {
    if !valid_project_id(&request.project_id) || request.build_interval_secs == 0 {
        return Err(StatusCode::BAD_REQUEST);
    }

    let project = Project::new(
        request.project_id,
        request.index_class,
        request.build_interval_secs,
    );
    let created = state.store.create_project(&project).await.map_err(internal)?;
    if !created {
        return Err(StatusCode::CONFLICT);
    }
    tracing::info!(
        project_id = %project.project_id,
        index_class = %project.index_class,
        "project registered"
    );

    Ok((
        StatusCode::CREATED,
        Json(ProjectResponse {
            project,
            deleted: None,
        }),
    ))
}

pub(super) async fn get_project(
    State(state): State<Arc<ApiState>>,
    Path(project_id): Path<String>,
) -> Result<Json<ProjectResponse>, StatusCode> {
    let project = state
        .store
        .get_project(&project_id)
        .await
        .map_err(internal)?
        .ok_or(StatusCode::NOT_FOUND)?;
    let deleted = state.store.get_tombstone(&project_id).await.map_err(internal)?;

    Ok(Json(ProjectResponse { project, deleted }))
}

pub(super) async fn list_indexes(
    State(state): State<Arc<ApiState>>,
    Path(project_id): Path<String>,
) -> Result<Json<IndexesResponse>, StatusCode> {
    if state
        .store
        .get_project(&project_id)
        .await
        .map_err(internal)?
        .is_none()
    {
        return Err(StatusCode::NOT_FOUND);
    }
    let indexes = state.store.list_indexes(&project_id).await.map_err(internal)?;

    Ok(Json(IndexesResponse {
        project_id,
        indexes,
    }))
}
