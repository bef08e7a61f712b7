use super::state::ApiState;
use crate::error::QueueError;
use crate::model::{CommandType, ControlCommand};
use crate::queue::DeadLetter;

use axum::Json;
use axum::extract::State;
use axum::http::StatusCode;
use serde::Serialize;
use std::sync::Arc;

#[derive(Serialize)]
pub(super) struct SendCommandResponse {
    message_id: String,
}

#[derive(Serialize)]
pub(super) struct DeadLettersResponse {
    dead_letters: Vec<DeadLetter>,
}

/// Enqueue a client-triggered control command.
pub(super) async fn send_command(
    State(state): State<Arc<ApiState>>,
    Json(command): Json<ControlCommand>,
) -> Result<(StatusCode, Json<SendCommandResponse>), StatusCode> {
    let needs_project = command.kind != CommandType::IndexResched;
    if needs_project && command.project_id.as_deref().is_none_or(str::is_empty) {
        return Err(StatusCode::BAD_REQUEST);
    }
    if command.kind == CommandType::IndexRefresh && command.version.is_none() {
        return Err(StatusCode::BAD_REQUEST);
    }

    let message_id = state.queue.send(&command).map_err(|error| {
        tracing::error!(%error, kind = %command.kind, "failed to enqueue command");
        match error {
            QueueError::Closed => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    })?;
    tracing::info!(%message_id, kind = %command.kind, project_id = ?command.project_id, "command accepted");

    Ok((StatusCode::ACCEPTED, Json(SendCommandResponse { message_id })))
}

pub(super) async fn list_dead_letters(State(state): State<Arc<ApiState>>) -> Json<DeadLettersResponse> {
    Json(DeadLettersResponse {
        dead_letters: state.queue.dead_letters(),
    })
}
