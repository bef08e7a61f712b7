use super::state::ApiState;
use crate::model::{FleetSlot, IndexClass};
use crate::{SlotId, Version};

use axum::Json;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

#[derive(Deserialize)]
pub(super) struct RouteQuery {
    #[serde(default)]
    project_id: Option<String>,
}

#[derive(Serialize)]
pub(super) struct RouteResponse {
    index_class: IndexClass,
    slot_id: SlotId,
    /// Version of `project_id` loaded on the slot, when one was asked for.
    #[serde(skip_serializing_if = "Option::is_none")]
    version: Option<Version>,
}

#[derive(Serialize)]
pub(super) struct SlotsResponse {
    slots: Vec<FleetSlot>,
}

fn parse_class(raw: &str) -> Result<IndexClass, StatusCode> {
    raw.parse().map_err(|_| StatusCode::BAD_REQUEST)
}

pub(super) async fn list_slots(
    State(state): State<Arc<ApiState>>,
    Path(index_class): Path<String>,
) -> Result<Json<SlotsResponse>, StatusCode> {
    let index_class = parse_class(&index_class)?;
    Ok(Json(SlotsResponse {
        slots: state.fleet.slots(index_class),
    }))
}

pub(super) async fn route(
    State(state): State<Arc<ApiState>>,
    Path((index_class, routing_key)): Path<(String, String)>,
    Query(query): Query<RouteQuery>,
) -> Result<Json<RouteResponse>, StatusCode> {
    let index_class = parse_class(&index_class)?;
    let slot_id = state.fleet.route(index_class, &routing_key);
    let version = query
        .project_id
        .as_deref()
        .and_then(|project_id| state.fleet.current_version(index_class, slot_id, project_id));

    Ok(Json(RouteResponse {
        index_class,
        slot_id,
        version,
    }))
}
