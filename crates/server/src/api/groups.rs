//! Admin routes for node groups and their membership.

use axum::extract::{Path, State};
use axum::Json;

use bor_domain::model::NodeGroup;
use bor_protocol::CreateGroupRequest;

use crate::state::AppState;

use super::{AdminGuard, ApiResult};

pub async fn admin_create(
    _guard: AdminGuard,
    State(state): State<AppState>,
    Json(request): Json<CreateGroupRequest>,
) -> ApiResult<NodeGroup> {
    let group = state
        .service
        .create_group(&request.name, &request.description)?;
    Ok(Json(group))
}

pub async fn admin_list(
    _guard: AdminGuard,
    State(state): State<AppState>,
) -> ApiResult<Vec<NodeGroup>> {
    Ok(Json(state.groups.list()?))
}

pub async fn admin_delete(
    _guard: AdminGuard,
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<serde_json::Value> {
    state.service.delete_group(&id)?;
    Ok(Json(serde_json::json!({ "deleted": true })))
}

pub async fn admin_add_member(
    _guard: AdminGuard,
    State(state): State<AppState>,
    Path((group_id, node_id)): Path<(String, String)>,
) -> ApiResult<serde_json::Value> {
    state.service.add_node_to_group(&group_id, &node_id)?;
    Ok(Json(serde_json::json!({ "added": true })))
}

pub async fn admin_remove_member(
    _guard: AdminGuard,
    State(state): State<AppState>,
    Path((group_id, node_id)): Path<(String, String)>,
) -> ApiResult<serde_json::Value> {
    state.service.remove_node_from_group(&group_id, &node_id)?;
    Ok(Json(serde_json::json!({ "removed": true })))
}
