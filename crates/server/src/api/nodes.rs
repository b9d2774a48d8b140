//! Node-facing RPCs (heartbeat, compliance, agent config) and the admin
//! inventory/refresh routes.

use axum::extract::{Path, State};
use axum::Json;

use bor_domain::model::ComplianceReport;
use bor_domain::Error;
use bor_protocol::{
    AgentConfigResponse, ComplianceRequest, ComplianceResponse, HeartbeatRequest,
    HeartbeatResponse, NodeSummary, RefreshResponse,
};

use crate::state::AppState;

use super::{AdminGuard, ApiError, ApiResult, ClientCert};

/// POST /v1/nodes/heartbeat — merge reported facts into the node record.
pub async fn heartbeat(
    _cert: ClientCert,
    State(state): State<AppState>,
    Json(request): Json<HeartbeatRequest>,
) -> ApiResult<HeartbeatResponse> {
    let node = state
        .nodes
        .get_by_name(&request.client_id)?
        .ok_or_else(|| Error::not_found("node", &request.client_id))?;
    state.nodes.apply_facts(&node.id, &request.node_info)?;
    Ok(Json(HeartbeatResponse { accepted: true }))
}

/// POST /v1/nodes/compliance — record the enforcement outcome for one
/// policy on the calling node.
pub async fn compliance(
    _cert: ClientCert,
    State(state): State<AppState>,
    Json(request): Json<ComplianceRequest>,
) -> ApiResult<ComplianceResponse> {
    let node = state
        .nodes
        .get_by_name(&request.client_id)?
        .ok_or_else(|| Error::not_found("node", &request.client_id))?;
    state.nodes.record_compliance(&ComplianceReport {
        node_id: node.id,
        policy_id: request.policy_id,
        compliant: request.compliant,
        message: request.message,
        reported_at: request.reported_at,
    })?;
    Ok(Json(ComplianceResponse { ok: true }))
}

/// GET /v1/agent-config — notification settings for the agent.
pub async fn agent_config(
    _cert: ClientCert,
    State(state): State<AppState>,
) -> ApiResult<AgentConfigResponse> {
    let n = &state.config.notifications;
    Ok(Json(AgentConfigResponse {
        notify_users: n.notify_users,
        notify_cooldown_seconds: n.notify_cooldown_seconds,
        apply_message: n.apply_message.clone(),
        restore_message: n.restore_message.clone(),
        error_message: n.error_message.clone(),
    }))
}

/// GET /v1/admin/nodes — inventory with cached liveness.
pub async fn admin_list(
    _guard: AdminGuard,
    State(state): State<AppState>,
) -> ApiResult<Vec<NodeSummary>> {
    let nodes = state.nodes.list()?;
    Ok(Json(
        nodes
            .into_iter()
            .map(|n| NodeSummary {
                id: n.id,
                name: n.name,
                status: n.status,
                address: n.address,
                os_name: n.os_name,
                agent_version: n.agent_version,
                last_seen: n.last_seen,
            })
            .collect(),
    ))
}

/// POST /v1/admin/nodes/:client_id/refresh — targeted metadata request.
pub async fn admin_refresh(
    _guard: AdminGuard,
    State(state): State<AppState>,
    Path(client_id): Path<String>,
) -> ApiResult<RefreshResponse> {
    if client_id.is_empty() {
        return Err(ApiError(Error::InvalidInput(
            "client_id must not be empty".into(),
        )));
    }
    let delivered = state.hub.send_metadata_refresh(&client_id);
    Ok(Json(RefreshResponse { delivered }))
}
