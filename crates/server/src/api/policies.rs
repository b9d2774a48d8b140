//! Policy routes: the agent-facing reads plus the admin lifecycle and
//! binding wiring.

use axum::extract::{Path, Query, State};
use axum::Json;
use serde::Deserialize;

use bor_domain::model::{Policy, PolicyBinding, PolicyKind};
use bor_domain::{Error, Result};
use bor_protocol::{
    CreateBindingRequest, CreatePolicyRequest, DeprecatePolicyRequest, SetPolicyStateRequest,
    UpdateBindingRequest, UpdatePolicyRequest, WirePolicy,
};

use crate::query::ApplicablePolicy;
use crate::state::AppState;

use super::{AdminGuard, ApiError, ApiResult, ClientCert};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Agent-facing reads
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    #[serde(default)]
    pub client_id: String,
    #[serde(default)]
    pub kind: Option<PolicyKind>,
}

/// GET /v1/policies?client_id=&kind= — the policies applicable to the
/// calling node, optionally filtered by target kind.
pub async fn list(
    _cert: ClientCert,
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> ApiResult<Vec<WirePolicy>> {
    if query.client_id.is_empty() {
        return Err(ApiError(Error::InvalidInput(
            "client_id must not be empty".into(),
        )));
    }
    let node = state
        .nodes
        .get_by_name(&query.client_id)?
        .ok_or_else(|| Error::not_found("node", &query.client_id))?;
    let groups = state.groups.groups_for_node(&node.id)?;
    let group_ids: Vec<String> = groups.into_iter().map(|g| g.id).collect();

    let mut applicable = state.query.applicable_for_groups(&group_ids)?;
    if let Some(kind) = query.kind {
        applicable.retain(|a| a.policy.kind == kind);
    }
    let wire = applicable
        .iter()
        .map(applicable_to_wire)
        .collect::<Result<Vec<_>>>()?;
    Ok(Json(wire))
}

/// GET /v1/policies/:id
pub async fn get_one(
    _cert: ClientCert,
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<WirePolicy> {
    let policy = state.query.get(&id)?;
    Ok(Json(policy_to_wire(&policy, 0)?))
}

pub(crate) fn applicable_to_wire(applicable: &ApplicablePolicy) -> Result<WirePolicy> {
    policy_to_wire(&applicable.policy, applicable.priority)
}

pub(crate) fn policy_to_wire(policy: &Policy, priority: i64) -> Result<WirePolicy> {
    Ok(WirePolicy {
        id: policy.id.clone(),
        name: policy.name.clone(),
        kind: policy.kind,
        version: policy.version,
        priority,
        content: policy.content_json()?,
    })
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Admin: lifecycle
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub async fn admin_create(
    _guard: AdminGuard,
    State(state): State<AppState>,
    Json(request): Json<CreatePolicyRequest>,
) -> ApiResult<Policy> {
    let policy = state.service.create_policy(
        &request.name,
        request.kind,
        &request.content,
        &request.created_by,
    )?;
    Ok(Json(policy))
}

pub async fn admin_update(
    _guard: AdminGuard,
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(request): Json<UpdatePolicyRequest>,
) -> ApiResult<Policy> {
    let policy = state.service.update_policy(
        &id,
        request.name.as_deref(),
        request.content.as_ref(),
    )?;
    Ok(Json(policy))
}

pub async fn admin_set_state(
    _guard: AdminGuard,
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(request): Json<SetPolicyStateRequest>,
) -> ApiResult<Policy> {
    let new_state = request.state.parse()?;
    let policy = state.service.set_state(&id, new_state)?;
    Ok(Json(policy))
}

pub async fn admin_deprecate(
    _guard: AdminGuard,
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(request): Json<DeprecatePolicyRequest>,
) -> ApiResult<Policy> {
    let policy = state.service.deprecate_policy(
        &id,
        &request.message,
        request.superseded_by.as_deref(),
    )?;
    Ok(Json(policy))
}

pub async fn admin_delete(
    _guard: AdminGuard,
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<serde_json::Value> {
    state.service.delete_policy(&id)?;
    Ok(Json(serde_json::json!({ "deleted": true })))
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Admin: bindings
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub async fn admin_create_binding(
    _guard: AdminGuard,
    State(state): State<AppState>,
    Json(request): Json<CreateBindingRequest>,
) -> ApiResult<PolicyBinding> {
    let binding_state = request.state.parse()?;
    let binding = state.service.create_binding(
        &request.policy_id,
        &request.group_id,
        binding_state,
        request.priority,
    )?;
    Ok(Json(binding))
}

pub async fn admin_update_binding(
    _guard: AdminGuard,
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(request): Json<UpdateBindingRequest>,
) -> ApiResult<PolicyBinding> {
    let binding_state = request.state.as_deref().map(str::parse).transpose()?;
    let binding = state
        .service
        .update_binding(&id, binding_state, request.priority)?;
    Ok(Json(binding))
}

pub async fn admin_delete_binding(
    _guard: AdminGuard,
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<serde_json::Value> {
    state.service.delete_binding(&id)?;
    Ok(Json(serde_json::json!({ "deleted": true })))
}
