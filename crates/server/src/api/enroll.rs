//! Enrollment routes: token issuance (admin) and the bootstrap RPC.

use axum::extract::State;
use axum::Json;

use bor_protocol::{CreateTokenRequest, CreateTokenResponse, EnrollRequest, EnrollResponse};

use crate::state::AppState;

use super::{AdminGuard, ApiResult};

/// POST /v1/enroll/token — issue a short-lived one-shot token.
pub async fn create_token(
    _guard: AdminGuard,
    State(state): State<AppState>,
    Json(request): Json<CreateTokenRequest>,
) -> ApiResult<CreateTokenResponse> {
    let (token, expires_at) = state.enrollment.create_token(&request.group_id)?;
    tracing::info!(group = %request.group_id, "enrollment token issued");
    Ok(Json(CreateTokenResponse { token, expires_at }))
}

/// POST /v1/enroll — bootstrap an agent.
///
/// The only mutually-authenticated-transport route that accepts
/// connections without a client certificate: the caller is here to get
/// one.
pub async fn enroll(
    State(state): State<AppState>,
    Json(request): Json<EnrollRequest>,
) -> ApiResult<EnrollResponse> {
    let enrolled =
        state
            .enrollment
            .enroll(&request.token, &request.csr_pem, &request.node_name)?;
    Ok(Json(EnrollResponse {
        node_id: enrolled.node_id,
        cert_pem: enrolled.cert_pem,
        ca_cert_pem: enrolled.ca_cert_pem,
        group_id: enrolled.group_id,
    }))
}
