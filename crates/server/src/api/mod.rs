//! HTTP surface: enrollment, agent RPCs, the policy stream, and the thin
//! admin wiring that drives the hub.

mod enroll;
mod groups;
mod guard;
mod nodes;
mod policies;
mod stream;

pub use guard::{AdminGuard, ClientCert};

use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{delete, get, post, put};
use axum::Router;

use bor_domain::Error;
use bor_protocol::ErrorResponse;

use crate::state::AppState;

/// Assemble the full router.
pub fn router(state: AppState) -> Router {
    Router::new()
        // Enrollment (the bootstrap route is exempt from client certs).
        .route("/v1/enroll/token", post(enroll::create_token))
        .route("/v1/enroll", post(enroll::enroll))
        // Agent-facing RPCs.
        .route("/v1/policies", get(policies::list))
        .route("/v1/policies/subscribe", get(stream::subscribe))
        .route("/v1/policies/:id", get(policies::get_one))
        .route("/v1/nodes/heartbeat", post(nodes::heartbeat))
        .route("/v1/nodes/compliance", post(nodes::compliance))
        .route("/v1/agent-config", get(nodes::agent_config))
        // Admin wiring.
        .route("/v1/admin/policies", post(policies::admin_create))
        .route(
            "/v1/admin/policies/:id",
            put(policies::admin_update).delete(policies::admin_delete),
        )
        .route("/v1/admin/policies/:id/state", put(policies::admin_set_state))
        .route(
            "/v1/admin/policies/:id/deprecation",
            put(policies::admin_deprecate),
        )
        .route("/v1/admin/bindings", post(policies::admin_create_binding))
        .route(
            "/v1/admin/bindings/:id",
            put(policies::admin_update_binding).delete(policies::admin_delete_binding),
        )
        .route(
            "/v1/admin/groups",
            post(groups::admin_create).get(groups::admin_list),
        )
        .route("/v1/admin/groups/:id", delete(groups::admin_delete))
        .route(
            "/v1/admin/groups/:id/nodes/:node_id",
            put(groups::admin_add_member).delete(groups::admin_remove_member),
        )
        .route("/v1/admin/nodes", get(nodes::admin_list))
        .route("/v1/admin/nodes/:client_id/refresh", post(nodes::admin_refresh))
        .with_state(state)
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Error mapping
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Wraps [`bor_domain::Error`] for translation into a wire response.
pub struct ApiError(pub Error);

impl<E: Into<Error>> From<E> for ApiError {
    fn from(e: E) -> Self {
        ApiError(e.into())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            Error::InvalidInput(_)
            | Error::Json(_)
            | Error::TokenInvalid
            | Error::TokenUsed
            | Error::TokenExpired => StatusCode::BAD_REQUEST,
            Error::StateViolation(_) => StatusCode::CONFLICT,
            Error::NotFound { .. } => StatusCode::NOT_FOUND,
            Error::Unauthenticated(_) => StatusCode::UNAUTHORIZED,
            Error::Forbidden(_) => StatusCode::FORBIDDEN,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status == StatusCode::INTERNAL_SERVER_ERROR {
            tracing::error!(error = %self.0, "internal error at RPC boundary");
        }
        (
            status,
            Json(ErrorResponse {
                error: self.0.to_string(),
            }),
        )
            .into_response()
    }
}

pub type ApiResult<T> = std::result::Result<Json<T>, ApiError>;
