//! Request guards: admin-token auth and client-certificate presence.
//!
//! Handlers opt in by adding `_guard: AdminGuard` or `cert: ClientCert`
//! to their parameter list.

use async_trait::async_trait;
use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

use bor_domain::Error;

use crate::state::AppState;
use crate::tls::TlsPeer;

use super::ApiError;

/// Enforces the static admin credential in the `x-admin-token` header.
///
/// SHA-256 + constant-time comparison so neither token length nor prefix
/// leaks through timing. With no token configured every admin call is
/// refused.
pub struct AdminGuard;

#[async_trait]
impl FromRequestParts<AppState> for AdminGuard {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let Some(expected_hash) = &state.admin_token_hash else {
            return Err(ApiError(Error::Forbidden(
                "admin interface is disabled (no admin token configured)".into(),
            )));
        };

        let provided = parts
            .headers
            .get("x-admin-token")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");
        if provided.is_empty() {
            return Err(ApiError(Error::Unauthenticated(
                "missing x-admin-token header".into(),
            )));
        }

        let provided_hash = Sha256::digest(provided.as_bytes());
        if !bool::from(provided_hash.ct_eq(expected_hash.as_slice())) {
            return Err(ApiError(Error::Forbidden("invalid admin token".into())));
        }
        Ok(AdminGuard)
    }
}

/// Requires a client certificate verified by the TLS layer; yields the
/// certificate's common name.
pub struct ClientCert {
    pub common_name: String,
}

#[async_trait]
impl FromRequestParts<AppState> for ClientCert {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        _state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let peer = parts
            .extensions
            .get::<TlsPeer>()
            .cloned()
            .unwrap_or_default();
        match peer.client_cert {
            Some(cert) => Ok(ClientCert {
                common_name: cert.common_name,
            }),
            None => Err(ApiError(Error::Unauthenticated(
                "client certificate required".into(),
            ))),
        }
    }
}
