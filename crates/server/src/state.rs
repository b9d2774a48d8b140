//! Shared application state passed to all API handlers.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use bor_domain::config::ServerConfig;

use crate::enrollment::EnrollmentService;
use crate::hub::PolicyHub;
use crate::query::PolicyQueryService;
use crate::service::PolicyService;
use crate::store::{BindingRepo, GroupRepo, NodeRepo, PolicyRepo};

/// Everything a handler needs, grouped by concern:
/// - **Config** — the loaded server configuration
/// - **Distribution** — the policy hub and query service
/// - **Administration** — lifecycle service and enrollment
/// - **Repositories** — trait objects so tests can substitute doubles
/// - **Security** — SHA-256 of the admin token, computed at startup
/// - **Lifecycle** — the shutdown token long-lived handlers watch
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<ServerConfig>,

    pub hub: Arc<PolicyHub>,
    pub query: Arc<PolicyQueryService>,

    pub service: Arc<PolicyService>,
    pub enrollment: Arc<EnrollmentService>,

    pub policies: Arc<dyn PolicyRepo>,
    pub bindings: Arc<dyn BindingRepo>,
    pub groups: Arc<dyn GroupRepo>,
    pub nodes: Arc<dyn NodeRepo>,

    /// SHA-256 hash of the admin token (read once at startup).
    /// `None` = admin RPCs are refused entirely.
    pub admin_token_hash: Option<Vec<u8>>,

    /// Cancelled when the process is asked to stop; the accept loop and
    /// every open policy stream exit promptly when it fires.
    pub shutdown: CancellationToken,
}
