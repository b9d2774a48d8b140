//! Unary RPCs to the server over HTTPS: enrollment, heartbeat,
//! compliance reporting, and the agent-config fetch.

use std::time::Duration;

use chrono::Utc;
use reqwest::StatusCode;
use serde::de::DeserializeOwned;

use bor_domain::config::AgentConfig;
use bor_domain::{Error, Result};
use bor_protocol::{
    AgentConfigResponse, ComplianceRequest, ComplianceResponse, EnrollRequest, EnrollResponse,
    ErrorResponse, HeartbeatRequest, HeartbeatResponse, NodeFacts,
};

/// Upper bound on every unary call.
const RPC_TIMEOUT: Duration = Duration::from_secs(10);

pub struct ServerRpc {
    http: reqwest::Client,
    base_url: String,
}

impl ServerRpc {
    /// Client for the pre-enrollment bootstrap call. There is no client
    /// certificate yet; a missing CA is tolerated here (and warned
    /// about) because the enrollment response delivers the trust anchor.
    pub fn bootstrap(config: &AgentConfig) -> Result<Self> {
        let mut builder = reqwest::Client::builder()
            .use_rustls_tls()
            .timeout(RPC_TIMEOUT);

        let ca_path = config.ca_path();
        if ca_path.exists() {
            let pem = std::fs::read(&ca_path)?;
            builder = builder.add_root_certificate(
                reqwest::Certificate::from_pem(&pem)
                    .map_err(|e| Error::Pki(format!("parsing {}: {e}", ca_path.display())))?,
            );
        } else {
            tracing::warn!(
                "no CA certificate yet; accepting the server certificate unverified for enrollment"
            );
            builder = builder.danger_accept_invalid_certs(true);
        }

        Ok(Self {
            http: builder
                .build()
                .map_err(|e| Error::Transport(format!("building HTTP client: {e}")))?,
            base_url: config.server_url.trim_end_matches('/').to_owned(),
        })
    }

    /// Mutually authenticated client for all post-enrollment RPCs.
    pub fn authenticated(config: &AgentConfig) -> Result<Self> {
        let cert_pem = std::fs::read(config.cert_path())?;
        let key_pem = std::fs::read(config.key_path())?;
        let mut identity_pem = cert_pem;
        identity_pem.extend_from_slice(&key_pem);
        let identity = reqwest::Identity::from_pem(&identity_pem)
            .map_err(|e| Error::Pki(format!("loading client identity: {e}")))?;

        let mut builder = reqwest::Client::builder()
            .use_rustls_tls()
            .identity(identity)
            .timeout(RPC_TIMEOUT);

        let ca_path = config.ca_path();
        if ca_path.exists() {
            let pem = std::fs::read(&ca_path)?;
            builder = builder.add_root_certificate(
                reqwest::Certificate::from_pem(&pem)
                    .map_err(|e| Error::Pki(format!("parsing {}: {e}", ca_path.display())))?,
            );
        } else if config.skip_verify {
            tracing::warn!("server certificate verification disabled by configuration");
            builder = builder.danger_accept_invalid_certs(true);
        } else {
            return Err(Error::Config(format!(
                "no CA certificate at {} and skip_verify is off; refusing to connect",
                ca_path.display()
            )));
        }

        Ok(Self {
            http: builder
                .build()
                .map_err(|e| Error::Transport(format!("building HTTP client: {e}")))?,
            base_url: config.server_url.trim_end_matches('/').to_owned(),
        })
    }

    pub async fn enroll(&self, request: &EnrollRequest) -> Result<EnrollResponse> {
        self.post("/v1/enroll", request).await
    }

    pub async fn heartbeat(&self, client_id: &str, facts: NodeFacts) -> Result<bool> {
        let response: HeartbeatResponse = self
            .post(
                "/v1/nodes/heartbeat",
                &HeartbeatRequest {
                    client_id: client_id.to_owned(),
                    node_info: facts,
                },
            )
            .await?;
        Ok(response.accepted)
    }

    pub async fn report_compliance(
        &self,
        client_id: &str,
        policy_id: &str,
        compliant: bool,
        message: &str,
    ) -> Result<()> {
        let _: ComplianceResponse = self
            .post(
                "/v1/nodes/compliance",
                &ComplianceRequest {
                    client_id: client_id.to_owned(),
                    policy_id: policy_id.to_owned(),
                    compliant,
                    message: message.to_owned(),
                    reported_at: Utc::now(),
                },
            )
            .await?;
        Ok(())
    }

    pub async fn agent_config(&self) -> Result<AgentConfigResponse> {
        let response = self
            .http
            .get(format!("{}/v1/agent-config", self.base_url))
            .send()
            .await
            .map_err(|e| Error::Transport(format!("agent-config: {e}")))?;
        decode(response).await
    }

    async fn post<Req: serde::Serialize, Resp: DeserializeOwned>(
        &self,
        path: &str,
        body: &Req,
    ) -> Result<Resp> {
        let response = self
            .http
            .post(format!("{}{path}", self.base_url))
            .json(body)
            .send()
            .await
            .map_err(|e| Error::Transport(format!("{path}: {e}")))?;
        decode(response).await
    }
}

async fn decode<T: DeserializeOwned>(response: reqwest::Response) -> Result<T> {
    let status = response.status();
    if status.is_success() {
        return response
            .json()
            .await
            .map_err(|e| Error::Transport(format!("decoding response: {e}")));
    }
    let message = response
        .json::<ErrorResponse>()
        .await
        .map(|e| e.error)
        .unwrap_or_else(|_| status.to_string());
    Err(match status {
        StatusCode::UNAUTHORIZED => Error::Unauthenticated(message),
        StatusCode::FORBIDDEN => Error::Forbidden(message),
        StatusCode::NOT_FOUND => Error::NotFound {
            what: "resource",
            id: message,
        },
        StatusCode::BAD_REQUEST => Error::InvalidInput(message),
        StatusCode::CONFLICT => Error::StateViolation(message),
        _ => Error::Transport(format!("{status}: {message}")),
    })
}
