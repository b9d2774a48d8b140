//! One-shot enrollment bootstrap: key, CSR, RPC, persisted materials.

use std::fs;
use std::os::unix::fs::PermissionsExt;

use bor_domain::config::AgentConfig;
use bor_domain::Result;
use bor_protocol::EnrollRequest;

use crate::rpc::ServerRpc;

/// Organisation field identifying agent certificates.
const AGENT_ORGANIZATION: &str = "Bor Agent";

/// Enroll against the server, persisting `agent.key`, `agent.crt`, and
/// `ca.crt` under the data directory. A completed enrollment (all three
/// files present) is never repeated.
pub async fn run_enrollment(config: &AgentConfig, token: &str) -> Result<bool> {
    if config.cert_path().exists() && config.key_path().exists() && config.ca_path().exists() {
        tracing::info!(
            data_dir = %config.data_dir.display(),
            "already enrolled, nothing to do"
        );
        return Ok(false);
    }

    fs::create_dir_all(&config.data_dir)?;
    fs::set_permissions(&config.data_dir, fs::Permissions::from_mode(0o700))?;

    let client_id = resolve_client_id(config);
    tracing::info!(client_id = %client_id, server = %config.server_url, "enrolling");

    let key_pem = bor_pki::generate_key_pem()?;
    let csr_pem = bor_pki::build_csr_pem(&key_pem, &client_id, AGENT_ORGANIZATION)?;

    let rpc = ServerRpc::bootstrap(config)?;
    let response = rpc
        .enroll(&EnrollRequest {
            token: token.to_owned(),
            csr_pem,
            node_name: client_id.clone(),
        })
        .await?;

    bor_pki::write_key_pem(&config.key_path(), &key_pem)?;
    bor_pki::write_cert_pem(&config.cert_path(), &response.cert_pem)?;
    bor_pki::write_cert_pem(&config.ca_path(), &response.ca_cert_pem)?;

    tracing::info!(
        node_id = %response.node_id,
        group = %response.group_id,
        "enrollment complete"
    );
    Ok(true)
}

/// The configured client identity, or the local hostname when unset.
pub fn resolve_client_id(config: &AgentConfig) -> String {
    if !config.client_id.is_empty() {
        return config.client_id.clone();
    }
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .filter(|h| !h.is_empty())
        .unwrap_or_else(|| "bor-agent".into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn configured_client_id_wins_over_hostname() {
        let config = AgentConfig {
            client_id: "ws-custom".into(),
            ..Default::default()
        };
        assert_eq!(resolve_client_id(&config), "ws-custom");

        let config = AgentConfig::default();
        assert!(!resolve_client_id(&config).is_empty());
    }

    #[tokio::test]
    async fn completed_enrollment_is_not_repeated() {
        let dir = tempfile::tempdir().unwrap();
        let config = AgentConfig {
            data_dir: dir.path().to_path_buf(),
            ..Default::default()
        };
        std::fs::write(config.cert_path(), b"cert").unwrap();
        std::fs::write(config.key_path(), b"key").unwrap();
        std::fs::write(config.ca_path(), b"ca").unwrap();

        // No server is running; this must return without any RPC.
        assert!(!run_enrollment(&config, "unused-token").await.unwrap());
    }
}
