//! Streaming policy subscription over mutually authenticated TLS.
//!
//! Tracks the highest revision seen across events and reconnects with it
//! after any stream loss, so the server can hand back a delta instead of
//! a full snapshot.

use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use rustls::pki_types::ServerName;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::Connector;
use tokio_util::sync::CancellationToken;

use bor_domain::config::AgentConfig;
use bor_domain::{Error, Result};
use bor_protocol::PolicyUpdate;

use crate::reconnect::ReconnectBackoff;

pub struct PolicyClient {
    config: AgentConfig,
    client_id: String,
    backoff: ReconnectBackoff,
    last_revision: u64,
}

impl PolicyClient {
    pub fn new(config: AgentConfig, client_id: String) -> Self {
        let backoff = ReconnectBackoff::new(
            Duration::from_millis(config.reconnect.initial_delay_ms),
            Duration::from_secs(config.reconnect.max_delay_secs),
            &client_id,
        );
        Self {
            config,
            client_id,
            backoff,
            last_revision: 0,
        }
    }

    /// Run the subscription until `shutdown` fires, forwarding every
    /// update into `tx`.
    ///
    /// Returns early only on a fatal configuration error (bad TLS
    /// material); transport failures reconnect with back-off.
    pub async fn run(
        mut self,
        tx: mpsc::Sender<PolicyUpdate>,
        shutdown: CancellationToken,
    ) -> Result<()> {
        let tls = Arc::new(build_client_tls(&self.config)?);
        let mut attempt: u32 = 0;

        loop {
            if shutdown.is_cancelled() {
                return Ok(());
            }
            let result = tokio::select! {
                result = self.connect_and_stream(tls.clone(), &tx) => result,
                _ = shutdown.cancelled() => {
                    tracing::info!("shutdown requested, leaving the policy stream");
                    return Ok(());
                }
            };
            match result {
                Ok(()) => {
                    tracing::info!("policy stream closed by server");
                    attempt = 0;
                }
                Err(e) => {
                    tracing::warn!(attempt, error = %e, "policy stream lost");
                }
            }
            if tx.is_closed() {
                return Ok(());
            }
            let delay = self.backoff.delay_for_attempt(attempt);
            tracing::info!(
                delay_ms = delay.as_millis() as u64,
                last_known_revision = self.last_revision,
                "reconnecting"
            );
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = shutdown.cancelled() => return Ok(()),
            }
            attempt = attempt.saturating_add(1);
        }
    }

    async fn connect_and_stream(
        &mut self,
        tls: Arc<rustls::ClientConfig>,
        tx: &mpsc::Sender<PolicyUpdate>,
    ) -> Result<()> {
        let url = self.subscribe_url();
        tracing::debug!(url = %url, "connecting to policy stream");

        let (ws, _response) = tokio_tungstenite::connect_async_tls_with_config(
            url.as_str(),
            None,
            false,
            Some(Connector::Rustls(tls)),
        )
        .await
        .map_err(|e| Error::Transport(format!("websocket connect: {e}")))?;

        let (_sink, mut stream) = ws.split();
        while let Some(message) = stream.next().await {
            let message =
                message.map_err(|e| Error::Transport(format!("websocket read: {e}")))?;
            match message {
                Message::Text(text) => {
                    let update: PolicyUpdate = match serde_json::from_str(&text) {
                        Ok(update) => update,
                        Err(e) => {
                            tracing::warn!(error = %e, "ignoring unparseable stream message");
                            continue;
                        }
                    };
                    self.last_revision = self.last_revision.max(update.revision);
                    if tx.send(update).await.is_err() {
                        // Receiver gone: the agent is shutting down.
                        return Ok(());
                    }
                }
                Message::Close(_) => return Ok(()),
                _ => {}
            }
        }
        Ok(())
    }

    fn subscribe_url(&self) -> String {
        let base = self
            .config
            .server_url
            .trim_end_matches('/')
            .replacen("https://", "wss://", 1)
            .replacen("http://", "ws://", 1);
        format!(
            "{base}/v1/policies/subscribe?client_id={}&last_known_revision={}",
            self.client_id, self.last_revision
        )
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Client TLS
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Mutual-TLS client config from the enrolled materials.
///
/// Refuses to build without a trust anchor unless the operator asked for
/// skip-verify explicitly.
fn build_client_tls(config: &AgentConfig) -> Result<rustls::ClientConfig> {
    let ca_path = config.ca_path();
    let builder = if ca_path.exists() {
        let pem = std::fs::read(&ca_path)?;
        let mut roots = rustls::RootCertStore::empty();
        for cert in rustls_pemfile::certs(&mut std::io::Cursor::new(pem)) {
            let cert =
                cert.map_err(|e| Error::Pki(format!("reading {}: {e}", ca_path.display())))?;
            roots
                .add(cert)
                .map_err(|e| Error::Pki(format!("untrusted CA certificate: {e}")))?;
        }
        rustls::ClientConfig::builder().with_root_certificates(roots)
    } else if config.skip_verify {
        tracing::warn!("server certificate verification disabled by configuration");
        rustls::ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(NoVerify::default()))
    } else {
        return Err(Error::Config(format!(
            "no CA certificate at {} and skip_verify is off; refusing to connect",
            ca_path.display()
        )));
    };

    let cert_pem = std::fs::read(config.cert_path())?;
    let certs = rustls_pemfile::certs(&mut std::io::Cursor::new(cert_pem))
        .collect::<std::io::Result<Vec<_>>>()
        .map_err(|e| Error::Pki(format!("reading client certificate: {e}")))?;
    let key_pem = std::fs::read(config.key_path())?;
    let key = rustls_pemfile::private_key(&mut std::io::Cursor::new(key_pem))
        .map_err(|e| Error::Pki(format!("reading client key: {e}")))?
        .ok_or_else(|| Error::Pki("client key file holds no key".into()))?;

    builder
        .with_client_auth_cert(certs, key)
        .map_err(|e| Error::Pki(format!("assembling client TLS config: {e}")))
}

/// Accept-anything verifier for explicit skip-verify mode.
#[derive(Debug)]
struct NoVerify(Arc<rustls::crypto::CryptoProvider>);

impl Default for NoVerify {
    fn default() -> Self {
        Self(
            rustls::crypto::CryptoProvider::get_default()
                .cloned()
                .unwrap_or_else(|| Arc::new(rustls::crypto::aws_lc_rs::default_provider())),
        )
    }
}

impl rustls::client::danger::ServerCertVerifier for NoVerify {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::pki_types::CertificateDer<'_>,
        _intermediates: &[rustls::pki_types::CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> std::result::Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &rustls::pki_types::CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error>
    {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &self.0.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &rustls::pki_types::CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error>
    {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.0.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        self.0
            .signature_verification_algorithms
            .supported_schemes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn subscribe_url_switches_scheme_and_carries_revision() {
        let config = AgentConfig {
            server_url: "https://policy.example.org:8443".into(),
            ..Default::default()
        };
        let mut client = PolicyClient::new(config, "ws-01".into());
        client.last_revision = 17;
        assert_eq!(
            client.subscribe_url(),
            "wss://policy.example.org:8443/v1/policies/subscribe?client_id=ws-01&last_known_revision=17"
        );
    }

    #[test]
    fn missing_ca_without_skip_verify_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        // Enrolled materials exist, but no trust anchor.
        std::fs::write(dir.path().join("agent.crt"), b"x").unwrap();
        std::fs::write(dir.path().join("agent.key"), b"x").unwrap();
        let config = AgentConfig {
            data_dir: PathBuf::from(dir.path()),
            ca_file: Some(dir.path().join("missing-ca.crt")),
            skip_verify: false,
            ..Default::default()
        };
        let err = build_client_tls(&config).unwrap_err();
        assert!(matches!(err, Error::Config(_)), "{err}");
    }
}
