//! The single TLS listener carrying both the admin surface and the policy
//! stream.
//!
//! Client certificates are verified against the internal CA but optional
//! at the handshake — the enrollment RPC is bootstrap and has no
//! certificate yet. Each connection's verified peer identity is injected
//! into requests as an extension; the per-route guards enforce presence.

use std::path::Path;
use std::sync::Arc;

use axum::Extension;
use axum::Router;
use hyper::body::Incoming;
use hyper::Request;
use hyper_util::rt::{TokioExecutor, TokioIo};
use rustls::server::WebPkiClientVerifier;
use rustls::RootCertStore;
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tower::ServiceExt;
use x509_parser::prelude::{FromDer, X509Certificate};

use bor_domain::{Error, Result};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Peer identity
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// What the TLS handshake learned about the peer. Inserted into every
/// request on the connection.
#[derive(Debug, Clone, Default)]
pub struct TlsPeer {
    /// Present when the peer supplied a certificate that chained to the
    /// internal CA.
    pub client_cert: Option<PeerCert>,
}

#[derive(Debug, Clone)]
pub struct PeerCert {
    /// Subject common name of the verified client certificate.
    pub common_name: String,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Config
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Build the rustls server config: our transport certificate, optional
/// client auth against `client_roots`, and h2 + http/1.1 via ALPN.
pub fn build_tls_config(
    cert_path: &Path,
    key_path: &Path,
    client_roots: RootCertStore,
) -> Result<Arc<rustls::ServerConfig>> {
    let cert_pem = std::fs::read(cert_path)?;
    let certs = rustls_pemfile::certs(&mut std::io::Cursor::new(cert_pem))
        .collect::<std::io::Result<Vec<_>>>()
        .map_err(|e| Error::Pki(format!("reading {}: {e}", cert_path.display())))?;

    let key_pem = std::fs::read(key_path)?;
    let key = rustls_pemfile::private_key(&mut std::io::Cursor::new(key_pem))
        .map_err(|e| Error::Pki(format!("reading {}: {e}", key_path.display())))?
        .ok_or_else(|| Error::Pki(format!("no private key in {}", key_path.display())))?;

    let verifier = WebPkiClientVerifier::builder(Arc::new(client_roots))
        .allow_unauthenticated()
        .build()
        .map_err(|e| Error::Pki(format!("building client verifier: {e}")))?;

    let mut config = rustls::ServerConfig::builder()
        .with_client_cert_verifier(verifier)
        .with_single_cert(certs, key)
        .map_err(|e| Error::Pki(format!("assembling TLS config: {e}")))?;
    config.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];
    Ok(Arc::new(config))
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Accept loop
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Accept TLS connections until `shutdown` fires, serving `app` on each.
///
/// Open streams watch the same token through [`crate::state::AppState`],
/// so cancelling it drains the whole listener, not just the accept loop.
pub async fn serve(
    listener: TcpListener,
    tls_config: Arc<rustls::ServerConfig>,
    app: Router,
    shutdown: CancellationToken,
) -> Result<()> {
    let acceptor = TlsAcceptor::from(tls_config);
    loop {
        let (tcp, remote) = tokio::select! {
            accepted = listener.accept() => accepted
                .map_err(|e| Error::Transport(format!("accept: {e}")))?,
            _ = shutdown.cancelled() => {
                tracing::info!("listener stopped");
                return Ok(());
            }
        };
        let acceptor = acceptor.clone();
        let app = app.clone();

        tokio::spawn(async move {
            let stream = match acceptor.accept(tcp).await {
                Ok(stream) => stream,
                Err(e) => {
                    tracing::debug!(remote = %remote, error = %e, "TLS handshake failed");
                    return;
                }
            };
            let peer = peer_identity(stream.get_ref().1);
            tracing::debug!(
                remote = %remote,
                client_cn = peer.client_cert.as_ref().map(|c| c.common_name.as_str()),
                "connection established"
            );

            let app = app.layer(Extension(peer));
            let service = hyper::service::service_fn(move |request: Request<Incoming>| {
                app.clone().oneshot(request)
            });

            let builder =
                hyper_util::server::conn::auto::Builder::new(TokioExecutor::new());
            if let Err(e) = builder
                .serve_connection_with_upgrades(TokioIo::new(stream), service)
                .await
            {
                tracing::debug!(remote = %remote, error = %e, "connection ended with error");
            }
        });
    }
}

/// Extract the verified client certificate's CN, if one was presented.
fn peer_identity(conn: &rustls::ServerConnection) -> TlsPeer {
    let Some(certs) = conn.peer_certificates() else {
        return TlsPeer::default();
    };
    let Some(leaf) = certs.first() else {
        return TlsPeer::default();
    };
    match X509Certificate::from_der(leaf.as_ref()) {
        Ok((_, cert)) => {
            let common_name = cert
                .subject()
                .iter_common_name()
                .next()
                .and_then(|cn| cn.as_str().ok())
                .unwrap_or_default()
                .to_owned();
            TlsPeer {
                client_cert: Some(PeerCert { common_name }),
            }
        }
        Err(e) => {
            tracing::warn!(error = %e, "peer presented an unparseable certificate");
            TlsPeer::default()
        }
    }
}
