//! Internal PKI for the Bor control plane.
//!
//! One self-signed root CA signs everything: the server's transport
//! certificate and every agent's client certificate. The CA bootstraps
//! itself on first start and is reused from disk afterwards.

mod ca;
mod keys;

pub use ca::{
    ensure_ca, ensure_server_cert, load_ca, load_ca_cert_pool, CertAuthority, CA_CERT_FILE,
    CA_KEY_FILE, SERVER_CERT_FILE, SERVER_KEY_FILE,
};
pub use keys::{build_csr_pem, generate_key_pem, write_cert_pem, write_key_pem};
