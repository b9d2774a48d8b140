//! Root CA bootstrap, transport-certificate management, and CSR signing.

use std::fs;
use std::net::IpAddr;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use rcgen::{
    BasicConstraints, Certificate, CertificateParams, CertificateSigningRequestParams, DnType,
    ExtendedKeyUsagePurpose, IsCa, KeyPair, KeyUsagePurpose, SanType, SerialNumber,
};
use time::{Duration, OffsetDateTime};
use x509_parser::certification_request::X509CertificationRequest;
use x509_parser::pem::parse_x509_pem;
use x509_parser::prelude::{FromDer, X509Certificate};

use bor_domain::{Error, Result};

use crate::keys::{generate_key_pem, write_cert_pem, write_key_pem};

pub const CA_CERT_FILE: &str = "ca.crt";
pub const CA_KEY_FILE: &str = "ca.key";
pub const SERVER_CERT_FILE: &str = "server.crt";
pub const SERVER_KEY_FILE: &str = "server.key";

const CA_VALIDITY_DAYS: i64 = 3650;
const LEAF_VALIDITY_DAYS: i64 = 365;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// CertAuthority
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// A loaded CA: the issuer certificate and key used for signing, plus the
/// exact PEM handed out to enrolling agents as their trust anchor.
pub struct CertAuthority {
    issuer: Certificate,
    key: KeyPair,
    cert_pem: String,
}

impl CertAuthority {
    /// The on-disk CA certificate PEM, byte-for-byte.
    pub fn cert_pem(&self) -> &str {
        &self.cert_pem
    }

    /// Sign a PEM-encoded certificate request, producing a one-year client
    /// certificate bearing the request's subject.
    ///
    /// The request's self-signature is verified first; anything that does
    /// not verify is refused.
    pub fn sign_csr(&self, csr_pem: &str) -> Result<String> {
        let (_, pem) = parse_x509_pem(csr_pem.as_bytes())
            .map_err(|e| Error::Pki(format!("decoding CSR PEM: {e}")))?;
        let (_, request) = X509CertificationRequest::from_der(&pem.contents)
            .map_err(|e| Error::Pki(format!("parsing CSR: {e}")))?;
        request
            .verify_signature()
            .map_err(|e| Error::Pki(format!("CSR self-signature did not verify: {e}")))?;

        let mut csr = CertificateSigningRequestParams::from_pem(csr_pem)
            .map_err(|e| Error::Pki(format!("reading CSR parameters: {e}")))?;
        let now = OffsetDateTime::now_utc();
        csr.params.not_before = now;
        csr.params.not_after = now + Duration::days(LEAF_VALIDITY_DAYS);
        csr.params.is_ca = IsCa::NoCa;
        csr.params.key_usages = vec![
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyEncipherment,
        ];
        csr.params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ClientAuth];
        csr.params.serial_number = Some(random_serial());

        let cert = csr
            .signed_by(&self.issuer, &self.key)
            .map_err(|e| Error::Pki(format!("signing CSR: {e}")))?;
        Ok(cert.pem())
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// CA bootstrap
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Ensure the CA exists under `dir`, generating it on first use.
///
/// Returns the certificate and key paths. An existing pair is reused
/// untouched.
pub fn ensure_ca(dir: &Path) -> Result<(PathBuf, PathBuf)> {
    ensure_pki_dir(dir)?;
    let cert_path = dir.join(CA_CERT_FILE);
    let key_path = dir.join(CA_KEY_FILE);
    if cert_path.exists() && key_path.exists() {
        return Ok((cert_path, key_path));
    }

    let key_pem = generate_key_pem()?;
    let key = KeyPair::from_pem(&key_pem)
        .map_err(|e| Error::Pki(format!("loading generated CA key: {e}")))?;

    let mut params = CertificateParams::default();
    params
        .distinguished_name
        .push(DnType::CommonName, "Bor Root CA");
    params.distinguished_name.push(DnType::OrganizationName, "Bor");
    params.is_ca = IsCa::Ca(BasicConstraints::Constrained(0));
    params.key_usages = vec![KeyUsagePurpose::KeyCertSign, KeyUsagePurpose::CrlSign];
    let now = OffsetDateTime::now_utc();
    params.not_before = now;
    params.not_after = now + Duration::days(CA_VALIDITY_DAYS);
    params.serial_number = Some(random_serial());

    let cert = params
        .self_signed(&key)
        .map_err(|e| Error::Pki(format!("self-signing CA certificate: {e}")))?;

    write_key_pem(&key_path, &key_pem)?;
    write_cert_pem(&cert_path, &cert.pem())?;
    tracing::info!(path = %cert_path.display(), "generated new root CA");
    Ok((cert_path, key_path))
}

/// Load the CA from its on-disk PEM pair.
pub fn load_ca(cert_path: &Path, key_path: &Path) -> Result<CertAuthority> {
    let cert_pem = fs::read_to_string(cert_path)?;
    let key_pem = fs::read_to_string(key_path)?;
    let key = KeyPair::from_pem(&key_pem)
        .map_err(|e| Error::Pki(format!("parsing CA key {}: {e}", key_path.display())))?;
    let params = CertificateParams::from_ca_cert_pem(&cert_pem).map_err(|e| {
        Error::Pki(format!(
            "parsing CA certificate {}: {e}",
            cert_path.display()
        ))
    })?;
    // Rebuild the issuer object from the parsed parameters. The signature
    // on the rebuilt certificate is fresh, but subject and key — all that
    // issuance uses — match the distributed PEM.
    let issuer = params
        .self_signed(&key)
        .map_err(|e| Error::Pki(format!("reconstructing CA issuer: {e}")))?;
    Ok(CertAuthority {
        issuer,
        key,
        cert_pem,
    })
}

/// Load the CA certificate as a rustls trust-anchor set.
pub fn load_ca_cert_pool(cert_path: &Path) -> Result<rustls::RootCertStore> {
    let pem = fs::read(cert_path)?;
    let mut reader = std::io::Cursor::new(pem);
    let mut roots = rustls::RootCertStore::empty();
    for cert in rustls_pemfile::certs(&mut reader) {
        let cert = cert.map_err(|e| {
            Error::Pki(format!("reading CA bundle {}: {e}", cert_path.display()))
        })?;
        roots
            .add(cert)
            .map_err(|e| Error::Pki(format!("untrusted CA certificate: {e}")))?;
    }
    if roots.is_empty() {
        return Err(Error::Pki(format!(
            "no certificates in {}",
            cert_path.display()
        )));
    }
    Ok(roots)
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Transport certificate
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Ensure the server's transport certificate under `dir`.
///
/// An existing pair is reused only while it still chains to the supplied
/// CA; a stale pair is deleted and regenerated. Without a CA the
/// certificate is self-signed.
pub fn ensure_server_cert(
    dir: &Path,
    ca: Option<&CertAuthority>,
    extra_hostnames: &[String],
) -> Result<(PathBuf, PathBuf)> {
    ensure_pki_dir(dir)?;
    let cert_path = dir.join(SERVER_CERT_FILE);
    let key_path = dir.join(SERVER_KEY_FILE);

    if cert_path.exists() && key_path.exists() {
        match ca {
            None => return Ok((cert_path, key_path)),
            Some(ca) => {
                let cert_pem = fs::read_to_string(&cert_path)?;
                if chains_to(&cert_pem, ca.cert_pem())? {
                    return Ok((cert_path, key_path));
                }
                tracing::warn!(
                    path = %cert_path.display(),
                    "transport certificate no longer chains to the CA, regenerating"
                );
                fs::remove_file(&cert_path)?;
                fs::remove_file(&key_path)?;
            }
        }
    }

    let key_pem = generate_key_pem()?;
    let key = KeyPair::from_pem(&key_pem)
        .map_err(|e| Error::Pki(format!("loading generated server key: {e}")))?;

    let host = local_hostname();
    let mut params = CertificateParams::default();
    params.distinguished_name.push(DnType::CommonName, &host);
    params.distinguished_name.push(DnType::OrganizationName, "Bor");
    params.is_ca = IsCa::NoCa;
    params.key_usages = vec![
        KeyUsagePurpose::DigitalSignature,
        KeyUsagePurpose::KeyEncipherment,
    ];
    params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];
    let now = OffsetDateTime::now_utc();
    params.not_before = now;
    params.not_after = now + Duration::days(LEAF_VALIDITY_DAYS);
    params.serial_number = Some(random_serial());

    params.subject_alt_names = vec![
        dns_san("localhost")?,
        SanType::IpAddress(IpAddr::from([127, 0, 0, 1])),
        SanType::IpAddress("::1".parse().expect("literal v6 loopback")),
        dns_san(&host)?,
    ];
    for name in extra_hostnames {
        match name.parse::<IpAddr>() {
            Ok(ip) => params.subject_alt_names.push(SanType::IpAddress(ip)),
            Err(_) => params.subject_alt_names.push(dns_san(name)?),
        }
    }

    let cert = match ca {
        Some(ca) => params
            .signed_by(&key, &ca.issuer, &ca.key)
            .map_err(|e| Error::Pki(format!("signing server certificate: {e}")))?,
        None => params
            .self_signed(&key)
            .map_err(|e| Error::Pki(format!("self-signing server certificate: {e}")))?,
    };

    write_key_pem(&key_path, &key_pem)?;
    write_cert_pem(&cert_path, &cert.pem())?;
    tracing::info!(
        path = %cert_path.display(),
        self_signed = ca.is_none(),
        "generated server transport certificate"
    );
    Ok((cert_path, key_path))
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Helpers
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Does `cert_pem` carry a signature made by the key in `ca_pem`?
fn chains_to(cert_pem: &str, ca_pem: &str) -> Result<bool> {
    let (_, cert_der) = parse_x509_pem(cert_pem.as_bytes())
        .map_err(|e| Error::Pki(format!("decoding certificate PEM: {e}")))?;
    let (_, ca_der) = parse_x509_pem(ca_pem.as_bytes())
        .map_err(|e| Error::Pki(format!("decoding CA PEM: {e}")))?;
    let (_, cert) = X509Certificate::from_der(&cert_der.contents)
        .map_err(|e| Error::Pki(format!("parsing certificate: {e}")))?;
    let (_, ca) = X509Certificate::from_der(&ca_der.contents)
        .map_err(|e| Error::Pki(format!("parsing CA certificate: {e}")))?;
    Ok(cert.verify_signature(Some(ca.public_key())).is_ok())
}

fn ensure_pki_dir(dir: &Path) -> Result<()> {
    if !dir.exists() {
        fs::create_dir_all(dir)?;
    }
    fs::set_permissions(dir, fs::Permissions::from_mode(0o700))?;
    Ok(())
}

fn dns_san(name: &str) -> Result<SanType> {
    let ia5 = name
        .try_into()
        .map_err(|e| Error::Pki(format!("invalid SAN {name:?}: {e}")))?;
    Ok(SanType::DnsName(ia5))
}

fn random_serial() -> SerialNumber {
    let mut bytes = [0u8; 16];
    rand::RngCore::fill_bytes(&mut rand::rngs::OsRng, &mut bytes);
    // Clear the top bit so the serial is a positive DER integer.
    bytes[0] &= 0x7f;
    SerialNumber::from_slice(&bytes)
}

fn local_hostname() -> String {
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .filter(|h| !h.is_empty())
        .unwrap_or_else(|| "bor-server".into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::build_csr_pem;

    #[test]
    fn ensure_ca_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let (cert1, key1) = ensure_ca(dir.path()).unwrap();
        let cert_bytes = fs::read(&cert1).unwrap();
        let key_bytes = fs::read(&key1).unwrap();

        let (cert2, key2) = ensure_ca(dir.path()).unwrap();
        assert_eq!(cert1, cert2);
        assert_eq!(key1, key2);
        assert_eq!(fs::read(&cert2).unwrap(), cert_bytes);
        assert_eq!(fs::read(&key2).unwrap(), key_bytes);
    }

    #[test]
    fn ca_key_is_owner_only_and_cert_world_readable() {
        let dir = tempfile::tempdir().unwrap();
        let (cert, key) = ensure_ca(dir.path()).unwrap();
        assert_eq!(
            fs::metadata(&key).unwrap().permissions().mode() & 0o777,
            0o600
        );
        assert_eq!(
            fs::metadata(&cert).unwrap().permissions().mode() & 0o777,
            0o644
        );
    }

    #[test]
    fn signed_csr_chains_to_the_ca() {
        let dir = tempfile::tempdir().unwrap();
        let (cert_path, key_path) = ensure_ca(dir.path()).unwrap();
        let ca = load_ca(&cert_path, &key_path).unwrap();

        let agent_key = generate_key_pem().unwrap();
        let csr = build_csr_pem(&agent_key, "ws-01", "Bor Agent").unwrap();
        let issued = ca.sign_csr(&csr).unwrap();

        assert!(issued.contains("BEGIN CERTIFICATE"));
        assert!(chains_to(&issued, ca.cert_pem()).unwrap());
    }

    #[test]
    fn garbage_csr_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let (cert_path, key_path) = ensure_ca(dir.path()).unwrap();
        let ca = load_ca(&cert_path, &key_path).unwrap();
        assert!(ca.sign_csr("-----BEGIN CERTIFICATE REQUEST-----\nAAAA\n-----END CERTIFICATE REQUEST-----\n").is_err());
        assert!(ca.sign_csr("not pem at all").is_err());
    }

    #[test]
    fn server_cert_reused_while_chained() {
        let dir = tempfile::tempdir().unwrap();
        let (cert_path, key_path) = ensure_ca(dir.path()).unwrap();
        let ca = load_ca(&cert_path, &key_path).unwrap();

        let (c1, _) = ensure_server_cert(dir.path(), Some(&ca), &[]).unwrap();
        let first = fs::read(&c1).unwrap();
        let (c2, _) = ensure_server_cert(dir.path(), Some(&ca), &[]).unwrap();
        assert_eq!(fs::read(&c2).unwrap(), first);
    }

    #[test]
    fn self_signed_cert_replaced_once_a_ca_appears() {
        let dir = tempfile::tempdir().unwrap();
        let (c1, _) = ensure_server_cert(dir.path(), None, &[]).unwrap();
        let self_signed = fs::read(&c1).unwrap();

        let ca_dir = tempfile::tempdir().unwrap();
        let (cert_path, key_path) = ensure_ca(ca_dir.path()).unwrap();
        let ca = load_ca(&cert_path, &key_path).unwrap();

        let (c2, _) = ensure_server_cert(dir.path(), Some(&ca), &[]).unwrap();
        let reissued = fs::read(&c2).unwrap();
        assert_ne!(self_signed, reissued);

        let pem = String::from_utf8(reissued).unwrap();
        assert!(chains_to(&pem, ca.cert_pem()).unwrap());
    }

    #[test]
    fn extra_hostnames_become_sans() {
        let dir = tempfile::tempdir().unwrap();
        let (cert_path, key_path) = ensure_ca(dir.path()).unwrap();
        let ca = load_ca(&cert_path, &key_path).unwrap();

        let (c, _) = ensure_server_cert(
            dir.path(),
            Some(&ca),
            &["policy.example.org".into(), "192.0.2.10".into()],
        )
        .unwrap();
        let pem = fs::read_to_string(&c).unwrap();
        let (_, der) = parse_x509_pem(pem.as_bytes()).unwrap();
        let (_, cert) = X509Certificate::from_der(&der.contents).unwrap();
        let san = cert
            .subject_alternative_name()
            .unwrap()
            .expect("certificate has a SAN extension");
        let rendered = format!("{:?}", san.value.general_names);
        assert!(rendered.contains("policy.example.org"));
        assert!(rendered.contains("192.0.2.10"));
        assert!(rendered.contains("localhost"));
    }

    #[test]
    fn cert_pool_loads_the_anchor() {
        let dir = tempfile::tempdir().unwrap();
        let (cert_path, _) = ensure_ca(dir.path()).unwrap();
        let pool = load_ca_cert_pool(&cert_path).unwrap();
        assert_eq!(pool.len(), 1);
    }
}
