//! Agent enrollment: one-shot bearer tokens and the bootstrap flow that
//! turns a token plus a CSR into a signed certificate and a node record.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use rand::RngCore;

use bor_domain::model::{Node, NodeStatus};
use bor_domain::{Error, Result};
use bor_pki::CertAuthority;

use crate::store::{GroupRepo, NodeRepo};

/// Tokens are valid for five minutes after issuance.
const TOKEN_TTL_MINUTES: i64 = 5;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Token registry
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

struct TokenEntry {
    group_id: String,
    expires_at: DateTime<Utc>,
    used: bool,
}

/// Process-local registry of short-lived, single-use enrollment tokens.
///
/// Not persisted: a server restart invalidates outstanding tokens.
#[derive(Default)]
pub struct TokenRegistry {
    tokens: Mutex<HashMap<String, TokenEntry>>,
}

impl TokenRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Issue a token bound to a node group.
    pub fn create(&self, group_id: &str) -> Result<(String, DateTime<Utc>)> {
        if group_id.is_empty() {
            return Err(Error::InvalidInput(
                "enrollment token requires a node group".into(),
            ));
        }
        let mut bytes = [0u8; 32];
        rand::rngs::OsRng.fill_bytes(&mut bytes);
        let token = hex::encode(bytes);
        let expires_at = Utc::now() + Duration::minutes(TOKEN_TTL_MINUTES);

        self.tokens.lock().insert(
            token.clone(),
            TokenEntry {
                group_id: group_id.to_owned(),
                expires_at,
                used: false,
            },
        );
        Ok((token, expires_at))
    }

    /// Consume a token exactly once, yielding its node group.
    ///
    /// Unknown, already-used, and expired tokens fail distinctly; an
    /// expired entry is removed on the way out. The used entry stays as a
    /// tombstone until its expiry purge so that a second consume is
    /// reported as "already used" rather than "unknown".
    pub fn consume(&self, token: &str) -> Result<String> {
        let mut tokens = self.tokens.lock();
        let entry = tokens.get_mut(token).ok_or(Error::TokenInvalid)?;
        if entry.used {
            return Err(Error::TokenUsed);
        }
        if entry.expires_at < Utc::now() {
            tokens.remove(token);
            return Err(Error::TokenExpired);
        }
        entry.used = true;
        let group_id = entry.group_id.clone();
        // Opportunistic purge of anything past its expiry.
        let now = Utc::now();
        tokens.retain(|_, e| e.expires_at >= now);
        Ok(group_id)
    }

    #[cfg(test)]
    fn force_expire(&self, token: &str) {
        if let Some(entry) = self.tokens.lock().get_mut(token) {
            entry.expires_at = Utc::now() - Duration::minutes(1);
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Enrollment service
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Result of a successful enrollment.
pub struct EnrolledAgent {
    pub node_id: String,
    pub cert_pem: String,
    pub ca_cert_pem: String,
    pub group_id: String,
}

/// Composes the token registry, the CA, and the node/group repositories
/// into the bootstrap flow.
pub struct EnrollmentService {
    tokens: Arc<TokenRegistry>,
    ca: Arc<CertAuthority>,
    nodes: Arc<dyn NodeRepo>,
    groups: Arc<dyn GroupRepo>,
}

impl EnrollmentService {
    pub fn new(
        tokens: Arc<TokenRegistry>,
        ca: Arc<CertAuthority>,
        nodes: Arc<dyn NodeRepo>,
        groups: Arc<dyn GroupRepo>,
    ) -> Self {
        Self {
            tokens,
            ca,
            nodes,
            groups,
        }
    }

    /// Issue a fresh enrollment token (admin operation).
    pub fn create_token(&self, group_id: &str) -> Result<(String, DateTime<Utc>)> {
        // The group must exist; a token for a dangling group would enroll
        // nodes into nothing.
        self.groups.get(group_id)?;
        self.tokens.create(group_id)
    }

    /// Bootstrap: consume the token, sign the request, create the node,
    /// add it to the token's group.
    pub fn enroll(&self, token: &str, csr_pem: &str, node_name: &str) -> Result<EnrolledAgent> {
        if node_name.is_empty() {
            return Err(Error::InvalidInput("node name must not be empty".into()));
        }
        let group_id = self.tokens.consume(token)?;
        let cert_pem = self.ca.sign_csr(csr_pem)?;

        // Re-enrollment of a known workstation reuses its record.
        let node_id = match self.nodes.get_by_name(node_name)? {
            Some(existing) => existing.id,
            None => {
                let node = Node {
                    id: uuid::Uuid::new_v4().to_string(),
                    name: node_name.to_owned(),
                    machine_id: None,
                    address: None,
                    os_name: None,
                    os_version: None,
                    desktop_envs: Vec::new(),
                    agent_version: None,
                    status: NodeStatus::Unknown,
                    last_seen: None,
                    created_at: Utc::now(),
                };
                self.nodes.create(&node)?;
                node.id
            }
        };
        if !group_id.is_empty() {
            self.groups.add_member(&group_id, &node_id)?;
        }

        tracing::info!(node = %node_name, group = %group_id, "agent enrolled");
        Ok(EnrolledAgent {
            node_id,
            cert_pem,
            ca_cert_pem: self.ca.cert_pem().to_owned(),
            group_id,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::SqliteStore;
    use bor_domain::model::NodeGroup;
    use bor_pki::{build_csr_pem, ensure_ca, generate_key_pem, load_ca};

    #[test]
    fn token_is_one_shot() {
        let registry = TokenRegistry::new();
        let (token, _) = registry.create("grp-1").unwrap();
        assert_eq!(registry.consume(&token).unwrap(), "grp-1");
        assert!(matches!(registry.consume(&token), Err(Error::TokenUsed)));
    }

    #[test]
    fn unknown_and_expired_tokens_fail_distinctly() {
        let registry = TokenRegistry::new();
        assert!(matches!(
            registry.consume("deadbeef"),
            Err(Error::TokenInvalid)
        ));

        let (token, _) = registry.create("grp-1").unwrap();
        registry.force_expire(&token);
        assert!(matches!(registry.consume(&token), Err(Error::TokenExpired)));
        // The expired entry was removed.
        assert!(matches!(
            registry.consume(&token),
            Err(Error::TokenInvalid)
        ));
    }

    #[test]
    fn empty_group_is_refused() {
        let registry = TokenRegistry::new();
        assert!(registry.create("").is_err());
    }

    #[test]
    fn token_body_is_32_random_bytes_hex() {
        let registry = TokenRegistry::new();
        let (a, expires) = registry.create("grp-1").unwrap();
        let (b, _) = registry.create("grp-1").unwrap();
        assert_eq!(a.len(), 64);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(a, b);
        assert!(expires > Utc::now());
    }

    #[test]
    fn enroll_creates_the_node_and_membership() {
        let dir = tempfile::tempdir().unwrap();
        let (cert_path, key_path) = ensure_ca(dir.path()).unwrap();
        let ca = Arc::new(load_ca(&cert_path, &key_path).unwrap());

        let store = SqliteStore::open_in_memory().unwrap();
        GroupRepo::create(
            &*store,
            &NodeGroup {
                id: "grp-1".into(),
                name: "workstations".into(),
                description: String::new(),
            },
        )
        .unwrap();

        let service = EnrollmentService::new(
            TokenRegistry::new(),
            ca,
            store.clone(),
            store.clone(),
        );
        let (token, _) = service.create_token("grp-1").unwrap();

        let key = generate_key_pem().unwrap();
        let csr = build_csr_pem(&key, "ws-01", "Bor Agent").unwrap();
        let enrolled = service.enroll(&token, &csr, "ws-01").unwrap();

        assert!(enrolled.cert_pem.contains("BEGIN CERTIFICATE"));
        assert!(enrolled.ca_cert_pem.contains("BEGIN CERTIFICATE"));
        assert_eq!(enrolled.group_id, "grp-1");

        let node = NodeRepo::get_by_name(&*store, "ws-01").unwrap().unwrap();
        assert_eq!(node.id, enrolled.node_id);
        let groups = store.groups_for_node(&node.id).unwrap();
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].id, "grp-1");
    }

    #[test]
    fn token_for_unknown_group_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let (cert_path, key_path) = ensure_ca(dir.path()).unwrap();
        let ca = Arc::new(load_ca(&cert_path, &key_path).unwrap());
        let store = SqliteStore::open_in_memory().unwrap();
        let service = EnrollmentService::new(
            TokenRegistry::new(),
            ca,
            store.clone(),
            store.clone(),
        );
        assert!(matches!(
            service.create_token("nope"),
            Err(Error::NotFound { .. })
        ));
    }
}
