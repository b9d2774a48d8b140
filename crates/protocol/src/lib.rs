//! Wire types shared by `bord` and `bor-agent`: the policy stream message,
//! typed policy payloads, and the request/response bodies of the unary RPCs.
//!
//! Wire-level compatibility matters here — the agent and server are
//! deployed independently, so every type keeps serde defaults on fields a
//! newer peer may omit.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use bor_domain::model::{NodeStatus, PolicyKind};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Policy stream
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// What happened to the policy a stream update carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdateKind {
    Created,
    Updated,
    Deleted,
    /// Part of a full snapshot. A snapshot update without a policy payload
    /// is the empty-set marker.
    Snapshot,
    /// Targeted request for the agent to re-send its node facts.
    MetadataRequest,
}

/// One server→agent stream message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyUpdate {
    pub kind: UpdateKind,
    /// Absent on the empty-snapshot marker and on metadata requests.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub policy: Option<WirePolicy>,
    /// Hub revision this update corresponds to. Snapshot messages share
    /// the revision observed when the snapshot was taken.
    pub revision: u64,
    /// Set on the final message of a snapshot run only.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub snapshot_complete: bool,
}

/// A policy as delivered to agents.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WirePolicy {
    pub id: String,
    pub name: String,
    pub kind: PolicyKind,
    pub version: i64,
    /// Highest priority among the bindings that made this policy
    /// applicable to the receiving node.
    #[serde(default)]
    pub priority: i64,
    /// JSON settings object for browser kinds, JSON entry array for the
    /// kconfig kind.
    pub content: serde_json::Value,
}

impl WirePolicy {
    /// Interpret `content` according to `kind`.
    pub fn typed_content(&self) -> Result<PolicyContent, String> {
        match self.kind {
            PolicyKind::Firefox => match &self.content {
                serde_json::Value::Object(map) => Ok(PolicyContent::Firefox(map.clone())),
                other => Err(format!(
                    "policy {}: firefox content must be a JSON object, got {}",
                    self.name,
                    json_type_name(other)
                )),
            },
            PolicyKind::Chromium => match &self.content {
                serde_json::Value::Object(map) => Ok(PolicyContent::Chromium(map.clone())),
                other => Err(format!(
                    "policy {}: chromium content must be a JSON object, got {}",
                    self.name,
                    json_type_name(other)
                )),
            },
            PolicyKind::Kconfig => {
                let entries: Vec<KconfigEntry> =
                    serde_json::from_value(self.content.clone()).map_err(|e| {
                        format!("policy {}: invalid kconfig entry list: {e}", self.name)
                    })?;
                Ok(PolicyContent::Kconfig(entries))
            }
        }
    }
}

/// Typed view of a wire policy's content.
#[derive(Debug, Clone)]
pub enum PolicyContent {
    Firefox(serde_json::Map<String, serde_json::Value>),
    Chromium(serde_json::Map<String, serde_json::Value>),
    Kconfig(Vec<KconfigEntry>),
}

/// One keyed-INI setting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KconfigEntry {
    /// File name relative to the overlay directory, e.g. `kdeglobals`.
    pub file: String,
    /// INI group, e.g. `General` or `KDE Action Restrictions`.
    pub group: String,
    pub key: String,
    pub value: String,
    /// Rendered with the `[$i]` enforcement marker when set.
    #[serde(default)]
    pub immutable: bool,
}

fn json_type_name(value: &serde_json::Value) -> &'static str {
    match value {
        serde_json::Value::Null => "null",
        serde_json::Value::Bool(_) => "bool",
        serde_json::Value::Number(_) => "number",
        serde_json::Value::String(_) => "string",
        serde_json::Value::Array(_) => "array",
        serde_json::Value::Object(_) => "object",
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Enrollment
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateTokenRequest {
    pub group_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateTokenResponse {
    pub token: String,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnrollRequest {
    pub token: String,
    pub csr_pem: String,
    pub node_name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnrollResponse {
    pub node_id: String,
    pub cert_pem: String,
    pub ca_cert_pem: String,
    pub group_id: String,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Node RPCs
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Facts the agent reports about its workstation. Empty strings are
/// treated as "unknown" and never overwrite stored values.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodeFacts {
    #[serde(default)]
    pub fqdn: String,
    #[serde(default)]
    pub ip_address: String,
    #[serde(default)]
    pub os_name: String,
    #[serde(default)]
    pub os_version: String,
    #[serde(default)]
    pub desktop_envs: Vec<String>,
    #[serde(default)]
    pub agent_version: String,
    #[serde(default)]
    pub machine_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatRequest {
    pub client_id: String,
    pub node_info: NodeFacts,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatResponse {
    pub accepted: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComplianceRequest {
    pub client_id: String,
    pub policy_id: String,
    pub compliant: bool,
    #[serde(default)]
    pub message: String,
    pub reported_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComplianceResponse {
    pub ok: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfigResponse {
    pub notify_users: bool,
    pub notify_cooldown_seconds: u64,
    pub apply_message: String,
    pub restore_message: String,
    pub error_message: String,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Admin wiring
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreatePolicyRequest {
    pub name: String,
    pub kind: PolicyKind,
    pub content: serde_json::Value,
    #[serde(default)]
    pub created_by: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdatePolicyRequest {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub content: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SetPolicyStateRequest {
    pub state: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeprecatePolicyRequest {
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub superseded_by: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateGroupRequest {
    pub name: String,
    #[serde(default)]
    pub description: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateBindingRequest {
    pub policy_id: String,
    pub group_id: String,
    pub state: String,
    #[serde(default)]
    pub priority: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateBindingRequest {
    #[serde(default)]
    pub state: Option<String>,
    #[serde(default)]
    pub priority: Option<i64>,
}

/// Node inventory row returned by the admin listing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeSummary {
    pub id: String,
    pub name: String,
    pub status: NodeStatus,
    #[serde(default)]
    pub address: Option<String>,
    #[serde(default)]
    pub os_name: Option<String>,
    #[serde(default)]
    pub agent_version: Option<String>,
    #[serde(default)]
    pub last_seen: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RefreshResponse {
    /// Whether the targeted node was connected and the request was queued.
    pub delivered: bool,
}

/// Uniform error body for non-2xx responses.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}
