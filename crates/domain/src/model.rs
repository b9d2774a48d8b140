//! Core entities: policies, node groups, nodes, and policy bindings.
//!
//! Enumerations round-trip through their string form because the SQL store
//! persists them as text and the wire protocol carries them as JSON strings.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Error;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Enumerations
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// The configuration system a policy targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PolicyKind {
    Firefox,
    Chromium,
    Kconfig,
}

impl PolicyKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            PolicyKind::Firefox => "firefox",
            PolicyKind::Chromium => "chromium",
            PolicyKind::Kconfig => "kconfig",
        }
    }
}

impl fmt::Display for PolicyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PolicyKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Error> {
        match s {
            "firefox" => Ok(PolicyKind::Firefox),
            "chromium" => Ok(PolicyKind::Chromium),
            "kconfig" => Ok(PolicyKind::Kconfig),
            other => Err(Error::InvalidInput(format!("unknown policy kind: {other}"))),
        }
    }
}

/// Editorial lifecycle of a policy.
///
/// `draft` policies are editable and invisible to agents, `released`
/// policies are live and immutable, `archived` policies are retired.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PolicyState {
    Draft,
    Released,
    Archived,
}

impl PolicyState {
    pub fn as_str(&self) -> &'static str {
        match self {
            PolicyState::Draft => "draft",
            PolicyState::Released => "released",
            PolicyState::Archived => "archived",
        }
    }
}

impl fmt::Display for PolicyState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PolicyState {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Error> {
        match s {
            "draft" => Ok(PolicyState::Draft),
            "released" => Ok(PolicyState::Released),
            "archived" => Ok(PolicyState::Archived),
            other => Err(Error::InvalidInput(format!("unknown policy state: {other}"))),
        }
    }
}

/// Enforcement state of a policy binding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BindingState {
    Enabled,
    Disabled,
}

impl BindingState {
    pub fn as_str(&self) -> &'static str {
        match self {
            BindingState::Enabled => "enabled",
            BindingState::Disabled => "disabled",
        }
    }
}

impl fmt::Display for BindingState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BindingState {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Error> {
        match s {
            "enabled" => Ok(BindingState::Enabled),
            "disabled" => Ok(BindingState::Disabled),
            other => Err(Error::InvalidInput(format!(
                "unknown binding state: {other}"
            ))),
        }
    }
}

/// Cached liveness of a node, maintained by the stream server on
/// connect/disconnect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeStatus {
    Online,
    Offline,
    Unknown,
}

impl NodeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeStatus::Online => "online",
            NodeStatus::Offline => "offline",
            NodeStatus::Unknown => "unknown",
        }
    }
}

impl fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for NodeStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Error> {
        match s {
            "online" => Ok(NodeStatus::Online),
            "offline" => Ok(NodeStatus::Offline),
            "unknown" => Ok(NodeStatus::Unknown),
            other => Err(Error::InvalidInput(format!("unknown node status: {other}"))),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Policy
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// A declarative policy document.
///
/// `content` is JSON text: for browser kinds a settings object, for the
/// kconfig kind an array of keyed-INI entries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Policy {
    pub id: String,
    pub name: String,
    pub kind: PolicyKind,
    pub content: String,
    /// Bumped on every edit while in `draft`.
    pub version: i64,
    pub state: PolicyState,
    #[serde(default)]
    pub deprecated_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub deprecation_message: Option<String>,
    /// Identity of the policy replacing this one, if any.
    #[serde(default)]
    pub superseded_by: Option<String>,
    pub created_by: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Policy {
    /// Parse `content` into a JSON value.
    pub fn content_json(&self) -> Result<serde_json::Value, Error> {
        Ok(serde_json::from_str(&self.content)?)
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Node group
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// A logical grouping of managed workstations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeGroup {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Node
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// A managed workstation, created at first enrollment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    pub id: String,
    /// Agent-chosen name, typically the workstation's hostname. Unique.
    pub name: String,
    #[serde(default)]
    pub machine_id: Option<String>,
    #[serde(default)]
    pub address: Option<String>,
    #[serde(default)]
    pub os_name: Option<String>,
    #[serde(default)]
    pub os_version: Option<String>,
    /// Desktop environments seen on the workstation (e.g. "KDE").
    #[serde(default)]
    pub desktop_envs: Vec<String>,
    #[serde(default)]
    pub agent_version: Option<String>,
    pub status: NodeStatus,
    #[serde(default)]
    pub last_seen: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Policy binding
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Links a policy to a node group. At most one binding per (policy, group).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyBinding {
    pub id: String,
    pub policy_id: String,
    pub group_id: String,
    pub state: BindingState,
    /// Non-negative; higher wins when the same policy reaches a node
    /// through several groups.
    pub priority: i64,
    pub created_at: DateTime<Utc>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Compliance report
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Last reported enforcement outcome for one policy on one node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComplianceReport {
    pub node_id: String,
    pub policy_id: String,
    pub compliant: bool,
    #[serde(default)]
    pub message: String,
    pub reported_at: DateTime<Utc>,
}
