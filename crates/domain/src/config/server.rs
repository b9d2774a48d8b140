use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use super::{ConfigIssue, ConfigSeverity};
use crate::error::{Error, Result};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Top-level server config
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Configuration for `bord`, loaded from TOML.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ServerConfig {
    #[serde(default)]
    pub server: ListenConfig,
    #[serde(default)]
    pub pki: PkiConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub hub: HubConfig,
    /// Settings handed to agents via the agent-config RPC.
    #[serde(default)]
    pub notifications: NotificationConfig,
}

impl ServerConfig {
    /// Load from a TOML file; a missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let raw = std::fs::read_to_string(path)?;
        toml::from_str(&raw).map_err(|e| Error::Config(format!("{}: {e}", path.display())))
    }

    /// Validate the configuration and return a list of issues.
    pub fn validate(&self) -> Vec<ConfigIssue> {
        let mut issues = Vec::new();

        if self.server.port == 0 {
            issues.push(ConfigIssue::error(
                "server.port",
                "port must be greater than 0",
            ));
        }
        if self.server.host.is_empty() {
            issues.push(ConfigIssue::error("server.host", "host must not be empty"));
        }
        if self.server.admin_token_env.is_empty() {
            issues.push(ConfigIssue::error(
                "server.admin_token_env",
                "admin token env var name must not be empty",
            ));
        }
        if self.hub.event_log_capacity < 2 {
            issues.push(ConfigIssue::error(
                "hub.event_log_capacity",
                "event log capacity must be at least 2",
            ));
        }
        if self.notifications.notify_cooldown_seconds == 0 {
            issues.push(ConfigIssue::warning(
                "notifications.notify_cooldown_seconds",
                "cooldown of 0 disables notification debouncing",
            ));
        }
        issues
    }

    /// True when any issue is an error.
    pub fn has_errors(issues: &[ConfigIssue]) -> bool {
        issues
            .iter()
            .any(|i| i.severity == ConfigSeverity::Error)
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Listener
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListenConfig {
    #[serde(default = "d_host")]
    pub host: String,
    #[serde(default = "d_port")]
    pub port: u16,
    /// Extra SANs for the transport certificate. Entries that parse as IP
    /// addresses become IP SANs, anything else a DNS SAN.
    #[serde(default)]
    pub extra_hostnames: Vec<String>,
    /// Environment variable holding the static admin credential checked on
    /// `x-admin-token`. If the variable is unset, admin RPCs are refused.
    #[serde(default = "d_admin_token_env")]
    pub admin_token_env: String,
}

impl Default for ListenConfig {
    fn default() -> Self {
        Self {
            host: d_host(),
            port: d_port(),
            extra_hostnames: Vec::new(),
            admin_token_env: d_admin_token_env(),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// PKI / storage / hub
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PkiConfig {
    /// Directory holding the CA and transport certificate material.
    #[serde(default = "d_pki_dir")]
    pub dir: PathBuf,
}

impl Default for PkiConfig {
    fn default() -> Self {
        Self { dir: d_pki_dir() }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "d_db_path")]
    pub db_path: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            db_path: d_db_path(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HubConfig {
    /// Ring-buffer capacity of the change-event log; evicted in halves on
    /// overflow.
    #[serde(default = "d_event_log_capacity")]
    pub event_log_capacity: usize,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            event_log_capacity: d_event_log_capacity(),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Agent notification settings (served via get-agent-config)
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationConfig {
    #[serde(default = "d_true")]
    pub notify_users: bool,
    #[serde(default = "d_cooldown")]
    pub notify_cooldown_seconds: u64,
    #[serde(default = "d_apply_message")]
    pub apply_message: String,
    #[serde(default = "d_restore_message")]
    pub restore_message: String,
    #[serde(default = "d_error_message")]
    pub error_message: String,
}

impl Default for NotificationConfig {
    fn default() -> Self {
        Self {
            notify_users: true,
            notify_cooldown_seconds: d_cooldown(),
            apply_message: d_apply_message(),
            restore_message: d_restore_message(),
            error_message: d_error_message(),
        }
    }
}

// ── serde default helpers ───────────────────────────────────────────

fn d_host() -> String {
    "0.0.0.0".into()
}
fn d_port() -> u16 {
    8443
}
fn d_admin_token_env() -> String {
    "BOR_ADMIN_TOKEN".into()
}
fn d_pki_dir() -> PathBuf {
    PathBuf::from("/var/lib/bor/pki")
}
fn d_db_path() -> PathBuf {
    PathBuf::from("/var/lib/bor/bor.db")
}
fn d_event_log_capacity() -> usize {
    1000
}
fn d_true() -> bool {
    true
}
fn d_cooldown() -> u64 {
    30
}
fn d_apply_message() -> String {
    "Your workstation configuration has been updated by your administrator.".into()
}
fn d_restore_message() -> String {
    "A managed configuration has been removed from your workstation.".into()
}
fn d_error_message() -> String {
    "A managed configuration could not be applied; contact your administrator.".into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = ServerConfig::default();
        let issues = config.validate();
        assert!(!ServerConfig::has_errors(&issues), "{issues:?}");
    }

    #[test]
    fn zero_port_is_an_error() {
        let config: ServerConfig = toml::from_str(
            r#"
[server]
port = 0
"#,
        )
        .unwrap();
        let issues = config.validate();
        assert!(ServerConfig::has_errors(&issues));
        assert!(issues.iter().any(|i| i.field == "server.port"));
    }

    #[test]
    fn partial_toml_fills_defaults() {
        let config: ServerConfig = toml::from_str(
            r#"
[server]
host = "policy.example.org"

[hub]
event_log_capacity = 5
"#,
        )
        .unwrap();
        assert_eq!(config.server.host, "policy.example.org");
        assert_eq!(config.server.port, 8443);
        assert_eq!(config.hub.event_log_capacity, 5);
        assert!(config.notifications.notify_users);
    }
}
