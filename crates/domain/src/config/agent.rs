use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use super::ConfigIssue;
use crate::error::{Error, Result};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Agent config
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Configuration for `bor-agent`, loaded from YAML.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Base URL of the Bor server, e.g. `https://policy.example.org:8443`.
    #[serde(default = "d_server_url")]
    pub server_url: String,
    /// Identity reported to the server. Defaults to the local hostname when
    /// empty.
    #[serde(default)]
    pub client_id: String,
    /// Holds the agent certificate, key, and pinned CA.
    #[serde(default = "d_data_dir")]
    pub data_dir: PathBuf,
    /// Trust anchor for the server certificate. Defaults to
    /// `<data_dir>/ca.crt` once enrolled.
    #[serde(default)]
    pub ca_file: Option<PathBuf>,
    /// Accept any server certificate. Tolerated for enrollment bootstrap,
    /// refused for the policy stream unless set explicitly.
    #[serde(default)]
    pub skip_verify: bool,
    #[serde(default = "d_heartbeat")]
    pub heartbeat_interval_secs: u64,
    /// Pacing of stream reconnect attempts.
    #[serde(default)]
    pub reconnect: ReconnectConfig,
    #[serde(default)]
    pub targets: TargetsConfig,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            server_url: d_server_url(),
            client_id: String::new(),
            data_dir: d_data_dir(),
            ca_file: None,
            skip_verify: false,
            heartbeat_interval_secs: d_heartbeat(),
            reconnect: ReconnectConfig::default(),
            targets: TargetsConfig::default(),
        }
    }
}

impl AgentConfig {
    /// Load from a YAML file; a missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let raw = std::fs::read_to_string(path)?;
        serde_yaml::from_str(&raw)
            .map_err(|e| Error::Config(format!("{}: {e}", path.display())))
    }

    pub fn validate(&self) -> Vec<ConfigIssue> {
        let mut issues = Vec::new();

        if self.server_url.is_empty() {
            issues.push(ConfigIssue::error(
                "server_url",
                "server URL must not be empty",
            ));
        } else if !self.server_url.starts_with("https://") {
            issues.push(ConfigIssue::warning(
                "server_url",
                "server URL is not https; the policy stream requires TLS",
            ));
        }
        if self.skip_verify {
            issues.push(ConfigIssue::warning(
                "skip_verify",
                "server certificate verification is disabled",
            ));
        }
        if self.targets.chromium.managed_dirs.is_empty() {
            issues.push(ConfigIssue::warning(
                "targets.chromium.managed_dirs",
                "no Chromium policy directories configured",
            ));
        }
        if self.reconnect.initial_delay_ms == 0 {
            issues.push(ConfigIssue::warning(
                "reconnect.initial_delay_ms",
                "a zero initial delay hammers an unreachable server",
            ));
        }
        issues
    }

    /// Path of the persisted client certificate.
    pub fn cert_path(&self) -> PathBuf {
        self.data_dir.join("agent.crt")
    }

    /// Path of the persisted private key.
    pub fn key_path(&self) -> PathBuf {
        self.data_dir.join("agent.key")
    }

    /// Path of the pinned CA certificate (unless overridden by `ca_file`).
    pub fn ca_path(&self) -> PathBuf {
        self.ca_file
            .clone()
            .unwrap_or_else(|| self.data_dir.join("ca.crt"))
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Reconnect pacing
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconnectConfig {
    /// Delay before the first reconnect attempt; doubles per failure.
    #[serde(default = "d_reconnect_initial_ms")]
    pub initial_delay_ms: u64,
    /// Cap on the doubling schedule.
    #[serde(default = "d_reconnect_max_secs")]
    pub max_delay_secs: u64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_delay_ms: d_reconnect_initial_ms(),
            max_delay_secs: d_reconnect_max_secs(),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Materialiser targets
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct TargetsConfig {
    #[serde(default)]
    pub firefox: FirefoxTarget,
    #[serde(default)]
    pub chromium: ChromiumTarget,
    #[serde(default)]
    pub kconfig: KconfigTarget,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FirefoxTarget {
    /// The enterprise policies file; backed up before first overwrite.
    #[serde(default = "d_firefox_policies")]
    pub policies_file: PathBuf,
    /// Secondary policies file for sandboxed installs. Owned entirely by
    /// Bor: written without backup, deleted when no policy applies.
    #[serde(default)]
    pub sandbox_policies_file: Option<PathBuf>,
}

impl Default for FirefoxTarget {
    fn default() -> Self {
        Self {
            policies_file: d_firefox_policies(),
            sandbox_policies_file: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChromiumTarget {
    /// Managed-policy directories; each receives one Bor-owned file.
    #[serde(default = "d_chromium_dirs")]
    pub managed_dirs: Vec<PathBuf>,
}

impl Default for ChromiumTarget {
    fn default() -> Self {
        Self {
            managed_dirs: d_chromium_dirs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KconfigTarget {
    /// Overlay directory prepended to `XDG_CONFIG_DIRS`; per-policy INI
    /// files land here.
    #[serde(default = "d_kconfig_overlay")]
    pub overlay_dir: PathBuf,
    /// System-wide files receiving action-restriction entries.
    #[serde(default = "d_restrictions_paths")]
    pub restrictions_paths: Vec<PathBuf>,
    /// Login-profile script exporting the overlay onto the XDG search path.
    #[serde(default = "d_profile_script")]
    pub profile_script: PathBuf,
}

impl Default for KconfigTarget {
    fn default() -> Self {
        Self {
            overlay_dir: d_kconfig_overlay(),
            restrictions_paths: d_restrictions_paths(),
            profile_script: d_profile_script(),
        }
    }
}

// ── serde default helpers ───────────────────────────────────────────

fn d_server_url() -> String {
    "https://localhost:8443".into()
}
fn d_data_dir() -> PathBuf {
    PathBuf::from("/var/lib/bor/agent")
}
fn d_heartbeat() -> u64 {
    60
}
fn d_reconnect_initial_ms() -> u64 {
    1000
}
fn d_reconnect_max_secs() -> u64 {
    60
}
fn d_firefox_policies() -> PathBuf {
    PathBuf::from("/etc/firefox/policies/policies.json")
}
fn d_chromium_dirs() -> Vec<PathBuf> {
    vec![
        PathBuf::from("/etc/chromium/policies/managed"),
        PathBuf::from("/etc/opt/chrome/policies/managed"),
    ]
}
fn d_kconfig_overlay() -> PathBuf {
    PathBuf::from("/etc/xdg/bor")
}
fn d_restrictions_paths() -> Vec<PathBuf> {
    vec![
        PathBuf::from("/etc/kderc"),
        PathBuf::from("/etc/xdg/kdeglobals"),
    ]
}
fn d_profile_script() -> PathBuf {
    PathBuf::from("/etc/profile.d/bor-xdg.sh")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_have_both_chromium_dirs() {
        let config = AgentConfig::default();
        assert_eq!(config.targets.chromium.managed_dirs.len(), 2);
        assert_eq!(
            config.cert_path(),
            PathBuf::from("/var/lib/bor/agent/agent.crt")
        );
    }

    #[test]
    fn partial_yaml_fills_defaults() {
        let yaml = r#"
server_url: https://policy.example.org:8443
client_id: ws-01
targets:
  kconfig:
    overlay_dir: /tmp/overlay
"#;
        let config: AgentConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.client_id, "ws-01");
        assert_eq!(config.targets.kconfig.overlay_dir, PathBuf::from("/tmp/overlay"));
        assert_eq!(
            config.targets.firefox.policies_file,
            PathBuf::from("/etc/firefox/policies/policies.json")
        );
    }

    #[test]
    fn http_url_warns_but_passes() {
        let config = AgentConfig {
            server_url: "http://localhost:8080".into(),
            ..Default::default()
        };
        let issues = config.validate();
        assert!(issues.iter().any(|i| i.field == "server_url"));
    }

    #[test]
    fn ca_file_overrides_data_dir() {
        let config = AgentConfig {
            ca_file: Some(PathBuf::from("/etc/bor/ca.crt")),
            ..Default::default()
        };
        assert_eq!(config.ca_path(), PathBuf::from("/etc/bor/ca.crt"));
    }
}
