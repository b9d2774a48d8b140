use bor_domain::config::{AgentConfig, ServerConfig};

#[test]
fn default_server_listens_on_8443() {
    let config = ServerConfig::default();
    assert_eq!(config.server.port, 8443);
    assert_eq!(config.hub.event_log_capacity, 1000);
    assert_eq!(config.server.admin_token_env, "BOR_ADMIN_TOKEN");
}

#[test]
fn explicit_listener_parses() {
    let toml_str = r#"
[server]
host = "0.0.0.0"
port = 9443
extra_hostnames = ["policy.example.org", "192.0.2.10"]
"#;
    let config: ServerConfig = toml::from_str(toml_str).unwrap();
    assert_eq!(config.server.host, "0.0.0.0");
    assert_eq!(config.server.port, 9443);
    assert_eq!(config.server.extra_hostnames.len(), 2);
}

#[test]
fn agent_defaults_point_at_var_lib() {
    let config = AgentConfig::default();
    assert_eq!(
        config.data_dir,
        std::path::PathBuf::from("/var/lib/bor/agent")
    );
    assert!(!config.skip_verify);
    assert_eq!(config.heartbeat_interval_secs, 60);
    assert_eq!(config.reconnect.initial_delay_ms, 1000);
    assert_eq!(config.reconnect.max_delay_secs, 60);
}

#[test]
fn agent_yaml_overrides_selected_fields() {
    let yaml = r#"
server_url: https://bor.corp.example:8443
skip_verify: true
heartbeat_interval_secs: 120
"#;
    let config: AgentConfig = serde_yaml::from_str(yaml).unwrap();
    assert_eq!(config.server_url, "https://bor.corp.example:8443");
    assert!(config.skip_verify);
    assert_eq!(config.heartbeat_interval_secs, 120);
    // Everything else keeps its default.
    assert_eq!(
        config.targets.firefox.policies_file,
        std::path::PathBuf::from("/etc/firefox/policies/policies.json")
    );
}
