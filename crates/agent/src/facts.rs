//! Workstation facts reported via heartbeat.

use std::fs;

use bor_protocol::NodeFacts;

/// Collect what this workstation can tell about itself. Fields that
/// cannot be determined stay empty; the server never overwrites stored
/// values with blanks.
pub fn gather() -> NodeFacts {
    NodeFacts {
        fqdn: hostname::get()
            .ok()
            .and_then(|h| h.into_string().ok())
            .unwrap_or_default(),
        ip_address: String::new(),
        os_name: os_release_field("NAME"),
        os_version: os_release_field("VERSION_ID"),
        desktop_envs: desktop_environments(),
        agent_version: env!("CARGO_PKG_VERSION").to_owned(),
        machine_id: fs::read_to_string("/etc/machine-id")
            .map(|s| s.trim().to_owned())
            .unwrap_or_default(),
    }
}

fn os_release_field(field: &str) -> String {
    let Ok(content) = fs::read_to_string("/etc/os-release") else {
        return String::new();
    };
    parse_os_release_field(&content, field)
}

fn parse_os_release_field(content: &str, field: &str) -> String {
    content
        .lines()
        .find_map(|line| line.strip_prefix(&format!("{field}=")))
        .map(|value| value.trim().trim_matches('"').to_owned())
        .unwrap_or_default()
}

fn desktop_environments() -> Vec<String> {
    std::env::var("XDG_CURRENT_DESKTOP")
        .map(|raw| {
            raw.split(':')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_owned)
                .collect()
        })
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn os_release_values_are_unquoted() {
        let content = "NAME=\"openSUSE Leap\"\nVERSION_ID=\"15.6\"\nID=opensuse-leap\n";
        assert_eq!(parse_os_release_field(content, "NAME"), "openSUSE Leap");
        assert_eq!(parse_os_release_field(content, "VERSION_ID"), "15.6");
        assert_eq!(parse_os_release_field(content, "ID"), "opensuse-leap");
        assert_eq!(parse_os_release_field(content, "MISSING"), "");
    }

    #[test]
    fn gathered_facts_carry_the_agent_version() {
        let facts = gather();
        assert_eq!(facts.agent_version, env!("CARGO_PKG_VERSION"));
    }
}
