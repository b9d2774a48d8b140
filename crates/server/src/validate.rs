//! Policy content validation, run when a policy is created or edited.
//!
//! Browser content is schemaless JSON; only a small allow-list of
//! constrained values is checked. Keyed-INI entries get full structural
//! validation because their file names end up as paths on workstations.

use serde_json::Value;

use bor_domain::model::PolicyKind;
use bor_domain::{Error, Result};
use bor_protocol::KconfigEntry;

const URL_RESTRICTIONS_GROUP: &str = "KDE URL Restrictions";

const ALLOWED_URL_SCHEMES: [&str; 2] = ["http", "https"];
const ALLOWED_SSL_VERSIONS: [&str; 4] = ["tls1", "tls1.1", "tls1.2", "tls1.3"];
const ALLOWED_START_PAGES: [&str; 3] = ["homepage", "previous-session", "homepage-locked"];
const ALLOWED_PROXY_MODES: [&str; 5] = ["none", "system", "manual", "autoDetect", "autoConfig"];

/// Validate policy content for its target kind.
pub fn validate_policy_content(kind: PolicyKind, content: &Value) -> Result<()> {
    match kind {
        PolicyKind::Firefox => validate_firefox(content),
        PolicyKind::Chromium => validate_chromium(content),
        PolicyKind::Kconfig => validate_kconfig(content),
    }
}

fn validate_firefox(content: &Value) -> Result<()> {
    let object = content.as_object().ok_or_else(|| {
        Error::InvalidInput("firefox policy content must be a JSON object".into())
    })?;

    if let Some(homepage) = object.get("Homepage").and_then(Value::as_object) {
        if let Some(url) = homepage.get("URL").and_then(Value::as_str) {
            check_url_scheme("Homepage.URL", url)?;
        }
        if let Some(start) = homepage.get("StartPage").and_then(Value::as_str) {
            if !ALLOWED_START_PAGES.contains(&start) {
                return Err(Error::InvalidInput(format!(
                    "Homepage.StartPage must be one of {ALLOWED_START_PAGES:?}, got {start:?}"
                )));
            }
        }
        if let Some(additional) = homepage.get("Additional").and_then(Value::as_array) {
            for (i, url) in additional.iter().enumerate() {
                if let Some(url) = url.as_str() {
                    check_url_scheme(&format!("Homepage.Additional[{i}]"), url)?;
                }
            }
        }
    }

    for field in ["SSLVersionMin", "SSLVersionMax"] {
        if let Some(version) = object.get(field).and_then(Value::as_str) {
            if !ALLOWED_SSL_VERSIONS.contains(&version) {
                return Err(Error::InvalidInput(format!(
                    "{field} must be one of {ALLOWED_SSL_VERSIONS:?}, got {version:?}"
                )));
            }
        }
    }

    if let Some(proxy) = object.get("Proxy").and_then(Value::as_object) {
        if let Some(mode) = proxy.get("Mode").and_then(Value::as_str) {
            if !ALLOWED_PROXY_MODES.contains(&mode) {
                return Err(Error::InvalidInput(format!(
                    "Proxy.Mode must be one of {ALLOWED_PROXY_MODES:?}, got {mode:?}"
                )));
            }
        }
    }

    Ok(())
}

fn validate_chromium(content: &Value) -> Result<()> {
    let object = content.as_object().ok_or_else(|| {
        Error::InvalidInput("chromium policy content must be a JSON object".into())
    })?;
    for key in object.keys() {
        if key.is_empty() {
            return Err(Error::InvalidInput(
                "chromium policy contains an empty setting name".into(),
            ));
        }
    }
    if let Some(url) = object.get("HomepageLocation").and_then(Value::as_str) {
        check_url_scheme("HomepageLocation", url)?;
    }
    Ok(())
}

fn validate_kconfig(content: &Value) -> Result<()> {
    let entries: Vec<KconfigEntry> = serde_json::from_value(content.clone())
        .map_err(|e| Error::InvalidInput(format!("kconfig content must be an entry list: {e}")))?;

    for (i, entry) in entries.iter().enumerate() {
        if entry.file.is_empty() {
            return Err(Error::InvalidInput(format!(
                "kconfig entry {i}: file name must not be empty"
            )));
        }
        if entry.file.contains('/') || entry.file.contains('\\') || entry.file.contains("..") {
            return Err(Error::InvalidInput(format!(
                "kconfig entry {i}: file name {:?} must not contain path separators",
                entry.file
            )));
        }
        if entry.group.is_empty() {
            return Err(Error::InvalidInput(format!(
                "kconfig entry {i}: group must not be empty"
            )));
        }
        if entry.key.is_empty() {
            return Err(Error::InvalidInput(format!(
                "kconfig entry {i}: key must not be empty"
            )));
        }
        if entry.group == URL_RESTRICTIONS_GROUP
            && entry.key.starts_with("rule_")
            && entry.key != "rule_count"
        {
            // KDE URL rules are comma-separated:
            // action,src-scheme,src-host,src-path,dst-scheme,dst-host,dst-path[,enabled]
            let fields = entry.value.split(',').count();
            if !(7..=8).contains(&fields) {
                return Err(Error::InvalidInput(format!(
                    "kconfig entry {i}: URL rule {:?} has {fields} fields, expected 7 or 8",
                    entry.key
                )));
            }
        }
    }
    Ok(())
}

fn check_url_scheme(field: &str, url: &str) -> Result<()> {
    let scheme = url.split(':').next().unwrap_or("");
    if !ALLOWED_URL_SCHEMES
        .iter()
        .any(|allowed| scheme.eq_ignore_ascii_case(allowed))
    {
        return Err(Error::InvalidInput(format!(
            "{field}: URL scheme {scheme:?} is not allowed (use http or https)"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn homepage_scheme_allow_list() {
        for scheme in ["http", "https"] {
            let content = json!({"Homepage": {"URL": format!("{scheme}://example.org")}});
            validate_firefox(&content).unwrap();
        }
        for scheme in ["javascript", "ftp", "file"] {
            let content = json!({"Homepage": {"URL": format!("{scheme}://example.org")}});
            assert!(validate_firefox(&content).is_err(), "{scheme} accepted");
        }
    }

    #[test]
    fn ssl_versions_are_constrained() {
        validate_firefox(&json!({"SSLVersionMin": "tls1.2"})).unwrap();
        let err = validate_firefox(&json!({"SSLVersionMin": "ssl3"})).unwrap_err();
        assert!(err.to_string().contains("SSLVersionMin"));
    }

    #[test]
    fn proxy_mode_is_constrained() {
        validate_firefox(&json!({"Proxy": {"Mode": "system"}})).unwrap();
        assert!(validate_firefox(&json!({"Proxy": {"Mode": "socks-rave"}})).is_err());
    }

    #[test]
    fn unknown_settings_pass_through() {
        // Schemaless by design: anything outside the allow-list is accepted.
        validate_firefox(&json!({"DisableTelemetry": true, "ExtensionSettings": {}})).unwrap();
    }

    #[test]
    fn kconfig_rejects_path_traversal() {
        for bad in ["../kdeglobals", "sub/dir", "back\\slash"] {
            let content = json!([
                {"file": bad, "group": "General", "key": "k", "value": "v"}
            ]);
            let err = validate_kconfig(&content).unwrap_err();
            assert!(err.to_string().contains("entry 0"), "{err}");
        }
    }

    #[test]
    fn kconfig_reports_the_offending_index() {
        let content = json!([
            {"file": "kdeglobals", "group": "General", "key": "ok", "value": "v"},
            {"file": "kdeglobals", "group": "", "key": "k", "value": "v"}
        ]);
        let err = validate_kconfig(&content).unwrap_err();
        assert!(err.to_string().contains("entry 1"));
    }

    #[test]
    fn url_rules_need_seven_or_eight_fields() {
        let good = json!([
            {"file": "kdeglobals", "group": URL_RESTRICTIONS_GROUP, "key": "rule_1",
             "value": "open,file,,,,,,false", "immutable": true}
        ]);
        validate_kconfig(&good).unwrap();

        let bad = json!([
            {"file": "kdeglobals", "group": URL_RESTRICTIONS_GROUP, "key": "rule_1",
             "value": "open,file", "immutable": true}
        ]);
        let err = validate_kconfig(&bad).unwrap_err();
        assert!(err.to_string().contains("expected 7 or 8"), "{err}");

        // rule_count and non-rule keys are exempt.
        let exempt = json!([
            {"file": "kdeglobals", "group": URL_RESTRICTIONS_GROUP, "key": "rule_count",
             "value": "2", "immutable": true}
        ]);
        validate_kconfig(&exempt).unwrap();
    }

    #[test]
    fn chromium_must_be_object() {
        assert!(validate_chromium(&json!(["a"])).is_err());
        validate_chromium(&json!({"HomepageLocation": "https://example.org"})).unwrap();
        assert!(validate_chromium(&json!({"HomepageLocation": "javascript:alert(1)"})).is_err());
    }
}
