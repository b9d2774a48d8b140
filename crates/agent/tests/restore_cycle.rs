//! End-to-end materialise/restore cycles through the applier, driven by
//! the same stream messages the server would send.

use std::fs;
use std::path::Path;

use serde_json::json;

use bor_agent::materialize::PolicyApplier;
use bor_domain::config::{ChromiumTarget, FirefoxTarget, KconfigTarget, TargetsConfig};
use bor_domain::model::PolicyKind;
use bor_protocol::{PolicyUpdate, UpdateKind, WirePolicy};

fn targets(dir: &Path) -> TargetsConfig {
    TargetsConfig {
        firefox: FirefoxTarget {
            policies_file: dir.join("firefox/policies.json"),
            sandbox_policies_file: None,
        },
        chromium: ChromiumTarget {
            managed_dirs: vec![dir.join("chromium-managed")],
        },
        kconfig: KconfigTarget {
            overlay_dir: dir.join("overlay"),
            restrictions_paths: vec![dir.join("kderc")],
            profile_script: dir.join("profile.d/bor-xdg.sh"),
        },
    }
}

fn kconfig_policy(id: &str, entries: serde_json::Value) -> WirePolicy {
    WirePolicy {
        id: id.into(),
        name: format!("policy-{id}"),
        kind: PolicyKind::Kconfig,
        version: 1,
        priority: 0,
        content: entries,
    }
}

fn snapshot(policies: Vec<WirePolicy>, revision: u64) -> Vec<PolicyUpdate> {
    if policies.is_empty() {
        return vec![PolicyUpdate {
            kind: UpdateKind::Snapshot,
            policy: None,
            revision,
            snapshot_complete: true,
        }];
    }
    let last = policies.len() - 1;
    policies
        .into_iter()
        .enumerate()
        .map(|(i, policy)| PolicyUpdate {
            kind: UpdateKind::Snapshot,
            policy: Some(policy),
            revision,
            snapshot_complete: i == last,
        })
        .collect()
}

#[test]
fn unbind_restores_the_original_kdeglobals() {
    let dir = tempfile::tempdir().unwrap();
    let targets = targets(dir.path());
    let original = b"[General]\nfoo=bar\n";
    fs::create_dir_all(&targets.kconfig.overlay_dir).unwrap();
    fs::write(targets.kconfig.overlay_dir.join("kdeglobals"), original).unwrap();

    let mut applier = PolicyApplier::new(targets.clone());
    for update in snapshot(
        vec![kconfig_policy(
            "lockdown",
            json!([
                {"file": "kdeglobals", "group": "General", "key": "fixed", "value": "true", "immutable": true}
            ]),
        )],
        5,
    ) {
        applier.handle(&update).unwrap();
    }

    let managed_path = targets.kconfig.overlay_dir.join("kdeglobals");
    let managed = fs::read_to_string(&managed_path).unwrap();
    assert!(managed.starts_with("# This file is managed by Bor"));
    assert!(managed.contains("fixed=true"));
    assert_eq!(
        fs::read(targets.kconfig.overlay_dir.join("kdeglobals.bor-backup")).unwrap(),
        original
    );

    // Unbinding arrives as an empty resnapshot.
    for update in snapshot(vec![], 6) {
        applier.handle(&update).unwrap();
    }
    assert_eq!(fs::read(&managed_path).unwrap(), original);
    assert!(!targets
        .kconfig
        .overlay_dir
        .join("kdeglobals.bor-backup")
        .exists());
}

#[test]
fn a_policy_swap_restores_files_that_fell_out_of_scope() {
    let dir = tempfile::tempdir().unwrap();
    let targets = targets(dir.path());
    let mut applier = PolicyApplier::new(targets.clone());

    for update in snapshot(
        vec![kconfig_policy(
            "input",
            json!([
                {"file": "kcminputrc", "group": "Mouse", "key": "cursorTheme", "value": "breeze", "immutable": false}
            ]),
        )],
        1,
    ) {
        applier.handle(&update).unwrap();
    }
    assert!(targets.kconfig.overlay_dir.join("kcminputrc").exists());

    // A later snapshot covers a different file; kcminputrc had no
    // original, so it disappears.
    for update in snapshot(
        vec![kconfig_policy(
            "screen",
            json!([
                {"file": "kscreenlockerrc", "group": "Daemon", "key": "Timeout", "value": "5", "immutable": true}
            ]),
        )],
        2,
    ) {
        applier.handle(&update).unwrap();
    }
    assert!(!targets.kconfig.overlay_dir.join("kcminputrc").exists());
    assert!(targets.kconfig.overlay_dir.join("kscreenlockerrc").exists());
}

#[test]
fn browser_targets_clean_up_on_empty_snapshot() {
    let dir = tempfile::tempdir().unwrap();
    let targets = targets(dir.path());
    let mut applier = PolicyApplier::new(targets.clone());

    let firefox = WirePolicy {
        id: "ff".into(),
        name: "firefox-lockdown".into(),
        kind: PolicyKind::Firefox,
        version: 1,
        priority: 0,
        content: json!({"DisableTelemetry": true}),
    };
    let chromium = WirePolicy {
        id: "cr".into(),
        name: "chromium-lockdown".into(),
        kind: PolicyKind::Chromium,
        version: 1,
        priority: 0,
        content: json!({"MetricsReportingEnabled": false}),
    };
    for update in snapshot(vec![firefox, chromium], 3) {
        applier.handle(&update).unwrap();
    }

    let firefox_file = &targets.firefox.policies_file;
    let chromium_file = targets.chromium.managed_dirs[0].join("bor_policy.json");
    assert!(firefox_file.exists());
    assert!(chromium_file.exists());
    // No original existed: the firefox backup is the empty sentinel.
    let backup = firefox_file.with_file_name("policies.json.bor-backup");
    assert_eq!(fs::read(&backup).unwrap(), b"");

    for update in snapshot(vec![], 4) {
        applier.handle(&update).unwrap();
    }
    assert!(!firefox_file.exists());
    assert!(!chromium_file.exists());
    assert!(!backup.exists());
}
