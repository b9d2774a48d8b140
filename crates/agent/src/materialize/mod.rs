//! Per-target materialisers and the applier that feeds them.
//!
//! The applier owns the agent's in-memory view of applicable policies.
//! Stream updates mutate that view; after each mutation the affected
//! target kinds are re-materialised from the full set, so disk state is
//! always a pure function of the current policy set.

pub mod chromium;
pub mod firefox;
pub mod kconfig;

pub use chromium::ChromiumMaterializer;
pub use firefox::FirefoxMaterializer;
pub use kconfig::KconfigMaterializer;

use std::collections::{BTreeSet, HashMap};

use serde_json::{Map, Value};

use bor_domain::config::TargetsConfig;
use bor_domain::model::PolicyKind;
use bor_domain::Result;
use bor_protocol::{KconfigEntry, PolicyContent, PolicyUpdate, UpdateKind, WirePolicy};

/// What handling one stream update did.
#[derive(Debug, Default)]
pub struct ApplyOutcome {
    /// Target kinds whose files were re-materialised.
    pub changed_kinds: Vec<PolicyKind>,
    /// The server asked for fresh node facts.
    pub metadata_requested: bool,
}

pub struct PolicyApplier {
    firefox: FirefoxMaterializer,
    chromium: ChromiumMaterializer,
    kconfig: KconfigMaterializer,
    policies: HashMap<String, WirePolicy>,
    /// Buffer for an in-flight snapshot run.
    pending_snapshot: Option<Vec<WirePolicy>>,
    initial_synced: bool,
}

impl PolicyApplier {
    pub fn new(targets: TargetsConfig) -> Self {
        Self {
            firefox: FirefoxMaterializer::new(targets.firefox),
            chromium: ChromiumMaterializer::new(targets.chromium),
            kconfig: KconfigMaterializer::new(targets.kconfig),
            policies: HashMap::new(),
            pending_snapshot: None,
            initial_synced: false,
        }
    }

    /// The policies currently held for a kind, in delegation order
    /// (priority descending, then name).
    pub fn policies_of_kind(&self, kind: PolicyKind) -> Vec<&WirePolicy> {
        let mut of_kind: Vec<&WirePolicy> = self
            .policies
            .values()
            .filter(|p| p.kind == kind)
            .collect();
        of_kind.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then_with(|| a.name.cmp(&b.name))
        });
        of_kind
    }

    /// Feed one stream update through the set and the materialisers.
    pub fn handle(&mut self, update: &PolicyUpdate) -> Result<ApplyOutcome> {
        match update.kind {
            UpdateKind::MetadataRequest => Ok(ApplyOutcome {
                metadata_requested: true,
                ..Default::default()
            }),
            UpdateKind::Snapshot => {
                let pending = self.pending_snapshot.get_or_insert_with(Vec::new);
                if let Some(policy) = &update.policy {
                    pending.push(policy.clone());
                }
                if !update.snapshot_complete {
                    return Ok(ApplyOutcome::default());
                }

                let fresh: HashMap<String, WirePolicy> = self
                    .pending_snapshot
                    .take()
                    .unwrap_or_default()
                    .into_iter()
                    .map(|p| (p.id.clone(), p))
                    .collect();

                let mut changed: Vec<PolicyKind> = Vec::new();
                for kind in [PolicyKind::Firefox, PolicyKind::Chromium, PolicyKind::Kconfig] {
                    // The first snapshot applies everything so files left
                    // over from a previous agent run get reconciled.
                    if !self.initial_synced
                        || fingerprint(&self.policies, kind) != fingerprint(&fresh, kind)
                    {
                        changed.push(kind);
                    }
                }
                self.policies = fresh;
                self.initial_synced = true;
                for kind in &changed {
                    self.apply_kind(*kind)?;
                }
                Ok(ApplyOutcome {
                    changed_kinds: changed,
                    ..Default::default()
                })
            }
            UpdateKind::Created | UpdateKind::Updated => {
                let Some(policy) = &update.policy else {
                    return Ok(ApplyOutcome::default());
                };
                let kind = policy.kind;
                self.policies.insert(policy.id.clone(), policy.clone());
                self.apply_kind(kind)?;
                Ok(ApplyOutcome {
                    changed_kinds: vec![kind],
                    ..Default::default()
                })
            }
            UpdateKind::Deleted => {
                let Some(policy) = &update.policy else {
                    return Ok(ApplyOutcome::default());
                };
                let kind = policy.kind;
                self.policies.remove(&policy.id);
                self.apply_kind(kind)?;
                Ok(ApplyOutcome {
                    changed_kinds: vec![kind],
                    ..Default::default()
                })
            }
        }
    }

    fn apply_kind(&self, kind: PolicyKind) -> Result<()> {
        let ordered = self.policies_of_kind(kind);
        match kind {
            // Deep-merge lets later documents overwrite, so browsers get
            // the delegation order reversed: the highest-priority policy
            // merges last and wins conflicts.
            PolicyKind::Firefox => {
                let mut documents = browser_documents(&ordered);
                documents.reverse();
                self.firefox.apply(&documents)
            }
            PolicyKind::Chromium => {
                let mut documents = browser_documents(&ordered);
                documents.reverse();
                self.chromium.apply(&documents)
            }
            PolicyKind::Kconfig => self.kconfig.apply(&kconfig_entries(&ordered)),
        }
    }
}

fn browser_documents(policies: &[&WirePolicy]) -> Vec<Map<String, Value>> {
    policies
        .iter()
        .filter_map(|policy| match policy.typed_content() {
            Ok(PolicyContent::Firefox(map)) | Ok(PolicyContent::Chromium(map)) => Some(map),
            Ok(PolicyContent::Kconfig(_)) => None,
            Err(e) => {
                tracing::warn!(policy = %policy.name, error = %e, "skipping malformed policy");
                None
            }
        })
        .collect()
}

fn kconfig_entries(policies: &[&WirePolicy]) -> Vec<KconfigEntry> {
    let mut entries = Vec::new();
    for policy in policies {
        match policy.typed_content() {
            Ok(PolicyContent::Kconfig(list)) => entries.extend(list),
            Ok(_) => {}
            Err(e) => {
                tracing::warn!(policy = %policy.name, error = %e, "skipping malformed policy");
            }
        }
    }
    entries
}

fn fingerprint(
    policies: &HashMap<String, WirePolicy>,
    kind: PolicyKind,
) -> BTreeSet<(String, i64, i64)> {
    policies
        .values()
        .filter(|p| p.kind == kind)
        .map(|p| (p.id.clone(), p.version, p.priority))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use bor_domain::config::{ChromiumTarget, FirefoxTarget, KconfigTarget};
    use serde_json::json;
    use std::path::Path;

    fn targets(dir: &Path) -> TargetsConfig {
        TargetsConfig {
            firefox: FirefoxTarget {
                policies_file: dir.join("firefox/policies.json"),
                sandbox_policies_file: None,
            },
            chromium: ChromiumTarget {
                managed_dirs: vec![dir.join("chromium")],
            },
            kconfig: KconfigTarget {
                overlay_dir: dir.join("overlay"),
                restrictions_paths: vec![dir.join("kderc")],
                profile_script: dir.join("profile.sh"),
            },
        }
    }

    fn wire(id: &str, kind: PolicyKind, priority: i64, content: Value) -> WirePolicy {
        WirePolicy {
            id: id.into(),
            name: format!("policy-{id}"),
            kind,
            version: 1,
            priority,
            content,
        }
    }

    fn snapshot_message(policy: Option<WirePolicy>, complete: bool) -> PolicyUpdate {
        PolicyUpdate {
            kind: UpdateKind::Snapshot,
            policy,
            revision: 1,
            snapshot_complete: complete,
        }
    }

    #[test]
    fn empty_snapshot_marker_completes_initial_sync() {
        let dir = tempfile::tempdir().unwrap();
        let mut applier = PolicyApplier::new(targets(dir.path()));
        let outcome = applier.handle(&snapshot_message(None, true)).unwrap();
        // First sync reconciles every target even with nothing held.
        assert_eq!(outcome.changed_kinds.len(), 3);
        assert!(!dir.path().join("firefox/policies.json").exists());
    }

    #[test]
    fn snapshot_run_buffers_until_complete() {
        let dir = tempfile::tempdir().unwrap();
        let mut applier = PolicyApplier::new(targets(dir.path()));

        let first = applier
            .handle(&snapshot_message(
                Some(wire("a", PolicyKind::Firefox, 5, json!({"DisablePocket": true}))),
                false,
            ))
            .unwrap();
        assert!(first.changed_kinds.is_empty());
        assert!(!dir.path().join("firefox/policies.json").exists());

        applier
            .handle(&snapshot_message(
                Some(wire("b", PolicyKind::Firefox, 1, json!({"DisableTelemetry": true}))),
                true,
            ))
            .unwrap();
        let text =
            std::fs::read_to_string(dir.path().join("firefox/policies.json")).unwrap();
        assert!(text.contains("DisablePocket"));
        assert!(text.contains("DisableTelemetry"));
    }

    #[test]
    fn delta_events_mutate_the_held_set() {
        let dir = tempfile::tempdir().unwrap();
        let mut applier = PolicyApplier::new(targets(dir.path()));
        applier.handle(&snapshot_message(None, true)).unwrap();

        let policy = wire("a", PolicyKind::Chromium, 0, json!({"ShowHomeButton": true}));
        applier
            .handle(&PolicyUpdate {
                kind: UpdateKind::Created,
                policy: Some(policy.clone()),
                revision: 2,
                snapshot_complete: false,
            })
            .unwrap();
        let managed = dir.path().join("chromium").join(chromium::MANAGED_FILE_NAME);
        assert!(managed.exists());

        applier
            .handle(&PolicyUpdate {
                kind: UpdateKind::Deleted,
                policy: Some(policy),
                revision: 3,
                snapshot_complete: false,
            })
            .unwrap();
        assert!(!managed.exists());
    }

    #[test]
    fn unchanged_snapshot_touches_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let mut applier = PolicyApplier::new(targets(dir.path()));
        let policy = wire("a", PolicyKind::Firefox, 3, json!({"DisablePocket": true}));

        applier
            .handle(&snapshot_message(Some(policy.clone()), true))
            .unwrap();
        // A resync snapshot with the identical set re-materialises no
        // target.
        let outcome = applier
            .handle(&snapshot_message(Some(policy), true))
            .unwrap();
        assert!(outcome.changed_kinds.is_empty());
    }

    #[test]
    fn metadata_request_is_surfaced_not_applied() {
        let dir = tempfile::tempdir().unwrap();
        let mut applier = PolicyApplier::new(targets(dir.path()));
        let outcome = applier
            .handle(&PolicyUpdate {
                kind: UpdateKind::MetadataRequest,
                policy: None,
                revision: 5,
                snapshot_complete: false,
            })
            .unwrap();
        assert!(outcome.metadata_requested);
        assert!(outcome.changed_kinds.is_empty());
    }

    #[test]
    fn higher_priority_policy_wins_merge_conflicts() {
        let dir = tempfile::tempdir().unwrap();
        let mut applier = PolicyApplier::new(targets(dir.path()));
        applier
            .handle(&snapshot_message(
                Some(wire("low", PolicyKind::Firefox, 1, json!({"HomepageURL": "https://low.example"}))),
                false,
            ))
            .unwrap();
        applier
            .handle(&snapshot_message(
                Some(wire("high", PolicyKind::Firefox, 9, json!({"HomepageURL": "https://high.example"}))),
                true,
            ))
            .unwrap();

        let text =
            std::fs::read_to_string(dir.path().join("firefox/policies.json")).unwrap();
        assert!(text.contains("https://high.example"));
        assert!(!text.contains("https://low.example"));
    }
}
