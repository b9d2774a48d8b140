//! KDE keyed-INI materialisation.
//!
//! Entries from all applicable policies are grouped per file and INI
//! group, rendered deterministically, and written into the overlay
//! directory that a login-profile script prepends to `XDG_CONFIG_DIRS`.
//! Action-restriction entries are split out to the system-wide files KDE
//! consults directly. Every managed file is backed up before its first
//! overwrite and restored once no policy covers it.

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::PathBuf;
use std::sync::OnceLock;

use regex::Regex;

use bor_domain::config::KconfigTarget;
use bor_domain::Result;
use bor_protocol::KconfigEntry;

use crate::fsutil::{atomic_write, ensure_backup, restore_backup, BACKUP_SUFFIX};

/// Group whose `rule_N` keys are renumbered across policies.
pub const URL_RESTRICTIONS_GROUP: &str = "KDE URL Restrictions";
/// File/group pair mirrored into the system-wide restriction files.
pub const RESTRICTIONS_FILE: &str = "kdeglobals";
pub const RESTRICTIONS_GROUP: &str = "KDE Action Restrictions";

/// Two-line ownership header on every managed keyed-INI file.
const MANAGED_HEADER: &str = "# This file is managed by Bor; local changes will be overwritten.\n\
     # Unbind the policy on the Bor server to release it.\n";

fn rule_regex() -> &'static Regex {
    static RULE: OnceLock<Regex> = OnceLock::new();
    RULE.get_or_init(|| Regex::new(r"^rule_(\d+)$").expect("static regex"))
}

pub struct KconfigMaterializer {
    target: KconfigTarget,
}

impl KconfigMaterializer {
    pub fn new(target: KconfigTarget) -> Self {
        Self { target }
    }

    /// Materialise `entries`; an empty set restores every managed file.
    pub fn apply(&self, entries: &[KconfigEntry]) -> Result<()> {
        let (restrictions, overlay): (Vec<KconfigEntry>, Vec<KconfigEntry>) = entries
            .iter()
            .cloned()
            .partition(|e| e.file == RESTRICTIONS_FILE && e.group == RESTRICTIONS_GROUP);

        // ── Overlay files ────────────────────────────────────────────
        let rendered = render_files(&overlay);
        for (name, bytes) in &rendered {
            let path = self.target.overlay_dir.join(name);
            ensure_backup(&path)?;
            atomic_write(&path, &with_header(bytes))?;
        }
        // Previously managed files with no counterpart in the desired
        // set go back to their originals.
        for managed in self.managed_overlay_files()? {
            let name = managed
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            if !rendered.contains_key(&name) {
                restore_backup(&managed)?;
                tracing::info!(path = %managed.display(), "keyed-INI file restored");
            }
        }

        // ── System-wide restriction files ────────────────────────────
        if restrictions.is_empty() {
            for path in &self.target.restrictions_paths {
                restore_backup(path)?;
            }
        } else {
            let files = render_files(&restrictions);
            if let Some(bytes) = files.get(RESTRICTIONS_FILE) {
                for path in &self.target.restrictions_paths {
                    ensure_backup(path)?;
                    atomic_write(path, &with_header(bytes))?;
                }
            }
        }

        // ── Login-profile script ─────────────────────────────────────
        if entries.is_empty() {
            self.remove_profile_script()?;
        } else {
            self.ensure_profile_script()?;
        }
        Ok(())
    }

    /// Managed overlay files, discovered through their backup sidecars.
    fn managed_overlay_files(&self) -> Result<Vec<PathBuf>> {
        let mut managed = Vec::new();
        let dir = match fs::read_dir(&self.target.overlay_dir) {
            Ok(dir) => dir,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(managed),
            Err(e) => return Err(e.into()),
        };
        for entry in dir {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if let Some(stem) = name.strip_suffix(BACKUP_SUFFIX) {
                managed.push(self.target.overlay_dir.join(stem));
            }
        }
        managed.sort();
        Ok(managed)
    }

    /// Keep the profile script exporting the overlay onto the XDG search
    /// path. Rewritten only when its content drifts, then made
    /// executable.
    fn ensure_profile_script(&self) -> Result<()> {
        let desired = format!(
            "#!/bin/sh\n\
             # Managed by Bor: prepends the policy overlay to the XDG config path.\n\
             XDG_CONFIG_DIRS=\"{}:${{XDG_CONFIG_DIRS:-/etc/xdg}}\"\n\
             export XDG_CONFIG_DIRS\n",
            self.target.overlay_dir.display()
        );
        let current = fs::read_to_string(&self.target.profile_script).unwrap_or_default();
        if current != desired {
            atomic_write(&self.target.profile_script, desired.as_bytes())?;
        }
        fs::set_permissions(
            &self.target.profile_script,
            fs::Permissions::from_mode(0o755),
        )?;
        Ok(())
    }

    fn remove_profile_script(&self) -> Result<()> {
        match fs::remove_file(&self.target.profile_script) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Rendering
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Render the entries into per-file bytes, keyed by file name.
///
/// Output is byte-stable: file names and group names sort
/// lexicographically, keys sort within a group, and the URL-restriction
/// renumbering is a stable sort over the entries' arrival order.
pub fn render_files(entries: &[KconfigEntry]) -> BTreeMap<String, Vec<u8>> {
    let mut by_file: BTreeMap<String, Vec<KconfigEntry>> = BTreeMap::new();
    for entry in entries {
        by_file.entry(entry.file.clone()).or_default().push(entry.clone());
    }
    by_file
        .into_iter()
        .map(|(name, entries)| (name, render_file(entries)))
        .collect()
}

fn render_file(entries: Vec<KconfigEntry>) -> Vec<u8> {
    // Group by INI group, keeping first-appearance order — the
    // renumbering below depends on arrival order for its tie-break.
    let mut group_names: Vec<String> = Vec::new();
    let mut groups: HashMap<String, Vec<KconfigEntry>> = HashMap::new();
    for entry in entries {
        if !groups.contains_key(&entry.group) {
            group_names.push(entry.group.clone());
        }
        groups.entry(entry.group.clone()).or_default().push(entry);
    }

    group_names.sort();
    let mut out = String::new();
    for (i, name) in group_names.iter().enumerate() {
        if i > 0 {
            out.push('\n');
        }
        let mut group_entries = groups.remove(name).unwrap_or_default();
        if name == URL_RESTRICTIONS_GROUP {
            group_entries = renumber_url_rules(group_entries);
        } else {
            group_entries.sort_by(|a, b| a.key.cmp(&b.key));
        }
        render_group(name, &group_entries, &mut out);
    }
    out.into_bytes()
}

/// Rewrite `rule_N` keys to a dense sequence.
///
/// Incoming `rule_count` entries are dropped and recomputed. The stable
/// sort by the original N keeps rules that collide across policies in
/// their arrival order, so two policies both starting at `rule_1`
/// interleave rather than clobber.
fn renumber_url_rules(entries: Vec<KconfigEntry>) -> Vec<KconfigEntry> {
    let template = match entries.first() {
        Some(first) => first.clone(),
        None => return entries,
    };

    let mut rules: Vec<(u64, KconfigEntry)> = Vec::new();
    let mut others: Vec<KconfigEntry> = Vec::new();
    for entry in entries {
        if entry.key == "rule_count" {
            continue;
        }
        match rule_regex()
            .captures(&entry.key)
            .and_then(|caps| caps[1].parse::<u64>().ok())
        {
            Some(n) => rules.push((n, entry)),
            None => others.push(entry),
        }
    }
    rules.sort_by_key(|(n, _)| *n);
    others.sort_by(|a, b| a.key.cmp(&b.key));

    let count = rules.len();
    let mut result = others;
    for (i, (_, mut rule)) in rules.into_iter().enumerate() {
        rule.key = format!("rule_{}", i + 1);
        result.push(rule);
    }
    result.push(KconfigEntry {
        file: template.file,
        group: template.group,
        key: "rule_count".into(),
        value: count.to_string(),
        immutable: template.immutable,
    });
    result
}

/// A fully enforced group gets the `[$i]` marker on its header; a mixed
/// group keeps a plain header and marks individual keys.
fn render_group(name: &str, entries: &[KconfigEntry], out: &mut String) {
    let all_immutable = !entries.is_empty() && entries.iter().all(|e| e.immutable);
    if all_immutable {
        out.push_str(&format!("[{name}][$i]\n"));
    } else {
        out.push_str(&format!("[{name}]\n"));
    }
    for entry in entries {
        if entry.immutable && !all_immutable {
            out.push_str(&format!("{}[$i]={}\n", entry.key, entry.value));
        } else {
            out.push_str(&format!("{}={}\n", entry.key, entry.value));
        }
    }
}

fn with_header(bytes: &[u8]) -> Vec<u8> {
    let mut content = MANAGED_HEADER.as_bytes().to_vec();
    content.extend_from_slice(bytes);
    content
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(file: &str, group: &str, key: &str, value: &str, immutable: bool) -> KconfigEntry {
        KconfigEntry {
            file: file.into(),
            group: group.into(),
            key: key.into(),
            value: value.into(),
            immutable,
        }
    }

    #[test]
    fn groups_and_keys_render_sorted() {
        let files = render_files(&[
            entry("kdeglobals", "Zeta", "b", "2", false),
            entry("kdeglobals", "Alpha", "y", "25", false),
            entry("kdeglobals", "Zeta", "a", "1", false),
            entry("kdeglobals", "Alpha", "x", "24", false),
        ]);
        let text = String::from_utf8(files["kdeglobals"].clone()).unwrap();
        assert_eq!(text, "[Alpha]\nx=24\ny=25\n\n[Zeta]\na=1\nb=2\n");
    }

    #[test]
    fn fully_enforced_group_marks_the_header() {
        let files = render_files(&[
            entry("kdeglobals", "General", "a", "1", true),
            entry("kdeglobals", "General", "b", "2", true),
        ]);
        let text = String::from_utf8(files["kdeglobals"].clone()).unwrap();
        assert_eq!(text, "[General][$i]\na=1\nb=2\n");
    }

    #[test]
    fn mixed_enforcement_marks_individual_keys() {
        let files = render_files(&[
            entry("kdeglobals", "General", "locked", "1", true),
            entry("kdeglobals", "General", "free", "2", false),
        ]);
        let text = String::from_utf8(files["kdeglobals"].clone()).unwrap();
        assert_eq!(text, "[General]\nfree=2\nlocked[$i]=1\n");
    }

    #[test]
    fn url_rules_renumber_across_policies() {
        // Two policies each contribute rule_1 and rule_2; arrival order
        // is policy A then policy B.
        let files = render_files(&[
            entry("kdeglobals", URL_RESTRICTIONS_GROUP, "rule_1", "A-first", true),
            entry("kdeglobals", URL_RESTRICTIONS_GROUP, "rule_2", "A-second", true),
            entry("kdeglobals", URL_RESTRICTIONS_GROUP, "rule_1", "B-first", true),
            entry("kdeglobals", URL_RESTRICTIONS_GROUP, "rule_2", "B-second", true),
        ]);
        let text = String::from_utf8(files["kdeglobals"].clone()).unwrap();
        assert_eq!(
            text,
            format!(
                "[{URL_RESTRICTIONS_GROUP}][$i]\n\
                 rule_1=A-first\n\
                 rule_2=B-first\n\
                 rule_3=A-second\n\
                 rule_4=B-second\n\
                 rule_count=4\n"
            )
        );
    }

    #[test]
    fn incoming_rule_count_is_dropped_and_recomputed() {
        let files = render_files(&[
            entry("kdeglobals", URL_RESTRICTIONS_GROUP, "rule_count", "7", true),
            entry("kdeglobals", URL_RESTRICTIONS_GROUP, "rule_1", "only", true),
        ]);
        let text = String::from_utf8(files["kdeglobals"].clone()).unwrap();
        assert!(text.contains("rule_count=1\n"));
        assert!(!text.contains("rule_count=7"));
    }

    #[test]
    fn rendering_is_byte_stable() {
        let entries = vec![
            entry("kdeglobals", "B", "k", "v", false),
            entry("kcminputrc", "A", "k2", "v2", true),
        ];
        assert_eq!(render_files(&entries), render_files(&entries));
    }

    #[test]
    fn apply_writes_headers_and_restores_on_empty() {
        let dir = tempfile::tempdir().unwrap();
        let target = KconfigTarget {
            overlay_dir: dir.path().join("overlay"),
            restrictions_paths: vec![dir.path().join("kderc")],
            profile_script: dir.path().join("profile.sh"),
        };
        let materializer = KconfigMaterializer::new(target.clone());

        materializer
            .apply(&[entry("kcminputrc", "Mouse", "cursorTheme", "breeze", true)])
            .unwrap();

        let managed = target.overlay_dir.join("kcminputrc");
        let text = fs::read_to_string(&managed).unwrap();
        assert!(text.starts_with("# This file is managed by Bor"));
        assert!(text.contains("[Mouse][$i]\ncursorTheme=breeze\n"));
        // The original never existed: sentinel backup.
        assert_eq!(fs::read(managed.with_file_name("kcminputrc.bor-backup")).unwrap(), b"");
        assert!(target.profile_script.exists());

        materializer.apply(&[]).unwrap();
        assert!(!managed.exists());
        assert!(!target.profile_script.exists());
    }

    #[test]
    fn restrictions_split_to_system_paths() {
        let dir = tempfile::tempdir().unwrap();
        let kderc = dir.path().join("kderc");
        let xdg_globals = dir.path().join("xdg/kdeglobals");
        fs::write(&kderc, b"[Old]\nkeep=me\n").unwrap();

        let target = KconfigTarget {
            overlay_dir: dir.path().join("overlay"),
            restrictions_paths: vec![kderc.clone(), xdg_globals.clone()],
            profile_script: dir.path().join("profile.sh"),
        };
        let materializer = KconfigMaterializer::new(target);

        materializer
            .apply(&[
                entry("kdeglobals", RESTRICTIONS_GROUP, "action/shell_access", "false", true),
                entry("kdeglobals", "General", "fixed", "true", true),
            ])
            .unwrap();

        // Restriction entries landed in both system paths.
        for path in [&kderc, &xdg_globals] {
            let text = fs::read_to_string(path).unwrap();
            assert!(text.contains(&format!("[{RESTRICTIONS_GROUP}][$i]")));
            assert!(text.contains("action/shell_access=false"));
            assert!(!text.contains("fixed=true"));
        }
        // The non-restriction kdeglobals group went to the overlay.
        let overlay_text =
            fs::read_to_string(dir.path().join("overlay/kdeglobals")).unwrap();
        assert!(overlay_text.contains("fixed=true"));
        assert!(!overlay_text.contains("shell_access"));

        // Unbinding restores the pre-Bor kderc exactly.
        materializer.apply(&[]).unwrap();
        assert_eq!(fs::read(&kderc).unwrap(), b"[Old]\nkeep=me\n");
        assert!(!xdg_globals.exists());
    }

    #[test]
    fn profile_script_is_rewritten_only_on_drift() {
        let dir = tempfile::tempdir().unwrap();
        let target = KconfigTarget {
            overlay_dir: dir.path().join("overlay"),
            restrictions_paths: vec![],
            profile_script: dir.path().join("profile.sh"),
        };
        let materializer = KconfigMaterializer::new(target.clone());
        let entries = [entry("kdeglobals", "General", "k", "v", false)];

        materializer.apply(&entries).unwrap();
        let first = fs::metadata(&target.profile_script).unwrap().modified().unwrap();
        let mode = fs::metadata(&target.profile_script).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o755);

        materializer.apply(&entries).unwrap();
        let second = fs::metadata(&target.profile_script).unwrap().modified().unwrap();
        assert_eq!(first, second);
    }
}
