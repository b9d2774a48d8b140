//! Firefox enterprise policies: one JSON document with a top-level
//! `policies` object, merged from every applicable policy.

use std::path::Path;

use serde_json::{json, Map, Value};

use bor_domain::config::FirefoxTarget;
use bor_domain::Result;

use crate::fsutil::{atomic_write, ensure_backup, restore_backup};
use crate::merge::deep_merge;

/// Marker placed in the managed file so administrators know its owner.
const MANAGED_COMMENT: &str =
    "This file is managed by Bor. Local changes will be overwritten.";

pub struct FirefoxMaterializer {
    target: FirefoxTarget,
}

impl FirefoxMaterializer {
    pub fn new(target: FirefoxTarget) -> Self {
        Self { target }
    }

    /// Merge the policy documents into the serialised file content.
    pub fn render(documents: &[Map<String, Value>]) -> Result<Vec<u8>> {
        let mut policies = Value::Object(Map::new());
        for document in documents {
            deep_merge(&mut policies, &Value::Object(document.clone()));
        }
        let file = json!({
            "_comment": MANAGED_COMMENT,
            "policies": policies,
        });
        let mut bytes = serde_json::to_vec_pretty(&file)?;
        bytes.push(b'\n');
        Ok(bytes)
    }

    /// Materialise the merged documents, or restore the original when no
    /// policy applies any more.
    pub fn apply(&self, documents: &[Map<String, Value>]) -> Result<()> {
        if documents.is_empty() {
            let restored = restore_backup(&self.target.policies_file)?;
            if restored {
                tracing::info!(
                    path = %self.target.policies_file.display(),
                    "firefox policies restored to pre-management state"
                );
            }
            if let Some(sandbox) = &self.target.sandbox_policies_file {
                remove_if_present(sandbox)?;
            }
            return Ok(());
        }

        let bytes = Self::render(documents)?;
        ensure_backup(&self.target.policies_file)?;
        atomic_write(&self.target.policies_file, &bytes)?;
        tracing::debug!(
            path = %self.target.policies_file.display(),
            policies = documents.len(),
            "firefox policies written"
        );

        // The sandbox copy is owned outright by Bor: no backup, deleted
        // on empty input above.
        if let Some(sandbox) = &self.target.sandbox_policies_file {
            atomic_write(sandbox, &bytes)?;
        }
        Ok(())
    }
}

fn remove_if_present(path: &Path) -> Result<()> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}
