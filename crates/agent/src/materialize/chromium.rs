//! Chromium-family managed policies: one Bor-owned JSON file per managed
//! policy directory.
//!
//! Chromium warns on unknown keys, so the file carries no comment marker;
//! ownership is expressed by the fixed file name alone. No backup/restore
//! either — the managed file exists only while Bor policies apply.

use std::path::{Path, PathBuf};

use serde_json::{Map, Value};

use bor_domain::config::ChromiumTarget;
use bor_domain::Result;

use crate::fsutil::atomic_write;
use crate::merge::deep_merge;

/// File name Bor owns inside each managed-policy directory.
pub const MANAGED_FILE_NAME: &str = "bor_policy.json";

pub struct ChromiumMaterializer {
    target: ChromiumTarget,
}

impl ChromiumMaterializer {
    pub fn new(target: ChromiumTarget) -> Self {
        Self { target }
    }

    /// Merge the policy documents into the serialised file content.
    pub fn render(documents: &[Map<String, Value>]) -> Result<Vec<u8>> {
        let mut merged = Value::Object(Map::new());
        for document in documents {
            deep_merge(&mut merged, &Value::Object(document.clone()));
        }
        let mut bytes = serde_json::to_vec_pretty(&merged)?;
        bytes.push(b'\n');
        Ok(bytes)
    }

    pub fn apply(&self, documents: &[Map<String, Value>]) -> Result<()> {
        if documents.is_empty() {
            for dir in &self.target.managed_dirs {
                remove_if_present(&managed_file(dir))?;
            }
            return Ok(());
        }

        let bytes = Self::render(documents)?;
        for dir in &self.target.managed_dirs {
            atomic_write(&managed_file(dir), &bytes)?;
        }
        tracing::debug!(
            dirs = self.target.managed_dirs.len(),
            policies = documents.len(),
            "chromium policies written"
        );
        Ok(())
    }
}

fn managed_file(dir: &Path) -> PathBuf {
    dir.join(MANAGED_FILE_NAME)
}

fn remove_if_present(path: &Path) -> Result<()> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}
