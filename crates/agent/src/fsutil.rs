//! Filesystem primitives shared by every materialiser: atomic writes and
//! the backup/restore pair that preserves pre-Bor file content.

use std::fs;
use std::io::Write;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use bor_domain::{Error, Result};

/// Sidecar suffix marking a managed file's preserved original.
pub const BACKUP_SUFFIX: &str = ".bor-backup";

/// Write `content` to `path` atomically.
///
/// The payload goes to a temporary file in the target directory, gets
/// chmodded to 0644, and is renamed onto the target — the rename is the
/// commit point. A failed write leaves no temp file behind.
pub fn atomic_write(path: &Path, content: &[u8]) -> Result<()> {
    let parent = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .ok_or_else(|| {
            Error::InvalidInput(format!("{} has no parent directory", path.display()))
        })?;
    if !parent.exists() {
        fs::create_dir_all(parent)?;
        fs::set_permissions(parent, fs::Permissions::from_mode(0o755))?;
    }

    // NamedTempFile removes itself on drop, covering every early return.
    let mut tmp = tempfile::NamedTempFile::new_in(parent)?;
    tmp.write_all(content)?;
    tmp.flush()?;
    tmp.as_file()
        .set_permissions(fs::Permissions::from_mode(0o644))?;
    tmp.persist(path)
        .map_err(|e| Error::Io(e.error))?;
    Ok(())
}

/// `<path>.bor-backup`
pub fn backup_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(BACKUP_SUFFIX);
    PathBuf::from(name)
}

/// Preserve the original content of `path` before its first managed
/// write.
///
/// An existing backup is never overwritten — after an agent restart the
/// sidecar still describes the true pre-Bor state. When no original
/// exists, a zero-length sentinel backup records "nothing was there".
pub fn ensure_backup(path: &Path) -> Result<()> {
    let backup = backup_path(path);
    if backup.exists() {
        return Ok(());
    }
    match fs::read(path) {
        Ok(content) => atomic_write(&backup, &content),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => atomic_write(&backup, b""),
        Err(e) => Err(e.into()),
    }
}

/// Undo management of `path` from its backup.
///
/// An empty sentinel backup deletes the managed file; a non-empty backup
/// rewrites the target with the original bytes. The backup itself is
/// removed either way. Returns `false` (a no-op) when no backup exists.
pub fn restore_backup(path: &Path) -> Result<bool> {
    let backup = backup_path(path);
    let content = match fs::read(&backup) {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(false),
        Err(e) => return Err(e.into()),
    };
    if content.is_empty() {
        match fs::remove_file(path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
    } else {
        atomic_write(path, &content)?;
    }
    fs::remove_file(&backup)?;
    Ok(true)
}
