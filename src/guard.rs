//! RAII scopes mirroring the original's two context managers: a path made
//! temporarily writable, restored on drop, and a "did this file change while
//! I was reading it" check.

use crate::error::{InventoryError, Result};
use log::warn;
use std::fs;
use std::os::unix::fs::{MetadataExt, PermissionsExt};
use std::path::{Path, PathBuf};

/// Temporarily ORs in the owner-write bit on `path`, restoring the original
/// mode when the guard is dropped. A no-op if the path doesn't exist.
///
/// ```no_run
/// # use crate::guard::WritableGuard;
/// # fn example() -> std::io::Result<()> {
/// let _guard = WritableGuard::new("/my/file")?;
/// std::fs::write("/my/file", b"foobar")?;
/// # Ok(())
/// # } // original mode restored here
/// ```
pub struct WritableGuard {
    path: Option<PathBuf>,
    original_mode: u32,
}

impl WritableGuard {
    pub fn new<P: AsRef<Path>>(path: P) -> std::io::Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Ok(Self {
                path: None,
                original_mode: 0,
            });
        }

        let metadata = fs::metadata(path)?;
        let original_mode = metadata.permissions().mode() & 0o7777;

        if original_mode & 0o200 == 0 {
            let mut perms = metadata.permissions();
            perms.set_mode(original_mode | 0o200);
            fs::set_permissions(path, perms)?;
        }

        Ok(Self {
            path: Some(path.to_path_buf()),
            original_mode,
        })
    }
}

impl Drop for WritableGuard {
    fn drop(&mut self) {
        if let Some(path) = &self.path {
            if let Err(e) = fs::set_permissions(path, fs::Permissions::from_mode(self.original_mode)) {
                warn!("failed to restore mode on {}: {e}", path.display());
            }
        }
    }
}

/// A snapshot of the identity-relevant metadata of a file (mtime, size,
/// inode, device), taken at construction and compared against the current
/// state in [`ChangeGuard::finish`].
///
/// Unlike [`WritableGuard`], the check can fail, so it's consumed explicitly
/// rather than relying on `Drop` (which can't return a `Result`). The `Drop`
/// impl only logs if `finish` was never called, e.g. because an earlier `?`
/// unwound past it.
pub struct ChangeGuard {
    path: PathBuf,
    before: Option<Stamp>,
    finished: bool,
}

#[derive(PartialEq, Eq)]
struct Stamp {
    mtime_ns: i64,
    size: i64,
    ino: u64,
    dev: u64,
}

impl Stamp {
    fn of(path: &Path) -> std::io::Result<Self> {
        let metadata = fs::metadata(path)?;
        Ok(Self {
            mtime_ns: metadata.mtime() * 1_000_000_000 + metadata.mtime_nsec(),
            size: metadata.size() as i64,
            ino: metadata.ino(),
            dev: metadata.dev(),
        })
    }
}

impl ChangeGuard {
    pub fn new<P: AsRef<Path>>(path: P) -> std::io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let before = Stamp::of(&path)?;
        Ok(Self {
            path,
            before: Some(before),
            finished: false,
        })
    }

    /// Compares the file's current metadata against the snapshot taken at
    /// construction. Returns [`InventoryError::FileChangedDuringRead`] if
    /// anything differs.
    pub fn finish(mut self) -> Result<()> {
        self.finished = true;
        let before = self.before.take().expect("Stamp taken at construction");
        let after = Stamp::of(&self.path)?;

        if before != after {
            return Err(InventoryError::FileChangedDuringRead { path: self.path.clone() }.into());
        }
        Ok(())
    }
}

impl Drop for ChangeGuard {
    fn drop(&mut self) {
        if !self.finished {
            warn!(
                "change guard for {} dropped without finish() being called",
                self.path.display()
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt as _;

    #[test]
    fn writable_guard_restores_mode() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ro.txt");
        fs::write(&path, b"x").unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o444)).unwrap();

        {
            let _guard = WritableGuard::new(&path).unwrap();
            let mode = fs::metadata(&path).unwrap().permissions().mode() & 0o7777;
            assert_eq!(mode, 0o644);
            fs::write(&path, b"updated").unwrap();
        }

        let mode = fs::metadata(&path).unwrap().permissions().mode() & 0o7777;
        assert_eq!(mode, 0o444);
    }

    #[test]
    fn writable_guard_is_noop_for_missing_path() {
        let guard = WritableGuard::new("/nonexistent/path/for/spare/tests");
        assert!(guard.is_ok());
    }

    #[test]
    fn change_guard_passes_when_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stable.txt");
        fs::write(&path, b"hello").unwrap();

        let guard = ChangeGuard::new(&path).unwrap();
        guard.finish().unwrap();
    }

    #[test]
    fn change_guard_fails_when_size_changes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mutating.txt");
        fs::write(&path, b"hello").unwrap();

        let guard = ChangeGuard::new(&path).unwrap();
        fs::write(&path, b"hello, much longer now").unwrap();
        assert!(guard.finish().is_err());
    }
}
