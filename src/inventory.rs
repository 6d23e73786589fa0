//! # Inventory
//!
//! Walks a local path and produces two maps: `structure`, every path's
//! metadata needed to rebuild the directory tree, and `files`, a dedup map
//! from content digest to the (possibly several) paths that share it.
//!
//! A scan is a snapshot, not a transaction — the tree can change underneath
//! it. [`crate::guard::ChangeGuard`] catches the file-changed-during-read
//! case; everything else (deleted files, racing writers) is surfaced by the
//! upload step that follows.

use crate::error::{InventoryError, Result};
use crate::guard::ChangeGuard;
use crate::hasher::{hash_file, Digest};
use log::warn;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::fs;
use std::os::unix::fs::{FileTypeExt, MetadataExt};
use std::path::{Path, PathBuf};

/// One entry in the structure map: everything needed to recreate a path
/// (minus its content, which lives in `files`).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Entry {
    Directory(Stat),
    Symlink {
        target: String,
        #[serde(flatten)]
        stat: Stat,
    },
    File {
        empty: bool,
        #[serde(flatten)]
        stat: Stat,
    },
}

/// Cached `stat(2)` fields, resolved to names rather than raw ids so a
/// restore onto a different machine can still make a best effort.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Stat {
    pub user: String,
    pub group: String,
    pub mode: u32,
    pub size: u64,
    pub mtime_ns: i64,
    pub inode: u64,
}

/// The result of one scan: a structure map and a content-dedup map.
#[derive(Debug, Default)]
pub struct Inventory {
    root: PathBuf,
    skip: Option<Regex>,
    pub structure: HashMap<String, Entry>,
    pub files: HashMap<Digest, Vec<String>>,
    users: HashMap<u32, String>,
    groups: HashMap<u32, String>,
}

impl Inventory {
    pub fn new(root: impl Into<PathBuf>, skip: &[String]) -> Self {
        let root = root.into();
        let skip = if skip.is_empty() {
            None
        } else {
            let pattern = skip
                .iter()
                .map(|p| p.trim_start_matches("./"))
                .collect::<Vec<_>>()
                .join("|");
            Regex::new(&format!("^({pattern})")).ok()
        };

        Self {
            root,
            skip,
            structure: HashMap::new(),
            files: HashMap::new(),
            users: build_user_cache(),
            groups: build_group_cache(),
        }
    }

    /// `hostname:abs_path:root_inode` — used to confirm a restore target or
    /// existing bucket belongs to the same source tree it was last backed
    /// up from.
    pub fn identity(&self) -> Result<String> {
        let meta = fs::metadata(&self.root)?;
        Ok(format!(
            "{}:{}:{}",
            hostname(),
            self.root.display(),
            meta.ino()
        ))
    }

    pub fn clear(&mut self) {
        self.structure.clear();
        self.files.clear();
    }

    pub fn scan(&mut self) -> Result<()> {
        self.clear();

        let root_meta = fs::symlink_metadata(&self.root)?;
        if root_meta.is_dir() {
            self.scan_directory(self.root.clone())?;
        } else {
            self.scan_entry(self.root.clone())?;
        }
        Ok(())
    }

    fn scan_directory(&mut self, root: PathBuf) -> Result<()> {
        let mut unscanned: VecDeque<PathBuf> = VecDeque::from([root]);

        while let Some(dir) = unscanned.pop_front() {
            let entries = match fs::read_dir(&dir) {
                Ok(entries) => entries,
                Err(e) => {
                    warn!("failed to read directory {}: {e}", dir.display());
                    continue;
                }
            };

            for entry in entries {
                let entry = match entry {
                    Ok(e) => e,
                    Err(e) => {
                        warn!("failed to read a directory entry in {}: {e}", dir.display());
                        continue;
                    }
                };
                let path = entry.path();

                if let Some(push_back) = self.scan_entry(path.clone())? {
                    unscanned.push_back(push_back);
                }

                let file_type = entry.file_type()?;
                if file_type.is_dir() {
                    unscanned.push_back(path);
                }
            }
        }
        Ok(())
    }

    pub fn absolute_path(&self, relative: &str) -> PathBuf {
        self.root.join(relative)
    }

    fn relative(&self, path: &Path) -> String {
        path.strip_prefix(&self.root)
            .unwrap_or(path)
            .to_string_lossy()
            .into_owned()
    }

    /// Processes one path. Returns `Some(path)` when an externally-located
    /// symlink resolves to a directory that should itself be scanned.
    fn scan_entry(&mut self, path: PathBuf) -> Result<Option<PathBuf>> {
        if let Some(skip) = &self.skip {
            if skip.is_match(&self.relative(&path)) {
                return Ok(None);
            }
        }

        let status = fs::symlink_metadata(&path)?;
        let file_type = status.file_type();

        if file_type.is_char_device() {
            warn!("skipping character special device {}", path.display());
            return Ok(None);
        }
        if file_type.is_block_device() {
            warn!("skipping block special device {}", path.display());
            return Ok(None);
        }
        if file_type.is_fifo() {
            warn!("skipping named pipe {}", path.display());
            return Ok(None);
        }
        if file_type.is_socket() {
            warn!("skipping socket {}", path.display());
            return Ok(None);
        }

        if file_type.is_symlink() {
            return self.scan_symlink(&path, &status);
        }

        if file_type.is_dir() {
            self.process_dir(&path, &status);
            return Ok(None);
        }

        if file_type.is_file() {
            self.process_file(&path, &status)?;
            return Ok(None);
        }

        Ok(None)
    }

    fn scan_symlink(&mut self, path: &Path, status: &fs::Metadata) -> Result<Option<PathBuf>> {
        let raw_target = match fs::read_link(path) {
            Ok(t) => t,
            Err(e) => {
                warn!("failed to read symlink {}: {e}", path.display());
                return Ok(None);
            }
        };
        let target = if raw_target.is_absolute() {
            raw_target.clone()
        } else {
            path.parent().unwrap_or(Path::new("")).join(&raw_target)
        };

        if !target.exists() {
            warn!("skipping broken symlink {}", path.display());
            return Ok(None);
        }

        if target.starts_with(&self.root) {
            self.process_symlink(path, status, &target);
            return Ok(None);
        }

        if target.is_dir() {
            warn!("processing symlink {} as a directory", path.display());
            self.process_dir(path, status);
            return Ok(Some(path.to_path_buf()));
        }

        warn!("processing symlink {} as a file", path.display());
        let file_status = fs::metadata(path)?;
        self.process_file(path, &file_status)?;
        Ok(None)
    }

    fn stat(&self, status: &fs::Metadata) -> Stat {
        Stat {
            user: self
                .users
                .get(&status.uid())
                .cloned()
                .unwrap_or_else(|| status.uid().to_string()),
            group: self
                .groups
                .get(&status.gid())
                .cloned()
                .unwrap_or_else(|| status.gid().to_string()),
            mode: status.mode(),
            size: status.size(),
            mtime_ns: status.mtime() * 1_000_000_000 + status.mtime_nsec(),
            inode: status.ino(),
        }
    }

    fn process_dir(&mut self, path: &Path, status: &fs::Metadata) {
        let stat = self.stat(status);
        self.structure
            .insert(self.relative(path), Entry::Directory(stat));
    }

    fn process_symlink(&mut self, path: &Path, status: &fs::Metadata, target: &Path) {
        let stat = self.stat(status);
        let target = self.relative(target);
        self.structure
            .insert(self.relative(path), Entry::Symlink { target, stat });
    }

    fn process_file(&mut self, path: &Path, status: &fs::Metadata) -> Result<()> {
        let relative = self.relative(path);
        let empty = status.size() == 0;
        let stat = self.stat(status);

        self.structure
            .insert(relative.clone(), Entry::File { empty, stat });

        if !empty {
            let guard = ChangeGuard::new(path)?;
            let digest = match hash_file(path) {
                Ok(d) => d,
                Err(e) => {
                    // a file that vanished mid-hash isn't a hard failure at
                    // scan time; it will simply be missing from `files` and
                    // the upload step won't see it either.
                    warn!("failed to hash {}: {e}", path.display());
                    return Ok(());
                }
            };
            guard.finish().map_err(|e| {
                if matches!(&e, crate::error::SpareError::Inventory(InventoryError::FileChangedDuringRead { .. })) {
                    warn!("{} changed while it was being read", path.display());
                }
                e
            })?;

            self.files.entry(digest).or_default().push(relative);
        }

        Ok(())
    }
}

fn build_user_cache() -> HashMap<u32, String> {
    let mut cache = HashMap::new();
    for user in unsafe { uzers::all_users() } {
        cache.insert(user.uid(), user.name().to_string_lossy().into_owned());
    }
    cache
}

fn build_group_cache() -> HashMap<u32, String> {
    let mut cache = HashMap::new();
    for group in unsafe { uzers::all_groups() } {
        cache.insert(group.gid(), group.name().to_string_lossy().into_owned());
    }
    cache
}

fn hostname() -> String {
    let mut buf = vec![0u8; 256];
    let ret = unsafe { libc::gethostname(buf.as_mut_ptr() as *mut libc::c_char, buf.len()) };
    if ret != 0 {
        return "unknown-host".to_string();
    }
    let end = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
    String::from_utf8_lossy(&buf[..end]).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::symlink;

    #[test]
    fn scans_files_and_directories() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir(dir.path().join("sub")).unwrap();
        fs::write(dir.path().join("sub/a.txt"), b"hello").unwrap();
        fs::write(dir.path().join("b.txt"), b"hello").unwrap();

        let mut inv = Inventory::new(dir.path(), &[]);
        inv.scan().unwrap();

        assert!(inv.structure.contains_key("sub"));
        assert!(inv.structure.contains_key("sub/a.txt"));
        assert!(inv.structure.contains_key("b.txt"));
    }

    #[test]
    fn identical_content_deduplicates() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("a.txt"), b"same content").unwrap();
        fs::write(dir.path().join("b.txt"), b"same content").unwrap();

        let mut inv = Inventory::new(dir.path(), &[]);
        inv.scan().unwrap();

        assert_eq!(inv.files.len(), 1);
        let paths = inv.files.values().next().unwrap();
        assert_eq!(paths.len(), 2);
    }

    #[test]
    fn empty_files_are_not_hashed() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("empty.txt"), b"").unwrap();

        let mut inv = Inventory::new(dir.path(), &[]);
        inv.scan().unwrap();

        assert!(inv.files.is_empty());
        assert!(matches!(
            inv.structure.get("empty.txt"),
            Some(Entry::File { empty: true, .. })
        ));
    }

    #[test]
    fn internal_symlink_is_recorded_as_symlink() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("real.txt"), b"x").unwrap();
        symlink(dir.path().join("real.txt"), dir.path().join("link.txt")).unwrap();

        let mut inv = Inventory::new(dir.path(), &[]);
        inv.scan().unwrap();

        assert!(matches!(inv.structure.get("link.txt"), Some(Entry::Symlink { .. })));
    }

    #[test]
    fn skip_pattern_excludes_matching_paths() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir(dir.path().join("node_modules")).unwrap();
        fs::write(dir.path().join("node_modules/pkg.js"), b"x").unwrap();
        fs::write(dir.path().join("keep.txt"), b"x").unwrap();

        let mut inv = Inventory::new(dir.path(), &["node_modules".to_string()]);
        inv.scan().unwrap();

        assert!(!inv.structure.contains_key("node_modules"));
        assert!(inv.structure.contains_key("keep.txt"));
    }

    #[test]
    fn skip_pattern_only_matches_at_the_root_segment_boundary() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir(dir.path().join("foo")).unwrap();
        fs::write(dir.path().join("foo/bar"), b"x").unwrap();

        let mut inv = Inventory::new(dir.path(), &["bar".to_string()]);
        inv.scan().unwrap();

        assert!(inv.structure.contains_key("foo"));
        assert!(inv.structure.contains_key("foo/bar"));
    }

    #[test]
    fn identity_is_stable_across_scans() {
        let dir = tempfile::tempdir().unwrap();
        let mut inv = Inventory::new(dir.path(), &[]);
        let first = inv.identity().unwrap();
        inv.scan().unwrap();
        let second = inv.identity().unwrap();
        assert_eq!(first, second);
    }
}
