//! # Recovery
//!
//! Reconstructs a tree from a [`crate::snapshot::Snapshot`]'s metadata plus
//! the envoy's content-addressed chunks.
//!
//! Restoring happens in two passes: [`Recovery::restore_structure`] recreates
//! every directory, symlink and empty-file placeholder (so later hardlinks
//! have somewhere to point), then [`Recovery::download_data`] fetches every
//! digest exactly once and fans it out to every local path that shares it —
//! by copy across inode groups, by hardlink within one.
//!
//! Unlike backup, which stays conservative with CPU/memory, recovery assumes
//! the target system is otherwise idle and favors throughput: downloads run
//! on a bounded pool of worker threads, same shape as the envoy's upload pool.

use crate::envoy::Envoy;
use crate::error::{RecoveryError, Result};
use crate::guard::WritableGuard;
use crate::hasher::{Digest, Hasher};
use crate::inventory::{Entry, Stat};
use crossbeam_channel::bounded;
use log::{error, info, warn};
use std::collections::HashMap;
use std::ffi::CString;
use std::fs;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::symlink;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;

/// Number of concurrent download workers.
const POOL_SIZE: usize = 4;

/// Restores one snapshot's structure and content to a target directory.
pub struct Recovery {
    envoy: Arc<Envoy>,
    structure: HashMap<String, Entry>,
    files: HashMap<Digest, Vec<String>>,
    uids: HashMap<String, u32>,
    gids: HashMap<String, u32>,
}

impl Recovery {
    pub fn new(
        envoy: Arc<Envoy>,
        structure: HashMap<String, Entry>,
        files: HashMap<Digest, Vec<String>>,
    ) -> Self {
        Self {
            envoy,
            structure,
            files,
            uids: build_uid_cache(),
            gids: build_gid_cache(),
        }
    }

    /// Recreates the snapshot into `target`, which must be empty (it may
    /// already exist).
    pub fn restore(&self, target: &Path) -> Result<()> {
        info!("restoring to {}", target.display());

        fs::create_dir_all(target)?;
        if fs::read_dir(target)?.next().is_some() {
            return Err(RecoveryError::TargetPathNotEmpty(target.to_path_buf()).into());
        }

        info!("restoring folder structure of {}", target.display());
        self.restore_structure(target)?;

        info!("downloading data for {}", target.display());
        self.download_data(target)?;

        info!("restored {}", target.display());
        Ok(())
    }

    // ─── Phase 1: structure ─────────────────────────────────────────────

    fn restore_structure(&self, target: &Path) -> Result<()> {
        let mut paths: Vec<&String> = self.structure.keys().collect();
        paths.sort();

        for path in paths {
            let entry = &self.structure[path];
            let full = target.join(path);

            match entry {
                Entry::Directory(stat) => {
                    fs::create_dir_all(&full)?;
                    self.apply_stat(&full, stat, false)?;
                }
                Entry::Symlink { target: link_target, stat } => {
                    let destination = target.join(link_target);
                    symlink(&destination, &full)?;
                    self.apply_stat(&full, stat, true)?;
                }
                Entry::File { stat, .. } => {
                    fs::File::create(&full)?;
                    self.apply_stat(&full, stat, false)?;
                }
            }
        }
        Ok(())
    }

    /// Sets mode and ownership on a freshly created path. Unknown
    /// user/group names leave the corresponding id unchanged, matching
    /// `chown(path, -1, ...)` semantics.
    fn apply_stat(&self, path: &Path, stat: &Stat, is_symlink: bool) -> Result<()> {
        let uid = self.uids.get(&stat.user).copied();
        let gid = self.gids.get(&stat.group).copied();

        if uid.is_none() {
            warn!("unknown user '{}' for {}, leaving owner unchanged", stat.user, path.display());
        }
        if gid.is_none() {
            warn!("unknown group '{}' for {}, leaving group unchanged", stat.group, path.display());
        }

        chown(path, uid, gid, is_symlink)?;

        // Linux has no lchmod(2); symlink permission bits aren't meaningful
        // on this platform, so only regular files and directories get one.
        if !is_symlink {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(path, fs::Permissions::from_mode(stat.mode & 0o7777))?;
        }
        Ok(())
    }

    // ─── Phase 2: data ──────────────────────────────────────────────────

    fn download_data(&self, target: &Path) -> Result<()> {
        let jobs: Vec<DownloadJob> = self
            .files
            .iter()
            .map(|(digest, paths)| self.plan_job(target, digest, paths))
            .collect();

        if jobs.is_empty() {
            return Ok(());
        }

        let pool_size = POOL_SIZE.min(jobs.len());
        let (tx, rx) = bounded::<DownloadJob>(jobs.len());
        let (result_tx, result_rx) = bounded::<Result<()>>(jobs.len());

        for job in jobs {
            tx.send(job).expect("channel sized to job count");
        }
        drop(tx);

        let workers: Vec<_> = (0..pool_size)
            .map(|_| {
                let rx = rx.clone();
                let result_tx = result_tx.clone();
                let envoy = Arc::clone(&self.envoy);
                thread::spawn(move || {
                    for job in rx {
                        let outcome = download_one(&envoy, &job);
                        let _ = result_tx.send(outcome);
                    }
                })
            })
            .collect();
        drop(result_tx);

        let mut first_err = None;
        for outcome in result_rx {
            if let Err(e) = outcome {
                first_err.get_or_insert(e);
            }
        }
        for worker in workers {
            let _ = worker.join();
        }

        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Groups `paths` (all sharing `digest`) by inode. The first path of the
    /// first group is the genesis download target; every other path in that
    /// group becomes a hardlink to it; every other group's first path is a
    /// copy of the genesis, with its own remaining paths hardlinked to it.
    fn plan_job(&self, target: &Path, digest: &Digest, paths: &[String]) -> DownloadJob {
        let mut order: Vec<u64> = Vec::new();
        let mut by_inode: HashMap<u64, Vec<PathBuf>> = HashMap::new();

        let mut sorted = paths.to_vec();
        sorted.sort();

        for path in &sorted {
            let inode = match self.structure.get(path) {
                Some(Entry::File { stat, .. }) => stat.inode,
                _ => 0,
            };
            if !by_inode.contains_key(&inode) {
                order.push(inode);
            }
            by_inode.entry(inode).or_default().push(target.join(path));
        }

        let targets = order
            .into_iter()
            .map(|inode| by_inode.remove(&inode).unwrap())
            .collect();

        DownloadJob {
            prefix: digest.to_hex(),
            targets,
        }
    }
}

struct DownloadJob {
    prefix: String,
    targets: Vec<Vec<PathBuf>>,
}

fn download_one(envoy: &Envoy, job: &DownloadJob) -> Result<()> {
    let genesis = job.targets[0][0].clone();
    info!("downloading {}", genesis.display());

    let mut hasher = Hasher::new();
    {
        let _guard = WritableGuard::new(&genesis)?;
        let mut file = fs::File::create(&genesis)?;
        envoy.recv(&job.prefix, &mut file, Some(&mut |chunk: &[u8]| hasher.update(chunk)))?;
    }

    let computed = hasher.finalize().to_hex();
    if computed != job.prefix {
        // A digest mismatch here does not abort the restore: the file
        // exists but is suspect, and every path sharing it is flagged.
        for group in &job.targets {
            for path in group {
                error!(
                    "unexpected checksum for {}, expected {}, got {computed}",
                    path.display(),
                    job.prefix,
                );
            }
        }
    }

    for group in &job.targets {
        let clone = &group[0];
        if clone != &genesis {
            fs::copy(&genesis, clone)?;
            copy_stat(&genesis, clone)?;
        }

        for link in &group[1..] {
            if link.exists() {
                fs::remove_file(link)?;
            }
            fs::hard_link(clone, link)?;
        }
    }

    Ok(())
}

fn copy_stat(src: &Path, dst: &Path) -> Result<()> {
    let meta = fs::metadata(src)?;

    // set mtime before mode: a read-only source mode would otherwise block
    // re-opening dst at all, even just to stamp its modification time.
    let file = fs::File::open(dst)?;
    file.set_modified(meta.modified()?)?;
    fs::set_permissions(dst, meta.permissions())?;
    Ok(())
}

fn chown(path: &Path, uid: Option<u32>, gid: Option<u32>, is_symlink: bool) -> Result<()> {
    let c_path = CString::new(path.as_os_str().as_bytes())
        .map_err(|e| anyhow::anyhow!("path {} contains a nul byte: {e}", path.display()))?;
    let uid = uid.unwrap_or(u32::MAX);
    let gid = gid.unwrap_or(u32::MAX);

    let rc = if is_symlink {
        unsafe { libc::lchown(c_path.as_ptr(), uid, gid) }
    } else {
        unsafe { libc::chown(c_path.as_ptr(), uid, gid) }
    };

    if rc != 0 {
        return Err(std::io::Error::last_os_error().into());
    }
    Ok(())
}

fn build_uid_cache() -> HashMap<String, u32> {
    let mut cache = HashMap::new();
    for user in unsafe { uzers::all_users() } {
        cache.insert(user.name().to_string_lossy().into_owned(), user.uid());
    }
    cache
}

fn build_gid_cache() -> HashMap<String, u32> {
    let mut cache = HashMap::new();
    for group in unsafe { uzers::all_groups() } {
        cache.insert(group.name().to_string_lossy().into_owned(), group.gid());
    }
    cache
}
