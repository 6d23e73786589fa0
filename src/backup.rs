//! # CLI orchestration
//!
//! Wires a CLI invocation's connection parameters and tunables into the
//! engine: build an [`Envoy`], acquire its bucket lock for the duration of
//! the operation, and drive a [`SnapshotCollection`]/[`Recovery`] through
//! one of the five verbs. Mirrors `original_source/spare/backup.py`'s
//! `create`/`restore`/`validate`/`lock`/`unlock` functions one for one.

use crate::config::Tunables;
use crate::envoy::Envoy;
use crate::error::{Result, SnapshotError};
use crate::inventory::Inventory;
use crate::object_store::{S3Config, S3ObjectStore};
use crate::recovery::Recovery;
use crate::snapshot::{Snapshot, SnapshotCollection};
use colored::Colorize;
use log::info;
use std::path::Path;
use std::sync::Arc;

/// Everything needed to reach one bucket: where it is, how to authenticate,
/// and the password its content is sealed with.
pub struct Connection {
    pub endpoint: String,
    pub access_key: String,
    pub secret_key: String,
    pub password: String,
    pub bucket: String,
}

impl Connection {
    pub fn envoy(&self, tunables: &Tunables) -> Result<Arc<Envoy>> {
        let store = S3ObjectStore::new(S3Config {
            endpoint: self.endpoint.clone(),
            access_key: self.access_key.clone(),
            secret_key: self.secret_key.clone(),
            connect_timeout: tunables.connect_timeout(),
            read_timeout: tunables.read_timeout(),
            max_attempts: tunables.max_attempts,
        })?;

        let envoy = Envoy::new(Arc::new(store), self.bucket.clone(), self.password.clone().into_bytes())
            .with_codec(tunables.codec()?)
            .with_block_size(tunables.block_size);

        Ok(Arc::new(envoy))
    }
}

/// Scans `path`, uploads every not-yet-known digest, saves a new snapshot,
/// then prunes down to `tunables.keep`.
pub fn create(conn: &Connection, tunables: &Tunables, path: &Path, skip: &[String], force: bool) -> Result<()> {
    let mut inventory = Inventory::new(path, skip);
    inventory.scan()?;

    let envoy = conn.envoy(tunables)?;
    let _guard = envoy.lock_scope()?;

    let mut collection = SnapshotCollection::new(Arc::clone(&envoy));
    collection.load()?;

    let mut snapshot = collection.create();
    snapshot.backup(&inventory, force)?;
    print_backup_summary(&snapshot);

    collection.prune(tunables.keep)?;
    Ok(())
}

/// Restores `selector` ("latest" or a specific snapshot prefix) onto `path`,
/// which must be empty.
pub fn restore(conn: &Connection, tunables: &Tunables, path: &Path, selector: &str) -> Result<()> {
    let envoy = conn.envoy(tunables)?;
    let _guard = envoy.lock_scope()?;

    let mut collection = SnapshotCollection::new(Arc::clone(&envoy));
    collection.load()?;

    let snapshot = collection
        .get(selector)
        .ok_or_else(|| SnapshotError::NotFound(selector.to_string()))?;

    let recovery = Recovery::new(
        Arc::clone(&envoy),
        snapshot.meta.structure.clone(),
        snapshot.meta.files.clone(),
    );
    recovery.restore(path)
}

/// Re-downloads and re-hashes every file every snapshot references. Returns
/// `true` only if every snapshot in the bucket validates cleanly.
pub fn validate(conn: &Connection, tunables: &Tunables) -> Result<bool> {
    let envoy = conn.envoy(tunables)?;
    let _guard = envoy.lock_scope()?;

    let mut collection = SnapshotCollection::new(Arc::clone(&envoy));
    collection.load()?;

    let mut valid = true;
    for snapshot in &collection.snapshots {
        if snapshot.validate()? {
            info!("{} is valid", snapshot.prefix);
        } else {
            eprintln!("{} {} has errors", "✗".red(), snapshot.prefix);
            valid = false;
        }
    }
    Ok(valid)
}

/// Acquires the bucket lock outright, without releasing it when this call
/// returns. Returns `false` if the bucket was already locked.
pub fn lock(conn: &Connection, tunables: &Tunables) -> Result<bool> {
    let envoy = conn.envoy(tunables)?;
    envoy.ensure_bucket_exists()?;
    envoy.ensure_bucket_is_ours()?;

    if envoy.locked()? {
        return Ok(false);
    }
    envoy.lock()?;
    Ok(true)
}

/// Releases the bucket lock. Returns `false` if the bucket was already free.
pub fn unlock(conn: &Connection, tunables: &Tunables) -> Result<bool> {
    let envoy = conn.envoy(tunables)?;
    envoy.ensure_bucket_exists()?;
    envoy.ensure_bucket_is_ours()?;

    if !envoy.locked()? {
        return Ok(false);
    }
    envoy.unlock()?;
    Ok(true)
}

fn print_backup_summary(snapshot: &Snapshot) {
    eprintln!(
        "{} snapshot {}",
        "✓".green(),
        snapshot.prefix.bold(),
    );
    eprintln!(
        "  {} files, {} unique blobs",
        snapshot.meta.structure.len(),
        snapshot.meta.files.len(),
    );
}
