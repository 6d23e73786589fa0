//! # Snapshot & Collection
//!
//! A snapshot backs up one [`crate::inventory::Inventory`]: it uploads every
//! not-yet-known content digest, then stores its own metadata (the
//! inventory's `structure` and `files` maps, plus the source identity) under
//! a ULID-ordered prefix. Snapshots double as a reference count — a digest
//! prefix stays in the bucket as long as any snapshot's `files` map mentions
//! it; [`SnapshotCollection::prune`] deletes everything else.

use crate::envoy::Envoy;
use crate::error::{Result, SnapshotError};
use crate::hasher::{Digest, Hasher};
use crate::inventory::{Entry, Inventory};
use log::{error, info};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use ulid::Ulid;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct SnapshotMeta {
    #[serde(default)]
    pub files: HashMap<Digest, Vec<String>>,
    #[serde(default)]
    pub structure: HashMap<String, Entry>,
    pub identity: Option<String>,
}

pub struct Snapshot {
    envoy: Arc<Envoy>,
    pub prefix: String,
    pub meta: SnapshotMeta,
}

impl Snapshot {
    fn new(envoy: Arc<Envoy>) -> Self {
        let prefix = format!("snapshot_{}", Ulid::new());
        Self {
            envoy,
            prefix,
            meta: SnapshotMeta::default(),
        }
    }

    pub fn load(envoy: Arc<Envoy>, prefix: &str) -> Result<Self> {
        let mut buffer = Vec::new();
        envoy.recv(prefix, &mut buffer, None)?;
        let meta: SnapshotMeta = serde_json::from_slice(&buffer)?;
        Ok(Self {
            envoy,
            prefix: prefix.to_string(),
            meta,
        })
    }

    /// All other snapshots currently in the bucket.
    fn neighbours(&self) -> Result<Vec<Snapshot>> {
        let mut collection = SnapshotCollection::new(Arc::clone(&self.envoy));
        collection.load()?;
        Ok(collection
            .snapshots
            .into_iter()
            .filter(|s| s.prefix != self.prefix)
            .collect())
    }

    /// Every inventory backed up is tied to a hostname+path identity, to
    /// keep one bucket from silently mixing backups of two different source
    /// trees.
    fn ensure_identity_match(&self, identity: &str) -> Result<()> {
        if let Some(existing) = &self.meta.identity {
            if existing != identity {
                return Err(SnapshotError::SnapshotMismatch {
                    expected: identity.to_string(),
                    found: existing.clone(),
                }
                .into());
            }
        }

        for neighbour in self.neighbours()? {
            if let Some(found) = &neighbour.meta.identity {
                if found != identity {
                    return Err(SnapshotError::SnapshotMismatch {
                        expected: identity.to_string(),
                        found: found.clone(),
                    }
                    .into());
                }
            }
        }

        Ok(())
    }

    pub fn backup(&mut self, inventory: &Inventory, force: bool) -> Result<()> {
        let identity = inventory.identity()?;
        info!("backing up {identity}");

        if !force {
            self.ensure_identity_match(&identity)?;
        }

        let uploaded: HashSet<String> = self.envoy.prefixes(None)?.into_iter().collect();

        for (digest, paths) in &inventory.files {
            if uploaded.contains(&digest.to_hex()) {
                continue;
            }

            for path in paths {
                info!("uploading {path}");
            }

            let first_path = inventory.absolute_path(&paths[0]);
            let mut hasher = Hasher::new();

            let guard = crate::guard::ChangeGuard::new(&first_path)?;
            let file = std::fs::File::open(&first_path)?;
            self.envoy.send(&digest.to_hex(), file, Some(&mut |chunk: &[u8]| hasher.update(chunk)))?;
            guard.finish()?;

            let computed = hasher.finalize();
            if &computed != digest {
                return Err(crate::error::SnapshotError::FileChangedBeforeUpload {
                    path: first_path,
                }
                .into());
            }
        }

        self.meta.files = inventory.files.clone();
        self.meta.structure = inventory.structure.clone();
        self.meta.identity = Some(identity);

        self.save()?;
        info!("completed {}", self.prefix);
        Ok(())
    }

    pub fn save(&self) -> Result<()> {
        if self.envoy.is_known_prefix(&self.prefix)? {
            self.envoy.delete(&self.prefix)?;
        }

        let body = serde_json::to_vec(&self.meta)?;
        self.envoy.send(&self.prefix, std::io::Cursor::new(body), None)?;
        Ok(())
    }

    /// Deletes the snapshot's own metadata object. The content it references
    /// is untouched — that's [`SnapshotCollection::prune`]'s job.
    pub fn delete(&self) -> Result<()> {
        self.envoy.delete(&self.prefix)
    }

    /// Downloads and re-hashes every file this snapshot references,
    /// confirming both the digests and the structure map stay consistent.
    /// Failures are logged; the return value is the overall verdict.
    pub fn validate(&self) -> Result<bool> {
        let prefixes: HashSet<String> = self.envoy.prefixes(None)?.into_iter().collect();
        let mut success = true;

        for (digest, paths) in &self.meta.files {
            let hex = digest.to_hex();

            if !prefixes.contains(&hex) {
                error!("{hex} is unknown");
                success = false;
            } else {
                let mut hasher = Hasher::new();
                let mut sink = std::io::sink();
                self.envoy
                    .recv(&hex, &mut sink, Some(&mut |chunk: &[u8]| hasher.update(chunk)))?;

                let computed = hasher.finalize().to_hex();
                if computed != hex {
                    error!("expected {hex} but got {computed}");
                    success = false;
                }
            }

            for path in paths {
                if !self.meta.structure.contains_key(path) {
                    error!("the metadata for {path} is missing");
                    success = false;
                }
            }
        }

        Ok(success)
    }
}

/// Manages every snapshot stored in a bucket.
pub struct SnapshotCollection {
    envoy: Arc<Envoy>,
    pub snapshots: Vec<Snapshot>,
}

impl SnapshotCollection {
    pub fn new(envoy: Arc<Envoy>) -> Self {
        Self {
            envoy,
            snapshots: Vec::new(),
        }
    }

    pub fn clear(&mut self) {
        self.snapshots.clear();
    }

    /// Loads every snapshot, oldest first (ULID prefixes sort lexically in
    /// creation order).
    pub fn load(&mut self) -> Result<()> {
        self.clear();

        let mut prefixes = self.envoy.prefixes(Some("snapshot"))?;
        prefixes.sort();

        for prefix in prefixes {
            self.snapshots.push(Snapshot::load(Arc::clone(&self.envoy), &prefix)?);
        }
        Ok(())
    }

    pub fn create(&self) -> Snapshot {
        Snapshot::new(Arc::clone(&self.envoy))
    }

    /// Gets a snapshot by prefix, or the most recent one with `"latest"`.
    pub fn get(&self, selector: &str) -> Option<&Snapshot> {
        if selector == "latest" {
            return self.snapshots.last();
        }
        self.snapshots.iter().find(|s| s.prefix == selector)
    }

    /// Prunes snapshot metadata down to the `keep` most recent, then deletes
    /// every content prefix no longer referenced by a surviving snapshot.
    pub fn prune(&mut self, keep: i64) -> Result<()> {
        self.load()?;

        if keep < 1 {
            return Err(SnapshotError::PruneToZero {
                remaining: self.snapshots.len() as i64,
            }
            .into());
        }

        let keep = keep as usize;
        if self.snapshots.len() <= keep {
            return Ok(());
        }

        let split_at = self.snapshots.len() - keep;
        let old: Vec<Snapshot> = self.snapshots.drain(..split_at).collect();

        for snapshot in &old {
            snapshot.delete()?;
        }

        let mut known: HashSet<String> = HashSet::new();
        for snapshot in &self.snapshots {
            known.insert(snapshot.prefix.clone());
            known.extend(snapshot.meta.files.keys().map(|d| d.to_hex()));
        }

        for prefix in self.envoy.prefixes(None)? {
            if !known.contains(&prefix) {
                self.envoy.delete(&prefix)?;
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object_store::memory::InMemoryObjectStore;
    use std::fs;
    use std::sync::Arc;

    fn envoy() -> Arc<Envoy> {
        let store: Arc<dyn crate::object_store::ObjectStore> = Arc::new(InMemoryObjectStore::new());
        let envoy = Envoy::new(store, "bucket", b"pw".to_vec());
        envoy.lock().unwrap();
        Arc::new(envoy)
    }

    #[test]
    fn backup_then_validate_succeeds() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("a.txt"), b"hello").unwrap();

        let mut inventory = Inventory::new(dir.path(), &[]);
        inventory.scan().unwrap();

        let envoy = envoy();
        let mut collection = SnapshotCollection::new(Arc::clone(&envoy));
        let mut snapshot = collection.create();
        snapshot.backup(&inventory, false).unwrap();

        assert!(snapshot.validate().unwrap());
    }

    #[test]
    fn duplicate_content_uploads_once() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("a.txt"), b"same").unwrap();
        fs::write(dir.path().join("b.txt"), b"same").unwrap();

        let mut inventory = Inventory::new(dir.path(), &[]);
        inventory.scan().unwrap();
        assert_eq!(inventory.files.len(), 1);

        let envoy = envoy();
        let mut collection = SnapshotCollection::new(Arc::clone(&envoy));
        let mut snapshot = collection.create();
        snapshot.backup(&inventory, false).unwrap();

        let digest = inventory.files.keys().next().unwrap();
        assert_eq!(envoy.prefixes(None).unwrap().iter().filter(|p| **p == digest.to_hex()).count(), 1);
    }

    #[test]
    fn prune_keeps_only_the_requested_count() {
        let dir = tempfile::tempdir().unwrap();
        let envoy = envoy();
        let mut collection = SnapshotCollection::new(Arc::clone(&envoy));

        for i in 0..3 {
            fs::write(dir.path().join("a.txt"), format!("version {i}")).unwrap();
            let mut inventory = Inventory::new(dir.path(), &[]);
            inventory.scan().unwrap();
            let mut snapshot = collection.create();
            snapshot.backup(&inventory, true).unwrap();
        }

        collection.prune(1).unwrap();
        collection.load().unwrap();
        assert_eq!(collection.snapshots.len(), 1);
    }

    #[test]
    fn prune_rejects_keep_less_than_one() {
        let envoy = envoy();
        let mut collection = SnapshotCollection::new(envoy);
        assert!(collection.prune(0).is_err());
    }

    #[test]
    fn get_distinguishes_latest_from_an_older_snapshot_by_prefix() {
        let dir = tempfile::tempdir().unwrap();
        let envoy = envoy();
        let mut collection = SnapshotCollection::new(Arc::clone(&envoy));

        fs::write(dir.path().join("foo.txt"), b"foo").unwrap();
        let mut inventory = Inventory::new(dir.path(), &[]);
        inventory.scan().unwrap();
        let mut first = collection.create();
        first.backup(&inventory, true).unwrap();
        let first_prefix = first.prefix.clone();

        fs::write(dir.path().join("foo.txt"), b"bar").unwrap();
        fs::create_dir(dir.path().join("extra")).unwrap();
        let mut inventory = Inventory::new(dir.path(), &[]);
        inventory.scan().unwrap();
        let mut second = collection.create();
        second.backup(&inventory, true).unwrap();

        collection.prune(2).unwrap();
        collection.load().unwrap();
        assert_eq!(collection.snapshots.len(), 2);

        let latest = collection.get("latest").unwrap();
        assert!(latest.meta.structure.contains_key("extra"));

        let older = collection.get(&first_prefix).unwrap();
        assert!(!older.meta.structure.contains_key("extra"));
        assert_ne!(latest.prefix, older.prefix);
    }
}
