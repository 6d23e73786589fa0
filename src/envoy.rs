//! # Envoy
//!
//! The bridge between a local byte stream and a prefix of encrypted chunks
//! in a bucket. Keys look like:
//!
//! ```text
//! prefix/000000001-c3f543e56704af2ca4779a7d530836cc
//! prefix/000000002-4489c3d7ff0e090ad1a1260efa2f5084
//! ```
//!
//! The 9-digit ordinal caps a prefix at 999,999,999 blocks; at 1 MiB per
//! block that's ~953 TiB of plaintext per prefix, which is the largest
//! single file this crate can ever store.

use crate::block::{Block, Codec};
use crate::chunked::{ChunkedReader, DEFAULT_BLOCK_SIZE};
use crate::error::{EnvoyError, Result};
use crate::object_store::ObjectStore;
use crossbeam_channel::bounded;
use rand::RngCore;
use regex::Regex;
use std::collections::HashSet;
use std::io::{Read, Write};
use std::sync::{Arc, Mutex, OnceLock};
use std::thread;

/// Marker object written to a bucket's root the first time spare creates it.
/// Its presence is what lets a second spare deployment refuse to touch a
/// bucket that belongs to something else.
const SPARE_MARKER: &str = ".spare";
const SPARE_MARKER_BODY: &[u8] = b"https://github.com/seantis/spare\n";
const LOCK_KEY: &str = ".lock";

fn valid_prefix_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[a-zA-Z0-9_][a-zA-Z0-9_.]+$").unwrap())
}

/// Number of concurrent upload/download workers per `send`/`recv` call.
const POOL_SIZE: usize = 4;

pub struct Envoy {
    store: Arc<dyn ObjectStore>,
    bucket: String,
    password: Vec<u8>,
    codec: Codec,
    block_size: usize,
    known_prefixes: Mutex<HashSet<String>>,
    held: Mutex<bool>,
}

impl Envoy {
    pub fn new(store: Arc<dyn ObjectStore>, bucket: impl Into<String>, password: impl Into<Vec<u8>>) -> Self {
        Self {
            store,
            bucket: bucket.into(),
            password: password.into(),
            codec: Codec::default(),
            block_size: DEFAULT_BLOCK_SIZE,
            known_prefixes: Mutex::new(HashSet::new()),
            held: Mutex::new(false),
        }
    }

    pub fn with_codec(mut self, codec: Codec) -> Self {
        self.codec = codec;
        self
    }

    pub fn with_block_size(mut self, block_size: usize) -> Self {
        self.block_size = block_size;
        self
    }

    // ─── bootstrap & ownership ─────────────────────────────────────────

    pub fn ensure_bucket_exists(&self) -> Result<()> {
        if !self.store.bucket_exists(&self.bucket)? {
            self.store.bucket_create(&self.bucket)?;
            self.store
                .put_object(&self.bucket, SPARE_MARKER, SPARE_MARKER_BODY.to_vec())?;
        }
        Ok(())
    }

    /// Refuses to operate on a bucket that exists, has objects, but was
    /// never marked by spare — almost certainly someone else's bucket.
    pub fn ensure_bucket_is_ours(&self) -> Result<()> {
        if !self.store.bucket_exists(&self.bucket)? {
            return Ok(());
        }
        if self.is_known_prefix(SPARE_MARKER)? {
            return Ok(());
        }
        if self.store.list_objects(&self.bucket, "")?.is_empty() {
            self.store
                .put_object(&self.bucket, SPARE_MARKER, SPARE_MARKER_BODY.to_vec())?;
            return Ok(());
        }
        Err(EnvoyError::BucketOtherwiseUsed {
            bucket: self.bucket.clone(),
        }
        .into())
    }

    // ─── lock ───────────────────────────────────────────────────────────

    /// Acquires the bucket's mutex, then returns a guard that releases it
    /// again on drop — even if the protected section panics or returns early
    /// via `?`. Mirrors the original's `with Envoy(...) as envoy:` usage.
    pub fn lock_scope(self: &Arc<Self>) -> Result<EnvoyLockGuard> {
        self.lock()?;
        Ok(EnvoyLockGuard {
            envoy: Arc::clone(self),
        })
    }

    pub fn lock(&self) -> Result<()> {
        self.ensure_bucket_exists()?;
        self.ensure_bucket_is_ours()?;

        if self.locked()? {
            return Err(EnvoyError::BucketAlreadyLocked {
                bucket: self.bucket.clone(),
            }
            .into());
        }

        self.store.put_object(&self.bucket, LOCK_KEY, Vec::new())?;
        self.refresh_known_prefixes()?;
        *self.held.lock().unwrap() = true;
        Ok(())
    }

    pub fn unlock(&self) -> Result<()> {
        if self.is_known_prefix(LOCK_KEY)? {
            self.store.delete_object(&self.bucket, LOCK_KEY)?;
        }
        *self.held.lock().unwrap() = false;
        Ok(())
    }

    pub fn locked(&self) -> Result<bool> {
        self.is_known_prefix(LOCK_KEY)
    }

    /// `send`/`delete` mutate bucket state and must only run while this
    /// process holds the lock it itself acquired via [`Envoy::lock`].
    fn ensure_locked(&self) -> Result<()> {
        if *self.held.lock().unwrap() {
            return Ok(());
        }
        Err(EnvoyError::BucketNotLocked {
            bucket: self.bucket.clone(),
        }
        .into())
    }

    fn refresh_known_prefixes(&self) -> Result<()> {
        let prefixes = self.prefixes(None)?;
        let mut known = self.known_prefixes.lock().unwrap();
        known.clear();
        known.extend(prefixes);
        Ok(())
    }

    // ─── prefix validation ──────────────────────────────────────────────

    pub fn ensure_valid_prefix(&self, prefix: &str) -> Result<()> {
        if prefix.is_empty() || !valid_prefix_re().is_match(prefix) {
            return Err(EnvoyError::InvalidPrefix {
                prefix: prefix.to_string(),
            }
            .into());
        }
        Ok(())
    }

    pub fn ensure_prefix_unknown(&self, prefix: &str) -> Result<()> {
        if self.is_known_prefix(prefix)? {
            return Err(EnvoyError::ExistingPrefix {
                prefix: prefix.to_string(),
            }
            .into());
        }
        Ok(())
    }

    pub fn is_known_prefix(&self, prefix: &str) -> Result<bool> {
        if let Ok(known) = self.known_prefixes.try_lock() {
            if known.contains(prefix) {
                return Ok(true);
            }
        }
        Ok(!self.store.list_objects(&self.bucket, prefix)?.is_empty())
    }

    // ─── key grammar ────────────────────────────────────────────────────

    fn generate_nonce(&self) -> [u8; 16] {
        let mut nonce = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut nonce);
        nonce
    }

    fn block_key(prefix: &str, ordinal: u32, nonce: &[u8; 16]) -> String {
        format!("{prefix}/{ordinal:0>9}-{}", hex::encode(nonce))
    }

    fn extract_nonce(key: &str) -> Result<[u8; 16]> {
        let hex_part = key
            .rsplit('-')
            .next()
            .ok_or_else(|| EnvoyError::InvalidPrefix { prefix: key.to_string() })?;
        let mut nonce = [0u8; 16];
        hex::decode_to_slice(hex_part, &mut nonce)
            .map_err(|_| EnvoyError::InvalidPrefix { prefix: key.to_string() })?;
        Ok(nonce)
    }

    fn extract_prefix(key: &str) -> &str {
        key.split('/').next().unwrap_or(key)
    }

    /// True if `key`'s ordinal field is exactly `000000001`.
    fn is_first_block(key: &str) -> bool {
        key.split('/')
            .nth(1)
            .and_then(|rest| rest.split('-').next())
            .map(|ordinal| ordinal == "000000001")
            .unwrap_or(false)
    }

    // ─── listing ────────────────────────────────────────────────────────

    pub fn keys(&self, prefix: Option<&str>) -> Result<Vec<String>> {
        Ok(self
            .store
            .list_objects(&self.bucket, prefix.unwrap_or(""))?
            .into_iter()
            .filter(|k| !k.starts_with('.'))
            .collect())
    }

    pub fn prefixes(&self, prefix: Option<&str>) -> Result<Vec<String>> {
        let mut out: Vec<String> = self
            .keys(prefix)?
            .iter()
            .filter(|k| Self::is_first_block(k))
            .map(|k| Self::extract_prefix(k).to_string())
            .collect();
        out.sort();
        out.dedup();
        Ok(out)
    }

    pub fn delete(&self, prefix: &str) -> Result<()> {
        self.ensure_locked()?;
        self.ensure_valid_prefix(prefix)?;
        let keys = self.store.list_objects(&self.bucket, prefix)?;
        self.store.delete_objects(&self.bucket, &keys)?;
        if let Ok(mut known) = self.known_prefixes.lock() {
            known.remove(prefix);
        }
        Ok(())
    }

    // ─── send / recv ────────────────────────────────────────────────────

    /// Uploads `reader`'s content as a sequence of encrypted blocks under
    /// `prefix`. `before_encrypt` is called with each plaintext chunk (used
    /// by the caller to run a streaming digest alongside the upload).
    pub fn send<R: Read>(
        &self,
        prefix: &str,
        reader: R,
        mut before_encrypt: Option<&mut dyn FnMut(&[u8])>,
    ) -> Result<()> {
        self.ensure_locked()?;
        self.ensure_bucket_exists()?;
        self.ensure_valid_prefix(prefix)?;
        self.ensure_prefix_unknown(prefix)?;

        let (tx, rx) = bounded::<(String, Vec<u8>)>(POOL_SIZE * 2);
        let workers: Vec<_> = (0..POOL_SIZE)
            .map(|_| {
                let rx = rx.clone();
                let store = Arc::clone(&self.store);
                let bucket = self.bucket.clone();
                thread::spawn(move || -> Result<()> {
                    for (key, data) in rx {
                        store.put_object(&bucket, &key, data)?;
                    }
                    Ok(())
                })
            })
            .collect();
        drop(rx);

        let mut ordinal = 1u32;

        for chunk in ChunkedReader::new(reader, self.block_size) {
            let chunk = chunk?;

            if let Some(cb) = before_encrypt.as_deref_mut() {
                cb(&chunk);
            }

            let nonce = self.generate_nonce();
            let mut block = Block::new(self.codec, &self.password, nonce, chunk);
            block.encrypt()?;

            let key = Self::block_key(prefix, ordinal, &nonce);
            ordinal += 1;

            // a closed channel means a worker already failed and exited;
            // stop feeding it and let the join below surface that error.
            if tx.send((key, block.data)).is_err() {
                break;
            }
        }
        drop(tx);

        let mut first_err = None;
        for worker in workers {
            if let Ok(Err(e)) = worker.join() {
                first_err.get_or_insert(e);
            }
        }
        if let Some(e) = first_err {
            return Err(e);
        }

        if let Ok(mut known) = self.known_prefixes.lock() {
            known.insert(prefix.to_string());
        }
        Ok(())
    }

    /// Downloads and decrypts every block under `prefix`, in ordinal order,
    /// writing the recovered plaintext to `writer`. `after_decrypt` is
    /// called with each plaintext chunk as it is produced.
    pub fn recv<W: Write>(
        &self,
        prefix: &str,
        writer: &mut W,
        mut after_decrypt: Option<&mut dyn FnMut(&[u8])>,
    ) -> Result<()> {
        self.ensure_valid_prefix(prefix)?;

        let mut keys = self.store.list_objects(&self.bucket, prefix)?;
        keys.sort();

        let (tx, rx) = bounded::<(usize, String)>(keys.len().max(1));
        let (result_tx, result_rx) = bounded::<(usize, Result<Vec<u8>>)>(keys.len().max(1));

        for (i, key) in keys.iter().enumerate() {
            tx.send((i, key.clone())).expect("channel sized to keys.len()");
        }
        drop(tx);

        let password = self.password.clone();
        let codec = self.codec;
        let workers: Vec<_> = (0..POOL_SIZE.min(keys.len().max(1)))
            .map(|_| {
                let rx = rx.clone();
                let result_tx = result_tx.clone();
                let store = Arc::clone(&self.store);
                let bucket = self.bucket.clone();
                let password = password.clone();
                thread::spawn(move || {
                    for (i, key) in rx {
                        let outcome = (|| -> Result<Vec<u8>> {
                            let nonce = Self::extract_nonce(&key)?;
                            let ciphertext = store.get_object(&bucket, &key)?;
                            let mut block = Block::new(codec, &password, nonce, ciphertext);
                            block.decrypt()?;
                            Ok(block.data)
                        })();
                        let _ = result_tx.send((i, outcome));
                    }
                })
            })
            .collect();
        drop(result_tx);

        let mut results: Vec<Option<Result<Vec<u8>>>> = (0..keys.len()).map(|_| None).collect();
        for (i, outcome) in result_rx {
            results[i] = Some(outcome);
        }

        for worker in workers {
            let _ = worker.join();
        }

        for slot in results {
            let data = slot.expect("every index was sent exactly once")?;
            if let Some(cb) = after_decrypt.as_deref_mut() {
                cb(&data);
            }
            writer.write_all(&data)?;
        }

        Ok(())
    }
}

/// Releases an [`Envoy`]'s bucket lock when dropped. Obtained from
/// [`Envoy::lock_scope`]; release is best-effort and logs rather than
/// panicking, since `Drop` cannot propagate a `Result`.
pub struct EnvoyLockGuard {
    envoy: Arc<Envoy>,
}

impl Drop for EnvoyLockGuard {
    fn drop(&mut self) {
        if let Err(e) = self.envoy.unlock() {
            log::warn!("failed to release bucket lock: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object_store::memory::InMemoryObjectStore;
    use std::io::Cursor;

    fn envoy() -> Envoy {
        let store: Arc<dyn ObjectStore> = Arc::new(InMemoryObjectStore::new());
        Envoy::new(store, "test-bucket", b"hunter2".to_vec())
    }

    fn locked_envoy() -> Envoy {
        let envoy = envoy();
        envoy.lock().unwrap();
        envoy
    }

    #[test]
    fn send_then_recv_roundtrips() {
        let envoy = locked_envoy();
        let data = b"the quick brown fox jumps over the lazy dog".repeat(1000);

        envoy.send("my-file", Cursor::new(data.clone()), None).unwrap();

        let mut out = Vec::new();
        envoy.recv("my-file", &mut out, None).unwrap();
        assert_eq!(out, data);
    }

    #[test]
    fn send_rejects_existing_prefix() {
        let envoy = locked_envoy();
        envoy.send("dup", Cursor::new(b"a".to_vec()), None).unwrap();
        assert!(envoy.send("dup", Cursor::new(b"b".to_vec()), None).is_err());
    }

    #[test]
    fn send_rejects_invalid_prefix() {
        let envoy = locked_envoy();
        assert!(envoy.send(".hidden", Cursor::new(b"a".to_vec()), None).is_err());
        assert!(envoy.send("x", Cursor::new(b"a".to_vec()), None).is_err());
    }

    #[test]
    fn send_rejects_unlocked_bucket() {
        let envoy = envoy();
        assert!(matches!(
            envoy.send("nope", Cursor::new(b"a".to_vec()), None),
            Err(crate::error::SpareError::Envoy(EnvoyError::BucketNotLocked { .. }))
        ));
    }

    #[test]
    fn lock_unlock_cycle() {
        let envoy = envoy();
        assert!(!envoy.locked().unwrap());
        envoy.lock().unwrap();
        assert!(envoy.locked().unwrap());
        assert!(envoy.lock().is_err());
        envoy.unlock().unwrap();
        assert!(!envoy.locked().unwrap());
    }

    #[test]
    fn lock_scope_releases_on_drop() {
        let envoy = Arc::new(envoy());
        {
            let _guard = envoy.lock_scope().unwrap();
            assert!(envoy.locked().unwrap());
        }
        assert!(!envoy.locked().unwrap());
    }

    #[test]
    fn prefixes_lists_known_prefixes() {
        let envoy = locked_envoy();
        envoy.send("a", Cursor::new(vec![0u8; 5]), None).unwrap();
        envoy.send("b", Cursor::new(vec![1u8; 5]), None).unwrap();

        let mut prefixes = envoy.prefixes(None).unwrap();
        prefixes.sort();
        assert_eq!(prefixes, vec!["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn two_handles_racing_on_one_bucket_only_one_locks() {
        let store: Arc<dyn ObjectStore> = Arc::new(InMemoryObjectStore::new());
        let a = Envoy::new(Arc::clone(&store), "shared-bucket", b"pw".to_vec());
        let b = Envoy::new(Arc::clone(&store), "shared-bucket", b"pw".to_vec());

        a.lock().unwrap();
        assert!(matches!(
            b.lock(),
            Err(crate::error::SpareError::Envoy(EnvoyError::BucketAlreadyLocked { .. }))
        ));

        a.unlock().unwrap();
        b.lock().unwrap();
        assert!(b.locked().unwrap());
    }

    #[test]
    fn delete_removes_all_blocks_under_prefix() {
        let envoy = locked_envoy();
        envoy
            .send("gone", Cursor::new(vec![1u8; 3 * 1024 * 1024]), None)
            .unwrap();
        assert!(!envoy.keys(Some("gone")).unwrap().is_empty());
        envoy.delete("gone").unwrap();
        assert!(envoy.keys(Some("gone")).unwrap().is_empty());
    }
}
