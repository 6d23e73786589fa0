//! # Content Hashing
//!
//! Uses BLAKE2b with a 32-byte digest as the content-addressing hash: a good
//! compromise between security, performance and digest size. The checksum is
//! not a security boundary on its own (that's the block codec's job) — it is
//! simply used to detect differences between files and to name their remote
//! chunk prefix.
//!
//! Two files with identical content produce the same digest and are uploaded
//! only once (see [`crate::inventory`] and [`crate::snapshot`]).

use crate::error::Result;
use blake2::digest::consts::U32;
use blake2::{Blake2b, Digest as _};
use std::fmt;
use std::fs::File;
use std::io::Read;
use std::path::Path;
use std::str::FromStr;

/// BLAKE2b parameterized to a 32-byte (256-bit) output.
type Blake2b256 = Blake2b<U32>;

/// Size of the read buffer for streaming hash computation (64 KiB).
const BUF_SIZE: usize = 64 * 1024;

/// A BLAKE2b-256 content digest, rendered as 64 lowercase hex characters.
///
/// This is the key used to name a file's chunk prefix in the envoy, and the
/// key of the `files` map in a snapshot's metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Digest([u8; 32]);

impl Digest {
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl FromStr for Digest {
    type Err = hex::FromHexError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let mut out = [0u8; 32];
        hex::decode_to_slice(s, &mut out)?;
        Ok(Digest(out))
    }
}

impl serde::Serialize for Digest {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> serde::Deserialize<'de> for Digest {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Streaming BLAKE2b-256 hasher. Mirrors the running-hash usage in
/// [`crate::snapshot::Snapshot::backup`] and [`crate::recovery`], where the
/// digest is recomputed from plaintext chunks as they pass through the envoy.
#[derive(Default)]
pub struct Hasher(Blake2b256);

impl Hasher {
    pub fn new() -> Self {
        Self(Blake2b256::new())
    }

    pub fn update(&mut self, data: &[u8]) {
        self.0.update(data);
    }

    pub fn finalize(self) -> Digest {
        let out = self.0.finalize();
        let mut bytes = [0u8; 32];
        bytes.copy_from_slice(&out);
        Digest(bytes)
    }
}

/// Computes the BLAKE2b-256 digest of a file's contents.
///
/// Uses streaming reads to handle arbitrarily large files without loading
/// the entire contents into memory.
pub fn hash_file(path: &Path) -> Result<Digest> {
    let mut file = File::open(path)?;
    let mut hasher = Hasher::new();
    let mut buf = vec![0u8; BUF_SIZE];

    loop {
        let bytes_read = file.read(&mut buf)?;
        if bytes_read == 0 {
            break;
        }
        hasher.update(&buf[..bytes_read]);
    }

    Ok(hasher.finalize())
}

/// Computes the BLAKE2b-256 digest of in-memory data.
pub fn hash_bytes(data: &[u8]) -> Digest {
    let mut hasher = Hasher::new();
    hasher.update(data);
    hasher.finalize()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_deterministic() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.txt");
        std::fs::write(&path, b"hello world").unwrap();

        let h1 = hash_file(&path).unwrap();
        let h2 = hash_file(&path).unwrap();
        assert_eq!(h1, h2);
    }

    #[test]
    fn hash_bytes_consistent() {
        assert_eq!(hash_bytes(b"test data"), hash_bytes(b"test data"));
    }

    #[test]
    fn hash_bytes_different_inputs() {
        assert_ne!(hash_bytes(b"data A"), hash_bytes(b"data B"));
    }

    #[test]
    fn digest_roundtrips_through_hex() {
        let digest = hash_bytes(b"roundtrip me");
        let parsed: Digest = digest.to_hex().parse().unwrap();
        assert_eq!(digest, parsed);
    }

    #[test]
    fn digest_roundtrips_through_json() {
        let digest = hash_bytes(b"json roundtrip");
        let json = serde_json::to_string(&digest).unwrap();
        let back: Digest = serde_json::from_str(&json).unwrap();
        assert_eq!(digest, back);
    }
}
