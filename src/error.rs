//! # Error Types
//!
//! Defines a structured error hierarchy for the backup engine using `thiserror`.
//! Each subsystem gets its own enum, folded into the top-level [`SpareError`]
//! via `#[from]`, so a caller deep in the envoy can return `?` all the way up
//! to the CLI without manual conversions.

use std::path::PathBuf;
use thiserror::Error;

/// Top-level error type encompassing all failure modes in the backup system.
#[derive(Error, Debug)]
pub enum SpareError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Envoy(#[from] EnvoyError),

    #[error(transparent)]
    Inventory(#[from] InventoryError),

    #[error(transparent)]
    Snapshot(#[from] SnapshotError),

    #[error(transparent)]
    Recovery(#[from] RecoveryError),

    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("object store error: {0}")]
    ObjectStore(#[from] ObjectStoreError),

    #[error("failed to (de)serialize snapshot metadata: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Configuration parsing and validation errors.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("config file not found (searched: {searched:?})")]
    NotFound { searched: Vec<PathBuf> },

    #[error("failed to parse config: {source}")]
    Parse {
        #[source]
        source: toml::de::Error,
    },

    #[error("invalid config: {message}")]
    Validation { message: String },
}

/// Errors raised by the envoy (bucket/chunk gateway).
#[derive(Error, Debug)]
pub enum EnvoyError {
    #[error("prefix '{prefix}' is not a valid envoy prefix")]
    InvalidPrefix { prefix: String },

    #[error("prefix '{prefix}' already exists")]
    ExistingPrefix { prefix: String },

    #[error("bucket '{bucket}' is already locked")]
    BucketAlreadyLocked { bucket: String },

    #[error("bucket '{bucket}' is not locked")]
    BucketNotLocked { bucket: String },

    #[error("bucket '{bucket}' is not owned by spare (missing .spare marker)")]
    BucketOtherwiseUsed { bucket: String },
}

/// Errors raised while scanning a source tree into an inventory.
#[derive(Error, Debug)]
pub enum InventoryError {
    #[error("{path} changed while it was being read")]
    FileChangedDuringRead { path: PathBuf },
}

/// Errors raised while backing up or validating snapshots.
#[derive(Error, Debug)]
pub enum SnapshotError {
    #[error("{path} changed between inventory scan and upload")]
    FileChangedBeforeUpload { path: PathBuf },

    #[error("cannot prune to {remaining} snapshots, at least 1 must remain")]
    PruneToZero { remaining: i64 },

    #[error("snapshot identity mismatch: bucket belongs to '{found}', inventory is '{expected}'")]
    SnapshotMismatch { expected: String, found: String },

    #[error("no snapshot matches selector '{0}'")]
    NotFound(String),
}

/// Errors raised while restoring a snapshot to a target directory.
#[derive(Error, Debug)]
pub enum RecoveryError {
    #[error("target path {0} is not an empty directory")]
    TargetPathNotEmpty(PathBuf),
}

/// Block codec (compress + authenticated encryption) errors.
#[derive(Error, Debug)]
pub enum CodecError {
    #[error("unknown codec id: {0}")]
    UnknownCodec(String),

    #[error("authentication failed: ciphertext is corrupt or the password is wrong")]
    Integrity,

    #[error("compression failed: {0}")]
    Compression(#[source] std::io::Error),
}

/// Errors surfaced by the `ObjectStore` trait and its backends.
#[derive(Error, Debug)]
pub enum ObjectStoreError {
    #[error("bucket does not exist: {0}")]
    NoSuchBucket(String),

    #[error("object does not exist: {0}")]
    NoSuchKey(String),

    #[error("backend request failed: {0}")]
    Backend(String),
}

pub type Result<T> = std::result::Result<T, SpareError>;
