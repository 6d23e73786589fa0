//! # Configuration
//!
//! Connection settings (endpoint, credentials, password, bucket, path) are
//! supplied per invocation by CLI flags, each with a `SPARE_*` environment
//! variable fallback handled by `clap` directly — there's nothing here to
//! search or parse for those.
//!
//! What lives in this module are the tunables no CLI flag covers: block
//! size, object-store retry/timeout knobs, the default codec, and worker
//! pool sizes. They come from an **optional** TOML file, found by searching
//! the same standard locations a system service would, in descending
//! priority order. A missing file is not an error — every [`Tunables`]
//! field has a sensible default.

use crate::error::{ConfigError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use std::{env, fs};

/// Tunables not exposed as CLI flags. Every field defaults to the value the
/// engine already uses when no settings file is present.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Tunables {
    /// Plaintext block size, in bytes, before compression and sealing.
    #[serde(default = "default_block_size")]
    pub block_size: usize,

    /// Codec id used for new snapshots (`"aes-siv"` or `"aes-gcm"`).
    #[serde(default = "default_codec")]
    pub codec: String,

    /// Object store connect timeout, in seconds.
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,

    /// Object store read timeout, in seconds.
    #[serde(default = "default_read_timeout")]
    pub read_timeout_secs: u64,

    /// Maximum number of attempts (including the first) per object store call.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Number of snapshots `create` retains after a successful backup.
    #[serde(default = "default_keep")]
    pub keep: i64,
}

impl Default for Tunables {
    fn default() -> Self {
        Self {
            block_size: default_block_size(),
            codec: default_codec(),
            connect_timeout_secs: default_connect_timeout(),
            read_timeout_secs: default_read_timeout(),
            max_attempts: default_max_attempts(),
            keep: default_keep(),
        }
    }
}

impl Tunables {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.read_timeout_secs)
    }

    pub fn codec(&self) -> Result<crate::block::Codec> {
        Ok(crate::block::Codec::from_id(&self.codec)?)
    }
}

fn default_block_size() -> usize {
    crate::chunked::DEFAULT_BLOCK_SIZE
}
fn default_codec() -> String {
    crate::block::DEFAULT_CODEC.to_string()
}
fn default_connect_timeout() -> u64 {
    5
}
fn default_read_timeout() -> u64 {
    10
}
fn default_max_attempts() -> u32 {
    2
}
fn default_keep() -> i64 {
    1
}

/// Standard configuration file search paths, in descending priority order.
fn config_search_paths() -> Vec<PathBuf> {
    let mut paths = vec![PathBuf::from("/etc/spare.toml")];
    if let Ok(xdg) = env::var("XDG_CONFIG_HOME") {
        paths.push(PathBuf::from(format!("{xdg}/spare.toml")));
    } else if let Ok(home) = env::var("HOME") {
        paths.push(PathBuf::from(format!("{home}/.config/spare.toml")));
    }
    paths.push(PathBuf::from("spare.toml"));
    paths
}

/// Loads tunables from the first found settings file, or the defaults if
/// none of the search paths exist.
pub fn load_tunables() -> Result<Tunables> {
    for path in config_search_paths() {
        if path.exists() {
            return load_tunables_from(&path);
        }
    }
    Ok(Tunables::default())
}

/// Loads and parses a specific tunables file.
pub fn load_tunables_from(path: &Path) -> Result<Tunables> {
    let content = fs::read_to_string(path)
        .map_err(|e| anyhow::anyhow!("failed to read {}: {e}", path.display()))?;
    let tunables: Tunables = toml::from_str(&content).map_err(|e| ConfigError::Parse { source: e })?;
    validate(&tunables)?;
    Ok(tunables)
}

fn validate(tunables: &Tunables) -> std::result::Result<(), ConfigError> {
    if tunables.block_size == 0 {
        return Err(ConfigError::Validation {
            message: "block_size must be greater than 0".to_string(),
        });
    }
    if tunables.keep < 1 {
        return Err(ConfigError::Validation {
            message: format!("keep must be at least 1, got {}", tunables.keep),
        });
    }
    crate::block::Codec::from_id(&tunables.codec).map_err(|_| ConfigError::Validation {
        message: format!("unknown codec id: {}", tunables.codec),
    })?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let tunables = Tunables::default();
        assert!(validate(&tunables).is_ok());
    }

    #[test]
    fn parses_a_minimal_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("spare.toml");
        fs::write(&path, "codec = \"aes-gcm\"\nkeep = 3\n").unwrap();

        let tunables = load_tunables_from(&path).unwrap();
        assert_eq!(tunables.codec, "aes-gcm");
        assert_eq!(tunables.keep, 3);
        assert_eq!(tunables.block_size, default_block_size());
    }

    #[test]
    fn rejects_unknown_codec() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("spare.toml");
        fs::write(&path, "codec = \"rot13\"\n").unwrap();
        assert!(load_tunables_from(&path).is_err());
    }

    #[test]
    fn rejects_keep_less_than_one() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("spare.toml");
        fs::write(&path, "keep = 0\n").unwrap();
        assert!(load_tunables_from(&path).is_err());
    }

    #[test]
    fn missing_search_paths_fall_back_to_defaults() {
        // the cwd-relative "spare.toml" candidate could in principle exist
        // in a dirty checkout, but never in a clean test run.
        let tunables = load_tunables().unwrap();
        assert_eq!(tunables.block_size, default_block_size());
    }
}
