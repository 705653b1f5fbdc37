//! On-disk configuration: keyring locations, cache roots, and the
//! weak-crypto policy, persisted as TOML.
//!
//! The teacher crate ties its configuration to `proxmox-section-config` +
//! `proxmox-schema` + `proxmox-router`, a stack built around the Proxmox
//! JSON-API/CLI surface this crate doesn't have. Since there's no API
//! surface here to describe, configuration is instead a plain `serde`
//! struct persisted as TOML, the same pattern `AOSC-Dev-aoscbootstrap` and
//! `hodgesds-buckos` use for their own config files.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::keyring::WeakCryptoConfig;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Root directory the predownload cache and preloader pool live under.
    pub cache_root: PathBuf,
    /// Trusted keyring file path.
    pub trusted_keyring: PathBuf,
    /// General (known-but-not-trusted) keyring file path.
    pub general_keyring: PathBuf,
    pub weak_crypto: WeakCryptoConfig,
    pub transfer: TransferConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferConfig {
    /// Mirrored fields from spec.md §4.5's batch-size series, kept
    /// configurable so tests can exercise smaller batches.
    pub range_batch_sizes: Vec<usize>,
    pub max_concurrent_connections: usize,
    pub connect_timeout_secs: u64,
    pub low_speed_limit_bytes_per_sec: u64,
    pub low_speed_time_secs: u64,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            range_batch_sizes: vec![255, 127, 63, 15, 5, 1],
            max_concurrent_connections: 4,
            connect_timeout_secs: 30,
            low_speed_limit_bytes_per_sec: 1024,
            low_speed_time_secs: 30,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            cache_root: PathBuf::from("/var/cache/repo-provision"),
            trusted_keyring: PathBuf::from("/etc/repo-provision/trusted.gpg"),
            general_keyring: PathBuf::from("/etc/repo-provision/general.gpg"),
            weak_crypto: WeakCryptoConfig::default(),
            transfer: TransferConfig::default(),
        }
    }
}

impl Config {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let text = fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("reading config {}: {e}", path.display()))?;
        toml::from_str(&text).map_err(|e| anyhow::anyhow!("parsing config {}: {e}", path.display()))
    }

    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        let text = toml::to_string_pretty(self)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, text)?;
        Ok(())
    }

    pub fn predownload_dir(&self) -> PathBuf {
        self.cache_root.join("predownload")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_toml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        let config = Config::default();
        config.save(&path).unwrap();
        let loaded = Config::load(&path).unwrap();
        assert_eq!(loaded.cache_root, config.cache_root);
        assert_eq!(
            loaded.transfer.range_batch_sizes,
            config.transfer.range_batch_sizes
        );
    }
}
