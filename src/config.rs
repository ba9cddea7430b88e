//! Operator configuration, loaded from a YAML file and validated before the
//! core starts.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::client::TransportOptions;
use crate::error::MirrorError;
use crate::shard::DEFAULT_SHARD_SIZE;
use crate::sync::SyncOptions;
use crate::torrent::PackagerConfig;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MirrorConfig {
    /// The known-logs JSON file (log_list.json from
    /// certificate-transparency.org).
    pub log_list_file: PathBuf,
    /// Root directory of the archive; one subdirectory per log.
    pub archive_root: PathBuf,
    /// Where torrents, magnets, and the RSS feed land.
    pub torrent_dir: PathBuf,
    /// HTTP prefix under which the operator serves the torrent files.
    pub download_url: String,
    /// Concurrent fetch workers per log.
    #[serde(default = "defaults::workers")]
    pub workers: usize,
    /// Entries per `get-entries` request; the server may cap it lower.
    #[serde(default = "defaults::batch_size")]
    pub batch_size: u64,
    /// Entries per shard; must be a power of two.
    #[serde(default = "defaults::shard_size")]
    pub shard_size: u64,
    #[serde(default)]
    pub trackers: Vec<String>,
    /// Seed peers in `host:port` form.
    #[serde(default)]
    pub peers: Vec<String>,
    /// AS number announced in the torrent comment.
    #[serde(default)]
    pub asn: Option<u32>,
    #[serde(default = "defaults::request_timeout_seconds")]
    pub request_timeout_seconds: u64,
    /// Attempts per request before a transient failure aborts the run.
    #[serde(default = "defaults::max_retries")]
    pub max_retries: u32,
}

mod defaults {
    pub fn workers() -> usize {
        4
    }
    pub fn batch_size() -> u64 {
        1024
    }
    pub fn shard_size() -> u64 {
        super::DEFAULT_SHARD_SIZE
    }
    pub fn request_timeout_seconds() -> u64 {
        60
    }
    pub fn max_retries() -> u32 {
        5
    }
}

impl MirrorConfig {
    pub fn validate(&self) -> Result<(), MirrorError> {
        if !self.log_list_file.is_file() {
            return Err(MirrorError::Config(format!(
                "known-logs file {} cannot be read",
                self.log_list_file.display()
            )));
        }
        if self.workers == 0 {
            return Err(MirrorError::Config("workers must be at least 1".into()));
        }
        if self.batch_size == 0 {
            return Err(MirrorError::Config("batch_size must be at least 1".into()));
        }
        if self.shard_size < 2 || !self.shard_size.is_power_of_two() {
            return Err(MirrorError::Config(format!(
                "shard_size {} is not a power of two >= 2",
                self.shard_size
            )));
        }
        if self.download_url.is_empty() {
            return Err(MirrorError::Config("download_url must be set".into()));
        }
        std::fs::create_dir_all(&self.archive_root)?;
        std::fs::create_dir_all(&self.torrent_dir)?;
        Ok(())
    }

    pub fn transport_options(&self) -> TransportOptions {
        TransportOptions {
            request_timeout: Duration::from_secs(self.request_timeout_seconds),
            max_attempts: self.max_retries,
            ..TransportOptions::default()
        }
    }

    pub fn sync_options(&self) -> SyncOptions {
        SyncOptions {
            workers: self.workers,
            batch: self.batch_size,
        }
    }

    pub fn packager_config(&self) -> PackagerConfig {
        PackagerConfig {
            torrent_dir: self.torrent_dir.clone(),
            download_url: self.download_url.clone(),
            trackers: self.trackers.clone(),
            peers: self.peers.clone(),
            asn: self.asn,
        }
    }
}

/// Load configuration from a YAML file.
pub fn load_config_from_file(path: &Path) -> Result<MirrorConfig, MirrorError> {
    let raw = std::fs::read_to_string(path)?;
    serde_yaml::from_str(&raw)
        .map_err(|e| MirrorError::Config(format!("{}: {e}", path.display())))
}
