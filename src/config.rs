//! Configuration for catalog-preserver

use crate::container::PackerSettings;
use crate::digest::DigestAlgorithm;
use crate::error::PreservationError;
use crate::levels::SoftwareAgent;
use crate::resolver::{AgreementPolicy, ChecksumResolver};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default working directory for open and retained containers
pub fn default_work_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("catalog-preserver")
}

/// What to do with a record that alone exceeds the container size limit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum OversizePolicy {
    /// Pack it anyway; the container is flushed right after
    #[default]
    Allow,
    /// Refuse the record without touching the container
    Reject,
}

/// Per-collection overrides
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CollectionConfig {
    /// Size limit in bytes for this collection's containers
    pub container_size_limit: Option<u64>,
}

/// Configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Directory for open and not-yet-uploaded containers
    #[serde(default = "default_work_dir")]
    pub work_dir: PathBuf,

    /// Container size in bytes at which a container is closed and uploaded
    #[serde(default = "default_container_size_limit")]
    pub container_size_limit: u64,

    /// Algorithm for per-entry block digests
    #[serde(default)]
    pub block_digest_algorithm: DigestAlgorithm,

    /// Algorithm for whole-container checksums, as reported by the pillars
    #[serde(default)]
    pub container_checksum_algorithm: DigestAlgorithm,

    /// Minimum number of pillars that must report the agreed checksum
    #[serde(default = "default_min_replicas")]
    pub min_replicas: usize,

    /// Agreement required between pillars
    #[serde(default)]
    pub agreement: AgreementPolicy,

    /// Upload timeout in seconds
    #[serde(default = "default_upload_timeout")]
    pub upload_timeout_secs: u64,

    /// Fetch / checksum request timeout in seconds
    #[serde(default = "default_fetch_timeout")]
    pub fetch_timeout_secs: u64,

    /// Handling of records larger than the container limit
    #[serde(default)]
    pub oversize_policy: OversizePolicy,

    /// Per-collection overrides, keyed by collection id
    #[serde(default)]
    pub collections: HashMap<String, CollectionConfig>,

    /// Version reported in the info entry of every container
    #[serde(default)]
    pub agent_version: Option<String>,
}

fn default_container_size_limit() -> u64 {
    1024 * 1024 * 1024
}

fn default_min_replicas() -> usize {
    1
}

fn default_upload_timeout() -> u64 {
    3600
}

fn default_fetch_timeout() -> u64 {
    600
}

impl Default for Config {
    fn default() -> Self {
        Self {
            work_dir: default_work_dir(),
            container_size_limit: default_container_size_limit(),
            block_digest_algorithm: DigestAlgorithm::Sha1,
            container_checksum_algorithm: DigestAlgorithm::Sha1,
            min_replicas: default_min_replicas(),
            agreement: AgreementPolicy::Majority,
            upload_timeout_secs: default_upload_timeout(),
            fetch_timeout_secs: default_fetch_timeout(),
            oversize_policy: OversizePolicy::Allow,
            collections: HashMap::new(),
            agent_version: None,
        }
    }
}

impl Config {
    /// Load config from file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, PreservationError> {
        let content = std::fs::read_to_string(path)?;
        let config: Self =
            toml::from_str(&content).map_err(|e| PreservationError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Save config to file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), PreservationError> {
        let content =
            toml::to_string_pretty(self).map_err(|e| PreservationError::Config(e.to_string()))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Reject settings the coordinator cannot work with
    pub fn validate(&self) -> Result<(), PreservationError> {
        if self.container_size_limit == 0 {
            return Err(PreservationError::Config(
                "container_size_limit must be positive".to_string(),
            ));
        }
        if let Some((id, _)) = self
            .collections
            .iter()
            .find(|(_, c)| c.container_size_limit == Some(0))
        {
            return Err(PreservationError::Config(format!(
                "container_size_limit for collection '{}' must be positive",
                id
            )));
        }
        if self.min_replicas == 0 {
            return Err(PreservationError::Config(
                "min_replicas must be at least 1".to_string(),
            ));
        }
        if self.upload_timeout_secs == 0 || self.fetch_timeout_secs == 0 {
            return Err(PreservationError::Config(
                "timeouts must be positive".to_string(),
            ));
        }
        Ok(())
    }

    /// Size limit for one collection's containers
    pub fn size_limit_for(&self, collection_id: &str) -> u64 {
        self.collections
            .get(collection_id)
            .and_then(|c| c.container_size_limit)
            .unwrap_or(self.container_size_limit)
    }

    pub fn upload_timeout(&self) -> Duration {
        Duration::from_secs(self.upload_timeout_secs)
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch_timeout_secs)
    }

    pub fn resolver(&self) -> ChecksumResolver {
        ChecksumResolver::new(self.min_replicas, self.agreement)
            .with_algorithm(self.container_checksum_algorithm)
    }

    pub fn packer_settings(&self) -> PackerSettings {
        PackerSettings {
            block_algorithm: self.block_digest_algorithm,
            container_algorithm: self.container_checksum_algorithm,
            agent_label: SoftwareAgent::preservation_service(self.agent_version.clone()).label(),
        }
    }

    /// Get containers directory
    pub fn containers_dir(&self) -> PathBuf {
        self.work_dir.join("containers")
    }

    /// Get ledger database path
    pub fn ledger_path(&self) -> PathBuf {
        self.work_dir.join("ledger.sled")
    }
}
