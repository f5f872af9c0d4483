//! Archive access
//!
//! Timeout wrappers for every archive call the core makes, and
//! [`LocalArchive`], a filesystem archive that keeps one copy of each
//! container per pillar directory.

use crate::container::packer::CONTAINER_EXTENSION;
use crate::digest::{digest_file, DigestAlgorithm};
use crate::error::PreservationError;
use crate::resolver::ChecksumEvent;
use crate::source::{Archive, ContainerStream};
use async_trait::async_trait;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs;
use tracing::{debug, info, warn};

/// Run an archive call with a deadline. An elapsed deadline becomes
/// [`PreservationError::Timeout`].
pub async fn with_timeout<T, F>(
    duration: Duration,
    operation: &str,
    future: F,
) -> Result<T, PreservationError>
where
    F: Future<Output = Result<T, PreservationError>>,
{
    match tokio::time::timeout(duration, future).await {
        Ok(result) => result,
        Err(_) => {
            warn!(operation = %operation, timeout_ms = duration.as_millis() as u64, "Archive call timed out");
            Err(PreservationError::Timeout(format!(
                "{} did not finish within {:?}",
                operation, duration
            )))
        }
    }
}

/// Upload with a deadline. A refusal is turned into [`PreservationError::Upload`].
pub async fn upload_with_timeout(
    archive: &dyn Archive,
    path: &Path,
    container_id: &str,
    collection_id: &str,
    duration: Duration,
) -> Result<(), PreservationError> {
    let accepted = with_timeout(
        duration,
        &format!("upload of container {}", container_id),
        archive.upload(path, collection_id),
    )
    .await?;
    if accepted {
        Ok(())
    } else {
        Err(PreservationError::Upload(container_id.to_string()))
    }
}

/// Filesystem archive with one directory per pillar.
///
/// Layout: `<root>/<pillar>/<collection>/<container id>.warc`.
pub struct LocalArchive {
    root: PathBuf,
    pillars: Vec<String>,
    algorithm: DigestAlgorithm,
}

impl LocalArchive {
    /// Create a local archive with the given pillar names
    pub async fn new<P: AsRef<Path>>(
        root: P,
        pillars: Vec<String>,
        algorithm: DigestAlgorithm,
    ) -> Result<Self, PreservationError> {
        if pillars.is_empty() {
            return Err(PreservationError::Config(
                "a local archive needs at least one pillar".to_string(),
            ));
        }
        let root = root.as_ref().to_path_buf();
        for pillar in &pillars {
            fs::create_dir_all(root.join(pillar)).await?;
        }
        info!(path = %root.display(), pillars = pillars.len(), "Initialized local archive");
        Ok(Self {
            root,
            pillars,
            algorithm,
        })
    }

    pub fn pillars(&self) -> &[String] {
        &self.pillars
    }

    /// Where a pillar keeps a container
    pub fn container_path(&self, pillar: &str, collection_id: &str, container_id: &str) -> PathBuf {
        self.root
            .join(pillar)
            .join(collection_id)
            .join(format!("{}.{}", container_id, CONTAINER_EXTENSION))
    }

    /// Whether any pillar holds the container
    pub async fn contains(&self, container_id: &str, collection_id: &str) -> bool {
        for pillar in &self.pillars {
            if fs::metadata(self.container_path(pillar, collection_id, container_id))
                .await
                .is_ok()
            {
                return true;
            }
        }
        false
    }
}

fn container_id_of(path: &Path) -> Result<String, PreservationError> {
    path.file_stem()
        .and_then(|s| s.to_str())
        .map(str::to_string)
        .ok_or_else(|| {
            PreservationError::Upload(format!("{} has no container file name", path.display()))
        })
}

#[async_trait]
impl Archive for LocalArchive {
    async fn upload(&self, container: &Path, collection_id: &str) -> Result<bool, PreservationError> {
        let container_id = container_id_of(container)?;
        let checksum = digest_file(container, self.algorithm).await?;

        for pillar in &self.pillars {
            let target = self.container_path(pillar, collection_id, &container_id);
            if fs::metadata(&target).await.is_ok() {
                // Containers are immutable once archived
                let existing = digest_file(&target, self.algorithm).await?;
                if !existing.matches(&checksum) {
                    warn!(pillar = %pillar, container = %container_id, "Refusing to overwrite archived container");
                    return Ok(false);
                }
                continue;
            }
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent).await?;
            }
            let partial = target.with_extension("partial");
            fs::copy(container, &partial).await?;
            fs::rename(&partial, &target).await?;
            debug!(pillar = %pillar, container = %container_id, "Stored container copy");
        }

        info!(container = %container_id, collection = %collection_id, pillars = self.pillars.len(), "Archived container");
        Ok(true)
    }

    async fn fetch_container(
        &self,
        container_id: &str,
        collection_id: &str,
    ) -> Result<ContainerStream, PreservationError> {
        for pillar in &self.pillars {
            let path = self.container_path(pillar, collection_id, container_id);
            match fs::File::open(&path).await {
                Ok(file) => {
                    debug!(pillar = %pillar, container = %container_id, "Fetching container");
                    return Ok(Box::new(file));
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Err(PreservationError::NotFound(format!(
            "container {} in collection {}",
            container_id, collection_id
        )))
    }

    async fn fetch_checksums(
        &self,
        container_id: &str,
        collection_id: &str,
    ) -> Result<Vec<ChecksumEvent>, PreservationError> {
        let mut events = Vec::new();
        for pillar in &self.pillars {
            let path = self.container_path(pillar, collection_id, container_id);
            if fs::metadata(&path).await.is_err() {
                continue;
            }
            let digest = digest_file(&path, self.algorithm).await?;
            events.push(ChecksumEvent::new(pillar, container_id, collection_id, digest.value));
        }
        if events.is_empty() {
            return Err(PreservationError::NotFound(format!(
                "container {} in collection {}",
                container_id, collection_id
            )));
        }
        Ok(events)
    }
}
