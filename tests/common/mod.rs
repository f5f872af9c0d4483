//! Shared doubles for integration tests

#![allow(dead_code)]

use async_trait::async_trait;
use catalog_preserver::digest::Digest;
use catalog_preserver::record::{PreservationReceipt, PreservedRecord, Record, ValidationResult};
use catalog_preserver::resolver::ChecksumEvent;
use catalog_preserver::source::{Archive, ContainerStream, RecordStream};
use catalog_preserver::{Config, GuidResolver, LocalArchive, MetadataTransform, PreservationError, RecordSource};
use catalog_preserver::DigestAlgorithm;
use futures_util::stream;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use uuid::Uuid;

/// Catalog double that keeps everything in memory
#[derive(Default)]
pub struct MemorySource {
    ready: Mutex<Vec<Record>>,
    metadata: Mutex<HashMap<Uuid, Vec<u8>>>,
    preserved: Mutex<Vec<PreservedRecord>>,
    mark_calls: AtomicUsize,
    expected_override: Mutex<HashMap<Uuid, Digest>>,
    results: Mutex<Vec<(Uuid, ValidationResult)>>,
    unavailable: AtomicBool,
}

impl MemorySource {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn add_ready(&self, record: Record, metadata: &[u8]) {
        self.metadata.lock().unwrap().insert(record.id, metadata.to_vec());
        self.ready.lock().unwrap().push(record);
    }

    pub fn preserved(&self) -> Vec<PreservedRecord> {
        self.preserved.lock().unwrap().clone()
    }

    pub fn preserved_ids(&self) -> Vec<Uuid> {
        self.preserved().into_iter().map(|p| p.record.id).collect()
    }

    pub fn mark_calls(&self) -> usize {
        self.mark_calls.load(Ordering::SeqCst)
    }

    pub fn override_expected(&self, record_id: Uuid, digest: Digest) {
        self.expected_override.lock().unwrap().insert(record_id, digest);
    }

    pub fn results(&self) -> Vec<(Uuid, ValidationResult)> {
        self.results.lock().unwrap().clone()
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn check_available(&self) -> Result<(), PreservationError> {
        if self.unavailable.load(Ordering::SeqCst) {
            Err(PreservationError::SourceUnavailable("catalog offline".to_string()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl RecordSource for MemorySource {
    fn enumerate_ready_records(&self, collection_id: &str) -> RecordStream<'_, Record> {
        if let Err(e) = self.check_available() {
            return Box::pin(stream::once(async move { Err(e) }));
        }
        let done = self.preserved_ids();
        let records: Vec<_> = self
            .ready
            .lock()
            .unwrap()
            .iter()
            .filter(|r| r.collection_id == collection_id && !done.contains(&r.id))
            .cloned()
            .map(Ok)
            .collect();
        Box::pin(stream::iter(records))
    }

    fn enumerate_preserved_records(&self, collection_id: &str) -> RecordStream<'_, PreservedRecord> {
        if let Err(e) = self.check_available() {
            return Box::pin(stream::once(async move { Err(e) }));
        }
        let records: Vec<_> = self
            .preserved()
            .into_iter()
            .filter(|p| p.record.collection_id == collection_id)
            .map(Ok)
            .collect();
        Box::pin(stream::iter(records))
    }

    async fn raw_metadata(&self, record: &Record) -> Result<Vec<u8>, PreservationError> {
        self.check_available()?;
        self.metadata
            .lock()
            .unwrap()
            .get(&record.id)
            .cloned()
            .ok_or_else(|| PreservationError::NotFound(format!("metadata of {}", record.id)))
    }

    async fn mark_preserved(
        &self,
        record: &Record,
        receipt: &PreservationReceipt,
    ) -> Result<(), PreservationError> {
        self.check_available()?;
        self.mark_calls.fetch_add(1, Ordering::SeqCst);
        self.preserved.lock().unwrap().push(PreservedRecord {
            record: record.clone(),
            receipt: receipt.clone(),
        });
        Ok(())
    }

    async fn expected_checksum(&self, record: &PreservedRecord) -> Result<Digest, PreservationError> {
        self.check_available()?;
        Ok(self
            .expected_override
            .lock()
            .unwrap()
            .get(&record.record.id)
            .cloned()
            .unwrap_or_else(|| record.receipt.container_checksum.clone()))
    }

    async fn write_validation_result(
        &self,
        record: &PreservedRecord,
        result: &ValidationResult,
    ) -> Result<(), PreservationError> {
        self.check_available()?;
        self.results
            .lock()
            .unwrap()
            .push((record.record.id, result.clone()));
        Ok(())
    }
}

/// Local pillar archive with injectable failures and delays
pub struct ScriptedArchive {
    pub inner: LocalArchive,
    refuse_uploads: AtomicUsize,
    unavailable: AtomicBool,
    upload_delay: Mutex<Option<Duration>>,
    fetch_delay: Mutex<Option<Duration>>,
    upload_calls: Mutex<Vec<PathBuf>>,
}

impl ScriptedArchive {
    pub async fn new(root: &Path, pillars: &[&str]) -> Arc<Self> {
        let inner = LocalArchive::new(
            root,
            pillars.iter().map(|p| p.to_string()).collect(),
            DigestAlgorithm::Sha1,
        )
        .await
        .unwrap();
        Arc::new(Self {
            inner,
            refuse_uploads: AtomicUsize::new(0),
            unavailable: AtomicBool::new(false),
            upload_delay: Mutex::new(None),
            fetch_delay: Mutex::new(None),
            upload_calls: Mutex::new(Vec::new()),
        })
    }

    /// Refuse the next `count` uploads
    pub fn refuse_next_uploads(&self, count: usize) {
        self.refuse_uploads.store(count, Ordering::SeqCst);
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    pub fn delay_uploads(&self, delay: Duration) {
        *self.upload_delay.lock().unwrap() = Some(delay);
    }

    pub fn delay_fetches(&self, delay: Duration) {
        *self.fetch_delay.lock().unwrap() = Some(delay);
    }

    pub fn upload_calls(&self) -> Vec<PathBuf> {
        self.upload_calls.lock().unwrap().clone()
    }

    fn check_available(&self) -> Result<(), PreservationError> {
        if self.unavailable.load(Ordering::SeqCst) {
            Err(PreservationError::ArchiveUnavailable("pillars offline".to_string()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl Archive for ScriptedArchive {
    async fn upload(&self, container: &Path, collection_id: &str) -> Result<bool, PreservationError> {
        self.upload_calls.lock().unwrap().push(container.to_path_buf());
        self.check_available()?;
        let delay = *self.upload_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let refused = self
            .refuse_uploads
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if refused {
            return Ok(false);
        }
        self.inner.upload(container, collection_id).await
    }

    async fn fetch_container(
        &self,
        container_id: &str,
        collection_id: &str,
    ) -> Result<ContainerStream, PreservationError> {
        self.check_available()?;
        let delay = *self.fetch_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.inner.fetch_container(container_id, collection_id).await
    }

    async fn fetch_checksums(
        &self,
        container_id: &str,
        collection_id: &str,
    ) -> Result<Vec<ChecksumEvent>, PreservationError> {
        self.check_available()?;
        let delay = *self.fetch_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.inner.fetch_checksums(container_id, collection_id).await
    }
}

/// Transform that looks the raw metadata up as a file id and embeds its GUID
pub struct GuidTransform;

impl MetadataTransform for GuidTransform {
    fn transform(&self, raw: &[u8], guids: &GuidResolver) -> Result<Vec<u8>, PreservationError> {
        let file_id = std::str::from_utf8(raw)
            .map_err(|e| PreservationError::Transform(e.to_string()))?
            .trim();
        if file_id.is_empty() {
            return Err(PreservationError::Transform("empty metadata".to_string()));
        }
        let guid = guids.guid(file_id)?;
        let order = guids.order(file_id)?;
        Ok(format!("<mets OBJID=\"{}\" ORDER=\"{}\"/>", guid, order).into_bytes())
    }
}

/// Test configuration rooted in a temporary directory
pub fn config(temp_dir: &TempDir) -> Config {
    Config {
        work_dir: temp_dir.path().join("work"),
        ..Default::default()
    }
}

/// Write a payload file and build a record for it
pub async fn record(dir: &Path, collection: &str, payload: &[u8]) -> Record {
    let id = Uuid::new_v4();
    let path = dir.join(format!("{}.bin", id));
    tokio::fs::write(&path, payload).await.unwrap();
    Record::new(id, "photos", collection, path)
}
