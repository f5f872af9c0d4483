//! Upload/batch coordinator
//!
//! Keeps one open container per collection. Each submitted record is packed
//! into its collection's container; once the container reaches the size
//! threshold it is closed and uploaded. Containers whose upload fails stay on
//! local disk, tracked separately from the open container, until a later
//! flush gets them into the archive.
//!
//! All state of one collection sits behind its own async mutex, so producers
//! feeding different collections never wait on each other.

use crate::archive::upload_with_timeout;
use crate::config::{Config, OversizePolicy};
use crate::container::{ContainerHandle, ContainerPacker, PackerSettings, ReportFailure};
use crate::error::PreservationError;
use crate::events::{EventBus, PreservationEvent};
use crate::ledger::{ContainerLedger, LedgerEntry};
use crate::record::{PackedEntry, Record};
use crate::source::{Archive, RecordSource};
use dashmap::DashMap;
use std::sync::Arc;
use tokio::fs;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Per-collection state
#[derive(Default)]
struct CollectionSlot {
    /// Container accepting new records
    open: Option<ContainerPacker>,
    /// Closed containers not yet confirmed by the archive, oldest first
    pending: Vec<ContainerHandle>,
}

/// A container the archive confirmed during a flush
#[derive(Debug)]
pub struct UploadedContainer {
    pub container_id: String,
    pub records: usize,
    /// Records the source could not mark as preserved
    pub report_failures: Vec<ReportFailure>,
}

/// A container kept on disk because its upload failed
#[derive(Debug)]
pub struct RetainedContainer {
    pub container_id: String,
    pub error: PreservationError,
}

/// What one flush of a collection did
#[derive(Debug, Default)]
pub struct FlushReport {
    pub collection_id: String,
    /// Container closed by this flush, if the open one held records
    pub closed: Option<String>,
    pub uploaded: Vec<UploadedContainer>,
    pub retained: Vec<RetainedContainer>,
}

impl FlushReport {
    fn new(collection_id: &str) -> Self {
        Self {
            collection_id: collection_id.to_string(),
            ..Default::default()
        }
    }

    /// Records confirmed preserved by this flush
    pub fn preserved_records(&self) -> usize {
        self.uploaded
            .iter()
            .map(|u| u.records - u.report_failures.len())
            .sum()
    }

    /// Whether every container this flush tried went into the archive
    pub fn is_complete(&self) -> bool {
        self.retained.is_empty()
    }
}

/// Result of submitting one record
#[derive(Debug)]
pub struct SubmitOutcome {
    pub entry: PackedEntry,
    /// Present when this record pushed the container over its threshold
    pub flush: Option<FlushReport>,
}

/// Groups records into containers per collection and ships them
pub struct PreservationCoordinator {
    config: Config,
    settings: PackerSettings,
    source: Arc<dyn RecordSource>,
    archive: Arc<dyn Archive>,
    ledger: Option<Arc<ContainerLedger>>,
    events: Arc<EventBus>,
    slots: DashMap<String, Arc<Mutex<CollectionSlot>>>,
}

impl PreservationCoordinator {
    pub fn new(
        config: Config,
        source: Arc<dyn RecordSource>,
        archive: Arc<dyn Archive>,
    ) -> Result<Self, PreservationError> {
        config.validate()?;
        let settings = config.packer_settings();
        Ok(Self {
            config,
            settings,
            source,
            archive,
            ledger: None,
            events: Arc::new(EventBus::new()),
            slots: DashMap::new(),
        })
    }

    /// Persist closed-but-unuploaded containers in a ledger
    pub fn with_ledger(mut self, ledger: Arc<ContainerLedger>) -> Self {
        self.ledger = Some(ledger);
        self
    }

    pub fn with_event_bus(mut self, events: Arc<EventBus>) -> Self {
        self.events = events;
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn events(&self) -> Arc<EventBus> {
        self.events.clone()
    }

    fn slot(&self, collection_id: &str) -> Arc<Mutex<CollectionSlot>> {
        self.slots
            .entry(collection_id.to_string())
            .or_default()
            .clone()
    }

    /// Collections this coordinator has seen
    pub fn collections(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.slots.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids
    }

    /// Size of the collection's open container, if one is open
    pub async fn open_container_size(&self, collection_id: &str) -> Option<u64> {
        let slot = self.slot(collection_id);
        let slot = slot.lock().await;
        match &slot.open {
            Some(packer) => Some(packer.size().await),
            None => None,
        }
    }

    /// Closed containers of a collection still waiting for the archive
    pub async fn pending_containers(&self, collection_id: &str) -> Vec<ContainerHandle> {
        let slot = self.slot(collection_id);
        let slot = slot.lock().await;
        slot.pending.clone()
    }

    /// Pack one record into its collection's open container, flushing the
    /// collection when the container reaches its size threshold.
    ///
    /// A [`PreservationError::Packaging`] error leaves the container open and
    /// usable for the next record.
    pub async fn submit(
        &self,
        record: &Record,
        metadata: &[u8],
    ) -> Result<SubmitOutcome, PreservationError> {
        let collection_id = record.collection_id.as_str();
        let limit = self.config.size_limit_for(collection_id);
        let slot = self.slot(collection_id);
        let mut slot = slot.lock().await;

        if let Some(packer) = slot.open.take() {
            if packer.is_poisoned().await {
                warn!(container = %packer.id(), collection = %collection_id, "Discarding unusable container");
                if let Err(e) = packer.discard().await {
                    warn!(collection = %collection_id, error = %e, "Failed to remove unusable container");
                }
            } else {
                slot.open = Some(packer);
            }
        }

        if slot.open.is_none() {
            let packer =
                ContainerPacker::create(self.config.containers_dir(), collection_id, self.settings.clone())
                    .await?;
            self.events.emit(PreservationEvent::ContainerOpened {
                container_id: packer.id().to_string(),
                collection_id: collection_id.to_string(),
            });
            slot.open = Some(packer);
        }

        let packer = match slot.open.as_ref() {
            Some(packer) => packer,
            None => return Err(PreservationError::AlreadyClosed(collection_id.to_string())),
        };

        if self.config.oversize_policy == OversizePolicy::Reject {
            // Measured against a fresh container, so a record that fits on
            // its own is never refused
            let needed = packer.info_size() + packer.estimate_packed_size(record, metadata).await?;
            if needed > limit {
                self.events.emit(PreservationEvent::RecordRejected {
                    record_id: record.id,
                    reason: format!("needs {} bytes, limit is {}", needed, limit),
                });
                return Err(PreservationError::Oversized {
                    record: record.id.to_string(),
                    size: needed,
                    limit,
                });
            }
        }

        let entry = packer.pack_record(record, metadata).await?;
        let size = packer.size().await;
        self.events.emit(PreservationEvent::RecordPacked {
            record_id: record.id,
            container_id: packer.id().to_string(),
        });

        let flush = if size >= limit {
            debug!(collection = %collection_id, size = size, limit = limit, "Container reached threshold");
            Some(self.flush_slot(&mut slot, collection_id).await?)
        } else {
            None
        };

        Ok(SubmitOutcome { entry, flush })
    }

    /// Close the collection's open container if it holds records, then try
    /// to upload every closed container of the collection.
    pub async fn flush_collection(&self, collection_id: &str) -> Result<FlushReport, PreservationError> {
        let slot = self.slot(collection_id);
        let mut slot = slot.lock().await;
        self.flush_slot(&mut slot, collection_id).await
    }

    /// Flush every known collection. All collections are attempted; the
    /// first error is returned after the rest have been flushed.
    pub async fn flush_all(&self) -> Result<Vec<FlushReport>, PreservationError> {
        let mut reports = Vec::new();
        let mut first_error = None;
        for collection_id in self.collections() {
            match self.flush_collection(&collection_id).await {
                Ok(report) => reports.push(report),
                Err(e) => {
                    warn!(collection = %collection_id, error = %e, "Flush failed");
                    first_error.get_or_insert(e);
                }
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(reports),
        }
    }

    /// Reload retained containers from the ledger after a restart.
    /// Returns how many containers are pending again.
    pub async fn recover(&self) -> Result<usize, PreservationError> {
        let Some(ledger) = &self.ledger else {
            return Ok(0);
        };

        let (entries, unreadable) = ledger.scan()?;
        for key in &unreadable {
            warn!(container = %key, "Skipping unreadable ledger entry");
        }

        let mut recovered = 0;
        for entry in entries {
            let handle = entry.handle;
            if fs::metadata(&handle.path).await.is_err() {
                warn!(
                    container = %handle.id,
                    path = %handle.path.display(),
                    "Retained container is missing from disk, dropping it from the ledger"
                );
                ledger.remove(&handle.id)?;
                continue;
            }

            let slot = self.slot(&handle.collection_id);
            let mut slot = slot.lock().await;
            if slot.pending.iter().any(|p| p.id == handle.id) {
                continue;
            }
            debug!(container = %handle.id, attempts = entry.failed_attempts, "Recovered retained container");
            slot.pending.push(handle);
            recovered += 1;
        }

        if recovered > 0 {
            info!(containers = recovered, "Recovered retained containers");
        }
        Ok(recovered)
    }

    async fn flush_slot(
        &self,
        slot: &mut CollectionSlot,
        collection_id: &str,
    ) -> Result<FlushReport, PreservationError> {
        let mut report = FlushReport::new(collection_id);

        if let Some(packer) = slot.open.take() {
            if packer.is_empty().await {
                // Nothing to ship; a fresh container is opened on demand
                if let Err(e) = packer.discard().await {
                    warn!(collection = %collection_id, error = %e, "Failed to remove empty container");
                }
            } else {
                let handle = packer.close().await?;
                self.events.emit(PreservationEvent::ContainerClosed {
                    container_id: handle.id.clone(),
                    collection_id: collection_id.to_string(),
                    records: handle.records.len(),
                    size: handle.size,
                });
                report.closed = Some(handle.id.clone());
                slot.pending.push(handle.clone());
                if let Some(ledger) = &self.ledger {
                    if let Err(e) = ledger.put(&LedgerEntry::new(handle)) {
                        warn!(collection = %collection_id, error = %e, "Failed to record closed container in ledger");
                    }
                }
            }
        }

        // Every handle goes back into `pending` unless the archive confirmed it
        let mut archive_down = false;
        for handle in std::mem::take(&mut slot.pending) {
            if archive_down {
                slot.pending.push(handle);
                continue;
            }

            let result = match upload_with_timeout(
                self.archive.as_ref(),
                &handle.path,
                &handle.id,
                collection_id,
                self.config.upload_timeout(),
            )
            .await
            {
                Ok(()) => self.finish_upload(&handle).await,
                Err(error) => Err(error),
            };

            match result {
                Ok(uploaded) => report.uploaded.push(uploaded),
                Err(error) => {
                    warn!(
                        container = %handle.id,
                        collection = %collection_id,
                        error = %error,
                        "Upload not confirmed, keeping container for the next flush"
                    );
                    if let Some(ledger) = &self.ledger {
                        if let Err(e) = ledger.record_failure(&handle.id, &error.to_string()) {
                            warn!(container = %handle.id, error = %e, "Failed to record upload failure in ledger");
                        }
                    }
                    self.events.emit(PreservationEvent::ContainerRetained {
                        container_id: handle.id.clone(),
                        collection_id: collection_id.to_string(),
                        reason: error.to_string(),
                    });
                    archive_down = error.is_infrastructure();
                    report.retained.push(RetainedContainer {
                        container_id: handle.id.clone(),
                        error,
                    });
                    slot.pending.push(handle);
                }
            }
        }

        info!(
            collection = %collection_id,
            uploaded = report.uploaded.len(),
            retained = report.retained.len(),
            "Flushed collection"
        );
        Ok(report)
    }

    /// Forget a confirmed container, report its records, then remove it
    /// locally. The ledger entry goes first so a restart can never report
    /// the same container twice.
    async fn finish_upload(&self, handle: &ContainerHandle) -> Result<UploadedContainer, PreservationError> {
        if let Some(ledger) = &self.ledger {
            ledger.remove(&handle.id)?;
        }
        self.events.emit(PreservationEvent::ContainerUploaded {
            container_id: handle.id.clone(),
            collection_id: handle.collection_id.clone(),
        });

        let report_failures = handle.report_success(self.source.as_ref()).await;
        self.events.emit(PreservationEvent::RecordsPreserved {
            container_id: handle.id.clone(),
            count: handle.records.len() - report_failures.len(),
        });

        if let Err(e) = fs::remove_file(&handle.path).await {
            warn!(container = %handle.id, error = %e, "Failed to delete uploaded container");
        }

        Ok(UploadedContainer {
            container_id: handle.id.clone(),
            records: handle.records.len(),
            report_failures,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::LocalArchive;
    use crate::digest::{Digest, DigestAlgorithm};
    use crate::record::{PreservationReceipt, PreservedRecord, ValidationResult};
    use crate::source::RecordStream;
    use async_trait::async_trait;
    use futures_util::stream;
    use std::path::Path;
    use tempfile::TempDir;
    use uuid::Uuid;

    #[derive(Default)]
    struct MarkingSource {
        preserved: std::sync::Mutex<Vec<Uuid>>,
    }

    #[async_trait]
    impl RecordSource for MarkingSource {
        fn enumerate_ready_records(&self, _collection_id: &str) -> RecordStream<'_, Record> {
            Box::pin(stream::empty())
        }

        fn enumerate_preserved_records(&self, _collection_id: &str) -> RecordStream<'_, PreservedRecord> {
            Box::pin(stream::empty())
        }

        async fn raw_metadata(&self, _record: &Record) -> Result<Vec<u8>, PreservationError> {
            Ok(Vec::new())
        }

        async fn mark_preserved(
            &self,
            record: &Record,
            _receipt: &PreservationReceipt,
        ) -> Result<(), PreservationError> {
            self.preserved.lock().unwrap().push(record.id);
            Ok(())
        }

        async fn expected_checksum(&self, record: &PreservedRecord) -> Result<Digest, PreservationError> {
            Ok(record.receipt.container_checksum.clone())
        }

        async fn write_validation_result(
            &self,
            _record: &PreservedRecord,
            _result: &ValidationResult,
        ) -> Result<(), PreservationError> {
            Ok(())
        }
    }

    async fn setup(
        temp_dir: &TempDir,
        config: Config,
    ) -> (PreservationCoordinator, Arc<MarkingSource>, Arc<LocalArchive>) {
        let source = Arc::new(MarkingSource::default());
        let archive = Arc::new(
            LocalArchive::new(
                temp_dir.path().join("archive"),
                vec!["p1".into(), "p2".into()],
                DigestAlgorithm::Sha1,
            )
            .await
            .unwrap(),
        );
        let config = Config {
            work_dir: temp_dir.path().join("work"),
            ..config
        };
        let coordinator = PreservationCoordinator::new(config, source.clone(), archive.clone()).unwrap();
        (coordinator, source, archive)
    }

    async fn record(dir: &Path, collection: &str, data: &[u8]) -> Record {
        let id = Uuid::new_v4();
        let path = dir.join(format!("{}.bin", id));
        fs::write(&path, data).await.unwrap();
        Record::new(id, "photos", collection, path)
    }

    #[tokio::test]
    async fn test_below_threshold_keeps_container_open() {
        let temp_dir = TempDir::new().unwrap();
        let (coordinator, source, _) = setup(&temp_dir, Config::default()).await;

        let r = record(temp_dir.path(), "books", b"small").await;
        let outcome = coordinator.submit(&r, b"<mets/>").await.unwrap();
        assert!(outcome.flush.is_none());
        assert!(coordinator.open_container_size("books").await.is_some());
        assert!(source.preserved.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_flush_collection_uploads_and_deletes() {
        let temp_dir = TempDir::new().unwrap();
        let (coordinator, source, archive) = setup(&temp_dir, Config::default()).await;

        let r = record(temp_dir.path(), "books", b"payload").await;
        coordinator.submit(&r, b"<mets/>").await.unwrap();
        let report = coordinator.flush_collection("books").await.unwrap();

        let container_id = report.closed.clone().unwrap();
        assert_eq!(report.uploaded.len(), 1);
        assert_eq!(report.preserved_records(), 1);
        assert!(archive.contains(&container_id, "books").await);
        assert_eq!(*source.preserved.lock().unwrap(), vec![r.id]);
        assert!(coordinator.open_container_size("books").await.is_none());

        let local = coordinator
            .config()
            .containers_dir()
            .join(format!("{}.warc", container_id));
        assert!(fs::metadata(local).await.is_err());
    }

    #[tokio::test]
    async fn test_flush_of_empty_collection_is_noop() {
        let temp_dir = TempDir::new().unwrap();
        let (coordinator, _, _) = setup(&temp_dir, Config::default()).await;

        let report = coordinator.flush_collection("books").await.unwrap();
        assert!(report.closed.is_none());
        assert!(report.uploaded.is_empty());
        assert!(report.is_complete());
    }

    #[tokio::test]
    async fn test_oversize_reject_leaves_container_untouched() {
        let temp_dir = TempDir::new().unwrap();
        let config = Config {
            container_size_limit: 4096,
            oversize_policy: OversizePolicy::Reject,
            ..Default::default()
        };
        let (coordinator, _, _) = setup(&temp_dir, config).await;

        let big = record(temp_dir.path(), "books", &[1u8; 8192]).await;
        let before = {
            let small = record(temp_dir.path(), "books", b"x").await;
            coordinator.submit(&small, b"").await.unwrap();
            coordinator.open_container_size("books").await.unwrap()
        };

        let err = coordinator.submit(&big, b"").await.unwrap_err();
        assert!(matches!(err, PreservationError::Oversized { limit: 4096, .. }));
        assert_eq!(coordinator.open_container_size("books").await, Some(before));
    }

    #[tokio::test]
    async fn test_oversize_allow_packs_then_flushes() {
        let temp_dir = TempDir::new().unwrap();
        let config = Config {
            container_size_limit: 1024,
            ..Default::default()
        };
        let (coordinator, source, _) = setup(&temp_dir, config).await;

        let big = record(temp_dir.path(), "books", &[1u8; 4096]).await;
        let outcome = coordinator.submit(&big, b"").await.unwrap();
        let flush = outcome.flush.unwrap();
        assert_eq!(flush.uploaded.len(), 1);
        assert_eq!(*source.preserved.lock().unwrap(), vec![big.id]);
    }

    #[tokio::test]
    async fn test_oversize_reject_measures_a_fresh_container() {
        let temp_dir = TempDir::new().unwrap();
        let r = record(temp_dir.path(), "books", &[5u8; 300]).await;
        let scratch = ContainerPacker::create(
            temp_dir.path().join("scratch"),
            "books",
            Config::default().packer_settings(),
        )
        .await
        .unwrap();
        let fresh = scratch.info_size() + scratch.estimate_packed_size(&r, b"<mets/>").await.unwrap();
        scratch.discard().await.unwrap();

        let config = Config {
            container_size_limit: fresh - 1,
            oversize_policy: OversizePolicy::Reject,
            ..Default::default()
        };
        let (coordinator, _, _) = setup(&temp_dir, config).await;
        let err = coordinator.submit(&r, b"<mets/>").await.unwrap_err();
        assert!(matches!(err, PreservationError::Oversized { size, .. } if size == fresh));

        let config = Config {
            container_size_limit: fresh,
            oversize_policy: OversizePolicy::Reject,
            ..Default::default()
        };
        let (coordinator, source, _) = setup(&temp_dir, config).await;
        let outcome = coordinator.submit(&r, b"<mets/>").await.unwrap();
        assert_eq!(outcome.flush.unwrap().uploaded.len(), 1);
        assert_eq!(*source.preserved.lock().unwrap(), vec![r.id]);
    }

    #[tokio::test]
    async fn test_flush_emits_container_lifecycle() {
        let temp_dir = TempDir::new().unwrap();
        let (coordinator, _, _) = setup(&temp_dir, Config::default()).await;
        let mut events = coordinator.events().subscribe();

        let r = record(temp_dir.path(), "books", b"payload").await;
        coordinator.submit(&r, b"<mets/>").await.unwrap();
        coordinator.flush_collection("books").await.unwrap();

        let mut seen = Vec::new();
        while let Ok(event) = events.try_recv() {
            seen.push(event);
        }
        assert_eq!(seen.len(), 5);
        assert!(matches!(seen[0], PreservationEvent::ContainerOpened { .. }));
        assert!(matches!(seen[1], PreservationEvent::RecordPacked { record_id, .. } if record_id == r.id));
        assert!(matches!(seen[2], PreservationEvent::ContainerClosed { records: 1, .. }));
        assert!(matches!(seen[3], PreservationEvent::ContainerUploaded { .. }));
        assert!(matches!(seen[4], PreservationEvent::RecordsPreserved { count: 1, .. }));
    }

    #[tokio::test]
    async fn test_bad_record_does_not_close_container() {
        let temp_dir = TempDir::new().unwrap();
        let (coordinator, _, _) = setup(&temp_dir, Config::default()).await;

        let good = record(temp_dir.path(), "books", b"good").await;
        coordinator.submit(&good, b"").await.unwrap();
        let size = coordinator.open_container_size("books").await.unwrap();

        let missing = Record::new(Uuid::new_v4(), "photos", "books", temp_dir.path().join("gone.bin"));
        let err = coordinator.submit(&missing, b"").await.unwrap_err();
        assert!(matches!(err, PreservationError::Packaging { .. }));
        assert_eq!(coordinator.open_container_size("books").await, Some(size));

        let report = coordinator.flush_collection("books").await.unwrap();
        assert_eq!(report.preserved_records(), 1);
    }

    #[tokio::test]
    async fn test_collections_are_independent() {
        let temp_dir = TempDir::new().unwrap();
        let (coordinator, _, _) = setup(&temp_dir, Config::default()).await;

        let a = record(temp_dir.path(), "books", b"a").await;
        let b = record(temp_dir.path(), "maps", b"b").await;
        let (ra, rb) = tokio::join!(coordinator.submit(&a, b""), coordinator.submit(&b, b""));
        ra.unwrap();
        rb.unwrap();

        assert_eq!(coordinator.collections(), vec!["books".to_string(), "maps".to_string()]);
        let reports = coordinator.flush_all().await.unwrap();
        assert_eq!(reports.len(), 2);
        assert!(reports.iter().all(|r| r.preserved_records() == 1));
    }
}
