//! Container packer
//!
//! Appends content + metadata entry pairs to one open container file. All
//! writes go through a single async mutex, so concurrent callers never
//! interleave partial entries. A record that fails to pack is rolled back
//! and the container stays usable for the next one.

use super::format::{
    info_payload, EntryHeader, EntryKind, ENTRY_TERMINATOR, INFO_CONTENT_TYPE,
    METADATA_CONTENT_TYPE,
};
use super::{ContainerHandle, PackagedRecord};
use crate::digest::{digest_bytes, digest_file, DigestAlgorithm, HashingReader};
use crate::error::PreservationError;
use crate::record::{PackedEntry, Record};
use chrono::Utc;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncSeekExt, AsyncWriteExt, BufWriter};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// File extension of container files
pub const CONTAINER_EXTENSION: &str = "warc";

/// Extra header carrying the record's bit safety level
pub const HEADER_PRESERVATION_LEVEL: &str = "X-Preservation-Level";

/// Settings shared by every packer a coordinator creates
#[derive(Debug, Clone)]
pub struct PackerSettings {
    /// Algorithm for per-entry block digests
    pub block_algorithm: DigestAlgorithm,
    /// Algorithm for the whole-container checksum
    pub container_algorithm: DigestAlgorithm,
    /// Software agent label written into the info entry
    pub agent_label: String,
}

impl Default for PackerSettings {
    fn default() -> Self {
        Self {
            block_algorithm: DigestAlgorithm::Sha1,
            container_algorithm: DigestAlgorithm::Sha1,
            agent_label: "preservationService (v. UNKNOWN)".to_string(),
        }
    }
}

struct PackerState {
    /// `None` once closed
    writer: Option<BufWriter<File>>,
    size: u64,
    records: Vec<PackagedRecord>,
    /// Set when a failed pack could not be rolled back
    poisoned: bool,
}

/// One open, append-only container
pub struct ContainerPacker {
    id: String,
    collection_id: String,
    path: PathBuf,
    settings: PackerSettings,
    /// Bytes taken by the info entry
    info_size: u64,
    state: Mutex<PackerState>,
}

impl ContainerPacker {
    /// Create a new container file in `dir` and write its info entry
    pub async fn create<P: AsRef<Path>>(
        dir: P,
        collection_id: &str,
        settings: PackerSettings,
    ) -> Result<Self, PreservationError> {
        let dir = dir.as_ref();
        fs::create_dir_all(dir).await?;

        let id = Uuid::new_v4().to_string();
        let path = dir.join(format!("{}.{}", id, CONTAINER_EXTENSION));
        let file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .await?;
        let mut writer = BufWriter::new(file);

        let payload = info_payload(&settings.agent_label, &id);
        let header = EntryHeader::new(
            EntryKind::Info,
            Uuid::new_v4(),
            INFO_CONTENT_TYPE,
            payload.len() as u64,
            digest_bytes(&payload, settings.block_algorithm),
        )
        .filename(format!("{}.{}", id, CONTAINER_EXTENSION));

        let encoded = header.encode();
        writer.write_all(&encoded).await?;
        writer.write_all(&payload).await?;
        writer.write_all(ENTRY_TERMINATOR).await?;
        writer.flush().await?;
        let size = (encoded.len() + payload.len() + ENTRY_TERMINATOR.len()) as u64;

        info!(container = %id, collection = %collection_id, path = %path.display(), "Opened container");

        Ok(Self {
            id,
            collection_id: collection_id.to_string(),
            path,
            settings,
            info_size: size,
            state: Mutex::new(PackerState {
                writer: Some(writer),
                size,
                records: Vec::new(),
                poisoned: false,
            }),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn collection_id(&self) -> &str {
        &self.collection_id
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Size of a container holding no records
    pub fn info_size(&self) -> u64 {
        self.info_size
    }

    /// Current container size in bytes, headers included
    pub async fn size(&self) -> u64 {
        self.state.lock().await.size
    }

    pub async fn record_count(&self) -> usize {
        self.state.lock().await.records.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.record_count().await == 0
    }

    pub async fn is_closed(&self) -> bool {
        self.state.lock().await.writer.is_none()
    }

    pub async fn is_poisoned(&self) -> bool {
        self.state.lock().await.poisoned
    }

    /// Bytes a record would add to this container, computed without writing
    pub async fn estimate_packed_size(
        &self,
        record: &Record,
        metadata: &[u8],
    ) -> Result<u64, PreservationError> {
        let payload_len = fs::metadata(&record.payload_path)
            .await
            .map_err(|e| packaging(record, format!("cannot read payload: {}", e)))?
            .len();
        let placeholder = digest_bytes(b"", self.settings.block_algorithm);
        let content = self.content_header(record, payload_len, placeholder.clone());
        let meta = EntryHeader::new(
            EntryKind::Metadata,
            Uuid::nil(),
            METADATA_CONTENT_TYPE,
            metadata.len() as u64,
            placeholder,
        )
        .refers_to(record.id);
        Ok(content.encoded_entry_len() + meta.encoded_entry_len())
    }

    /// Write the record's content entry followed by its metadata entry.
    ///
    /// On failure nothing of the record remains in the container.
    pub async fn pack_record(
        &self,
        record: &Record,
        metadata: &[u8],
    ) -> Result<PackedEntry, PreservationError> {
        let mut state = self.state.lock().await;
        if state.writer.is_none() {
            return Err(PreservationError::AlreadyClosed(self.id.clone()));
        }
        if state.poisoned {
            return Err(packaging(record, "container is unusable after a failed rollback"));
        }

        let payload_len = fs::metadata(&record.payload_path)
            .await
            .map_err(|e| packaging(record, format!("cannot read payload: {}", e)))?
            .len();
        let content_digest = digest_file(&record.payload_path, self.settings.block_algorithm)
            .await
            .map_err(|e| packaging(record, format!("cannot digest payload: {}", e)))?;

        let start = state.size;
        let result = self
            .write_pair(&mut state, record, metadata, payload_len, content_digest)
            .await;

        match result {
            Ok(entry) => {
                state.size = start + entry.packed_size;
                state.records.push(PackagedRecord {
                    record: record.clone(),
                    entry: entry.clone(),
                });
                debug!(
                    container = %self.id,
                    record = %record.id,
                    packed = entry.packed_size,
                    size = state.size,
                    "Packed record"
                );
                Ok(entry)
            }
            Err(e) => {
                warn!(container = %self.id, record = %record.id, error = %e, "Packing failed, rolling back");
                if let Err(rollback) = rollback(&mut state, &self.path, start).await {
                    warn!(container = %self.id, error = %rollback, "Rollback failed, container unusable");
                    state.poisoned = true;
                }
                Err(match e {
                    PreservationError::Packaging { .. } => e,
                    other => packaging(record, other.to_string()),
                })
            }
        }
    }

    async fn write_pair(
        &self,
        state: &mut PackerState,
        record: &Record,
        metadata: &[u8],
        payload_len: u64,
        content_digest: crate::digest::Digest,
    ) -> Result<PackedEntry, PreservationError> {
        let writer = state
            .writer
            .as_mut()
            .ok_or_else(|| PreservationError::AlreadyClosed(self.id.clone()))?;

        let content = self.content_header(record, payload_len, content_digest.clone());
        let content_encoded = content.encode();
        writer.write_all(&content_encoded).await?;

        let file = File::open(&record.payload_path).await?;
        let mut hashing = HashingReader::new(file, self.settings.block_algorithm);
        let copied = tokio::io::copy(&mut hashing, writer).await?;
        let (streamed_digest, _) = hashing.finish();
        if copied != payload_len || !streamed_digest.matches(&content_digest) {
            return Err(packaging(record, "payload changed while it was being packed"));
        }
        writer.write_all(ENTRY_TERMINATOR).await?;

        let metadata_digest = digest_bytes(metadata, self.settings.block_algorithm);
        let metadata_id = Uuid::new_v4();
        let meta = EntryHeader::new(
            EntryKind::Metadata,
            metadata_id,
            METADATA_CONTENT_TYPE,
            metadata.len() as u64,
            metadata_digest.clone(),
        )
        .refers_to(record.id);
        let meta_encoded = meta.encode();
        writer.write_all(&meta_encoded).await?;
        writer.write_all(metadata).await?;
        writer.write_all(ENTRY_TERMINATOR).await?;
        writer.flush().await?;

        let packed_size = (content_encoded.len() + meta_encoded.len() + 2 * ENTRY_TERMINATOR.len())
            as u64
            + payload_len
            + metadata.len() as u64;

        Ok(PackedEntry {
            content_entry_id: record.id,
            metadata_entry_id: metadata_id,
            content_size: payload_len,
            content_digest,
            metadata_digest,
            packed_size,
        })
    }

    fn content_header(
        &self,
        record: &Record,
        payload_len: u64,
        digest: crate::digest::Digest,
    ) -> EntryHeader {
        let header = EntryHeader::new(
            EntryKind::Content,
            record.id,
            record.content_type(),
            payload_len,
            digest,
        );
        match &record.profile {
            Some(profile) => header.extra(HEADER_PRESERVATION_LEVEL, profile.bit_safety.as_str()),
            None => header,
        }
    }

    /// Finalize the container. No further records can be packed.
    pub async fn close(&self) -> Result<ContainerHandle, PreservationError> {
        let mut state = self.state.lock().await;
        let mut writer = state
            .writer
            .take()
            .ok_or_else(|| PreservationError::AlreadyClosed(self.id.clone()))?;
        writer.flush().await?;
        let file = writer.into_inner();
        file.sync_all().await?;
        drop(file);

        let checksum = digest_file(&self.path, self.settings.container_algorithm).await?;

        info!(
            container = %self.id,
            collection = %self.collection_id,
            records = state.records.len(),
            size = state.size,
            "Closed container"
        );

        Ok(ContainerHandle {
            id: self.id.clone(),
            collection_id: self.collection_id.clone(),
            path: self.path.clone(),
            size: state.size,
            checksum,
            records: state.records.clone(),
            closed_at: Utc::now(),
        })
    }

    /// Close and remove the container file without uploading it
    pub async fn discard(self) -> Result<(), PreservationError> {
        let mut state = self.state.into_inner();
        if let Some(mut writer) = state.writer.take() {
            writer.flush().await.ok();
        }
        fs::remove_file(&self.path).await?;
        debug!(container = %self.id, "Discarded container");
        Ok(())
    }
}

/// Truncate the container back to `start`, dropping buffered bytes
async fn rollback(state: &mut PackerState, path: &Path, start: u64) -> Result<(), PreservationError> {
    // Buffered bytes of the failed record are dropped with the writer
    let stale = state.writer.take();
    drop(stale);

    let mut file = OpenOptions::new().write(true).open(path).await?;
    file.set_len(start).await?;
    file.seek(SeekFrom::Start(start)).await?;
    state.writer = Some(BufWriter::new(file));
    Ok(())
}

fn packaging(record: &Record, reason: impl Into<String>) -> PreservationError {
    PreservationError::Packaging {
        record: record.id.to_string(),
        reason: reason.into(),
    }
}
