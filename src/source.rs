//! Collaborator interfaces
//!
//! The catalog, the metadata transformation and the archive live outside this
//! crate. They are reached only through the traits below.

use crate::digest::Digest;
use crate::error::PreservationError;
use crate::guid::GuidResolver;
use crate::record::{PreservationReceipt, PreservedRecord, Record, ValidationResult};
use crate::resolver::ChecksumEvent;
use async_trait::async_trait;
use futures_util::stream::BoxStream;
use std::path::Path;
use tokio::io::AsyncRead;

/// Lazy sequence of records from a source
pub type RecordStream<'a, T> = BoxStream<'a, Result<T, PreservationError>>;

/// Byte stream of a fetched container
pub type ContainerStream = Box<dyn AsyncRead + Send + Unpin>;

/// The catalog that owns the records
#[async_trait]
pub trait RecordSource: Send + Sync {
    /// Records of a collection that are ready to be preserved
    fn enumerate_ready_records(&self, collection_id: &str) -> RecordStream<'_, Record>;

    /// Records of a collection that have been preserved, with their receipts
    fn enumerate_preserved_records(&self, collection_id: &str) -> RecordStream<'_, PreservedRecord>;

    /// Raw descriptive metadata of a record, before transformation
    async fn raw_metadata(&self, record: &Record) -> Result<Vec<u8>, PreservationError>;

    /// Record that the record's container has been archived
    async fn mark_preserved(
        &self,
        record: &Record,
        receipt: &PreservationReceipt,
    ) -> Result<(), PreservationError>;

    /// Container checksum the source recorded at packaging time
    async fn expected_checksum(&self, record: &PreservedRecord) -> Result<Digest, PreservationError> {
        Ok(record.receipt.container_checksum.clone())
    }

    /// Store the outcome of a validation pass
    async fn write_validation_result(
        &self,
        record: &PreservedRecord,
        result: &ValidationResult,
    ) -> Result<(), PreservationError>;
}

/// Transformation of raw catalog metadata into the archived metadata entry
pub trait MetadataTransform: Send + Sync {
    fn transform(&self, raw: &[u8], guids: &GuidResolver) -> Result<Vec<u8>, PreservationError>;
}

/// Transform that archives the raw metadata unchanged
#[derive(Debug, Default, Clone, Copy)]
pub struct IdentityTransform;

impl MetadataTransform for IdentityTransform {
    fn transform(&self, raw: &[u8], _guids: &GuidResolver) -> Result<Vec<u8>, PreservationError> {
        Ok(raw.to_vec())
    }
}

/// The replicated archive containers are uploaded to
#[async_trait]
pub trait Archive: Send + Sync {
    /// Upload a closed container. `Ok(false)` means the archive refused it.
    async fn upload(&self, container: &Path, collection_id: &str) -> Result<bool, PreservationError>;

    /// Stream an archived container
    async fn fetch_container(
        &self,
        container_id: &str,
        collection_id: &str,
    ) -> Result<ContainerStream, PreservationError>;

    /// Ask every pillar of the collection for the container's checksum
    async fn fetch_checksums(
        &self,
        container_id: &str,
        collection_id: &str,
    ) -> Result<Vec<ChecksumEvent>, PreservationError>;
}
