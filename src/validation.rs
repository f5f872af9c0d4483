//! Validation engine
//!
//! Two ways of checking that an archived record is still intact:
//!
//! - [`SimpleValidation`] asks every pillar for the container checksum and
//!   compares the agreed value with the one recorded at packaging time.
//! - [`FullValidation`] streams the whole container back, finds the record's
//!   entries and re-verifies their sizes and digests, and checks the
//!   container checksum on the way through.
//!
//! A validator only decides and builds the message. Writing the result back
//! to the record source is done by [`crate::workflow::ValidationStep`].

use crate::archive::with_timeout;
use crate::config::Config;
use crate::container::format::EntryKind;
use crate::container::reader::is_entry;
use crate::container::ContainerReader;
use crate::digest::HashingReader;
use crate::error::PreservationError;
use crate::record::{InvalidReason, PackedEntry, PreservedRecord, ValidationResult};
use crate::resolver::ChecksumResolver;
use crate::source::{Archive, RecordSource};
use async_trait::async_trait;
use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufRead, BufReader};
use tracing::{debug, warn};

/// Fidelity of a validation pass
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValidationMode {
    Simple,
    Full,
}

/// Decides whether one preserved record is intact
#[async_trait]
pub trait Validator: Send + Sync {
    fn mode(&self) -> ValidationMode;

    /// `Ok` carries a valid or mismatch result. Errors are turned into
    /// invalid results by [`failure_result`].
    async fn verify(
        &self,
        source: &dyn RecordSource,
        record: &PreservedRecord,
    ) -> Result<ValidationResult, PreservationError>;
}

fn now_label() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// Invalid result describing why a record could not be validated
pub fn failure_result(record: &PreservedRecord, error: &PreservationError) -> ValidationResult {
    let id = record.record.id;
    match error {
        PreservationError::Timeout(_) => ValidationResult::invalid(
            InvalidReason::Inconclusive,
            format!(
                "Validation of record {} was inconclusive: {}. Discovered at: {}",
                id,
                error,
                now_label()
            ),
        ),
        PreservationError::ChecksumDisagreement { .. } | PreservationError::NoReplicaResponse(_) => {
            ValidationResult::invalid(
                InvalidReason::NoAgreement,
                format!(
                    "The archive could not agree on a checksum for record {}: {}. Discovered at: {}",
                    id,
                    error,
                    now_label()
                ),
            )
        }
        PreservationError::Format(_) => ValidationResult::invalid(
            InvalidReason::Mismatch,
            format!(
                "Archived container of record {} is damaged: {}. Integrity issue discovered at: {}",
                id,
                error,
                now_label()
            ),
        ),
        _ => ValidationResult::invalid(
            InvalidReason::Error,
            format!(
                "Error when trying to validate record {}: {}. Discovered at: {}",
                id,
                error,
                now_label()
            ),
        ),
    }
}

/// Checksum agreement check at container granularity
pub struct SimpleValidation {
    archive: Arc<dyn Archive>,
    resolver: ChecksumResolver,
    timeout: Duration,
}

impl SimpleValidation {
    pub fn new(archive: Arc<dyn Archive>, resolver: ChecksumResolver, timeout: Duration) -> Self {
        Self {
            archive,
            resolver,
            timeout,
        }
    }

    pub fn from_config(archive: Arc<dyn Archive>, config: &Config) -> Self {
        Self::new(archive, config.resolver(), config.fetch_timeout())
    }
}

#[async_trait]
impl Validator for SimpleValidation {
    fn mode(&self) -> ValidationMode {
        ValidationMode::Simple
    }

    async fn verify(
        &self,
        source: &dyn RecordSource,
        record: &PreservedRecord,
    ) -> Result<ValidationResult, PreservationError> {
        let receipt = &record.receipt;
        let expected = source.expected_checksum(record).await?;

        let events = with_timeout(
            self.timeout,
            &format!("checksum request for container {}", receipt.container_id),
            self.archive
                .fetch_checksums(&receipt.container_id, &receipt.collection_id),
        )
        .await?;
        if events.is_empty() {
            return Err(PreservationError::NoReplicaResponse(receipt.container_id.clone()));
        }
        let agreed = self.resolver.resolve(&events)?;
        debug!(
            record = %record.record.id,
            container = %receipt.container_id,
            pillars = events.len(),
            "Resolved archive checksum"
        );

        if expected.matches(&agreed) {
            Ok(ValidationResult::valid(format!(
                "Checksum '{}' confirmed by the archive. Validated at: {}",
                agreed.value,
                now_label()
            )))
        } else {
            Ok(ValidationResult::invalid(
                InvalidReason::Mismatch,
                format!(
                    "Checksums did not match. Expected '{}', but received '{}' from the archive. Integrity issue discovered at: {}",
                    expected.value,
                    agreed.value,
                    now_label()
                ),
            ))
        }
    }
}

/// Content-level check of one record inside its archived container
pub struct FullValidation {
    archive: Arc<dyn Archive>,
    timeout: Duration,
}

impl FullValidation {
    pub fn new(archive: Arc<dyn Archive>, timeout: Duration) -> Self {
        Self { archive, timeout }
    }

    pub fn from_config(archive: Arc<dyn Archive>, config: &Config) -> Self {
        Self::new(archive, config.fetch_timeout())
    }
}

#[async_trait]
impl Validator for FullValidation {
    fn mode(&self) -> ValidationMode {
        ValidationMode::Full
    }

    async fn verify(
        &self,
        source: &dyn RecordSource,
        record: &PreservedRecord,
    ) -> Result<ValidationResult, PreservationError> {
        let receipt = &record.receipt;
        let expected = source.expected_checksum(record).await?;
        let operation = format!("fetch of container {}", receipt.container_id);

        let stream = with_timeout(
            self.timeout,
            &operation,
            self.archive
                .fetch_container(&receipt.container_id, &receipt.collection_id),
        )
        .await?;

        let hashing = HashingReader::new(stream, expected.algorithm);
        let mut reader = ContainerReader::new(BufReader::new(hashing));
        let mut problems =
            with_timeout(self.timeout, &operation, inspect_entries(&mut reader, &receipt.entry)).await?;

        let (container_digest, container_size) = reader.into_inner().into_inner().finish();
        if !container_digest.matches(&expected) {
            problems.push(format!(
                "Container checksums did not match. Expected '{}', but computed '{}' over {} bytes",
                expected.value, container_digest.value, container_size
            ));
        }

        if problems.is_empty() {
            Ok(ValidationResult::valid(format!(
                "Entry {} ({} bytes, {}) and container checksum '{}' verified. Validated at: {}",
                receipt.entry.content_entry_id,
                receipt.entry.content_size,
                receipt.entry.content_digest,
                container_digest.value,
                now_label()
            )))
        } else {
            warn!(
                record = %record.record.id,
                container = %receipt.container_id,
                problems = problems.len(),
                "Full validation found integrity issues"
            );
            Ok(ValidationResult::invalid(
                InvalidReason::Mismatch,
                format!(
                    "{}. Integrity issue discovered at: {}",
                    problems.join("; "),
                    now_label()
                ),
            ))
        }
    }
}

/// Locate the record's entries, compare them with what was packed, then read
/// the rest of the container so its checksum covers every byte.
async fn inspect_entries<R: AsyncBufRead + Unpin>(
    reader: &mut ContainerReader<R>,
    entry: &PackedEntry,
) -> Result<Vec<String>, PreservationError> {
    let mut problems = Vec::new();

    let Some(content) = reader.find_entry(&entry.content_entry_id).await? else {
        problems.push(format!(
            "No entry {} in the archived container",
            entry.content_entry_id
        ));
        return Ok(problems);
    };
    if content.kind != EntryKind::Content {
        problems.push(format!(
            "Entry {} is a {} entry, not content",
            content.id, content.kind
        ));
    }

    let check = reader.check_payload(&content).await?;
    if check.actual_length != entry.content_size {
        problems.push(format!(
            "Sizes did not match. Expected {} bytes, but the archive holds {} bytes",
            entry.content_size, check.actual_length
        ));
    }
    if !check.computed_digest.matches(&entry.content_digest) {
        problems.push(format!(
            "Checksums did not match. Expected '{}', but received '{}' from the archive",
            entry.content_digest.value, check.computed_digest.value
        ));
    }

    match reader.next_header().await? {
        Some(meta) if is_entry(&meta, EntryKind::Metadata, &entry.metadata_entry_id) => {
            if meta.refers_to != Some(entry.content_entry_id) {
                problems.push(format!(
                    "Metadata entry {} does not refer to its content entry",
                    meta.id
                ));
            }
            let meta_check = reader.check_payload(&meta).await?;
            if !meta_check.computed_digest.matches(&entry.metadata_digest) {
                problems.push(format!(
                    "Metadata checksums did not match. Expected '{}', but received '{}' from the archive",
                    entry.metadata_digest.value, meta_check.computed_digest.value
                ));
            }
        }
        _ => problems.push(format!(
            "Metadata entry {} does not follow its content entry",
            entry.metadata_entry_id
        )),
    }

    reader.drain().await?;
    Ok(problems)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::digest::{Digest, DigestAlgorithm};
    use crate::record::{PreservationReceipt, Record, ValidationState};
    use crate::resolver::ChecksumEvent;
    use crate::source::{ContainerStream, RecordStream};
    use futures_util::stream;
    use std::path::Path;
    use uuid::Uuid;

    struct ExpectingSource;

    #[async_trait]
    impl RecordSource for ExpectingSource {
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
            _record: &Record,
            _receipt: &PreservationReceipt,
        ) -> Result<(), PreservationError> {
            Ok(())
        }

        async fn write_validation_result(
            &self,
            _record: &PreservedRecord,
            _result: &ValidationResult,
        ) -> Result<(), PreservationError> {
            Ok(())
        }
    }

    /// Answers checksum requests from a fixed list, or hangs
    struct FixedArchive {
        checksums: Vec<&'static str>,
        hang: bool,
    }

    #[async_trait]
    impl Archive for FixedArchive {
        async fn upload(&self, _container: &Path, _collection_id: &str) -> Result<bool, PreservationError> {
            Ok(true)
        }

        async fn fetch_container(
            &self,
            container_id: &str,
            _collection_id: &str,
        ) -> Result<ContainerStream, PreservationError> {
            Err(PreservationError::NotFound(container_id.to_string()))
        }

        async fn fetch_checksums(
            &self,
            container_id: &str,
            collection_id: &str,
        ) -> Result<Vec<ChecksumEvent>, PreservationError> {
            if self.hang {
                tokio::time::sleep(Duration::from_secs(30)).await;
            }
            Ok(self
                .checksums
                .iter()
                .enumerate()
                .map(|(i, c)| ChecksumEvent::new(format!("p{}", i + 1), container_id, collection_id, *c))
                .collect())
        }
    }

    fn preserved(checksum: &str) -> PreservedRecord {
        let digest = Digest::new(DigestAlgorithm::Sha1, checksum);
        let record = Record::new(Uuid::new_v4(), "photos", "books", "/tmp/x.bin");
        PreservedRecord {
            receipt: PreservationReceipt {
                container_id: "c-1".into(),
                collection_id: "books".into(),
                container_checksum: digest.clone(),
                entry: PackedEntry {
                    content_entry_id: record.id,
                    metadata_entry_id: Uuid::new_v4(),
                    content_size: 1,
                    content_digest: digest.clone(),
                    metadata_digest: digest,
                    packed_size: 1,
                },
                preserved_at: Utc::now(),
            },
            record,
        }
    }

    fn simple(checksums: Vec<&'static str>, hang: bool) -> SimpleValidation {
        SimpleValidation::new(
            Arc::new(FixedArchive { checksums, hang }),
            ChecksumResolver::default(),
            Duration::from_millis(50),
        )
    }

    #[tokio::test]
    async fn test_simple_match_is_valid() {
        let validator = simple(vec!["ABC123", "abc123", "abc123"], false);
        let result = validator.verify(&ExpectingSource, &preserved("abc123")).await.unwrap();
        assert!(result.is_valid());
    }

    #[tokio::test]
    async fn test_simple_mismatch_names_both_values() {
        let validator = simple(vec!["abc123", "abc123"], false);
        let result = validator.verify(&ExpectingSource, &preserved("ffff00")).await.unwrap();
        assert_eq!(result.state, ValidationState::Invalid(InvalidReason::Mismatch));
        assert!(result.message.contains("'ffff00'"));
        assert!(result.message.contains("'abc123'"));
    }

    #[tokio::test]
    async fn test_simple_disagreement_is_error() {
        let validator = simple(vec!["aa", "bb"], false);
        let record = preserved("aa");
        let err = validator.verify(&ExpectingSource, &record).await.unwrap_err();
        let result = failure_result(&record, &err);
        assert_eq!(result.reason(), Some(InvalidReason::NoAgreement));
        assert!(result.message.contains("p1=aa"));
    }

    #[tokio::test]
    async fn test_simple_timeout_is_inconclusive() {
        let validator = simple(vec!["aa"], true);
        let record = preserved("aa");
        let err = validator.verify(&ExpectingSource, &record).await.unwrap_err();
        let result = failure_result(&record, &err);
        assert_eq!(result.reason(), Some(InvalidReason::Inconclusive));
    }

    #[tokio::test]
    async fn test_no_replicas_is_no_agreement() {
        let validator = simple(vec![], false);
        let record = preserved("aa");
        let err = validator.verify(&ExpectingSource, &record).await.unwrap_err();
        assert!(matches!(err, PreservationError::NoReplicaResponse(ref id) if id == "c-1"));
    }

    #[tokio::test]
    async fn test_full_missing_container_is_error() {
        let validator = FullValidation::new(
            Arc::new(FixedArchive {
                checksums: vec![],
                hang: false,
            }),
            Duration::from_secs(1),
        );
        let record = preserved("aa");
        let err = validator.verify(&ExpectingSource, &record).await.unwrap_err();
        let result = failure_result(&record, &err);
        assert_eq!(result.reason(), Some(InvalidReason::Error));
        assert!(result.message.starts_with("Error when trying to validate record"));
    }
}
