//! Workflow steps
//!
//! A step walks one collection of the record source and drives the core:
//! [`PreservationStep`] feeds ready records through the coordinator,
//! [`ValidationStep`] runs a validator over preserved records. Errors scoped
//! to one record are counted in the step's report. Infrastructure errors end
//! the pass and are returned to the caller, which decides whether to retry.

use crate::coordinator::{FlushReport, PreservationCoordinator};
use crate::error::PreservationError;
use crate::events::{EventBus, PreservationEvent};
use crate::guid::GuidResolver;
use crate::record::{InvalidReason, Record};
use crate::source::{MetadataTransform, RecordSource};
use crate::validation::{failure_result, ValidationMode, Validator};
use futures_util::StreamExt;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// A record that could not be handled in this pass
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordFailure {
    /// `None` when the record could not even be enumerated
    pub record_id: Option<Uuid>,
    pub error: String,
}

/// Outcome of one preservation pass over a collection
#[derive(Debug, Default)]
pub struct PreservationReport {
    pub collection_id: String,
    pub packed: usize,
    pub failed: Vec<RecordFailure>,
    pub flushes: Vec<FlushReport>,
}

impl PreservationReport {
    /// Records confirmed preserved during the pass
    pub fn preserved(&self) -> usize {
        self.flushes.iter().map(|f| f.preserved_records()).sum()
    }

    /// Containers left on disk for a later flush
    pub fn retained(&self) -> usize {
        self.flushes.iter().map(|f| f.retained.len()).sum()
    }
}

/// Errors that only affect the record at hand
fn is_record_scoped(error: &PreservationError) -> bool {
    matches!(
        error,
        PreservationError::Packaging { .. }
            | PreservationError::Oversized { .. }
            | PreservationError::Transform(_)
            | PreservationError::UnresolvedIdentifier(_)
            | PreservationError::UnknownValue { .. }
            | PreservationError::NotFound(_)
    )
}

/// Packs every ready record of a collection and ships the result
pub struct PreservationStep {
    coordinator: Arc<PreservationCoordinator>,
    source: Arc<dyn RecordSource>,
    transform: Arc<dyn MetadataTransform>,
}

impl PreservationStep {
    pub fn new(
        coordinator: Arc<PreservationCoordinator>,
        source: Arc<dyn RecordSource>,
        transform: Arc<dyn MetadataTransform>,
    ) -> Self {
        Self {
            coordinator,
            source,
            transform,
        }
    }

    /// Preserve the ready records of one collection, then flush it so nothing
    /// stays buffered after the pass.
    pub async fn run(
        &self,
        collection_id: &str,
        guids: &GuidResolver,
    ) -> Result<PreservationReport, PreservationError> {
        let mut report = PreservationReport {
            collection_id: collection_id.to_string(),
            ..Default::default()
        };
        info!(collection = %collection_id, "Starting preservation pass");

        let mut records = self.source.enumerate_ready_records(collection_id);
        while let Some(item) = records.next().await {
            let outcome = match item {
                Ok(record) => self.preserve(&record, guids).await.map_err(|e| (Some(record.id), e)),
                Err(e) => Err((None, e)),
            };

            match outcome {
                Ok(flush) => {
                    report.packed += 1;
                    report.flushes.extend(flush);
                }
                Err((record_id, error)) if is_record_scoped(&error) => {
                    warn!(collection = %collection_id, record = ?record_id, error = %error, "Skipping record");
                    report.failed.push(RecordFailure {
                        record_id,
                        error: error.to_string(),
                    });
                }
                Err((_, error)) => {
                    warn!(collection = %collection_id, error = %error, "Preservation pass aborted");
                    // Ship what was packed before giving up
                    if let Err(flush_error) = self.coordinator.flush_collection(collection_id).await {
                        warn!(collection = %collection_id, error = %flush_error, "Flush after abort failed");
                    }
                    return Err(error);
                }
            }
        }

        report
            .flushes
            .push(self.coordinator.flush_collection(collection_id).await?);

        info!(
            collection = %collection_id,
            packed = report.packed,
            failed = report.failed.len(),
            preserved = report.preserved(),
            retained = report.retained(),
            "Finished preservation pass"
        );
        Ok(report)
    }

    async fn preserve(
        &self,
        record: &Record,
        guids: &GuidResolver,
    ) -> Result<Option<FlushReport>, PreservationError> {
        let raw = self.source.raw_metadata(record).await?;
        let metadata = self.transform.transform(&raw, guids)?;
        let outcome = self.coordinator.submit(record, &metadata).await?;
        debug!(record = %record, packed = outcome.entry.packed_size, "Submitted record");
        Ok(outcome.flush)
    }
}

/// Outcome of one validation pass over a collection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationReport {
    pub collection_id: String,
    pub mode: ValidationMode,
    pub checked: usize,
    pub valid: usize,
    pub invalid: Vec<(Uuid, InvalidReason)>,
    /// Results the source failed to store
    pub write_failures: usize,
}

/// Validates every preserved record of a collection
pub struct ValidationStep {
    source: Arc<dyn RecordSource>,
    validator: Arc<dyn Validator>,
    events: Arc<EventBus>,
}

impl ValidationStep {
    pub fn new(source: Arc<dyn RecordSource>, validator: Arc<dyn Validator>) -> Self {
        Self {
            source,
            validator,
            events: Arc::new(EventBus::new()),
        }
    }

    pub fn with_event_bus(mut self, events: Arc<EventBus>) -> Self {
        self.events = events;
        self
    }

    /// Validate the collection's preserved records and write each result back.
    ///
    /// Every record reached gets a result, including the one whose check hit
    /// an infrastructure error; the pass then stops and returns that error.
    pub async fn run(&self, collection_id: &str) -> Result<ValidationReport, PreservationError> {
        let mode = self.validator.mode();
        let mut report = ValidationReport {
            collection_id: collection_id.to_string(),
            mode,
            checked: 0,
            valid: 0,
            invalid: Vec::new(),
            write_failures: 0,
        };
        info!(collection = %collection_id, mode = ?mode, "Starting validation pass");

        let mut records = self.source.enumerate_preserved_records(collection_id);
        while let Some(item) = records.next().await {
            let preserved = match item {
                Ok(preserved) => preserved,
                Err(e) if e.is_infrastructure() => return Err(e),
                Err(e) => {
                    warn!(collection = %collection_id, error = %e, "Skipping unreadable record");
                    continue;
                }
            };

            let (result, abort) = match self.validator.verify(self.source.as_ref(), &preserved).await {
                Ok(result) => (result, None),
                Err(e) => {
                    let result = failure_result(&preserved, &e);
                    (result, e.is_infrastructure().then_some(e))
                }
            };

            report.checked += 1;
            match result.reason() {
                None => report.valid += 1,
                Some(reason) => report.invalid.push((preserved.record.id, reason)),
            }
            self.events.emit(PreservationEvent::RecordValidated {
                record_id: preserved.record.id,
                container_id: preserved.receipt.container_id.clone(),
                state: result.state,
            });

            if let Err(e) = self.source.write_validation_result(&preserved, &result).await {
                if e.is_infrastructure() {
                    return Err(e);
                }
                warn!(record = %preserved.record.id, error = %e, "Failed to store validation result");
                report.write_failures += 1;
            }

            if let Some(e) = abort {
                warn!(collection = %collection_id, error = %e, "Validation pass aborted");
                return Err(e);
            }
        }

        info!(
            collection = %collection_id,
            mode = ?mode,
            checked = report.checked,
            valid = report.valid,
            invalid = report.invalid.len(),
            "Finished validation pass"
        );
        Ok(report)
    }
}
