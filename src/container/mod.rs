//! Append-only archival containers
//!
//! - [`format`]: entry header layout
//! - [`packer`]: writes content/metadata pairs into an open container
//! - [`reader`]: streams entries back out for verification

pub mod format;
pub mod packer;
pub mod reader;

pub use format::{EntryHeader, EntryKind};
pub use packer::{ContainerPacker, PackerSettings};
pub use reader::{ContainerReader, EntryCheck};

use crate::digest::Digest;
use crate::error::PreservationError;
use crate::record::{PackedEntry, PreservationReceipt, Record};
use crate::source::RecordSource;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tracing::{info, warn};

/// A record and what was written for it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackagedRecord {
    pub record: Record,
    pub entry: PackedEntry,
}

/// A closed container, immutable and ready for upload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerHandle {
    pub id: String,
    pub collection_id: String,
    pub path: PathBuf,
    pub size: u64,
    /// Checksum of the whole container file
    pub checksum: Digest,
    pub records: Vec<PackagedRecord>,
    pub closed_at: DateTime<Utc>,
}

/// A record whose preserved status could not be stored
#[derive(Debug)]
pub struct ReportFailure {
    pub record: Record,
    pub error: PreservationError,
}

impl ContainerHandle {
    /// Receipt for one packaged record of this container
    pub fn receipt_for(&self, packaged: &PackagedRecord) -> PreservationReceipt {
        PreservationReceipt {
            container_id: self.id.clone(),
            collection_id: self.collection_id.clone(),
            container_checksum: self.checksum.clone(),
            entry: packaged.entry.clone(),
            preserved_at: Utc::now(),
        }
    }

    /// Tell the record source that every packaged record is preserved.
    ///
    /// Only call this after the archive confirmed the upload. Failures are
    /// collected per record instead of stopping the report, because the
    /// container itself is already safe.
    pub async fn report_success(&self, source: &dyn RecordSource) -> Vec<ReportFailure> {
        let mut failures = Vec::new();
        for packaged in &self.records {
            let receipt = self.receipt_for(packaged);
            if let Err(error) = source.mark_preserved(&packaged.record, &receipt).await {
                warn!(
                    container = %self.id,
                    record = %packaged.record.id,
                    error = %error,
                    "Failed to mark record as preserved"
                );
                failures.push(ReportFailure {
                    record: packaged.record.clone(),
                    error,
                });
            }
        }
        info!(
            container = %self.id,
            reported = self.records.len() - failures.len(),
            failed = failures.len(),
            "Reported preserved records"
        );
        failures
    }
}
