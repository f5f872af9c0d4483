//! Error types for catalog-preserver

use crate::resolver::ChecksumEvent;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PreservationError {
    #[error("Packaging error for record {record}: {reason}")]
    Packaging { record: String, reason: String },

    #[error("Record {record} needs {size} bytes, exceeding the container limit of {limit} bytes")]
    Oversized { record: String, size: u64, limit: u64 },

    #[error("Container already closed: {0}")]
    AlreadyClosed(String),

    #[error("Upload failed for container {0}")]
    Upload(String),

    #[error("Request timeout: {0}")]
    Timeout(String),

    #[error("Checksums disagree for container {container_id}: {}", describe_events(.events))]
    ChecksumDisagreement {
        container_id: String,
        events: Vec<ChecksumEvent>,
    },

    #[error("No replica reported a checksum for container {0}")]
    NoReplicaResponse(String),

    #[error("Transform error: {0}")]
    Transform(String),

    #[error("Record source unavailable: {0}")]
    SourceUnavailable(String),

    #[error("Archive unavailable: {0}")]
    ArchiveUnavailable(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Container format error: {0}")]
    Format(String),

    #[error("Cannot handle the {kind} value '{value}'. Only accepts: {allowed}")]
    UnknownValue {
        kind: &'static str,
        value: String,
        allowed: String,
    },

    #[error("No entry for the file '{0}'")]
    UnresolvedIdentifier(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Database error: {0}")]
    Database(#[from] sled::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl PreservationError {
    /// Whether the error concerns the surrounding infrastructure rather than a
    /// single record. Workflow passes stop on these and let the caller retry.
    pub fn is_infrastructure(&self) -> bool {
        matches!(
            self,
            Self::SourceUnavailable(_) | Self::ArchiveUnavailable(_) | Self::Database(_)
        )
    }

    /// Whether the error is a timeout (inconclusive rather than a mismatch)
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout(_))
    }
}

fn describe_events(events: &[ChecksumEvent]) -> String {
    events
        .iter()
        .map(|e| format!("{}={}", e.pillar_id, e.checksum))
        .collect::<Vec<_>>()
        .join(", ")
}
