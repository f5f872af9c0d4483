//! Catalog records and the facts recorded about them
//!
//! A [`Record`] is what the catalog hands us for packing. Once its container
//! has been uploaded the record source stores a [`PreservationReceipt`];
//! validation later works from the pair as a [`PreservedRecord`] and writes a
//! [`ValidationResult`] back.

use crate::digest::Digest;
use crate::levels::PreservationProfile;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use uuid::Uuid;

/// Content type used when the catalog gives no hint
pub const DEFAULT_CONTENT_TYPE: &str = "application/octet-stream";

/// One catalog entry ready for preservation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    /// Stable record identifier, reused as the content entry identifier
    pub id: Uuid,
    /// Catalog the record was enumerated from
    pub catalog: String,
    /// Archive collection the record is preserved in
    pub collection_id: String,
    /// Local content file
    pub payload_path: PathBuf,
    /// Content type hint for the payload
    pub content_type: Option<String>,
    /// Preservation levels, when the catalog carries them
    pub profile: Option<PreservationProfile>,
}

impl Record {
    pub fn new(
        id: Uuid,
        catalog: impl Into<String>,
        collection_id: impl Into<String>,
        payload_path: impl Into<PathBuf>,
    ) -> Self {
        Self {
            id,
            catalog: catalog.into(),
            collection_id: collection_id.into(),
            payload_path: payload_path.into(),
            content_type: None,
            profile: None,
        }
    }

    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }

    pub fn with_profile(mut self, profile: PreservationProfile) -> Self {
        self.profile = Some(profile);
        self
    }

    pub fn content_type(&self) -> &str {
        self.content_type.as_deref().unwrap_or(DEFAULT_CONTENT_TYPE)
    }
}

impl fmt::Display for Record {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.catalog, self.id)
    }
}

/// What was written into a container for one record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackedEntry {
    /// Content entry identifier (the record's UUID)
    pub content_entry_id: Uuid,
    /// Metadata entry identifier
    pub metadata_entry_id: Uuid,
    /// Payload length in bytes
    pub content_size: u64,
    /// Block digest of the payload
    pub content_digest: Digest,
    /// Block digest of the transformed metadata
    pub metadata_digest: Digest,
    /// Bytes this record added to the container, headers included
    pub packed_size: u64,
}

/// Facts stored by the record source once a record's container is archived
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreservationReceipt {
    pub container_id: String,
    pub collection_id: String,
    /// Whole-container checksum computed when the container was closed
    pub container_checksum: Digest,
    pub entry: PackedEntry,
    pub preserved_at: DateTime<Utc>,
}

/// A record together with its receipt, as enumerated for validation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreservedRecord {
    pub record: Record,
    pub receipt: PreservationReceipt,
}

/// Why a record failed validation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvalidReason {
    /// Archive content does not match what was recorded
    Mismatch,
    /// Pillars disagree or none answered
    NoAgreement,
    /// The archive did not answer in time; integrity is unknown
    Inconclusive,
    /// Transport or lookup failure
    Error,
}

/// Outcome of validating one record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", content = "reason", rename_all = "snake_case")]
pub enum ValidationState {
    Valid,
    Invalid(InvalidReason),
}

/// Validation audit entry written back to the record source
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationResult {
    pub state: ValidationState,
    pub message: String,
    pub validated_at: DateTime<Utc>,
}

impl ValidationResult {
    pub fn valid(message: impl Into<String>) -> Self {
        Self {
            state: ValidationState::Valid,
            message: message.into(),
            validated_at: Utc::now(),
        }
    }

    pub fn invalid(reason: InvalidReason, message: impl Into<String>) -> Self {
        Self {
            state: ValidationState::Invalid(reason),
            message: message.into(),
            validated_at: Utc::now(),
        }
    }

    pub fn is_valid(&self) -> bool {
        self.state == ValidationState::Valid
    }

    pub fn reason(&self) -> Option<InvalidReason> {
        match self.state {
            ValidationState::Valid => None,
            ValidationState::Invalid(reason) => Some(reason),
        }
    }
}
