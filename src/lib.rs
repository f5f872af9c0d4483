//! Catalog Preserver - packaging, upload and validation of catalog records
//!
//! Sits between a digital-asset catalog and a replicated bit archive.
//!
//! ## Architecture
//!
//! - **Container packer**: writes each record's content file and transformed
//!   metadata as a pair of entries into an append-only container
//! - **Coordinator**: one open container per collection, closed and uploaded
//!   once it reaches the size threshold; failed uploads stay on disk for the
//!   next flush
//! - **Validation**: checksum agreement across pillars (simple) or a streamed
//!   re-check of a record's entries inside the archived container (full)
//!
//! The catalog, the metadata transformation and the archive are reached
//! through the traits in [`source`].
//!
//! ## Storage Layout
//!
//! ```text
//! <work_dir>/
//! ├── containers/            # Open and not-yet-uploaded containers
//! │   └── <uuid>.warc
//! └── ledger.sled/           # Retained container ledger
//! ```

pub mod archive;
pub mod config;
pub mod container;
pub mod coordinator;
pub mod digest;
pub mod error;
pub mod events;
pub mod guid;
pub mod ledger;
pub mod levels;
pub mod record;
pub mod resolver;
pub mod source;
pub mod validation;
pub mod workflow;

// Re-exports
pub use archive::LocalArchive;
pub use config::{Config, OversizePolicy};
pub use container::{ContainerHandle, ContainerPacker, ContainerReader, PackerSettings};
pub use coordinator::{FlushReport, PreservationCoordinator, SubmitOutcome};
pub use digest::{Digest, DigestAlgorithm};
pub use error::PreservationError;
pub use events::{EventBus, PreservationEvent};
pub use guid::GuidResolver;
pub use ledger::ContainerLedger;
pub use record::{
    InvalidReason, PreservationReceipt, PreservedRecord, Record, ValidationResult, ValidationState,
};
pub use resolver::{AgreementPolicy, ChecksumEvent, ChecksumResolver};
pub use source::{Archive, IdentityTransform, MetadataTransform, RecordSource};
pub use validation::{FullValidation, SimpleValidation, ValidationMode, Validator};
pub use workflow::{PreservationReport, PreservationStep, ValidationReport, ValidationStep};
