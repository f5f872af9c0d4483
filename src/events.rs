//! Preservation audit events
//!
//! The coordinator and the validation step publish what happens to
//! containers and records on a broadcast bus. Audit consumers subscribe and
//! are free to fall behind; a lagging subscriber loses the oldest events,
//! never the publisher's progress.

use crate::record::ValidationState;
use tokio::sync::broadcast;
use tracing::trace;
use uuid::Uuid;

/// Events emitted by the coordinator and the validation engine
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PreservationEvent {
    // Container lifecycle
    ContainerOpened {
        container_id: String,
        collection_id: String,
    },
    ContainerClosed {
        container_id: String,
        collection_id: String,
        records: usize,
        size: u64,
    },
    ContainerUploaded {
        container_id: String,
        collection_id: String,
    },
    ContainerRetained {
        container_id: String,
        collection_id: String,
        reason: String,
    },

    // Record outcomes
    RecordPacked {
        record_id: Uuid,
        container_id: String,
    },
    RecordRejected {
        record_id: Uuid,
        reason: String,
    },
    RecordsPreserved {
        container_id: String,
        count: usize,
    },
    RecordValidated {
        record_id: Uuid,
        container_id: String,
        state: ValidationState,
    },
}

impl PreservationEvent {
    /// Container the event concerns, when there is one
    pub fn container_id(&self) -> Option<&str> {
        match self {
            Self::ContainerOpened { container_id, .. }
            | Self::ContainerClosed { container_id, .. }
            | Self::ContainerUploaded { container_id, .. }
            | Self::ContainerRetained { container_id, .. }
            | Self::RecordPacked { container_id, .. }
            | Self::RecordsPreserved { container_id, .. }
            | Self::RecordValidated { container_id, .. } => Some(container_id),
            Self::RecordRejected { .. } => None,
        }
    }
}

/// Undelivered events kept per subscriber before it starts lagging
pub const DEFAULT_EVENT_CAPACITY: usize = 1024;

/// Broadcasts events to every subscribed audit consumer
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<PreservationEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::bounded(DEFAULT_EVENT_CAPACITY)
    }

    pub fn bounded(capacity: usize) -> Self {
        Self {
            sender: broadcast::channel(capacity).0,
        }
    }

    /// Publish an event. Returns how many subscribers will see it; with none
    /// subscribed the event is dropped.
    pub fn emit(&self, event: PreservationEvent) -> usize {
        trace!(event = ?event, "Preservation event");
        self.sender.send(event).unwrap_or(0)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PreservationEvent> {
        self.sender.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
