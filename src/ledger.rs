//! Ledger of closed containers awaiting upload
//!
//! Tracks:
//! - Which closed containers are still on local disk
//! - The records packaged into each of them
//! - How many upload attempts failed, and why
//!
//! A coordinator that restarts reads the ledger to pick retained containers
//! back up instead of losing them.

use crate::container::ContainerHandle;
use crate::error::PreservationError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sled::Db;
use std::path::Path;
use tracing::info;

/// One retained container
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub handle: ContainerHandle,
    /// Failed upload attempts so far
    pub failed_attempts: u32,
    pub last_error: Option<String>,
    pub last_attempt: Option<DateTime<Utc>>,
}

impl LedgerEntry {
    pub fn new(handle: ContainerHandle) -> Self {
        Self {
            handle,
            failed_attempts: 0,
            last_error: None,
            last_attempt: None,
        }
    }
}

/// Container ledger database
pub struct ContainerLedger {
    db: Db,
}

impl ContainerLedger {
    /// Open or create the ledger database
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, PreservationError> {
        let db = sled::open(path.as_ref())?;
        info!(path = %path.as_ref().display(), "Opened container ledger");
        Ok(Self { db })
    }

    /// Use an already opened database
    pub fn from_db(db: Db) -> Self {
        Self { db }
    }

    /// Store a retained container
    pub fn put(&self, entry: &LedgerEntry) -> Result<(), PreservationError> {
        let value = rmp_serde::to_vec(entry)
            .map_err(|e| PreservationError::Serialization(e.to_string()))?;
        self.db.insert(entry.handle.id.as_bytes(), value)?;
        self.db.flush()?;
        Ok(())
    }

    /// Get a retained container
    pub fn get(&self, container_id: &str) -> Result<Option<LedgerEntry>, PreservationError> {
        match self.db.get(container_id.as_bytes())? {
            Some(value) => Ok(Some(decode(&value)?)),
            None => Ok(None),
        }
    }

    /// Count a failed upload attempt
    pub fn record_failure(
        &self,
        container_id: &str,
        error: &str,
    ) -> Result<Option<LedgerEntry>, PreservationError> {
        let Some(mut entry) = self.get(container_id)? else {
            return Ok(None);
        };
        entry.failed_attempts += 1;
        entry.last_error = Some(error.to_string());
        entry.last_attempt = Some(Utc::now());
        self.put(&entry)?;
        Ok(Some(entry))
    }

    /// Forget a container once its upload is confirmed
    pub fn remove(&self, container_id: &str) -> Result<(), PreservationError> {
        self.db.remove(container_id.as_bytes())?;
        self.db.flush()?;
        Ok(())
    }

    /// Every retained container, oldest first
    pub fn list(&self) -> Result<Vec<LedgerEntry>, PreservationError> {
        let mut entries = Vec::new();
        for item in self.db.iter() {
            let (_, value) = item?;
            entries.push(decode(&value)?);
        }
        entries.sort_by_key(|e| e.handle.closed_at);
        Ok(entries)
    }

    /// Every readable entry, oldest first, plus the keys of values that
    /// could not be decoded
    pub fn scan(&self) -> Result<(Vec<LedgerEntry>, Vec<String>), PreservationError> {
        let mut entries = Vec::new();
        let mut unreadable = Vec::new();
        for item in self.db.iter() {
            let (key, value) = item?;
            match decode(&value) {
                Ok(entry) => entries.push(entry),
                Err(_) => unreadable.push(String::from_utf8_lossy(&key).into_owned()),
            }
        }
        entries.sort_by_key(|e| e.handle.closed_at);
        Ok((entries, unreadable))
    }

    /// Retained containers of one collection, oldest first
    pub fn list_collection(&self, collection_id: &str) -> Result<Vec<LedgerEntry>, PreservationError> {
        Ok(self
            .list()?
            .into_iter()
            .filter(|e| e.handle.collection_id == collection_id)
            .collect())
    }

    pub fn len(&self) -> usize {
        self.db.len()
    }

    pub fn is_empty(&self) -> bool {
        self.db.is_empty()
    }
}

fn decode(value: &[u8]) -> Result<LedgerEntry, PreservationError> {
    rmp_serde::from_slice(value).map_err(|e| PreservationError::Serialization(e.to_string()))
}
