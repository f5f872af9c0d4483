//! Checksum agreement across pillars
//!
//! Each pillar holding a copy of a container reports its own checksum. The
//! resolver reduces those reports to one agreed value, or fails with the full
//! set of reports so the disagreement can be diagnosed.

use crate::digest::{Digest, DigestAlgorithm};
use crate::error::PreservationError;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

/// One pillar's reported checksum for a container
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChecksumEvent {
    /// Pillar (replica) that answered
    pub pillar_id: String,
    /// Container the checksum belongs to
    pub container_id: String,
    /// Collection the container lives in
    pub collection_id: String,
    /// Hex checksum as reported by the pillar
    pub checksum: String,
}

impl ChecksumEvent {
    pub fn new(
        pillar_id: impl Into<String>,
        container_id: impl Into<String>,
        collection_id: impl Into<String>,
        checksum: impl Into<String>,
    ) -> Self {
        Self {
            pillar_id: pillar_id.into(),
            container_id: container_id.into(),
            collection_id: collection_id.into(),
            checksum: checksum.into(),
        }
    }
}

/// How much agreement is required between pillars
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum AgreementPolicy {
    /// A strict majority of the reporting pillars must agree
    #[default]
    Majority,
    /// Every reporting pillar must agree
    Unanimous,
}

/// Reduces per-pillar checksum reports to a single agreed checksum
#[derive(Debug, Clone)]
pub struct ChecksumResolver {
    min_replicas: usize,
    policy: AgreementPolicy,
    /// Algorithm the pillars compute container checksums with
    algorithm: DigestAlgorithm,
}

impl Default for ChecksumResolver {
    fn default() -> Self {
        Self::new(1, AgreementPolicy::Majority)
    }
}

impl ChecksumResolver {
    pub fn new(min_replicas: usize, policy: AgreementPolicy) -> Self {
        Self {
            min_replicas: min_replicas.max(1),
            policy,
            algorithm: DigestAlgorithm::default(),
        }
    }

    pub fn with_algorithm(mut self, algorithm: DigestAlgorithm) -> Self {
        self.algorithm = algorithm;
        self
    }

    pub fn min_replicas(&self) -> usize {
        self.min_replicas
    }

    pub fn policy(&self) -> AgreementPolicy {
        self.policy
    }

    pub fn algorithm(&self) -> DigestAlgorithm {
        self.algorithm
    }

    /// Resolve the agreed checksum.
    ///
    /// Each pillar counts once, however often it answered; a pillar that
    /// answered with two different values is a disagreement on its own. The
    /// most common value wins when at least `min_replicas` pillars report it
    /// and it satisfies the policy: a strict majority of the pillars, or all
    /// of them for [`AgreementPolicy::Unanimous`].
    pub fn resolve(&self, events: &[ChecksumEvent]) -> Result<Digest, PreservationError> {
        let container_id = events
            .first()
            .map(|e| e.container_id.clone())
            .ok_or_else(|| PreservationError::NoReplicaResponse("<unknown>".to_string()))?;
        let disagreement = || PreservationError::ChecksumDisagreement {
            container_id: container_id.clone(),
            events: events.to_vec(),
        };

        let mut by_pillar: BTreeMap<&str, String> = BTreeMap::new();
        for event in events {
            let checksum = event.checksum.trim().to_ascii_lowercase();
            match by_pillar.get(event.pillar_id.as_str()) {
                Some(seen) if *seen != checksum => return Err(disagreement()),
                Some(_) => {}
                None => {
                    by_pillar.insert(event.pillar_id.as_str(), checksum);
                }
            }
        }

        let mut counts: HashMap<&str, usize> = HashMap::new();
        for checksum in by_pillar.values() {
            *counts.entry(checksum.as_str()).or_insert(0) += 1;
        }

        let pillars = by_pillar.len();
        let (winner, votes) = counts
            .into_iter()
            .max_by(|a, b| a.1.cmp(&b.1).then_with(|| b.0.cmp(a.0)))
            .ok_or_else(|| PreservationError::NoReplicaResponse(container_id.clone()))?;

        let agreed = match self.policy {
            AgreementPolicy::Majority => votes * 2 > pillars,
            AgreementPolicy::Unanimous => votes == pillars,
        };

        if agreed && votes >= self.min_replicas {
            Ok(Digest::new(self.algorithm, winner))
        } else {
            Err(disagreement())
        }
    }
}
