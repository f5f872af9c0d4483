//! Closed value sets used in preservation metadata
//!
//! Catalog fields arrive as free text. Each set below accepts its canonical
//! values plus a small number of legacy labels that older catalog entries
//! still carry, and rejects everything else with
//! [`PreservationError::UnknownValue`].

use crate::error::PreservationError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Legacy label used for all preservation levels before the split into
/// bit safety, logical strategy and confidentiality
pub const LEGACY_ACTIVE_BIT_PRESERVATION: &str = "Aktiv bit bevaring";

/// Declares a closed set with its canonical string values and legacy mapping
macro_rules! closed_value_set {
    (
        $(#[$meta:meta])*
        $name:ident, $kind:literal {
            $($variant:ident => $value:literal),+ $(,)?
        }
        legacy { $($legacy:literal => $target:ident),* $(,)? }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        pub enum $name {
            $(
                #[serde(rename = $value)]
                $variant,
            )+
        }

        impl $name {
            /// All canonical variants
            pub const ALL: &'static [$name] = &[$($name::$variant),+];

            /// Canonical string value
            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $value,)+
                }
            }

            /// Normalize a catalog value, mapping legacy labels to their
            /// canonical counterpart
            pub fn normalize(value: &str) -> Result<Self, PreservationError> {
                $(
                    if value == $value {
                        return Ok($name::$variant);
                    }
                )+
                $(
                    if value == $legacy {
                        return Ok($name::$target);
                    }
                )*
                Err(PreservationError::UnknownValue {
                    kind: $kind,
                    value: value.to_string(),
                    allowed: Self::ALL
                        .iter()
                        .map(|v| v.as_str())
                        .collect::<Vec<_>>()
                        .join(", "),
                })
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = PreservationError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Self::normalize(s)
            }
        }
    };
}

closed_value_set! {
    /// Bit safety level of a preserved record
    BitSafetyLevel, "bit preservation level" {
        Max => "bitSafetyMax",
        VeryHigh => "bitSafetyVeryHigh",
        High => "bitSafetyHigh",
        Medium => "bitSafetyMedium",
        Low => "bitSafetyLow",
        VeryLow => "bitSafetyVeryLow",
        Min => "bitSafetyMin",
    }
    legacy { "Aktiv bit bevaring" => VeryHigh }
}

closed_value_set! {
    /// Logical preservation strategy
    LogicalStrategy, "logical preservation strategy" {
        Migration => "logicalStrategyMigration",
        Emulation => "logicalStrategyEmulation",
        Virtualization => "logicalStrategyVirtualization",
        Technical => "logicalStrategyTechnical",
    }
    legacy { "Aktiv bit bevaring" => Migration }
}

closed_value_set! {
    /// Confidentiality level
    ConfidentialityLevel, "confidentiality level" {
        Max => "confidentialityMax",
        VeryHigh => "confidentialityVeryHigh",
        High => "confidentialityHigh",
        Medium => "confidentialityMedium",
        Low => "confidentialityLow",
        VeryLow => "confidentialityVeryLow",
        Min => "confidentialityMin",
    }
    legacy { "Aktiv bit bevaring" => Low }
}

closed_value_set! {
    /// Agents that act on preserved records
    AgentName, "agent name" {
        Institution => "institution",
        PreservationService => "preservationService",
    }
    legacy {}
}

closed_value_set! {
    /// Kind of agent
    AgentType, "agent type" {
        Internal => "internal",
        Personnel => "personnel",
        Department => "department",
    }
    legacy { "program" => Internal }
}

/// The preservation profile of one record, normalized from catalog fields
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreservationProfile {
    pub bit_safety: BitSafetyLevel,
    pub logical_strategy: LogicalStrategy,
    pub confidentiality: ConfidentialityLevel,
}

impl PreservationProfile {
    /// Build a profile from raw catalog values
    pub fn from_catalog(
        bit_safety: &str,
        logical_strategy: &str,
        confidentiality: &str,
    ) -> Result<Self, PreservationError> {
        Ok(Self {
            bit_safety: BitSafetyLevel::normalize(bit_safety)?,
            logical_strategy: LogicalStrategy::normalize(logical_strategy)?,
            confidentiality: ConfidentialityLevel::normalize(confidentiality)?,
        })
    }
}

/// Software agent recorded in every container's info entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SoftwareAgent {
    pub name: AgentName,
    pub agent_type: AgentType,
    pub version: Option<String>,
}

impl SoftwareAgent {
    pub fn preservation_service(version: Option<String>) -> Self {
        Self {
            name: AgentName::PreservationService,
            agent_type: AgentType::Internal,
            version,
        }
    }

    /// Agent label with version, `UNKNOWN` when no version was configured
    pub fn label(&self) -> String {
        format!(
            "{} (v. {})",
            self.name,
            self.version.as_deref().unwrap_or("UNKNOWN")
        )
    }
}
