//! Signal records: the immutable, versioned target state handed from the
//! alpha engine to the execution gateway.

use crate::types::{InstrumentId, Version};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use thiserror::Error;

/// One row of a signal payload.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TargetRow {
    pub instrument: InstrumentId,
    /// Target weight or quantity; must be finite and non-negative.
    pub target: f64,
}

impl TargetRow {
    pub fn new(instrument: impl Into<String>, target: f64) -> Self {
        Self {
            instrument: InstrumentId(instrument.into()),
            target,
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum RecordError {
    #[error("signal {0} has an empty payload")]
    EmptyPayload(Version),
    #[error("signal {version} has a blank instrument id at row {row}")]
    BlankInstrument { version: Version, row: usize },
    #[error("signal {version} lists {instrument} more than once")]
    DuplicateInstrument {
        version: Version,
        instrument: InstrumentId,
    },
    #[error("signal {version} has a non-finite target for {instrument}")]
    NonFiniteTarget {
        version: Version,
        instrument: InstrumentId,
    },
    #[error("signal {version} has a negative target {value} for {instrument}")]
    NegativeTarget {
        version: Version,
        instrument: InstrumentId,
        value: f64,
    },
    #[error("signal {version} checksum mismatch: recorded {recorded}, computed {computed}")]
    ChecksumMismatch {
        version: Version,
        recorded: String,
        computed: String,
    },
}

impl RecordError {
    pub fn version(&self) -> Version {
        match self {
            RecordError::EmptyPayload(version)
            | RecordError::BlankInstrument { version, .. }
            | RecordError::DuplicateInstrument { version, .. }
            | RecordError::NonFiniteTarget { version, .. }
            | RecordError::NegativeTarget { version, .. }
            | RecordError::ChecksumMismatch { version, .. } => *version,
        }
    }
}

/// Versioned snapshot of the target state.
///
/// A record is never mutated after it has been published; a new computation
/// produces a new record with a higher version.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SignalRecord {
    pub version: Version,
    pub produced_at: DateTime<Utc>,
    pub payload: Vec<TargetRow>,
    /// Hex blake3 digest over version, timestamp and payload.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checksum: Option<String>,
}

impl SignalRecord {
    /// Build a record and seal it with its checksum.
    pub fn new(version: Version, produced_at: DateTime<Utc>, payload: Vec<TargetRow>) -> Self {
        let mut record = Self {
            version,
            produced_at,
            payload,
            checksum: None,
        };
        record.checksum = Some(record.compute_checksum());
        record
    }

    pub fn compute_checksum(&self) -> String {
        let mut hasher = blake3::Hasher::new();
        hasher.update(&self.version.0.to_le_bytes());
        hasher.update(&self.produced_at.timestamp().to_le_bytes());
        hasher.update(&self.produced_at.timestamp_subsec_nanos().to_le_bytes());
        for row in &self.payload {
            hasher.update(row.instrument.as_str().as_bytes());
            hasher.update(&[0u8]);
            hasher.update(&row.target.to_bits().to_le_bytes());
        }
        hasher.finalize().to_hex().to_string()
    }

    /// Full validation: non-empty payload, unique well-formed instruments,
    /// finite non-negative targets, and a matching checksum when one is recorded.
    pub fn validate(&self) -> Result<(), RecordError> {
        let version = self.version;
        if self.payload.is_empty() {
            return Err(RecordError::EmptyPayload(version));
        }

        let mut seen = BTreeSet::new();
        for (row_idx, row) in self.payload.iter().enumerate() {
            if row.instrument.as_str().trim().is_empty() {
                return Err(RecordError::BlankInstrument {
                    version,
                    row: row_idx,
                });
            }
            if !seen.insert(&row.instrument) {
                return Err(RecordError::DuplicateInstrument {
                    version,
                    instrument: row.instrument.clone(),
                });
            }
            if !row.target.is_finite() {
                return Err(RecordError::NonFiniteTarget {
                    version,
                    instrument: row.instrument.clone(),
                });
            }
            if row.target < 0.0 {
                return Err(RecordError::NegativeTarget {
                    version,
                    instrument: row.instrument.clone(),
                    value: row.target,
                });
            }
        }

        if let Some(recorded) = &self.checksum {
            let computed = self.compute_checksum();
            if *recorded != computed {
                return Err(RecordError::ChecksumMismatch {
                    version,
                    recorded: recorded.clone(),
                    computed,
                });
            }
        }
        Ok(())
    }

    /// Payload keyed by instrument. Only meaningful on a validated record.
    pub fn targets(&self) -> BTreeMap<InstrumentId, f64> {
        self.payload
            .iter()
            .map(|row| (row.instrument.clone(), row.target))
            .collect()
    }

    /// Age of the record relative to `now`, clamped at zero.
    pub fn age(&self, now: DateTime<Utc>) -> chrono::Duration {
        (now - self.produced_at).max(chrono::Duration::zero())
    }
}
