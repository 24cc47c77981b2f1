//! Data bus: the only channel between the alpha engine and the gateway.
//!
//! Implementations must publish atomically (a reader never sees a torn record)
//! and must answer [`DataBus::peek_head`] without deserialising the payload.

use crate::record::SignalRecord;
use crate::types::Version;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;

pub mod file;
pub mod memory;

pub use file::FileBus;
pub use memory::MemoryBus;

/// Record metadata that can be probed cheaply.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BusHead {
    pub version: Version,
    pub produced_at: DateTime<Utc>,
    #[serde(default)]
    pub checksum: Option<String>,
    pub rows: usize,
}

impl BusHead {
    pub fn of(record: &SignalRecord) -> Self {
        Self {
            version: record.version,
            produced_at: record.produced_at,
            checksum: record.checksum.clone(),
            rows: record.payload.len(),
        }
    }
}

#[derive(Debug, Error)]
pub enum BusError {
    #[error("bus io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("bus entry at {path} is unreadable: {details}")]
    Decode { path: PathBuf, details: String },
    #[error("refusing to publish {attempted}: bus already holds {current}")]
    StaleVersion { attempted: Version, current: Version },
    #[error("bus location {path} is not usable: {details}")]
    Unusable { path: PathBuf, details: String },
}

impl BusError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Errors that may clear up on the next cycle (e.g. a concurrent writer).
    pub fn is_transient(&self) -> bool {
        matches!(self, BusError::Io { .. } | BusError::Decode { .. })
    }
}

pub trait DataBus: Send + Sync {
    /// Atomically replace the latest record. Versions must strictly increase.
    fn publish(&self, record: &SignalRecord) -> Result<(), BusError>;

    /// Full read of the latest record; `Ok(None)` when nothing was ever published.
    fn read_latest(&self) -> Result<Option<SignalRecord>, BusError>;

    /// Cheap metadata probe of the latest record.
    fn peek_head(&self) -> Result<Option<BusHead>, BusError>;

    fn peek_version(&self) -> Result<Option<Version>, BusError> {
        Ok(self.peek_head()?.map(|head| head.version))
    }

    /// Read a specific version from the latest slot or the retained history.
    fn read_version(&self, version: Version) -> Result<Option<SignalRecord>, BusError>;

    /// Newest version in the retained history. Lets a producer keep numbering
    /// when the latest slot cannot be decoded.
    fn last_archived_version(&self) -> Result<Option<Version>, BusError> {
        Ok(None)
    }
}
