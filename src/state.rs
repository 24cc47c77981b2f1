use crate::types::{InstrumentId, Version};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Gateway-owned bookkeeping. `last_applied_version` only moves forward.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutionState {
    pub last_applied_version: Option<Version>,
    pub current_holdings: BTreeMap<InstrumentId, f64>,
}

impl ExecutionState {
    pub fn holding(&self, instrument: &str) -> f64 {
        self.current_holdings.get(instrument).copied().unwrap_or(0.0)
    }
}

#[derive(Debug, Error)]
pub enum StateError {
    #[error("execution state io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("execution state at {path} is corrupt: {details}")]
    Corrupt { path: PathBuf, details: String },
}

/// Persists [`ExecutionState`] with the same write-then-rename discipline as
/// the file bus, so a crash mid-save leaves the previous snapshot intact.
#[derive(Clone, Debug)]
pub struct StateStore {
    path: PathBuf,
}

impl StateStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn load(&self) -> Result<Option<ExecutionState>, StateError> {
        let bytes = match fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
            Err(source) => {
                return Err(StateError::Io {
                    path: self.path.clone(),
                    source,
                })
            }
        };
        serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|err| StateError::Corrupt {
                path: self.path.clone(),
                details: err.to_string(),
            })
    }

    pub fn save(&self, state: &ExecutionState) -> Result<(), StateError> {
        let io_err = |source| StateError::Io {
            path: self.path.clone(),
            source,
        };
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(io_err)?;
        }
        let bytes = serde_json::to_vec_pretty(state).map_err(|err| StateError::Corrupt {
            path: self.path.clone(),
            details: err.to_string(),
        })?;

        let mut tmp_name = self.path.as_os_str().to_owned();
        tmp_name.push(".tmp");
        let tmp = PathBuf::from(tmp_name);
        let mut file = fs::File::create(&tmp).map_err(io_err)?;
        file.write_all(&bytes).map_err(io_err)?;
        file.sync_all().map_err(io_err)?;
        fs::rename(&tmp, &self.path).map_err(io_err)?;
        Ok(())
    }
}
