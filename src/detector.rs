//! Two-phase change detection: a cheap head probe on every call, and a full
//! read plus validation only when the probe reports a newer version.
//!
//! A detected record stays pending until the consumer calls
//! [`ChangeDetector::commit`], so a record whose handling fails or is
//! abandoned mid-way is offered again on the next poll.

use crate::bus::{BusError, DataBus};
use crate::record::{RecordError, SignalRecord};
use crate::types::Version;
use std::sync::Arc;
use thiserror::Error;

#[derive(Clone, Debug, PartialEq)]
pub enum Poll {
    NewSignal(SignalRecord),
    NoChange,
}

#[derive(Debug, Error)]
pub enum DetectError {
    #[error("bus read failed: {0}")]
    Read(#[from] BusError),
    #[error("signal rejected: {0}")]
    Invalid(#[from] RecordError),
    #[error("bus advertised {0} but the entry disappeared before it could be read")]
    Vanished(Version),
}

impl DetectError {
    pub fn is_validation(&self) -> bool {
        matches!(self, DetectError::Invalid(_))
    }

    /// Version the failure relates to, when known.
    pub fn version(&self) -> Option<Version> {
        match self {
            DetectError::Invalid(err) => Some(err.version()),
            DetectError::Vanished(v) => Some(*v),
            DetectError::Read(_) => None,
        }
    }
}

pub struct ChangeDetector {
    bus: Arc<dyn DataBus>,
    seen: Option<Version>,
}

impl ChangeDetector {
    pub fn new(bus: Arc<dyn DataBus>) -> Self {
        Self::starting_from(bus, None)
    }

    /// Resume detection above an already handled version.
    pub fn starting_from(bus: Arc<dyn DataBus>, seen: Option<Version>) -> Self {
        Self { bus, seen }
    }

    /// Highest committed version.
    pub fn seen(&self) -> Option<Version> {
        self.seen
    }

    pub fn poll(&mut self) -> Result<Poll, DetectError> {
        let Some(head) = self.bus.peek_version()? else {
            return Ok(Poll::NoChange);
        };
        if Some(head) <= self.seen {
            return Ok(Poll::NoChange);
        }

        // A publish may land between probe and read; the read wins.
        let record = self.bus.read_latest()?.ok_or(DetectError::Vanished(head))?;
        if Some(record.version) <= self.seen {
            return Ok(Poll::NoChange);
        }
        record.validate()?;
        Ok(Poll::NewSignal(record))
    }

    /// Mark `version` as handled; later polls only report newer records.
    /// Never moves back.
    pub fn commit(&mut self, version: Version) {
        if Some(version) > self.seen {
            self.seen = Some(version);
        }
    }
}
