use serde::{Deserialize, Serialize};
use std::borrow::Borrow;
use std::fmt;

#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InstrumentId(pub String);

impl InstrumentId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for InstrumentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl Borrow<str> for InstrumentId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl From<&str> for InstrumentId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Identifies one computation run. Strictly increasing across publishes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Version(pub u64);

impl Version {
    pub const FIRST: Version = Version(1);

    pub fn next(self) -> Version {
        Version(self.0.saturating_add(1))
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}", self.0)
    }
}

/// A requested quantity change for one instrument.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RebalanceIntent {
    pub version: Version,
    pub instrument: InstrumentId,
    /// Positive to increase the holding, negative to reduce it.
    pub delta: f64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum IntentOutcome {
    Confirmed,
    Rejected { reason: String },
}

/// Per-intent answer from the order subsystem.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct IntentReport {
    pub intent: RebalanceIntent,
    pub outcome: IntentOutcome,
}

impl IntentReport {
    pub fn confirmed(intent: RebalanceIntent) -> Self {
        Self {
            intent,
            outcome: IntentOutcome::Confirmed,
        }
    }

    pub fn rejected(intent: RebalanceIntent, reason: impl Into<String>) -> Self {
        Self {
            intent,
            outcome: IntentOutcome::Rejected {
                reason: reason.into(),
            },
        }
    }

    pub fn is_confirmed(&self) -> bool {
        matches!(self.outcome, IntentOutcome::Confirmed)
    }
}
