use crate::types::{RebalanceIntent, Version};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub mod jsonl;

/// Protocol events worth keeping an external trail of.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum AuditEvent {
    Published {
        version: Version,
        produced_at: DateTime<Utc>,
        rows: usize,
        compute_ms: u64,
    },
    ComputationFailed {
        started_at: DateTime<Utc>,
        error: String,
    },
    ValidationRejected {
        version: Version,
        error: String,
    },
    Discarded {
        version: Version,
        watermark: Option<Version>,
    },
    Applied {
        version: Version,
        intents: Vec<RebalanceIntent>,
    },
    PartiallyApplied {
        version: Version,
        confirmed: Vec<RebalanceIntent>,
        rejected: Vec<RebalanceIntent>,
    },
    ApplyFailed {
        version: Version,
        error: String,
    },
    Blocked {
        version: Version,
        age_secs: i64,
    },
    Stale {
        version: Version,
        age_secs: i64,
    },
}

impl AuditEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            AuditEvent::Published { .. } => "published",
            AuditEvent::ComputationFailed { .. } => "computation_failed",
            AuditEvent::ValidationRejected { .. } => "validation_rejected",
            AuditEvent::Discarded { .. } => "discarded",
            AuditEvent::Applied { .. } => "applied",
            AuditEvent::PartiallyApplied { .. } => "partially_applied",
            AuditEvent::ApplyFailed { .. } => "apply_failed",
            AuditEvent::Blocked { .. } => "blocked",
            AuditEvent::Stale { .. } => "stale",
        }
    }
}

pub trait AuditSink: Send + Sync {
    fn emit(&self, event: AuditEvent) -> anyhow::Result<()>;
}

/// Emit and swallow sink failures; the audit trail never fails a cycle.
pub(crate) fn emit_quietly(sink: &dyn AuditSink, event: AuditEvent) {
    let kind = event.kind();
    if let Err(err) = sink.emit(event) {
        tracing::warn!(kind, error = %err, "audit sink rejected event");
    }
}

/// No-op audit sink (useful for demos and tests).
#[derive(Clone, Debug, Default)]
pub struct NoopAuditSink;

impl AuditSink for NoopAuditSink {
    fn emit(&self, _event: AuditEvent) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Keeps every event in memory; handy for assertions.
#[derive(Default)]
pub struct MemoryAuditSink {
    events: parking_lot::Mutex<Vec<AuditEvent>>,
}

impl MemoryAuditSink {
    pub fn events(&self) -> Vec<AuditEvent> {
        self.events.lock().clone()
    }

    pub fn kinds(&self) -> Vec<&'static str> {
        self.events.lock().iter().map(AuditEvent::kind).collect()
    }
}

impl AuditSink for MemoryAuditSink {
    fn emit(&self, event: AuditEvent) -> anyhow::Result<()> {
        self.events.lock().push(event);
        Ok(())
    }
}
