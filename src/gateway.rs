//! Execution gateway: consumes validated signal records exactly once and turns
//! them into rebalance intents.
//!
//! Every entry point returns quickly. The only bus access on the hot path is
//! the detector's head probe; the alpha computation never runs here.

use crate::audit::{emit_quietly, AuditEvent, AuditSink, NoopAuditSink};
use crate::bus::DataBus;
use crate::config::{Config, StalenessPolicy};
use crate::detector::{ChangeDetector, DetectError, Poll};
use crate::engine::panic_message;
use crate::execution::OrderSubsystem;
use crate::metrics::{counters, SyncMetrics};
use crate::record::SignalRecord;
use crate::state::{ExecutionState, StateError, StateStore};
use crate::types::{InstrumentId, IntentOutcome, RebalanceIntent, Version};
use chrono::Utc;
use futures_util::FutureExt;
use std::collections::{BTreeMap, BTreeSet};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GatewayState {
    Idle,
    Applying,
    /// Terminal. Only entered on an unrecoverable bus or configuration fault.
    Faulted,
}

/// Result of one poll-and-apply cycle.
#[derive(Clone, Debug, PartialEq)]
pub enum CycleOutcome {
    NoChange,
    /// Another invocation holds the gateway; nothing was done.
    Busy,
    Faulted,
    DetectFailed {
        version: Option<Version>,
        error: String,
    },
    /// Late or duplicate delivery at or below the watermark.
    Discarded {
        version: Version,
        watermark: Option<Version>,
    },
    /// Refused under the `block` staleness policy; retried next cycle.
    Blocked { version: Version, age_secs: i64 },
    Applied {
        version: Version,
        intents: Vec<RebalanceIntent>,
    },
    PartiallyApplied {
        version: Version,
        confirmed: Vec<RebalanceIntent>,
        rejected: Vec<RebalanceIntent>,
    },
    ApplyFailed { version: Version, error: String },
}

impl CycleOutcome {
    pub fn applied_version(&self) -> Option<Version> {
        match self {
            CycleOutcome::Applied { version, .. } => Some(*version),
            _ => None,
        }
    }
}

#[derive(Debug, Error)]
pub enum ApplyError {
    #[error("order subsystem failed: {0:#}")]
    Orders(anyhow::Error),
    #[error("order subsystem panicked: {0}")]
    Panicked(String),
}

#[derive(Clone, Debug)]
pub struct GatewayConfig {
    /// Deltas with an absolute value at or below this are not traded.
    pub min_delta: f64,
    pub staleness_threshold: Option<chrono::Duration>,
    pub staleness_policy: StalenessPolicy,
    /// Minimum spacing between repeated per-cycle warnings.
    pub warn_interval: Duration,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            min_delta: 1e-9,
            staleness_threshold: None,
            staleness_policy: StalenessPolicy::default(),
            warn_interval: Duration::from_secs(30),
        }
    }
}

impl From<&Config> for GatewayConfig {
    fn from(config: &Config) -> Self {
        Self {
            min_delta: config.gateway.min_delta,
            staleness_threshold: config.staleness.threshold(),
            staleness_policy: config.staleness.policy,
            ..Self::default()
        }
    }
}

/// Rate limits a repeating warning; suppressed occurrences drop to `debug`.
struct WarnThrottle {
    interval: Duration,
    last: Option<Instant>,
    suppressed: u64,
}

impl WarnThrottle {
    fn new(interval: Duration) -> Self {
        Self {
            interval,
            last: None,
            suppressed: 0,
        }
    }

    /// `Some(suppressed_since_last)` when a warning may be emitted now.
    fn check(&mut self) -> Option<u64> {
        let now = Instant::now();
        match self.last {
            Some(last) if now.duration_since(last) < self.interval => {
                self.suppressed += 1;
                None
            }
            _ => {
                self.last = Some(now);
                Some(std::mem::take(&mut self.suppressed))
            }
        }
    }

    fn reset(&mut self) {
        self.last = None;
        self.suppressed = 0;
    }
}

/// Holds the gateway in `Applying` and returns it to `Idle` on drop, including
/// when the cycle future is cancelled. A fault raised meanwhile is kept.
struct ApplyingPhase<'a>(&'a parking_lot::Mutex<GatewayState>);

impl<'a> ApplyingPhase<'a> {
    fn enter(phase: &'a parking_lot::Mutex<GatewayState>) -> Self {
        *phase.lock() = GatewayState::Applying;
        Self(phase)
    }
}

impl Drop for ApplyingPhase<'_> {
    fn drop(&mut self) {
        let mut phase = self.0.lock();
        if *phase == GatewayState::Applying {
            *phase = GatewayState::Idle;
        }
    }
}

struct Inner {
    detector: ChangeDetector,
    state: ExecutionState,
    throttle: WarnThrottle,
}

pub struct ExecutionGateway {
    bus: Arc<dyn DataBus>,
    orders: Arc<dyn OrderSubsystem>,
    audit: Arc<dyn AuditSink>,
    metrics: Arc<SyncMetrics>,
    store: Option<StateStore>,
    config: GatewayConfig,
    inner: tokio::sync::Mutex<Inner>,
    phase: parking_lot::Mutex<GatewayState>,
}

impl ExecutionGateway {
    pub fn new(bus: Arc<dyn DataBus>, orders: Arc<dyn OrderSubsystem>, config: GatewayConfig) -> Self {
        let inner = Inner {
            detector: ChangeDetector::new(Arc::clone(&bus)),
            state: ExecutionState::default(),
            throttle: WarnThrottle::new(config.warn_interval),
        };
        Self {
            bus,
            orders,
            audit: Arc::new(NoopAuditSink),
            metrics: Arc::new(SyncMetrics::new()),
            store: None,
            config,
            inner: tokio::sync::Mutex::new(inner),
            phase: parking_lot::Mutex::new(GatewayState::Idle),
        }
    }

    pub fn with_audit(mut self, audit: Arc<dyn AuditSink>) -> Self {
        self.audit = audit;
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<SyncMetrics>) -> Self {
        self.metrics = metrics;
        self
    }

    /// Start from a known execution state; detection resumes above its watermark.
    pub fn with_state(mut self, state: ExecutionState) -> Self {
        let inner = self.inner.get_mut();
        inner.detector = ChangeDetector::starting_from(Arc::clone(&self.bus), state.last_applied_version);
        inner.state = state;
        self
    }

    /// Persist state to `store` after every confirmed update, restoring any
    /// snapshot already there.
    pub fn with_store(self, store: StateStore) -> Result<Self, StateError> {
        let restored = store.load()?;
        let mut gateway = match restored {
            Some(state) => {
                tracing::info!(
                    path = %store.path().display(),
                    watermark = ?state.last_applied_version.map(|v| v.0),
                    holdings = state.current_holdings.len(),
                    "execution state restored"
                );
                self.with_state(state)
            }
            None => self,
        };
        gateway.store = Some(store);
        Ok(gateway)
    }

    pub fn state(&self) -> GatewayState {
        *self.phase.lock()
    }

    /// Enter the terminal faulted state. Subsequent cycles do nothing.
    pub fn fault(&self, reason: &str) {
        tracing::error!(reason, "execution gateway faulted");
        *self.phase.lock() = GatewayState::Faulted;
    }

    pub fn metrics(&self) -> &Arc<SyncMetrics> {
        &self.metrics
    }

    /// Snapshot of the execution state. Waits for an in-progress apply.
    pub async fn execution_state(&self) -> ExecutionState {
        self.inner.lock().await.state.clone()
    }

    pub async fn watermark(&self) -> Option<Version> {
        self.inner.lock().await.state.last_applied_version
    }

    /// One poll-and-apply cycle, driven by a tick or the poll timer.
    pub async fn on_tick(&self) -> CycleOutcome {
        let clock = Instant::now();
        let outcome = self.cycle().await;
        self.metrics.record_cycle(clock.elapsed());
        outcome
    }

    async fn cycle(&self) -> CycleOutcome {
        if self.state() == GatewayState::Faulted {
            return CycleOutcome::Faulted;
        }
        let Ok(mut guard) = self.inner.try_lock() else {
            self.metrics.incr(counters::BUSY);
            tracing::debug!("gateway busy; tick skipped");
            return CycleOutcome::Busy;
        };
        let inner = &mut *guard;
        self.metrics.incr(counters::POLLS);

        let record = match inner.detector.poll() {
            Ok(Poll::NoChange) => {
                self.metrics.incr(counters::NO_CHANGE);
                return CycleOutcome::NoChange;
            }
            Ok(Poll::NewSignal(record)) => record,
            Err(err) => return self.detect_failed(inner, err),
        };

        let watermark = inner.state.last_applied_version;
        if Some(record.version) <= watermark {
            inner.detector.commit(record.version);
            self.metrics.incr(counters::DISCARDED);
            tracing::info!(version = %record.version, watermark = ?watermark.map(|v| v.0), "discarding late signal");
            emit_quietly(
                &*self.audit,
                AuditEvent::Discarded {
                    version: record.version,
                    watermark,
                },
            );
            return CycleOutcome::Discarded {
                version: record.version,
                watermark,
            };
        }

        if let Some(age_secs) = self.blocked_age(&record) {
            self.metrics.incr(counters::BLOCKED);
            if let Some(suppressed) = inner.throttle.check() {
                tracing::warn!(version = %record.version, age_secs, suppressed, "signal older than staleness threshold; not applying");
            }
            emit_quietly(
                &*self.audit,
                AuditEvent::Blocked {
                    version: record.version,
                    age_secs,
                },
            );
            return CycleOutcome::Blocked {
                version: record.version,
                age_secs,
            };
        }

        // Dropping this future mid-apply leaves the record uncommitted, so the
        // next cycle offers it again.
        let _applying = ApplyingPhase::enter(&self.phase);
        self.apply(inner, &record).await
    }

    fn detect_failed(&self, inner: &mut Inner, err: DetectError) -> CycleOutcome {
        self.metrics.incr(counters::DETECT_ERRORS);
        let version = err.version();
        if let DetectError::Read(bus_err) = &err {
            if !bus_err.is_transient() {
                self.fault(&bus_err.to_string());
                return CycleOutcome::Faulted;
            }
        }
        if let Some(suppressed) = inner.throttle.check() {
            tracing::warn!(version = ?version.map(|v| v.0), error = %err, suppressed, "signal detection failed; retrying next cycle");
        } else {
            tracing::debug!(error = %err, "signal detection failed again");
        }
        if let (true, Some(version)) = (err.is_validation(), version) {
            emit_quietly(
                &*self.audit,
                AuditEvent::ValidationRejected {
                    version,
                    error: err.to_string(),
                },
            );
        }
        CycleOutcome::DetectFailed {
            version,
            error: err.to_string(),
        }
    }

    fn blocked_age(&self, record: &SignalRecord) -> Option<i64> {
        if self.config.staleness_policy != StalenessPolicy::Block {
            return None;
        }
        let threshold = self.config.staleness_threshold?;
        let age = record.age(Utc::now());
        (age > threshold).then(|| age.num_seconds())
    }

    async fn apply(&self, inner: &mut Inner, record: &SignalRecord) -> CycleOutcome {
        let version = record.version;
        let targets = record.targets();
        let intents = rebalance_intents(
            version,
            &inner.state.current_holdings,
            &targets,
            self.config.min_delta,
        );
        tracing::info!(version = %version, intents = intents.len(), "applying signal");

        let reports = if intents.is_empty() {
            Ok(Vec::new())
        } else {
            match AssertUnwindSafe(self.orders.submit(&intents)).catch_unwind().await {
                Ok(Ok(reports)) => Ok(reports),
                Ok(Err(err)) => Err(ApplyError::Orders(err)),
                Err(payload) => Err(ApplyError::Panicked(panic_message(payload.as_ref()))),
            }
        };
        let reports = match reports {
            Ok(reports) => reports,
            Err(err) => {
                self.metrics.incr(counters::APPLY_FAILURES);
                if let Some(suppressed) = inner.throttle.check() {
                    tracing::warn!(version = %version, error = %err, suppressed, "apply failed; watermark unchanged, will retry");
                }
                emit_quietly(
                    &*self.audit,
                    AuditEvent::ApplyFailed {
                        version,
                        error: err.to_string(),
                    },
                );
                return CycleOutcome::ApplyFailed {
                    version,
                    error: err.to_string(),
                };
            }
        };

        let outcomes: BTreeMap<&InstrumentId, &IntentOutcome> = reports
            .iter()
            .filter(|report| report.intent.version == version)
            .map(|report| (&report.intent.instrument, &report.outcome))
            .collect();
        let (confirmed, rejected): (Vec<_>, Vec<_>) = intents
            .iter()
            .cloned()
            .partition(|intent| matches!(outcomes.get(&intent.instrument), Some(IntentOutcome::Confirmed)));

        for intent in &confirmed {
            match targets.get(&intent.instrument) {
                Some(&target) if target != 0.0 => {
                    inner.state.current_holdings.insert(intent.instrument.clone(), target);
                }
                _ => {
                    inner.state.current_holdings.remove(&intent.instrument);
                }
            }
        }

        if rejected.is_empty() {
            inner.state.last_applied_version = Some(version);
            inner.detector.commit(version);
            inner.throttle.reset();
            self.persist(&inner.state);
            self.metrics.incr(counters::APPLIED);
            tracing::info!(version = %version, intents = confirmed.len(), "signal applied");
            emit_quietly(
                &*self.audit,
                AuditEvent::Applied {
                    version,
                    intents: confirmed.clone(),
                },
            );
            return CycleOutcome::Applied {
                version,
                intents: confirmed,
            };
        }

        // Confirmed legs are kept; the record stays pending until every leg lands.
        if !confirmed.is_empty() {
            self.persist(&inner.state);
        }
        self.metrics.incr(counters::PARTIAL);
        if let Some(suppressed) = inner.throttle.check() {
            tracing::warn!(
                version = %version,
                confirmed = confirmed.len(),
                rejected = rejected.len(),
                suppressed,
                "signal partially applied; rejected intents retried next cycle"
            );
        }
        emit_quietly(
            &*self.audit,
            AuditEvent::PartiallyApplied {
                version,
                confirmed: confirmed.clone(),
                rejected: rejected.clone(),
            },
        );
        CycleOutcome::PartiallyApplied {
            version,
            confirmed,
            rejected,
        }
    }

    fn persist(&self, state: &ExecutionState) {
        let Some(store) = &self.store else {
            return;
        };
        if let Err(err) = store.save(state) {
            tracing::warn!(error = %err, "failed to persist execution state; continuing in memory");
        }
    }
}

/// Per-instrument `target - held` over the union of both sides, in
/// instrument order. Instruments missing from `targets` are driven to zero.
pub fn rebalance_intents(
    version: Version,
    holdings: &BTreeMap<InstrumentId, f64>,
    targets: &BTreeMap<InstrumentId, f64>,
    min_delta: f64,
) -> Vec<RebalanceIntent> {
    let instruments: BTreeSet<&InstrumentId> = holdings.keys().chain(targets.keys()).collect();
    instruments
        .into_iter()
        .filter_map(|instrument| {
            let held = holdings.get(instrument).copied().unwrap_or(0.0);
            let target = targets.get(instrument).copied().unwrap_or(0.0);
            let delta = target - held;
            (delta.abs() > min_delta).then(|| RebalanceIntent {
                version,
                instrument: instrument.clone(),
                delta,
            })
        })
        .collect()
}
