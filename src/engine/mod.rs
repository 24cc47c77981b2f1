//! Alpha engine runner.
//!
//! The computation itself is pluggable ([`AlphaEngine`]); the runner owns the
//! task lifecycle, keeps runs from overlapping and is the only writer of new
//! versions to the bus.

use crate::audit::{emit_quietly, AuditEvent, AuditSink};
use crate::bus::{BusError, DataBus};
use crate::metrics::{counters, SyncMetrics};
use crate::record::{RecordError, SignalRecord, TargetRow};
use crate::types::Version;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tokio::task::JoinHandle;

pub mod demo;

/// Context handed to a computation run.
#[derive(Clone, Debug)]
pub struct TaskInput {
    pub scheduled_at: DateTime<Utc>,
    /// Version currently on the bus, if any.
    pub previous: Option<Version>,
}

impl TaskInput {
    pub fn now() -> Self {
        Self {
            scheduled_at: Utc::now(),
            previous: None,
        }
    }
}

/// The heavy, latency-insensitive computation. Runs on a blocking worker.
pub trait AlphaEngine: Send + Sync {
    fn name(&self) -> &str {
        "alpha"
    }

    fn compute(&self, input: &TaskInput) -> anyhow::Result<Vec<TargetRow>>;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    NotStarted,
    Running,
    Done,
    Failed,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ComputationTask {
    pub id: u64,
    pub status: TaskStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub version: Option<Version>,
    pub error: Option<String>,
}

impl ComputationTask {
    fn not_started(id: u64) -> Self {
        Self {
            id,
            status: TaskStatus::NotStarted,
            started_at: None,
            finished_at: None,
            version: None,
            error: None,
        }
    }
}

#[derive(Debug, Error)]
pub enum RunError {
    #[error("a computation is already running")]
    AlreadyRunning,
    #[error("computation failed: {0:#}")]
    Computation(anyhow::Error),
    #[error("computation panicked: {0}")]
    Panicked(String),
    #[error("computed payload is invalid: {0}")]
    Invalid(#[from] RecordError),
    #[error("publish failed: {0}")]
    Publish(#[from] BusError),
    #[error("computation worker was lost: {0}")]
    Join(String),
}

struct Shared {
    engine: Arc<dyn AlphaEngine>,
    bus: Arc<dyn DataBus>,
    audit: Arc<dyn AuditSink>,
    metrics: Arc<SyncMetrics>,
    running: AtomicBool,
    next_task_id: AtomicU64,
    last_published: Mutex<Option<Version>>,
    task: Mutex<ComputationTask>,
    last_failure: Mutex<Option<DateTime<Utc>>>,
}

/// Clears the single-flight flag however the run ends.
struct FlightGuard<'a>(&'a AtomicBool);

impl<'a> FlightGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self(flag))
    }
}

impl Drop for FlightGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

#[derive(Clone)]
pub struct AlphaRunner {
    shared: Arc<Shared>,
}

impl AlphaRunner {
    pub fn new(
        engine: Arc<dyn AlphaEngine>,
        bus: Arc<dyn DataBus>,
        audit: Arc<dyn AuditSink>,
        metrics: Arc<SyncMetrics>,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                engine,
                bus,
                audit,
                metrics,
                running: AtomicBool::new(false),
                next_task_id: AtomicU64::new(1),
                last_published: Mutex::new(None),
                task: Mutex::new(ComputationTask::not_started(0)),
                last_failure: Mutex::new(None),
            }),
        }
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::Acquire)
    }

    /// Snapshot of the most recent computation task.
    pub fn last_task(&self) -> ComputationTask {
        self.shared.task.lock().clone()
    }

    /// When the most recent run failed, if it did.
    pub fn last_failure(&self) -> Option<DateTime<Utc>> {
        *self.shared.last_failure.lock()
    }

    /// Run one computation to completion on a blocking worker and publish it.
    ///
    /// Returns [`RunError::AlreadyRunning`] without doing anything when a run
    /// is in flight.
    pub async fn run(&self, input: TaskInput) -> Result<SignalRecord, RunError> {
        if self.is_running() {
            return Err(RunError::AlreadyRunning);
        }
        let shared = Arc::clone(&self.shared);
        tokio::task::spawn_blocking(move || shared.run_blocking(input))
            .await
            .map_err(|err| RunError::Join(err.to_string()))?
    }

    /// Fire-and-forget variant used by the scheduler. `None` means the trigger
    /// was coalesced into the run already in flight.
    pub fn trigger(&self, input: TaskInput) -> Option<JoinHandle<Result<SignalRecord, RunError>>> {
        if self.is_running() {
            self.shared.metrics.incr(counters::COALESCED);
            tracing::debug!("alpha trigger coalesced into running computation");
            return None;
        }
        let runner = self.clone();
        Some(tokio::spawn(async move { runner.run(input).await }))
    }
}

impl Shared {
    fn run_blocking(&self, mut input: TaskInput) -> Result<SignalRecord, RunError> {
        let Some(_flight) = FlightGuard::acquire(&self.running) else {
            self.metrics.incr(counters::COALESCED);
            return Err(RunError::AlreadyRunning);
        };

        let id = self.next_task_id.fetch_add(1, Ordering::Relaxed);
        let started_at = Utc::now();
        *self.task.lock() = ComputationTask {
            status: TaskStatus::Running,
            started_at: Some(started_at),
            ..ComputationTask::not_started(id)
        };
        tracing::info!(task = id, engine = self.engine.name(), "alpha computation started");

        let clock = Instant::now();
        let result = self.compute_and_publish(&mut input);
        let finished_at = Utc::now();
        let compute_ms = u64::try_from(clock.elapsed().as_millis()).unwrap_or(u64::MAX);

        let mut task = self.task.lock();
        task.finished_at = Some(finished_at);
        match &result {
            Ok(record) => {
                task.status = TaskStatus::Done;
                task.version = Some(record.version);
                self.metrics.incr(counters::PUBLISHED);
                tracing::info!(
                    task = id,
                    version = %record.version,
                    rows = record.payload.len(),
                    compute_ms,
                    "signal published"
                );
                emit_quietly(
                    &*self.audit,
                    AuditEvent::Published {
                        version: record.version,
                        produced_at: record.produced_at,
                        rows: record.payload.len(),
                        compute_ms,
                    },
                );
            }
            Err(err) => {
                task.status = TaskStatus::Failed;
                task.error = Some(err.to_string());
                *self.last_failure.lock() = Some(finished_at);
                self.metrics.incr(counters::COMPUTATION_FAILURES);
                tracing::error!(task = id, error = %err, "alpha computation failed; previous signal stays authoritative");
                emit_quietly(
                    &*self.audit,
                    AuditEvent::ComputationFailed {
                        started_at,
                        error: err.to_string(),
                    },
                );
            }
        }
        result
    }

    fn compute_and_publish(&self, input: &mut TaskInput) -> Result<SignalRecord, RunError> {
        input.previous = self.readable_head()?;

        let rows = match panic::catch_unwind(AssertUnwindSafe(|| self.engine.compute(input))) {
            Ok(Ok(rows)) => rows,
            Ok(Err(err)) => return Err(RunError::Computation(err)),
            Err(payload) => return Err(RunError::Panicked(panic_message(payload.as_ref()))),
        };

        // Serialise version assignment and publish.
        let mut last_published = self.last_published.lock();
        let on_bus = self.readable_head()?;
        let version = on_bus.max(*last_published).map_or(Version::FIRST, Version::next);

        let record = SignalRecord::new(version, Utc::now(), rows);
        record.validate()?;
        self.bus.publish(&record)?;
        *last_published = Some(version);
        Ok(record)
    }

    /// Head version, falling back to the retained history when the latest
    /// entry cannot be decoded. The publish then replaces the torn entry.
    fn readable_head(&self) -> Result<Option<Version>, BusError> {
        match self.bus.peek_version() {
            Err(err @ BusError::Decode { .. }) => {
                tracing::warn!(error = %err, "bus head unreadable; numbering from retained history");
                self.bus.last_archived_version()
            }
            other => other,
        }
    }
}

pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::MemoryAuditSink;
    use crate::bus::MemoryBus;
    use std::time::Duration;

    struct Fixed(Vec<TargetRow>);

    impl AlphaEngine for Fixed {
        fn compute(&self, _input: &TaskInput) -> anyhow::Result<Vec<TargetRow>> {
            Ok(self.0.clone())
        }
    }

    struct Failing;

    impl AlphaEngine for Failing {
        fn compute(&self, _input: &TaskInput) -> anyhow::Result<Vec<TargetRow>> {
            anyhow::bail!("data source offline")
        }
    }

    struct Panicking;

    impl AlphaEngine for Panicking {
        fn compute(&self, _input: &TaskInput) -> anyhow::Result<Vec<TargetRow>> {
            panic!("index out of range")
        }
    }

    struct Slow(Duration);

    impl AlphaEngine for Slow {
        fn compute(&self, _input: &TaskInput) -> anyhow::Result<Vec<TargetRow>> {
            std::thread::sleep(self.0);
            Ok(vec![TargetRow::new("AAA", 1.0)])
        }
    }

    fn runner(engine: Arc<dyn AlphaEngine>, bus: Arc<MemoryBus>) -> (AlphaRunner, Arc<MemoryAuditSink>) {
        let audit = Arc::new(MemoryAuditSink::default());
        let runner = AlphaRunner::new(engine, bus, audit.clone(), Arc::new(SyncMetrics::new()));
        (runner, audit)
    }

    #[tokio::test]
    async fn publishes_increasing_versions() {
        let bus = Arc::new(MemoryBus::new(0));
        let (runner, audit) = runner(Arc::new(Fixed(vec![TargetRow::new("AAA", 1.0)])), bus.clone());

        let first = runner.run(TaskInput::now()).await.unwrap();
        let second = runner.run(TaskInput::now()).await.unwrap();
        assert_eq!(first.version, Version(1));
        assert_eq!(second.version, Version(2));
        assert_eq!(bus.peek_version().unwrap(), Some(Version(2)));
        assert_eq!(runner.last_task().status, TaskStatus::Done);
        assert_eq!(audit.kinds(), vec!["published", "published"]);
    }

    #[tokio::test]
    async fn failure_leaves_bus_untouched() {
        let bus = Arc::new(MemoryBus::new(0));
        let (ok_runner, _) = runner(Arc::new(Fixed(vec![TargetRow::new("AAA", 1.0)])), bus.clone());
        ok_runner.run(TaskInput::now()).await.unwrap();

        let (bad_runner, audit) = runner(Arc::new(Failing), bus.clone());
        let err = bad_runner.run(TaskInput::now()).await.unwrap_err();
        assert!(matches!(err, RunError::Computation(_)));
        let task = bad_runner.last_task();
        assert_eq!(task.status, TaskStatus::Failed);
        assert!(task.finished_at.is_some());
        assert!(bad_runner.last_failure().is_some());
        assert_eq!(bus.peek_version().unwrap(), Some(Version(1)));
        assert_eq!(audit.kinds(), vec!["computation_failed"]);
    }

    #[tokio::test]
    async fn panic_is_contained() {
        let bus = Arc::new(MemoryBus::new(0));
        let (runner, _) = runner(Arc::new(Panicking), bus.clone());
        let err = runner.run(TaskInput::now()).await.unwrap_err();
        assert!(matches!(err, RunError::Panicked(ref msg) if msg.contains("index out of range")));
        assert!(!runner.is_running());
        assert!(bus.read_latest().unwrap().is_none());
    }

    #[tokio::test]
    async fn invalid_payload_is_not_published() {
        let bus = Arc::new(MemoryBus::new(0));
        let (runner, _) = runner(Arc::new(Fixed(vec![TargetRow::new("AAA", -0.5)])), bus.clone());
        let err = runner.run(TaskInput::now()).await.unwrap_err();
        assert!(matches!(err, RunError::Invalid(RecordError::NegativeTarget { .. })));
        assert!(bus.read_latest().unwrap().is_none());
    }

    #[tokio::test]
    async fn overlapping_trigger_is_coalesced() {
        let bus = Arc::new(MemoryBus::new(0));
        let (runner, _) = runner(Arc::new(Slow(Duration::from_millis(200))), bus.clone());

        let handle = runner.trigger(TaskInput::now()).expect("first trigger runs");
        while !runner.is_running() {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        assert!(runner.trigger(TaskInput::now()).is_none());
        assert!(matches!(
            runner.run(TaskInput::now()).await,
            Err(RunError::AlreadyRunning)
        ));

        let record = handle.await.unwrap().unwrap();
        assert_eq!(record.version, Version(1));
        assert!(!runner.is_running());
    }

    /// Bus whose latest slot never decodes, as after a torn foreign write.
    struct TornHead {
        inner: MemoryBus,
        archived: Option<Version>,
    }

    impl DataBus for TornHead {
        fn publish(&self, record: &SignalRecord) -> Result<(), BusError> {
            self.inner.publish(record)
        }

        fn read_latest(&self) -> Result<Option<SignalRecord>, BusError> {
            self.inner.read_latest()
        }

        fn peek_head(&self) -> Result<Option<crate::bus::BusHead>, BusError> {
            Err(BusError::Decode {
                path: "latest.json".into(),
                details: "truncated".into(),
            })
        }

        fn read_version(&self, version: Version) -> Result<Option<SignalRecord>, BusError> {
            self.inner.read_version(version)
        }

        fn last_archived_version(&self) -> Result<Option<Version>, BusError> {
            Ok(self.archived)
        }
    }

    #[tokio::test]
    async fn unreadable_head_does_not_wedge_publishing() {
        let bus = Arc::new(TornHead {
            inner: MemoryBus::new(0),
            archived: Some(Version(7)),
        });
        let audit = Arc::new(MemoryAuditSink::default());
        let runner = AlphaRunner::new(
            Arc::new(Fixed(vec![TargetRow::new("AAA", 1.0)])),
            bus.clone(),
            audit.clone(),
            Arc::new(SyncMetrics::new()),
        );

        assert_eq!(runner.run(TaskInput::now()).await.unwrap().version, Version(8));
        assert_eq!(runner.run(TaskInput::now()).await.unwrap().version, Version(9));
        assert_eq!(bus.inner.peek_version().unwrap(), Some(Version(9)));
        assert_eq!(audit.kinds(), vec!["published", "published"]);
    }

    #[tokio::test]
    async fn versions_continue_from_existing_bus_head() {
        let bus = Arc::new(MemoryBus::new(0));
        bus.publish(&SignalRecord::new(Version(41), Utc::now(), vec![TargetRow::new("AAA", 1.0)]))
            .unwrap();
        let (runner, _) = runner(Arc::new(Fixed(vec![TargetRow::new("BBB", 1.0)])), bus.clone());
        let record = runner.run(TaskInput::now()).await.unwrap();
        assert_eq!(record.version, Version(42));
    }
}
