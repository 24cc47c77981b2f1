//! Process-wide timers. The scheduler owns no business state: the alpha
//! runner and the gateway only meet through the data bus.

use crate::audit::{emit_quietly, AuditEvent, AuditSink, NoopAuditSink};
use crate::bus::DataBus;
use crate::config::{Cadence, Config, ConfigError, StalenessPolicy};
use crate::engine::{AlphaRunner, RunError, TaskInput, TaskStatus};
use crate::gateway::{CycleOutcome, ExecutionGateway};
use crate::metrics::counters;
use crate::record::SignalRecord;
use crate::types::Version;
use chrono::{DateTime, NaiveTime, Utc};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("invalid alpha cadence: {0}")]
    Cadence(#[from] ConfigError),
}

#[derive(Clone, Debug)]
pub struct SchedulerConfig {
    pub alpha_cadence: Cadence,
    pub run_on_start: bool,
    pub poll_interval: Duration,
    pub health_check_interval: Duration,
    pub staleness_threshold: Option<chrono::Duration>,
    pub staleness_policy: StalenessPolicy,
}

impl From<&Config> for SchedulerConfig {
    fn from(config: &Config) -> Self {
        Self {
            alpha_cadence: config.alpha.cadence.clone(),
            run_on_start: config.alpha.run_on_start,
            poll_interval: config.gateway.poll_interval(),
            health_check_interval: Duration::from_secs(config.staleness.health_check_secs),
            staleness_threshold: config.staleness.threshold(),
            staleness_policy: config.staleness.policy,
        }
    }
}

/// Cloneable stop switch shared between the scheduler and whoever stops it.
#[derive(Clone, Default)]
pub struct ShutdownHandle {
    flag: Arc<AtomicBool>,
    notify: Arc<Notify>,
}

impl ShutdownHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn trigger(&self) {
        self.flag.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    pub fn is_triggered(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    pub async fn wait(&self) {
        let notified = self.notify.notified();
        if self.is_triggered() {
            return;
        }
        notified.await;
    }

    /// Trigger on Ctrl-C, or SIGTERM on unix.
    pub fn trigger_on_signals(&self) {
        let handle = self.clone();
        tokio::spawn(async move {
            wait_for_signal().await;
            tracing::info!("shutdown signal received");
            handle.trigger();
        });
    }
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    match signal(SignalKind::terminate()) {
        Ok(mut term) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = term.recv() => {}
            }
        }
        Err(err) => {
            tracing::warn!(error = %err, "SIGTERM handler unavailable; listening for Ctrl-C only");
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    let _ = tokio::signal::ctrl_c().await;
}

/// Result of one health evaluation.
#[derive(Clone, Debug, PartialEq)]
pub struct HealthReport {
    pub head: Option<Version>,
    pub age_secs: Option<i64>,
    pub stale: bool,
    pub last_run_failed: bool,
}

pub struct Scheduler {
    runner: AlphaRunner,
    gateway: Arc<ExecutionGateway>,
    bus: Arc<dyn DataBus>,
    audit: Arc<dyn AuditSink>,
    config: SchedulerConfig,
    ticks: Option<mpsc::Receiver<()>>,
    shutdown: ShutdownHandle,
}

type AlphaHandle = JoinHandle<Result<SignalRecord, RunError>>;

impl Scheduler {
    pub fn new(
        runner: AlphaRunner,
        gateway: Arc<ExecutionGateway>,
        bus: Arc<dyn DataBus>,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            runner,
            gateway,
            bus,
            audit: Arc::new(NoopAuditSink),
            config,
            ticks: None,
            shutdown: ShutdownHandle::new(),
        }
    }

    pub fn with_audit(mut self, audit: Arc<dyn AuditSink>) -> Self {
        self.audit = audit;
        self
    }

    /// Channel for external market-data ticks. Each message drives one
    /// gateway cycle in addition to the poll timer.
    pub fn tick_sender(&mut self, capacity: usize) -> mpsc::Sender<()> {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        self.ticks = Some(rx);
        tx
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        self.shutdown.clone()
    }

    /// Run until shutdown is triggered, then wait for an in-flight
    /// computation so its publish completes.
    pub async fn run(mut self) -> Result<(), SchedulerError> {
        let daily = self.config.alpha_cadence.daily_time().transpose()?;
        // Wall-clock target of the pending daily fire.
        let mut daily_target = None;
        let first_alpha = if self.config.run_on_start {
            Instant::now()
        } else {
            let (at, target) = self.next_alpha_fire(daily, None);
            daily_target = target;
            at
        };
        let alpha_sleep = tokio::time::sleep_until(first_alpha);
        tokio::pin!(alpha_sleep);

        let mut poll_timer = tokio::time::interval(self.config.poll_interval);
        poll_timer.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut health_timer = tokio::time::interval_at(
            Instant::now() + self.config.health_check_interval,
            self.config.health_check_interval,
        );
        health_timer.set_missed_tick_behavior(MissedTickBehavior::Skip);

        let mut ticks = self.ticks.take();
        let mut inflight: Option<AlphaHandle> = None;
        tracing::info!(
            cadence = ?self.config.alpha_cadence,
            poll_ms = u64::try_from(self.config.poll_interval.as_millis()).unwrap_or(u64::MAX),
            "scheduler started"
        );

        loop {
            tokio::select! {
                biased;
                _ = self.shutdown.wait() => break,
                _ = &mut alpha_sleep => {
                    if let Some(handle) = self.fire_alpha() {
                        inflight = Some(handle);
                    }
                    let (at, target) = self.next_alpha_fire(daily, daily_target);
                    daily_target = target;
                    alpha_sleep.as_mut().reset(at);
                }
                _ = poll_timer.tick() => {
                    self.drive_gateway("timer").await;
                }
                tick = next_tick(&mut ticks) => match tick {
                    Some(()) => self.drive_gateway("tick").await,
                    None => {
                        tracing::debug!("tick source closed");
                        ticks = None;
                    }
                },
                _ = health_timer.tick() => {
                    self.check_health();
                }
            }
        }

        tracing::info!("scheduler stopping");
        if let Some(handle) = inflight {
            if !handle.is_finished() {
                tracing::info!("waiting for in-flight alpha computation to finish");
            }
            if let Err(err) = handle.await {
                tracing::warn!(error = %err, "alpha task ended abnormally during shutdown");
            }
        }
        Ok(())
    }

    fn fire_alpha(&self) -> Option<AlphaHandle> {
        let input = TaskInput {
            scheduled_at: Utc::now(),
            previous: None,
        };
        self.runner.trigger(input)
    }

    async fn drive_gateway(&self, source: &'static str) {
        match self.gateway.on_tick().await {
            CycleOutcome::NoChange | CycleOutcome::Busy => {}
            outcome => tracing::debug!(source, ?outcome, "gateway cycle"),
        }
    }

    fn next_alpha_fire(
        &self,
        daily: Option<NaiveTime>,
        previous: Option<DateTime<Utc>>,
    ) -> (Instant, Option<DateTime<Utc>>) {
        match (&self.config.alpha_cadence, daily) {
            (_, Some(at)) => {
                let now = Utc::now();
                let target = match previous {
                    Some(previous) => following_daily_fire(previous, now, at),
                    None => next_daily_fire(now, at),
                };
                let wait = (target - now).to_std().unwrap_or(Duration::ZERO);
                (Instant::now() + wait, Some(target))
            }
            (Cadence::EverySecs(secs), None) => (Instant::now() + Duration::from_secs(*secs), None),
            (Cadence::DailyAt(_), None) => (Instant::now() + Duration::from_secs(86_400), None),
        }
    }

    /// Evaluate signal staleness and the last computation's outcome.
    pub fn check_health(&self) -> HealthReport {
        let last_run_failed = self.runner.last_task().status == TaskStatus::Failed;
        if last_run_failed {
            tracing::warn!(
                failed_at = ?self.runner.last_failure(),
                "last alpha computation failed; previous signal remains authoritative"
            );
        }

        let head = match self.bus.peek_head() {
            Ok(head) => head,
            Err(err) => {
                tracing::warn!(error = %err, "health check could not read bus head");
                None
            }
        };
        let age = head.as_ref().map(|h| (Utc::now() - h.produced_at).max(chrono::Duration::zero()));
        let stale = match (self.config.staleness_policy, self.config.staleness_threshold, age) {
            (StalenessPolicy::Ignore, _, _) | (_, None, _) => false,
            (_, Some(_), None) => {
                tracing::warn!("no signal has been published yet");
                false
            }
            (_, Some(threshold), Some(age)) => age > threshold,
        };

        let report = HealthReport {
            head: head.as_ref().map(|h| h.version),
            age_secs: age.map(|a| a.num_seconds()),
            stale,
            last_run_failed,
        };
        if let (true, Some(version), Some(age_secs)) = (stale, report.head, report.age_secs) {
            self.gateway.metrics().incr(counters::STALE_ALERTS);
            tracing::warn!(
                version = %version,
                age_secs,
                alpha_running = self.runner.is_running(),
                policy = ?self.config.staleness_policy,
                "latest signal is stale"
            );
            emit_quietly(&*self.audit, AuditEvent::Stale { version, age_secs });
        }
        report
    }
}

async fn next_tick(ticks: &mut Option<mpsc::Receiver<()>>) -> Option<()> {
    match ticks {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

/// Next occurrence of `at` (UTC) strictly after `now`.
pub fn next_daily_fire(now: DateTime<Utc>, at: NaiveTime) -> DateTime<Utc> {
    let today = now.date_naive().and_time(at).and_utc();
    if today > now {
        today
    } else {
        today + chrono::Duration::days(1)
    }
}

/// Fire after the one scheduled for `previous`. A wall clock still short of
/// `previous` cannot bring the same day back.
pub fn following_daily_fire(previous: DateTime<Utc>, now: DateTime<Utc>, at: NaiveTime) -> DateTime<Utc> {
    next_daily_fire(now.max(previous), at)
}
