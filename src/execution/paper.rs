use crate::execution::OrderSubsystem;
use crate::types::{InstrumentId, IntentReport, RebalanceIntent};
use async_trait::async_trait;
use parking_lot::Mutex;
use rand::Rng;
use std::collections::{BTreeSet, VecDeque};
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

/// Intents kept by [`PaperOrderSubsystem::submitted`]; older ones are dropped.
pub const SUBMITTED_LOG_CAP: usize = 1024;

/// In-process order subsystem for demos and tests.
///
/// Confirms everything by default. Instruments can be rejected
/// deterministically, whole submissions can be failed, and ack latency can be
/// simulated.
#[derive(Default)]
pub struct PaperOrderSubsystem {
    max_latency: Duration,
    rejected: Mutex<BTreeSet<InstrumentId>>,
    fail_next: AtomicU32,
    submitted: Mutex<VecDeque<RebalanceIntent>>,
}

impl PaperOrderSubsystem {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulated ack latency, drawn uniformly from `0..=max_latency`.
    pub fn with_latency(mut self, max_latency: Duration) -> Self {
        self.max_latency = max_latency;
        self
    }

    pub fn reject(&self, instrument: &str) {
        self.rejected.lock().insert(InstrumentId::from(instrument));
    }

    pub fn accept(&self, instrument: &str) {
        self.rejected.lock().remove(instrument);
    }

    /// Fail the next `n` submissions outright.
    pub fn fail_next(&self, n: u32) {
        self.fail_next.store(n, Ordering::Release);
    }

    /// The most recent submitted intents (up to [`SUBMITTED_LOG_CAP`]), oldest first.
    pub fn submitted(&self) -> Vec<RebalanceIntent> {
        self.submitted.lock().iter().cloned().collect()
    }

    fn record(&self, intents: &[RebalanceIntent]) {
        let mut log = self.submitted.lock();
        log.extend(intents.iter().cloned());
        let excess = log.len().saturating_sub(SUBMITTED_LOG_CAP);
        log.drain(..excess);
    }

    fn take_failure(&self) -> bool {
        self.fail_next
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl OrderSubsystem for PaperOrderSubsystem {
    async fn submit(&self, intents: &[RebalanceIntent]) -> anyhow::Result<Vec<IntentReport>> {
        if self.take_failure() {
            anyhow::bail!("paper venue unavailable");
        }
        if !self.max_latency.is_zero() {
            let micros = u64::try_from(self.max_latency.as_micros()).unwrap_or(u64::MAX);
            let wait = rand::thread_rng().gen_range(0..=micros);
            tokio::time::sleep(Duration::from_micros(wait)).await;
        }

        self.record(intents);
        let rejected = self.rejected.lock().clone();
        let reports = intents
            .iter()
            .cloned()
            .map(|intent| {
                if rejected.contains(&intent.instrument) {
                    IntentReport::rejected(intent, "instrument not tradable")
                } else {
                    IntentReport::confirmed(intent)
                }
            })
            .collect();
        Ok(reports)
    }
}
