//! Process-local counters and the gateway cycle latency histogram.

use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::time::Duration;

pub mod stats;

pub use stats::{Histo, LatencySummary};

pub mod counters {
    pub const POLLS: &str = "polls";
    pub const NO_CHANGE: &str = "no_change";
    pub const APPLIED: &str = "applied";
    pub const PARTIAL: &str = "partially_applied";
    pub const DISCARDED: &str = "discarded";
    pub const DETECT_ERRORS: &str = "detect_errors";
    pub const APPLY_FAILURES: &str = "apply_failures";
    pub const BLOCKED: &str = "blocked";
    pub const BUSY: &str = "busy";
    pub const PUBLISHED: &str = "published";
    pub const COALESCED: &str = "coalesced";
    pub const COMPUTATION_FAILURES: &str = "computation_failures";
    pub const STALE_ALERTS: &str = "stale_alerts";
}

#[derive(Default)]
pub struct SyncMetrics {
    counters: DashMap<&'static str, u64>,
    cycle_latency_us: Mutex<Histo>,
}

impl SyncMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn incr(&self, name: &'static str) {
        *self.counters.entry(name).or_insert(0) += 1;
    }

    pub fn counter(&self, name: &str) -> u64 {
        self.counters.get(name).map(|v| *v).unwrap_or(0)
    }

    pub fn record_cycle(&self, elapsed: Duration) {
        let micros = u64::try_from(elapsed.as_micros()).unwrap_or(u64::MAX);
        self.cycle_latency_us.lock().record(micros);
    }

    pub fn cycle_latency(&self) -> LatencySummary {
        LatencySummary::from(&*self.cycle_latency_us.lock())
    }

    pub fn snapshot_kv(&self) -> BTreeMap<String, String> {
        let mut kv: BTreeMap<String, String> = self
            .counters
            .iter()
            .map(|entry| (format!("counter|{}", entry.key()), entry.value().to_string()))
            .collect();
        let latency = self.cycle_latency();
        kv.insert("cycle_us|count".into(), latency.count.to_string());
        kv.insert("cycle_us|p50".into(), latency.p50_us.to_string());
        kv.insert("cycle_us|p99".into(), latency.p99_us.to_string());
        kv.insert("cycle_us|max".into(), latency.max_us.to_string());
        kv
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts_and_summarises() {
        let metrics = SyncMetrics::new();
        metrics.incr(counters::POLLS);
        metrics.incr(counters::POLLS);
        metrics.record_cycle(Duration::from_micros(40));
        metrics.record_cycle(Duration::from_micros(900));

        assert_eq!(metrics.counter(counters::POLLS), 2);
        assert_eq!(metrics.counter(counters::APPLIED), 0);
        let kv = metrics.snapshot_kv();
        assert_eq!(kv["counter|polls"], "2");
        assert_eq!(kv["cycle_us|count"], "2");
        assert!(metrics.cycle_latency().max_us >= 900);
    }
}
