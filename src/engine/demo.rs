//! Stand-in alpha engines.
//!
//! Real selection logic lives outside this crate; these exist so the binary
//! and tests have something to schedule.

use super::{AlphaEngine, TaskInput};
use crate::record::TargetRow;
use rand::seq::SliceRandom;
use rand::Rng;
use std::time::Duration;

/// Picks a random subset of a fixed universe and assigns normalised weights.
pub struct DemoAlpha {
    pub universe: Vec<String>,
    pub picks: usize,
    /// Artificial compute latency.
    pub delay: Duration,
}

impl DemoAlpha {
    pub fn new(universe: Vec<String>, picks: usize) -> Self {
        Self {
            universe,
            picks,
            delay: Duration::ZERO,
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

impl AlphaEngine for DemoAlpha {
    fn name(&self) -> &str {
        "demo"
    }

    fn compute(&self, _input: &TaskInput) -> anyhow::Result<Vec<TargetRow>> {
        if self.universe.is_empty() || self.picks == 0 {
            anyhow::bail!("demo universe is empty");
        }
        if !self.delay.is_zero() {
            std::thread::sleep(self.delay);
        }

        let mut rng = rand::thread_rng();
        let mut chosen: Vec<&String> = self
            .universe
            .choose_multiple(&mut rng, self.picks.min(self.universe.len()))
            .collect();
        chosen.sort();

        let raw: Vec<f64> = chosen.iter().map(|_| rng.gen_range(0.1..1.0)).collect();
        let total: f64 = raw.iter().sum();
        Ok(chosen
            .into_iter()
            .zip(raw)
            .map(|(id, w)| TargetRow::new(id.clone(), w / total))
            .collect())
    }
}

/// Always returns the same payload; used by the `publish` command to push an
/// externally computed target through the normal versioning path.
pub struct StaticAlpha(pub Vec<TargetRow>);

impl AlphaEngine for StaticAlpha {
    fn name(&self) -> &str {
        "static"
    }

    fn compute(&self, _input: &TaskInput) -> anyhow::Result<Vec<TargetRow>> {
        Ok(self.0.clone())
    }
}
