use super::{BusError, BusHead, DataBus};
use crate::record::SignalRecord;
use crate::types::Version;
use parking_lot::RwLock;
use std::collections::VecDeque;
use std::sync::Arc;

#[derive(Default)]
struct Slots {
    latest: Option<Arc<SignalRecord>>,
    history: VecDeque<Arc<SignalRecord>>,
}

/// In-process bus for tests and single-binary deployments.
///
/// The latest record is swapped under a write lock, which gives the same
/// all-or-nothing visibility as the file bus rename.
#[derive(Default)]
pub struct MemoryBus {
    slots: RwLock<Slots>,
    history_depth: usize,
}

impl MemoryBus {
    pub fn new(history_depth: usize) -> Self {
        Self {
            slots: RwLock::new(Slots::default()),
            history_depth,
        }
    }
}

impl DataBus for MemoryBus {
    fn publish(&self, record: &SignalRecord) -> Result<(), BusError> {
        let mut slots = self.slots.write();
        if let Some(current) = &slots.latest {
            if record.version <= current.version {
                return Err(BusError::StaleVersion {
                    attempted: record.version,
                    current: current.version,
                });
            }
        }
        if let Some(previous) = slots.latest.replace(Arc::new(record.clone())) {
            if self.history_depth > 0 {
                slots.history.push_back(previous);
                while slots.history.len() > self.history_depth {
                    slots.history.pop_front();
                }
            }
        }
        Ok(())
    }

    fn read_latest(&self) -> Result<Option<SignalRecord>, BusError> {
        Ok(self.slots.read().latest.as_deref().cloned())
    }

    fn peek_head(&self) -> Result<Option<BusHead>, BusError> {
        Ok(self.slots.read().latest.as_deref().map(BusHead::of))
    }

    fn read_version(&self, version: Version) -> Result<Option<SignalRecord>, BusError> {
        let slots = self.slots.read();
        let found = slots
            .latest
            .iter()
            .chain(slots.history.iter())
            .find(|record| record.version == version)
            .map(|record| (**record).clone());
        Ok(found)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::TargetRow;
    use chrono::Utc;

    #[test]
    fn swaps_latest_and_retains_history() {
        let bus = MemoryBus::new(1);
        assert!(bus.read_latest().unwrap().is_none());
        for v in 1..=3 {
            let rec = SignalRecord::new(Version(v), Utc::now(), vec![TargetRow::new("AAA", 1.0)]);
            bus.publish(&rec).unwrap();
        }
        assert_eq!(bus.peek_version().unwrap(), Some(Version(3)));
        assert!(bus.read_version(Version(2)).unwrap().is_some());
        assert!(bus.read_version(Version(1)).unwrap().is_none());

        let stale = SignalRecord::new(Version(3), Utc::now(), vec![TargetRow::new("BBB", 1.0)]);
        assert!(matches!(bus.publish(&stale), Err(BusError::StaleVersion { .. })));
    }
}
