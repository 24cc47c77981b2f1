//! Signal synchronisation between a slow alpha engine and a latency-sensitive
//! execution gateway.
//!
//! The alpha engine publishes immutable, versioned [`SignalRecord`]s to a
//! [`DataBus`]. The gateway probes the bus head on every tick, applies each new
//! version at most once, and never waits on a computation. The watermark in
//! [`ExecutionState`] only moves forward.

pub mod audit;
pub mod bus;
pub mod config;
pub mod detector;
pub mod engine;
pub mod execution;
pub mod gateway;
pub mod metrics;
pub mod record;
pub mod scheduler;
pub mod state;
pub mod types;

pub use crate::bus::{BusHead, DataBus, FileBus, MemoryBus};
pub use crate::detector::{ChangeDetector, Poll};
pub use crate::engine::{AlphaEngine, AlphaRunner, TaskInput};
pub use crate::gateway::{CycleOutcome, ExecutionGateway, GatewayConfig, GatewayState};
pub use crate::record::{SignalRecord, TargetRow};
pub use crate::scheduler::{Scheduler, SchedulerConfig, ShutdownHandle};
pub use crate::state::{ExecutionState, StateStore};
