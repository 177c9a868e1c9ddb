//! Watch-driven aggregation
//!
//! The [`WatchSupervisor`] keeps one [`EventProcessor`] consumer alive per
//! connected cluster; the consumers feed the shared cache, ledger and label
//! index held in [`crate::services::AggregationServices`].

mod processor;
mod supervisor;


pub use processor::EventProcessor;
pub use supervisor::{SupervisorConfig, TickSummary, WatchSupervisor, WatchSupervisorBuilder};
