// Scheduler engine and the loop that fires due triggers

pub mod engine;
mod run_loop;

pub use engine::{Scheduler, SchedulerConfig, SchedulerEngine, SchedulerMetadata, SchedulerStatus};
