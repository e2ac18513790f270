// Scheduler core: trigger calculation, job store, scheduler loop and the ambient service stack

pub mod bootstrap;
pub mod clock;
pub mod config;
pub mod cron;
pub mod dispatcher;
pub mod errors;
pub mod job;
pub mod listener;
pub mod loader;
pub mod models;
pub mod schedule;
pub mod scheduler;
pub mod store;
pub mod telemetry;
