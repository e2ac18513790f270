// Injectable time source for the scheduler loop

use crate::errors::ClockError;
use chrono::{DateTime, Utc};

/// Clock provides the current instant to the scheduler loop.
///
/// A failing clock is fatal to the loop; see `SchedulerEngine::fatal_error`.
#[cfg_attr(test, mockall::automock)]
pub trait Clock: Send + Sync {
    fn now(&self) -> Result<DateTime<Utc>, ClockError>;
}

/// Wall-clock time from the operating system
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Result<DateTime<Utc>, ClockError> {
        Ok(Utc::now())
    }
}
