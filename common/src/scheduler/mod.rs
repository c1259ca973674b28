// Scheduler: cron and one-shot schedules armed on the queue engine, each
// fire performing an HTTP call with its own retry policy.

pub mod engine;
pub mod executor;

pub use engine::{Scheduler, SchedulerEngine};
pub use executor::ScheduleExecutor;
