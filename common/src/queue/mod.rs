// Queue engine adapter
//
// `engine` defines the contract of the external queue engine, `memory`
// implements it in-process and `adapter` is what the rest of the crate
// talks to.

pub mod adapter;
pub mod engine;
pub mod memory;

pub use adapter::{EventHandler, JobHandler, QueueAdapter, QueueHandle};
pub use engine::{
    EngineEvent, EngineJob, JobOptions, NewJob, QueueCounts, QueueDefinition, QueueEngine,
    RepeatOptions, Retention,
};
pub use memory::MemoryQueueEngine;
