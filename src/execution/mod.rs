//! Pipeline execution engine

pub mod engine;
pub mod events;
pub mod executor;
pub mod scheduler;

pub use engine::ExecutionEngine;
pub use events::{EventEmitter, EventHandler, ExecutionEvent};
pub use executor::{JobExecutor, JobOutcome, RunSettings};
pub use scheduler::{ExecutionScheduler, SchedulingStrategy};
