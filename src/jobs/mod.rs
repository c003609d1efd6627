//! Job lifecycle: durable records, the bounded work queue, and the worker pool.

pub mod model;
pub mod queue;
pub mod store;

pub use model::{Job, JobStore, Stage, WorkItem};
pub use queue::{JobProcessor, Queue};
pub use store::SqliteJobStore;
