//! Engine job workers and the local job tracking store.
//!
//! ## Components
//!
//! - `JobWorker`: per-type poll loop with bounded concurrency and per-job timeout
//! - `JobHandler`: the work done for one job
//! - `JobClient`: completion/failure callback shared by handlers and the HTTP surface
//! - `JobTrackingStore`: snapshot queries over jobs held by this process

pub mod store;
pub mod types;
pub mod worker;

pub use store::{InMemoryJobTrackingStore, JobTrackingStore};
pub use types::{ActiveJob, JobWorkerConfig, TrackedStatus};
pub use worker::{JobClient, JobHandler, JobWorker};
