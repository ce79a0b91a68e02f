//! Background loop plumbing shared by job workers and broker consumers.

pub mod consume_worker;
pub mod handle;

pub use consume_worker::{ConsumeWorker, ConsumeWorkerConfig, MessageHandler};
pub use handle::{WorkerHandle, shutdown_all};
