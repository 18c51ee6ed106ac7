//! Background workers.

pub mod job_worker;

pub use job_worker::{JobDisposition, JobWorker, RunMode, ShutdownSignal, WorkerConfig, WorkerStats};
