//! Durable job queue with leases, heartbeats and retry backoff.
//!
//! ## Design
//!
//! - Jobs live in a [`LeaseStore`]; every mutation is a conditional update
//! - A claim takes a lease (`locked_at`, `locked_by`) and counts an attempt
//! - Leases are kept fresh by a [`HeartbeatHandle`] while work runs
//! - Orphaned leases are swept back to PENDING after the stale threshold
//! - Failures retry with exponential backoff until `max_attempts`
//!
//! ## Components
//!
//! - `Job`: the durable record
//! - `LeaseStore`: storage seam (in-memory here, Postgres in `db`)
//! - `JobQueue`: claim/extend/complete/fail/release operations
//! - `HeartbeatHandle`: per-claim lease extender

pub mod heartbeat;
pub mod queue;
pub mod store;
pub mod types;

pub use heartbeat::{HeartbeatHandle, HeartbeatReport};
pub use queue::{FailDisposition, JobQueue, QueueError};
pub use store::{
    InMemoryLeaseStore, JobOrder, JobPredicate, JobUpdate, LeaseStore, LeaseStoreError, LockChange,
};
pub use types::{Job, JobParams, JobStats, JobStatus, Lease, RetryPolicy};
