//! Infrastructure layer: job queue, worker loop, pipeline orchestration, adapters.
//!
//! - `jobs`: lease store seam, queue operations, heartbeat
//! - `workers`: the claim/run/report loop
//! - `ai`: async synthesis pipeline over pluggable collaborators
//! - `db`: Postgres implementations of the storage seams
//! - `external`: HTTP synthesis client
//! - `config`: explicit configuration structs, resolved once by the binary

pub mod ai;
pub mod config;
pub mod db;
pub mod external;
pub mod jobs;
pub mod workers;

#[cfg(test)]
mod integration_tests;
