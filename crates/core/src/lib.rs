//! `opforge-core`: shared building blocks.
//!
//! Identifiers, the domain error model and the clock seam used by the job
//! engine and the synthesis pipeline. No I/O lives here.

pub mod clock;
pub mod error;
pub mod id;

pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{DomainError, DomainResult};
pub use id::{JobId, ResultRef, TargetId, WorkerId};
