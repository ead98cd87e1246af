//! `formjobs-core`: primitives shared by the job subsystem.
//!
//! Nothing in here performs I/O.

pub mod error;
pub mod id;
pub mod queue;

pub use error::{DomainError, DomainResult};
pub use id::JobId;
pub use queue::QueueName;
