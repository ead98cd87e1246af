//! Durable, at-least-once background job queue.
//!
//! ## Design
//!
//! - Producers enqueue jobs through [`JobQueue`]; the record is durable before
//!   `enqueue` returns
//! - A single [`Dispatcher`] polls the store on a fixed interval and runs a
//!   bounded batch per tick, oldest first
//! - Handlers are looked up by queue name in a [`HandlerRegistry`] built at
//!   startup
//! - Failed attempts are retried until `max_attempts`, then the job is
//!   `failed` with the handler's error text
//! - Claims are compare-and-swap transitions in the store, so a job is never
//!   executed by two dispatchers for the same attempt
//!
//! ## Components
//!
//! - `JobRecord` / `JobStatus`: the persisted unit of work and its state machine
//! - `JobStore`: persistence (`InMemoryJobStore`, `SqliteJobStore`)
//! - `HandlerRegistry`: queue name to handler
//! - `Dispatcher`: tick loop, retry policy, timeouts, stale-claim recovery
//! - `JobQueue`: the enqueue API
//! - `JobsConfig`: configuration with environment overrides

pub mod config;
pub mod dispatcher;
pub mod queue;
pub mod registry;
pub mod sqlite;
pub mod store;
pub mod types;

pub use config::{BackoffConfig, ConfigError, JobsConfig};
pub use dispatcher::{
    Dispatcher, DispatcherConfig, DispatcherHandle, DispatcherStats, JobOutcome, TickReport,
    UnroutablePolicy,
};
pub use formjobs_core::{JobId, QueueName};
pub use queue::{EnqueueError, EnqueueOptions, JobQueue};
pub use registry::{HandlerRegistry, JobContext, JobHandler};
pub use sqlite::SqliteJobStore;
pub use store::{InMemoryJobStore, JobStore, JobStoreError, STALE_FINAL_ATTEMPT};
pub use types::{
    BackoffPolicy, BackoffStrategy, DEFAULT_MAX_ATTEMPTS, JobFilter, JobRecord, JobStats,
    JobStatus, NewJob, Payload,
};
