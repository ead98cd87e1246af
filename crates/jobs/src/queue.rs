//! Producer-facing enqueue API.
//!
//! Request handlers and other producers create jobs through [`JobQueue`]. It
//! validates what the store deliberately does not (queue name, attempt
//! budget, payload shape) and returns as soon as the record is durable; the
//! job's outcome is observed later through the store.

use serde::Serialize;
use thiserror::Error;
use tracing::info;

use formjobs_core::{DomainError, QueueName};

use super::store::{JobStore, JobStoreError};
use super::types::{DEFAULT_MAX_ATTEMPTS, JobRecord, NewJob, Payload};

/// Enqueue failure. No job was created.
#[derive(Debug, Error)]
pub enum EnqueueError {
    #[error("invalid queue name: {0}")]
    InvalidQueue(#[from] DomainError),
    #[error("max_attempts must be at least 1, got {0}")]
    InvalidMaxAttempts(u32),
    #[error("invalid payload: {0}")]
    Payload(String),
    #[error(transparent)]
    Store(#[from] JobStoreError),
}

/// Per-job overrides.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EnqueueOptions {
    pub max_attempts: Option<u32>,
}

impl EnqueueOptions {
    pub fn max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }
}

/// Write path for new jobs.
#[derive(Debug, Clone)]
pub struct JobQueue<S: JobStore> {
    store: S,
    default_max_attempts: u32,
}

impl<S: JobStore> JobQueue<S> {
    pub fn new(store: S) -> Self {
        Self {
            store,
            default_max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }

    pub fn with_default_max_attempts(mut self, max_attempts: u32) -> Self {
        self.default_max_attempts = max_attempts;
        self
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Enqueue a job with the default attempt budget.
    pub async fn enqueue(&self, queue: &str, payload: Payload) -> Result<JobRecord, EnqueueError> {
        self.enqueue_with(queue, payload, EnqueueOptions::default())
            .await
    }

    pub async fn enqueue_with(
        &self,
        queue: &str,
        payload: Payload,
        options: EnqueueOptions,
    ) -> Result<JobRecord, EnqueueError> {
        let queue = QueueName::new(queue)?;
        let max_attempts = options.max_attempts.unwrap_or(self.default_max_attempts);
        if max_attempts == 0 {
            return Err(EnqueueError::InvalidMaxAttempts(max_attempts));
        }

        let job = self
            .store
            .enqueue(NewJob::new(queue.into_inner(), payload).with_max_attempts(max_attempts))
            .await?;

        info!(
            job_id = %job.id,
            queue = %job.queue,
            max_attempts = job.max_attempts,
            "job enqueued"
        );
        Ok(job)
    }

    /// Serialize `value` into the payload. It must serialize to a JSON object.
    pub async fn enqueue_json<T>(&self, queue: &str, value: &T) -> Result<JobRecord, EnqueueError>
    where
        T: Serialize + ?Sized,
    {
        let payload = match serde_json::to_value(value) {
            Ok(serde_json::Value::Object(map)) => map,
            Ok(other) => {
                return Err(EnqueueError::Payload(format!(
                    "expected a JSON object, got {}",
                    json_kind(&other)
                )));
            }
            Err(e) => return Err(EnqueueError::Payload(e.to_string())),
        };

        self.enqueue(queue, payload).await
    }
}

fn json_kind(value: &serde_json::Value) -> &'static str {
    match value {
        serde_json::Value::Null => "null",
        serde_json::Value::Bool(_) => "a boolean",
        serde_json::Value::Number(_) => "a number",
        serde_json::Value::String(_) => "a string",
        serde_json::Value::Array(_) => "an array",
        serde_json::Value::Object(_) => "an object",
    }
}
