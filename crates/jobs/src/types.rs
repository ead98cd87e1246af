//! Core job types: the persisted record, its state machine, and retry backoff.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use formjobs_core::JobId;

/// Job payload: a JSON object, opaque to everything but the handler.
pub type Payload = serde_json::Map<String, serde_json::Value>;

/// Attempt budget applied when the producer does not pick one.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Job execution status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Queued, waiting for a dispatch tick
    Pending,
    /// Claimed by a dispatcher, handler running
    Processing,
    /// Handler succeeded
    Completed,
    /// Attempts exhausted
    Failed,
}

impl JobStatus {
    pub const ALL: [JobStatus; 4] = [
        JobStatus::Pending,
        JobStatus::Processing,
        JobStatus::Completed,
        JobStatus::Failed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Processing => "processing",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }

    /// No automatic transition leaves a terminal status.
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }

    /// The legal edges of the job state machine.
    ///
    /// `failed -> pending` is only taken by a manual requeue; the dispatcher
    /// never leaves a terminal status on its own.
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        use JobStatus::*;
        matches!(
            (self, next),
            (Pending, Processing)
                | (Processing, Completed)
                | (Processing, Pending)
                | (Processing, Failed)
                | (Failed, Pending)
        )
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(JobStatus::Pending),
            "processing" => Ok(JobStatus::Processing),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            other => Err(format!("unknown job status '{other}'")),
        }
    }
}

/// A persisted unit of work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: JobId,
    /// Names the handler to invoke
    pub queue: String,
    pub payload: Payload,
    /// Execution attempts so far (starts at 0)
    pub attempts: u32,
    pub max_attempts: u32,
    pub status: JobStatus,
    /// Handler error, only present once the job is `failed`
    pub error: Option<String>,
    /// Immutable; the dispatch ordering key
    pub created_at: DateTime<Utc>,
    /// Set after every execution attempt
    pub processed_at: Option<DateTime<Utc>>,
    /// Earliest time a retried job may be fetched again (backoff)
    pub next_eligible_at: Option<DateTime<Utc>>,
    /// When the current `processing` claim was taken
    pub claimed_at: Option<DateTime<Utc>>,
}

impl JobRecord {
    /// The attempt number the next execution would carry.
    pub fn next_attempt(&self) -> u32 {
        self.attempts.saturating_add(1)
    }

    /// Whether a failure on `attempt` should end the job.
    pub fn is_final_attempt(&self, attempt: u32) -> bool {
        attempt >= self.max_attempts
    }

    /// Pending, past any backoff delay, and with an attempt left to claim.
    pub fn is_eligible(&self, now: DateTime<Utc>) -> bool {
        self.status == JobStatus::Pending
            && self.attempts < self.max_attempts
            && self.next_eligible_at.is_none_or(|at| at <= now)
    }
}

/// Input for inserting a job into a store.
///
/// Stores persist this as-is; validation of the queue name happens in
/// [`crate::JobQueue`].
#[derive(Debug, Clone, PartialEq)]
pub struct NewJob {
    pub queue: String,
    pub payload: Payload,
    pub max_attempts: u32,
    /// Attempts already consumed, normally 0. Non-zero values are used when
    /// importing jobs from another system; a job imported with no attempts
    /// left is never dispatched.
    pub attempts: u32,
}

impl NewJob {
    pub fn new(queue: impl Into<String>, payload: Payload) -> Self {
        Self {
            queue: queue.into(),
            payload,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            attempts: 0,
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn with_attempts(mut self, attempts: u32) -> Self {
        self.attempts = attempts;
        self
    }

    /// Materialize the pending record a store will persist.
    pub fn into_record(self, id: JobId, created_at: DateTime<Utc>) -> JobRecord {
        JobRecord {
            id,
            queue: self.queue,
            payload: self.payload,
            attempts: self.attempts,
            max_attempts: self.max_attempts,
            status: JobStatus::Pending,
            error: None,
            created_at,
            processed_at: None,
            next_eligible_at: None,
            claimed_at: None,
        }
    }
}

/// Filter for operational inspection of jobs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobFilter {
    pub queue: Option<String>,
    pub status: Option<JobStatus>,
    pub limit: usize,
}

impl Default for JobFilter {
    fn default() -> Self {
        Self {
            queue: None,
            status: None,
            limit: 100,
        }
    }
}

impl JobFilter {
    pub fn queue(mut self, queue: impl Into<String>) -> Self {
        self.queue = Some(queue.into());
        self
    }

    pub fn status(mut self, status: JobStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = limit;
        self
    }

    pub fn matches(&self, job: &JobRecord) -> bool {
        self.queue.as_deref().is_none_or(|q| job.queue == q)
            && self.status.is_none_or(|s| job.status == s)
    }
}

/// Job counts per status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct JobStats {
    pub pending: u64,
    pub processing: u64,
    pub completed: u64,
    pub failed: u64,
}

impl JobStats {
    pub fn record(&mut self, status: JobStatus, count: u64) {
        match status {
            JobStatus::Pending => self.pending += count,
            JobStatus::Processing => self.processing += count,
            JobStatus::Completed => self.completed += count,
            JobStatus::Failed => self.failed += count,
        }
    }

    pub fn total(&self) -> u64 {
        self.pending + self.processing + self.completed + self.failed
    }
}

/// Backoff strategy for retries.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// Eligible again on the next tick
    #[default]
    Immediate,
    /// Fixed delay between retries
    Fixed,
    /// Linear backoff: base * attempt
    Linear,
    /// Exponential backoff: base * 2^(attempt - 1)
    Exponential,
}

/// Delay applied before a transiently failed job becomes eligible again.
#[derive(Debug, Clone, PartialEq)]
pub struct BackoffPolicy {
    pub strategy: BackoffStrategy,
    pub base_delay: Duration,
    /// Maximum delay cap
    pub max_delay: Duration,
    /// Jitter factor (0.0-1.0)
    pub jitter: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::immediate()
    }
}

impl BackoffPolicy {
    /// No delay: the job is re-fetched on the next tick.
    pub fn immediate() -> Self {
        Self {
            strategy: BackoffStrategy::Immediate,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            jitter: 0.0,
        }
    }

    pub fn fixed(delay: Duration) -> Self {
        Self {
            strategy: BackoffStrategy::Fixed,
            base_delay: delay,
            max_delay: delay,
            jitter: 0.0,
        }
    }

    pub fn linear(base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            strategy: BackoffStrategy::Linear,
            base_delay,
            max_delay,
            jitter: 0.0,
        }
    }

    pub fn exponential(base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            strategy: BackoffStrategy::Exponential,
            base_delay,
            max_delay,
            jitter: 0.1,
        }
    }

    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.clamp(0.0, 1.0);
        self
    }

    /// Delay after the failed attempt number `attempt` (1-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 || self.strategy == BackoffStrategy::Immediate {
            return Duration::ZERO;
        }

        let base_ms = self.base_delay.as_millis() as f64;
        let max_ms = self.max_delay.as_millis() as f64;

        let delay_ms = match self.strategy {
            BackoffStrategy::Immediate => 0.0,
            BackoffStrategy::Fixed => base_ms,
            BackoffStrategy::Linear => (base_ms * f64::from(attempt)).min(max_ms),
            BackoffStrategy::Exponential => {
                let exp = 2_f64.powi(attempt.saturating_sub(1).min(62) as i32);
                (base_ms * exp).min(max_ms)
            }
        };

        // Deterministic spread keyed on the attempt number.
        let jitter_range = delay_ms * self.jitter;
        let jitter = if jitter_range > 0.0 {
            let pseudo_random = ((f64::from(attempt) * 17.0) % 100.0) / 100.0;
            jitter_range * (pseudo_random - 0.5) * 2.0
        } else {
            0.0
        };

        Duration::from_millis((delay_ms + jitter).max(0.0) as u64)
    }

    /// When a job that just failed `attempt` may run again; `None` means now.
    pub fn next_eligible_at(&self, now: DateTime<Utc>, attempt: u32) -> Option<DateTime<Utc>> {
        let delay = self.delay_for_attempt(attempt);
        if delay.is_zero() {
            return None;
        }
        chrono::Duration::from_std(delay)
            .ok()
            .and_then(|d| now.checked_add_signed(d))
    }
}
