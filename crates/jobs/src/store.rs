//! Job storage abstraction and the in-memory implementation.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use formjobs_core::JobId;

use super::types::{JobFilter, JobRecord, JobStats, JobStatus, NewJob};

/// Durable storage for job records.
///
/// The store owns persistence and visibility of records. Every status
/// transition is a conditional update: it only lands when the stored record is
/// in the expected source status, and otherwise returns
/// [`JobStoreError::Conflict`] (or [`JobStoreError::NotFound`]). That makes
/// `mark_processing` a compare-and-swap claim, so two dispatchers racing for
/// the same job cannot both execute it.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Insert a new `pending` job. Never validates queue or payload contents.
    async fn enqueue(&self, job: NewJob) -> Result<JobRecord, JobStoreError>;

    /// Get a job by ID.
    async fn get(&self, id: JobId) -> Result<Option<JobRecord>, JobStoreError>;

    /// Up to `limit` eligible pending jobs, oldest `created_at` first across
    /// all queues. Read-only.
    ///
    /// Pending jobs that already used their whole attempt budget can never be
    /// claimed and are left out.
    async fn fetch_pending_batch(&self, limit: usize) -> Result<Vec<JobRecord>, JobStoreError>;

    /// Claim a pending job: `pending -> processing`, storing `attempts`.
    ///
    /// Succeeds only if the stored record is `pending` with
    /// `attempts - 1` attempts recorded and `attempts <= max_attempts`.
    async fn mark_processing(&self, id: JobId, attempts: u32) -> Result<(), JobStoreError>;

    /// `processing -> completed`.
    ///
    /// The settle operations only land on the claim that recorded `attempt`;
    /// a claim that was recovered and re-claimed in the meantime conflicts.
    async fn mark_completed(
        &self,
        id: JobId,
        attempt: u32,
        processed_at: DateTime<Utc>,
    ) -> Result<(), JobStoreError>;

    /// `processing -> pending`, keeping the incremented attempt count.
    async fn mark_failed_retryable(
        &self,
        id: JobId,
        attempt: u32,
        processed_at: DateTime<Utc>,
        next_eligible_at: Option<DateTime<Utc>>,
    ) -> Result<(), JobStoreError>;

    /// `processing -> failed`, persisting the handler error.
    async fn mark_failed_terminal(
        &self,
        id: JobId,
        attempt: u32,
        processed_at: DateTime<Utc>,
        error: &str,
    ) -> Result<(), JobStoreError>;

    /// List jobs matching a filter, oldest first.
    async fn list(&self, filter: &JobFilter) -> Result<Vec<JobRecord>, JobStoreError>;

    /// Count jobs per status, optionally for one queue.
    async fn stats(&self, queue: Option<&str>) -> Result<JobStats, JobStoreError>;

    /// Manual recovery: `failed -> pending` with a fresh attempt budget.
    async fn requeue(&self, id: JobId) -> Result<JobRecord, JobStoreError>;

    /// Return `processing` jobs claimed before `claimed_before` to `pending`.
    /// The interrupted attempt stays counted; a job whose interrupted attempt
    /// was its last is failed with [`STALE_FINAL_ATTEMPT`] instead.
    async fn recover_stale(&self, claimed_before: DateTime<Utc>) -> Result<u64, JobStoreError>;
}

/// Error recorded on a job whose claim expired during its final attempt.
pub const STALE_FINAL_ATTEMPT: &str = "claim expired during final attempt";

/// Job store error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum JobStoreError {
    #[error("job not found: {0}")]
    NotFound(JobId),
    #[error("job {id} cannot transition: {reason}")]
    Conflict { id: JobId, reason: String },
    #[error("job already exists: {0}")]
    AlreadyExists(JobId),
    #[error("storage error: {0}")]
    Storage(String),
    #[error("corrupt job row: {0}")]
    Corrupt(String),
}

impl JobStoreError {
    pub fn conflict(id: JobId, reason: impl Into<String>) -> Self {
        Self::Conflict {
            id,
            reason: reason.into(),
        }
    }

    /// Lost a race or the record moved on; the caller should skip the job.
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }
}

#[async_trait]
impl<S> JobStore for Arc<S>
where
    S: JobStore + ?Sized,
{
    async fn enqueue(&self, job: NewJob) -> Result<JobRecord, JobStoreError> {
        (**self).enqueue(job).await
    }

    async fn get(&self, id: JobId) -> Result<Option<JobRecord>, JobStoreError> {
        (**self).get(id).await
    }

    async fn fetch_pending_batch(&self, limit: usize) -> Result<Vec<JobRecord>, JobStoreError> {
        (**self).fetch_pending_batch(limit).await
    }

    async fn mark_processing(&self, id: JobId, attempts: u32) -> Result<(), JobStoreError> {
        (**self).mark_processing(id, attempts).await
    }

    async fn mark_completed(
        &self,
        id: JobId,
        attempt: u32,
        processed_at: DateTime<Utc>,
    ) -> Result<(), JobStoreError> {
        (**self).mark_completed(id, attempt, processed_at).await
    }

    async fn mark_failed_retryable(
        &self,
        id: JobId,
        attempt: u32,
        processed_at: DateTime<Utc>,
        next_eligible_at: Option<DateTime<Utc>>,
    ) -> Result<(), JobStoreError> {
        (**self)
            .mark_failed_retryable(id, attempt, processed_at, next_eligible_at)
            .await
    }

    async fn mark_failed_terminal(
        &self,
        id: JobId,
        attempt: u32,
        processed_at: DateTime<Utc>,
        error: &str,
    ) -> Result<(), JobStoreError> {
        (**self)
            .mark_failed_terminal(id, attempt, processed_at, error)
            .await
    }

    async fn list(&self, filter: &JobFilter) -> Result<Vec<JobRecord>, JobStoreError> {
        (**self).list(filter).await
    }

    async fn stats(&self, queue: Option<&str>) -> Result<JobStats, JobStoreError> {
        (**self).stats(queue).await
    }

    async fn requeue(&self, id: JobId) -> Result<JobRecord, JobStoreError> {
        (**self).requeue(id).await
    }

    async fn recover_stale(&self, claimed_before: DateTime<Utc>) -> Result<u64, JobStoreError> {
        (**self).recover_stale(claimed_before).await
    }
}

#[derive(Debug)]
struct Slot {
    /// Insertion order; breaks `created_at` ties.
    seq: u64,
    record: JobRecord,
}

#[derive(Debug, Default)]
struct Inner {
    jobs: HashMap<JobId, Slot>,
    next_seq: u64,
}

/// In-memory job store for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryJobStore {
    inner: RwLock<Inner>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    fn read(&self) -> Result<std::sync::RwLockReadGuard<'_, Inner>, JobStoreError> {
        self.inner
            .read()
            .map_err(|_| JobStoreError::Storage("lock poisoned".to_string()))
    }

    fn write(&self) -> Result<std::sync::RwLockWriteGuard<'_, Inner>, JobStoreError> {
        self.inner
            .write()
            .map_err(|_| JobStoreError::Storage("lock poisoned".to_string()))
    }

    /// Apply `apply` to the record if it is currently in `from` and the state
    /// machine allows `from -> to`.
    fn transition<F>(
        &self,
        id: JobId,
        from: JobStatus,
        to: JobStatus,
        apply: F,
    ) -> Result<JobRecord, JobStoreError>
    where
        F: FnOnce(&mut JobRecord) -> Result<(), JobStoreError>,
    {
        let mut inner = self.write()?;
        let slot = inner.jobs.get_mut(&id).ok_or(JobStoreError::NotFound(id))?;
        let record = &mut slot.record;

        if record.status != from || !from.can_transition_to(to) {
            return Err(JobStoreError::conflict(
                id,
                format!("expected {from}, found {}", record.status),
            ));
        }

        apply(record)?;
        record.status = to;
        Ok(record.clone())
    }

    fn sorted<'a>(slots: impl Iterator<Item = &'a Slot>) -> Vec<&'a Slot> {
        let mut slots: Vec<_> = slots.collect();
        slots.sort_by_key(|s| (s.record.created_at, s.seq));
        slots
    }
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn enqueue(&self, job: NewJob) -> Result<JobRecord, JobStoreError> {
        let mut inner = self.write()?;
        let id = JobId::new();
        if inner.jobs.contains_key(&id) {
            return Err(JobStoreError::AlreadyExists(id));
        }

        let record = job.into_record(id, Utc::now());
        let seq = inner.next_seq;
        inner.next_seq += 1;
        inner.jobs.insert(
            id,
            Slot {
                seq,
                record: record.clone(),
            },
        );
        Ok(record)
    }

    async fn get(&self, id: JobId) -> Result<Option<JobRecord>, JobStoreError> {
        Ok(self.read()?.jobs.get(&id).map(|s| s.record.clone()))
    }

    async fn fetch_pending_batch(&self, limit: usize) -> Result<Vec<JobRecord>, JobStoreError> {
        let inner = self.read()?;
        let now = Utc::now();

        Ok(
            Self::sorted(inner.jobs.values().filter(|s| s.record.is_eligible(now)))
                .into_iter()
                .take(limit)
                .map(|s| s.record.clone())
                .collect(),
        )
    }

    async fn mark_processing(&self, id: JobId, attempts: u32) -> Result<(), JobStoreError> {
        self.transition(id, JobStatus::Pending, JobStatus::Processing, |job| {
            if attempts == 0 || job.attempts != attempts - 1 {
                return Err(JobStoreError::conflict(
                    id,
                    format!("stale attempt count: stored {}, claimed {attempts}", job.attempts),
                ));
            }
            if attempts > job.max_attempts {
                return Err(JobStoreError::conflict(
                    id,
                    format!("attempt {attempts} exceeds max_attempts {}", job.max_attempts),
                ));
            }
            job.attempts = attempts;
            job.claimed_at = Some(Utc::now());
            Ok(())
        })
        .map(|_| ())
    }

    async fn mark_completed(
        &self,
        id: JobId,
        attempt: u32,
        processed_at: DateTime<Utc>,
    ) -> Result<(), JobStoreError> {
        self.transition(id, JobStatus::Processing, JobStatus::Completed, |job| {
            check_claim(job, attempt)?;
            job.processed_at = Some(processed_at);
            job.claimed_at = None;
            job.error = None;
            Ok(())
        })
        .map(|_| ())
    }

    async fn mark_failed_retryable(
        &self,
        id: JobId,
        attempt: u32,
        processed_at: DateTime<Utc>,
        next_eligible_at: Option<DateTime<Utc>>,
    ) -> Result<(), JobStoreError> {
        self.transition(id, JobStatus::Processing, JobStatus::Pending, |job| {
            check_claim(job, attempt)?;
            job.processed_at = Some(processed_at);
            job.next_eligible_at = next_eligible_at;
            job.claimed_at = None;
            job.error = None;
            Ok(())
        })
        .map(|_| ())
    }

    async fn mark_failed_terminal(
        &self,
        id: JobId,
        attempt: u32,
        processed_at: DateTime<Utc>,
        error: &str,
    ) -> Result<(), JobStoreError> {
        self.transition(id, JobStatus::Processing, JobStatus::Failed, |job| {
            check_claim(job, attempt)?;
            job.processed_at = Some(processed_at);
            job.claimed_at = None;
            job.error = Some(error.to_string());
            Ok(())
        })
        .map(|_| ())
    }

    async fn list(&self, filter: &JobFilter) -> Result<Vec<JobRecord>, JobStoreError> {
        let inner = self.read()?;
        Ok(
            Self::sorted(inner.jobs.values().filter(|s| filter.matches(&s.record)))
                .into_iter()
                .take(filter.limit)
                .map(|s| s.record.clone())
                .collect(),
        )
    }

    async fn stats(&self, queue: Option<&str>) -> Result<JobStats, JobStoreError> {
        let inner = self.read()?;
        let mut stats = JobStats::default();
        for slot in inner.jobs.values() {
            if queue.is_none_or(|q| slot.record.queue == q) {
                stats.record(slot.record.status, 1);
            }
        }
        Ok(stats)
    }

    async fn requeue(&self, id: JobId) -> Result<JobRecord, JobStoreError> {
        self.transition(id, JobStatus::Failed, JobStatus::Pending, |job| {
            job.attempts = 0;
            job.error = None;
            job.next_eligible_at = None;
            job.claimed_at = None;
            Ok(())
        })
    }

    async fn recover_stale(&self, claimed_before: DateTime<Utc>) -> Result<u64, JobStoreError> {
        let mut inner = self.write()?;
        let mut recovered = 0;
        for slot in inner.jobs.values_mut() {
            let job = &mut slot.record;
            let stale = job.status == JobStatus::Processing
                && job.claimed_at.is_none_or(|at| at < claimed_before);
            if !stale {
                continue;
            }
            if job.attempts >= job.max_attempts {
                job.status = JobStatus::Failed;
                job.processed_at = Some(Utc::now());
                job.error = Some(STALE_FINAL_ATTEMPT.to_string());
            } else {
                job.status = JobStatus::Pending;
                job.next_eligible_at = None;
            }
            job.claimed_at = None;
            recovered += 1;
        }
        Ok(recovered)
    }
}

/// The processing record must still carry the claim made for `attempt`.
fn check_claim(job: &JobRecord, attempt: u32) -> Result<(), JobStoreError> {
    if job.attempts != attempt {
        return Err(JobStoreError::conflict(
            job.id,
            format!("claim for attempt {attempt} superseded by attempt {}", job.attempts),
        ));
    }
    Ok(())
}
