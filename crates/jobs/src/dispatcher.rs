//! Polling dispatcher: claims pending jobs, runs their handlers, and records
//! the outcome with the retry policy.
//!
//! Each tick:
//! 1. returns stale `processing` claims to `pending` (when `stale_after` is set;
//!    it must exceed the handler timeout so a live handler is never reclaimed),
//! 2. fetches up to `batch_size` eligible pending jobs, oldest first,
//! 3. processes them one at a time: claim (`pending -> processing`, attempts + 1),
//!    invoke the handler under the timeout, then mark `completed`, `pending`
//!    (retryable) or `failed` (attempts exhausted).
//!
//! A handler error, panic or timeout only fails that job's attempt; store
//! errors are logged and the batch moves on to the next job.

use std::any::Any;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use super::config::ConfigError;
use super::registry::{HandlerRegistry, JobContext, JobHandler};
use super::store::{JobStore, JobStoreError};
use super::types::{BackoffPolicy, JobRecord};

/// What to do with a pending job whose queue has no registered handler.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnroutablePolicy {
    /// Leave the job untouched; it is reconsidered every tick.
    #[default]
    Skip,
    /// Each tick without a handler consumes an attempt.
    CountAttempt,
    /// Fail the job on first encounter.
    Fail,
}

impl std::str::FromStr for UnroutablePolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "skip" => Ok(Self::Skip),
            "count_attempt" => Ok(Self::CountAttempt),
            "fail" => Ok(Self::Fail),
            other => Err(format!("unknown unroutable policy: {other}")),
        }
    }
}

/// Dispatcher configuration.
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Name for logging
    pub name: String,
    /// Fixed tick interval
    pub poll_interval: Duration,
    /// Maximum jobs fetched per tick
    pub batch_size: usize,
    /// Per-invocation deadline; `None` waits forever
    pub handler_timeout: Option<Duration>,
    /// Handling of jobs whose queue has no handler
    pub unroutable: UnroutablePolicy,
    /// Delay before a retryable failure is eligible again
    pub backoff: BackoffPolicy,
    /// Age after which a `processing` claim is considered abandoned
    pub stale_after: Option<Duration>,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            name: "job-dispatcher".to_string(),
            poll_interval: Duration::from_secs(5),
            batch_size: 10,
            handler_timeout: Some(Duration::from_secs(60)),
            unroutable: UnroutablePolicy::Skip,
            backoff: BackoffPolicy::immediate(),
            stale_after: Some(Duration::from_secs(15 * 60)),
        }
    }
}

impl DispatcherConfig {
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn with_handler_timeout(mut self, timeout: impl Into<Option<Duration>>) -> Self {
        self.handler_timeout = timeout.into();
        self
    }

    pub fn with_unroutable_policy(mut self, policy: UnroutablePolicy) -> Self {
        self.unroutable = policy;
        self
    }

    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_stale_after(mut self, stale_after: impl Into<Option<Duration>>) -> Self {
        self.stale_after = stale_after.into();
        self
    }

    /// Reject settings the dispatch loop cannot run with.
    ///
    /// Stale recovery needs a handler timeout shorter than `stale_after`:
    /// otherwise a handler that is still running could be reclaimed and
    /// executed a second time.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.poll_interval.is_zero() {
            return Err(ConfigError::invalid("poll_interval", "must be greater than 0"));
        }
        if self.batch_size == 0 {
            return Err(ConfigError::invalid("batch_size", "must be greater than 0"));
        }
        if let Some(stale_after) = self.stale_after {
            match self.handler_timeout {
                None => {
                    return Err(ConfigError::invalid(
                        "handler_timeout",
                        "required while stale recovery is enabled",
                    ));
                }
                Some(timeout) if stale_after <= timeout => {
                    return Err(ConfigError::invalid(
                        "stale_after",
                        format!("{stale_after:?} must exceed the handler timeout {timeout:?}"),
                    ));
                }
                Some(_) => {}
            }
        }
        Ok(())
    }
}

/// Result of processing one job within a tick.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    Completed,
    /// Attempt failed; the job is pending again.
    Retrying { attempt: u32, error: String },
    /// Attempt failed and the job is now terminally `failed`.
    Failed { attempt: u32, error: String },
    /// No handler and the policy left the job untouched.
    Skipped,
    /// Another dispatcher (or an operator) moved the job first.
    Conflict,
    /// A status write did not land; the store keeps its last durable state.
    StoreError(JobStoreError),
}

/// Counters for a single tick.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TickReport {
    pub fetched: u64,
    pub completed: u64,
    pub retried: u64,
    pub failed: u64,
    pub skipped: u64,
    pub conflicts: u64,
    pub store_errors: u64,
    pub recovered: u64,
}

impl TickReport {
    fn record(&mut self, outcome: &JobOutcome) {
        match outcome {
            JobOutcome::Completed => self.completed += 1,
            JobOutcome::Retrying { .. } => self.retried += 1,
            JobOutcome::Failed { .. } => self.failed += 1,
            JobOutcome::Skipped => self.skipped += 1,
            JobOutcome::Conflict => self.conflicts += 1,
            JobOutcome::StoreError(_) => self.store_errors += 1,
        }
    }

    /// Jobs whose handler ran (or whose attempt was consumed) this tick.
    pub fn processed(&self) -> u64 {
        self.completed + self.retried + self.failed
    }
}

/// Dispatcher runtime statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DispatcherStats {
    pub ticks: u64,
    pub jobs_processed: u64,
    pub jobs_succeeded: u64,
    pub jobs_retried: u64,
    pub jobs_failed: u64,
    pub jobs_skipped: u64,
    pub conflicts: u64,
    pub store_errors: u64,
    pub uptime_secs: u64,
}

impl DispatcherStats {
    fn absorb(&mut self, report: &TickReport) {
        self.ticks += 1;
        self.jobs_processed += report.processed();
        self.jobs_succeeded += report.completed;
        self.jobs_retried += report.retried;
        self.jobs_failed += report.failed;
        self.jobs_skipped += report.skipped;
        self.conflicts += report.conflicts;
        self.store_errors += report.store_errors;
    }
}

/// Handle to control a running dispatcher.
#[derive(Debug)]
pub struct DispatcherHandle {
    shutdown: Arc<Notify>,
    join: JoinHandle<()>,
    stats: Arc<Mutex<DispatcherStats>>,
    started: Instant,
}

impl DispatcherHandle {
    /// Current dispatcher statistics.
    pub fn stats(&self) -> DispatcherStats {
        let mut stats = lock(&self.stats).clone();
        stats.uptime_secs = self.started.elapsed().as_secs();
        stats
    }

    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }

    /// Request shutdown and wait for the loop to exit. An in-flight tick runs
    /// to completion first.
    pub async fn shutdown(self) {
        self.shutdown.notify_one();
        if let Err(e) = self.join.await {
            error!(error = %e, "job dispatcher task ended abnormally");
        }
    }
}

/// Background job dispatcher.
///
/// Polls a job store for pending jobs and executes them with the handlers in
/// its registry.
pub struct Dispatcher<S: JobStore> {
    store: S,
    registry: Arc<HandlerRegistry>,
    config: DispatcherConfig,
}

impl<S: JobStore> std::fmt::Debug for Dispatcher<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("registry", &self.registry)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl<S: JobStore + 'static> Dispatcher<S> {
    pub fn new(
        store: S,
        registry: HandlerRegistry,
        config: DispatcherConfig,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            store,
            registry: Arc::new(registry),
            config,
        })
    }

    pub fn config(&self) -> &DispatcherConfig {
        &self.config
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Run one dispatch cycle.
    ///
    /// Fails only if the pending batch cannot be fetched; per-job store errors
    /// are counted in the report.
    pub async fn tick(&self) -> Result<TickReport, JobStoreError> {
        let mut report = TickReport::default();

        if let Some(cutoff) = self.stale_cutoff() {
            match self.store.recover_stale(cutoff).await {
                Ok(0) => {}
                Ok(recovered) => {
                    warn!(
                        dispatcher = %self.config.name,
                        recovered,
                        "recovered stale job claims"
                    );
                    report.recovered = recovered;
                }
                Err(e) => {
                    error!(dispatcher = %self.config.name, error = %e, "failed to recover stale jobs");
                    report.store_errors += 1;
                }
            }
        }

        let batch = self
            .store
            .fetch_pending_batch(self.config.batch_size)
            .await
            .inspect_err(|e| {
                error!(dispatcher = %self.config.name, error = %e, "failed to fetch pending jobs");
            })?;
        report.fetched = batch.len() as u64;

        for job in batch {
            let outcome = self.process_job(job).await;
            report.record(&outcome);
        }

        if report.fetched > 0 {
            debug!(dispatcher = %self.config.name, ?report, "tick finished");
        }
        Ok(report)
    }

    /// Claim, execute and settle a single job.
    pub async fn process_job(&self, job: JobRecord) -> JobOutcome {
        let Some(handler) = self.registry.lookup(&job.queue) else {
            return self.process_unroutable(job).await;
        };

        let attempt = job.next_attempt();
        if let Err(e) = self.store.mark_processing(job.id, attempt).await {
            return self.claim_failed(&job, e);
        }

        match self.invoke(handler, &job, attempt).await {
            Ok(()) => self.complete(&job, attempt).await,
            Err(error) => {
                let terminal = job.is_final_attempt(attempt);
                self.fail(&job, attempt, error, terminal).await
            }
        }
    }

    /// Start the dispatch loop on a tokio task.
    pub fn spawn(self) -> DispatcherHandle {
        let shutdown = Arc::new(Notify::new());
        let stats = Arc::new(Mutex::new(DispatcherStats::default()));

        let join = tokio::spawn(dispatcher_loop(self, shutdown.clone(), stats.clone()));

        DispatcherHandle {
            shutdown,
            join,
            stats,
            started: Instant::now(),
        }
    }

    fn stale_cutoff(&self) -> Option<chrono::DateTime<Utc>> {
        let stale_after = chrono::Duration::from_std(self.config.stale_after?).ok()?;
        Utc::now().checked_sub_signed(stale_after)
    }

    async fn process_unroutable(&self, job: JobRecord) -> JobOutcome {
        let policy = self.config.unroutable;
        warn!(
            dispatcher = %self.config.name,
            job_id = %job.id,
            queue = %job.queue,
            ?policy,
            "no handler registered for queue"
        );

        if policy == UnroutablePolicy::Skip {
            return JobOutcome::Skipped;
        }

        let attempt = job.next_attempt();
        if let Err(e) = self.store.mark_processing(job.id, attempt).await {
            return self.claim_failed(&job, e);
        }

        let error = format!("no handler registered for queue '{}'", job.queue);
        let terminal = policy == UnroutablePolicy::Fail || job.is_final_attempt(attempt);
        self.fail(&job, attempt, error, terminal).await
    }

    /// Run the handler on its own task so a panic or timeout only fails this
    /// attempt.
    async fn invoke(
        &self,
        handler: Arc<dyn JobHandler>,
        job: &JobRecord,
        attempt: u32,
    ) -> Result<(), String> {
        let timeout = self.config.handler_timeout;
        let deadline = timeout
            .and_then(|t| chrono::Duration::from_std(t).ok())
            .and_then(|t| Utc::now().checked_add_signed(t));

        let ctx = JobContext {
            job_id: job.id,
            queue: job.queue.clone(),
            attempt,
            max_attempts: job.max_attempts,
            deadline,
        };
        let payload = job.payload.clone();

        debug!(job_id = %job.id, queue = %job.queue, attempt, "running job handler");
        let mut task = tokio::spawn(async move { handler.handle(ctx, payload).await });

        let joined = match timeout {
            Some(limit) => match tokio::time::timeout(limit, &mut task).await {
                Ok(joined) => joined,
                Err(_) => {
                    task.abort();
                    return Err(format!("handler timed out after {limit:?}"));
                }
            },
            None => task.await,
        };

        match joined {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(format!("{e:#}")),
            Err(e) if e.is_panic() => Err(format!(
                "handler panicked: {}",
                panic_message(e.into_panic().as_ref())
            )),
            Err(e) => Err(format!("handler task cancelled: {e}")),
        }
    }

    async fn complete(&self, job: &JobRecord, attempt: u32) -> JobOutcome {
        match self.store.mark_completed(job.id, attempt, Utc::now()).await {
            Ok(()) => {
                info!(
                    dispatcher = %self.config.name,
                    job_id = %job.id,
                    queue = %job.queue,
                    attempts = attempt,
                    "job completed"
                );
                JobOutcome::Completed
            }
            Err(e) => self.settle_failed(job, "mark_completed", e),
        }
    }

    async fn fail(&self, job: &JobRecord, attempt: u32, error: String, terminal: bool) -> JobOutcome {
        let now = Utc::now();

        if terminal {
            return match self
                .store
                .mark_failed_terminal(job.id, attempt, now, &error)
                .await
            {
                Ok(()) => {
                    error!(
                        dispatcher = %self.config.name,
                        job_id = %job.id,
                        queue = %job.queue,
                        attempts = attempt,
                        max_attempts = job.max_attempts,
                        error = %error,
                        "job failed permanently"
                    );
                    JobOutcome::Failed { attempt, error }
                }
                Err(e) => self.settle_failed(job, "mark_failed_terminal", e),
            };
        }

        let next_eligible_at = self.config.backoff.next_eligible_at(now, attempt);
        match self
            .store
            .mark_failed_retryable(job.id, attempt, now, next_eligible_at)
            .await
        {
            Ok(()) => {
                warn!(
                    dispatcher = %self.config.name,
                    job_id = %job.id,
                    queue = %job.queue,
                    attempts = attempt,
                    max_attempts = job.max_attempts,
                    next_eligible_at = ?next_eligible_at,
                    error = %error,
                    "job attempt failed; will retry"
                );
                JobOutcome::Retrying { attempt, error }
            }
            Err(e) => self.settle_failed(job, "mark_failed_retryable", e),
        }
    }

    fn claim_failed(&self, job: &JobRecord, e: JobStoreError) -> JobOutcome {
        match e {
            JobStoreError::Conflict { .. } | JobStoreError::NotFound(_) => {
                debug!(
                    dispatcher = %self.config.name,
                    job_id = %job.id,
                    reason = %e,
                    "job no longer claimable; skipping"
                );
                JobOutcome::Conflict
            }
            e => {
                error!(
                    dispatcher = %self.config.name,
                    job_id = %job.id,
                    error = %e,
                    "failed to claim job"
                );
                JobOutcome::StoreError(e)
            }
        }
    }

    fn settle_failed(&self, job: &JobRecord, operation: &str, e: JobStoreError) -> JobOutcome {
        if e.is_conflict() {
            warn!(
                dispatcher = %self.config.name,
                job_id = %job.id,
                operation,
                reason = %e,
                "job moved while its handler ran; outcome discarded"
            );
            return JobOutcome::Conflict;
        }

        error!(
            dispatcher = %self.config.name,
            job_id = %job.id,
            operation,
            error = %e,
            "failed to record job outcome"
        );
        JobOutcome::StoreError(e)
    }
}

async fn dispatcher_loop<S: JobStore + 'static>(
    dispatcher: Dispatcher<S>,
    shutdown: Arc<Notify>,
    stats: Arc<Mutex<DispatcherStats>>,
) {
    let config = &dispatcher.config;
    info!(
        dispatcher = %config.name,
        poll_interval_ms = config.poll_interval.as_millis() as u64,
        batch_size = config.batch_size,
        queues = ?dispatcher.registry.queues(),
        "job dispatcher started"
    );

    let mut interval = tokio::time::interval(config.poll_interval);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = shutdown.notified() => break,
            _ = interval.tick() => {
                match dispatcher.tick().await {
                    Ok(report) => lock(&stats).absorb(&report),
                    Err(_) => {
                        let mut s = lock(&stats);
                        s.ticks += 1;
                        s.store_errors += 1;
                    }
                }
            }
        }
    }

    info!(dispatcher = %config.name, "job dispatcher stopped");
}

fn lock(stats: &Mutex<DispatcherStats>) -> std::sync::MutexGuard<'_, DispatcherStats> {
    stats.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    use crate::store::InMemoryJobStore;
    use crate::types::{JobStatus, NewJob, Payload};

    fn dispatcher(
        store: Arc<InMemoryJobStore>,
        registry: HandlerRegistry,
    ) -> Dispatcher<Arc<InMemoryJobStore>> {
        Dispatcher::new(store, registry, DispatcherConfig::default()).unwrap()
    }

    async fn enqueue(store: &InMemoryJobStore, queue: &str) -> JobRecord {
        store.enqueue(NewJob::new(queue, Payload::new())).await.unwrap()
    }

    #[tokio::test]
    async fn successful_handler_completes_job() {
        let store = InMemoryJobStore::arc();
        let mut registry = HandlerRegistry::new();
        registry.register_fn("q", |_, _| async { Ok(()) });
        let job = enqueue(&store, "q").await;

        let report = dispatcher(store.clone(), registry).tick().await.unwrap();
        assert_eq!(report.fetched, 1);
        assert_eq!(report.completed, 1);

        let job = store.get(job.id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.attempts, 1);
        assert!(job.processed_at.is_some());
        assert!(job.error.is_none());
    }

    #[tokio::test]
    async fn retryable_failure_stays_pending_without_error() {
        let store = InMemoryJobStore::arc();
        let mut registry = HandlerRegistry::new();
        registry.register_fn("q", |_, _| async { anyhow::bail!("upstream unavailable") });
        let job = enqueue(&store, "q").await;

        let outcome = dispatcher(store.clone(), registry).process_job(job.clone()).await;
        assert_eq!(
            outcome,
            JobOutcome::Retrying {
                attempt: 1,
                error: "upstream unavailable".to_string()
            }
        );

        let job = store.get(job.id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.attempts, 1);
        assert!(job.error.is_none());
        assert!(job.processed_at.is_some());
    }

    #[tokio::test]
    async fn final_failure_is_terminal_with_error_chain() {
        let store = InMemoryJobStore::arc();
        let mut registry = HandlerRegistry::new();
        registry.register_fn("q", |_, _| async {
            Err(anyhow::anyhow!("connection refused").context("vision pipeline failed"))
        });
        let job = store
            .enqueue(NewJob::new("q", Payload::new()).with_attempts(2))
            .await
            .unwrap();

        let report = dispatcher(store.clone(), registry).tick().await.unwrap();
        assert_eq!(report.failed, 1);

        let job = store.get(job.id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.attempts, 3);
        assert_eq!(
            job.error.as_deref(),
            Some("vision pipeline failed: connection refused")
        );
    }

    #[tokio::test]
    async fn unrouted_job_is_untouched_by_default() {
        let store = InMemoryJobStore::arc();
        let job = enqueue(&store, "nobody_listens").await;

        let report = dispatcher(store.clone(), HandlerRegistry::new())
            .tick()
            .await
            .unwrap();
        assert_eq!(report.skipped, 1);

        let after = store.get(job.id).await.unwrap().unwrap();
        assert_eq!(after, job);
    }

    #[tokio::test]
    async fn count_attempt_policy_eventually_fails_unroutable_job() {
        let store = InMemoryJobStore::arc();
        let job = store
            .enqueue(NewJob::new("orphan", Payload::new()).with_max_attempts(2))
            .await
            .unwrap();
        let dispatcher = Dispatcher::new(
            store.clone(),
            HandlerRegistry::new(),
            DispatcherConfig::default().with_unroutable_policy(UnroutablePolicy::CountAttempt),
        )
        .unwrap();

        assert_eq!(dispatcher.tick().await.unwrap().retried, 1);
        assert_eq!(dispatcher.tick().await.unwrap().failed, 1);

        let job = store.get(job.id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.attempts, 2);
        assert_eq!(
            job.error.as_deref(),
            Some("no handler registered for queue 'orphan'")
        );
    }

    #[tokio::test]
    async fn fail_policy_fails_unroutable_job_immediately() {
        let store = InMemoryJobStore::arc();
        let job = enqueue(&store, "orphan").await;
        let dispatcher = Dispatcher::new(
            store.clone(),
            HandlerRegistry::new(),
            DispatcherConfig::default().with_unroutable_policy(UnroutablePolicy::Fail),
        )
        .unwrap();

        assert_eq!(dispatcher.tick().await.unwrap().failed, 1);

        let job = store.get(job.id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.attempts, 1);
    }

    #[tokio::test]
    async fn batches_take_oldest_jobs_first() {
        let store = InMemoryJobStore::arc();
        let mut ids = Vec::new();
        for _ in 0..15 {
            ids.push(enqueue(&store, "q").await.id);
        }
        let mut registry = HandlerRegistry::new();
        registry.register_fn("q", |_, _| async { Ok(()) });
        let dispatcher = dispatcher(store.clone(), registry);

        let first = dispatcher.tick().await.unwrap();
        assert_eq!(first.completed, 10);
        for (i, id) in ids.iter().enumerate() {
            let job = store.get(*id).await.unwrap().unwrap();
            let expected = if i < 10 {
                JobStatus::Completed
            } else {
                JobStatus::Pending
            };
            assert_eq!(job.status, expected, "job #{i}");
        }

        let second = dispatcher.tick().await.unwrap();
        assert_eq!(second.completed, 5);
        assert_eq!(store.stats(None).await.unwrap().completed, 15);
    }

    #[tokio::test]
    async fn fails_twice_then_succeeds() {
        let store = InMemoryJobStore::arc();
        let calls = Arc::new(AtomicU32::new(0));
        let calls_in_handler = calls.clone();

        let mut registry = HandlerRegistry::new();
        registry.register_fn("extract_colors", move |_, _| {
            let calls = calls_in_handler.clone();
            async move {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    anyhow::bail!("vision service unavailable");
                }
                Ok(())
            }
        });

        let mut payload = Payload::new();
        payload.insert("user_id".to_string(), serde_json::json!(42));
        let job = store
            .enqueue(NewJob::new("extract_colors", payload))
            .await
            .unwrap();
        let dispatcher = dispatcher(store.clone(), registry);

        let trace = [
            (1, JobStatus::Pending),
            (2, JobStatus::Pending),
            (3, JobStatus::Completed),
        ];
        for (attempts, status) in trace {
            dispatcher.tick().await.unwrap();
            let current = store.get(job.id).await.unwrap().unwrap();
            assert_eq!((current.attempts, current.status), (attempts, status));
        }
    }

    #[tokio::test]
    async fn concurrent_dispatchers_execute_job_once() {
        let store = InMemoryJobStore::arc();
        let calls = Arc::new(AtomicU32::new(0));

        let registry = |calls: Arc<AtomicU32>| {
            let mut registry = HandlerRegistry::new();
            registry.register_fn("q", move |_, _| {
                let calls = calls.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            });
            registry
        };
        let a = dispatcher(store.clone(), registry(calls.clone()));
        let b = dispatcher(store.clone(), registry(calls.clone()));

        let job = enqueue(&store, "q").await;
        let seen_by_a = store.fetch_pending_batch(10).await.unwrap();
        let seen_by_b = store.fetch_pending_batch(10).await.unwrap();

        let (first, second) = tokio::join!(
            a.process_job(seen_by_a[0].clone()),
            b.process_job(seen_by_b[0].clone())
        );

        let mut outcomes = [first, second];
        outcomes.sort_by_key(|o| matches!(o, JobOutcome::Conflict));
        assert_eq!(outcomes, [JobOutcome::Completed, JobOutcome::Conflict]);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(
            store.get(job.id).await.unwrap().unwrap().status,
            JobStatus::Completed
        );
    }

    #[tokio::test]
    async fn panicking_handler_is_a_failed_attempt() {
        let store = InMemoryJobStore::arc();
        let mut registry = HandlerRegistry::new();
        registry
            .register_fn("boom", |_, _| async { panic!("kaboom") })
            .register_fn("ok", |_, _| async { Ok(()) });
        let bad = store
            .enqueue(NewJob::new("boom", Payload::new()).with_max_attempts(1))
            .await
            .unwrap();
        let good = enqueue(&store, "ok").await;

        let report = dispatcher(store.clone(), registry).tick().await.unwrap();
        assert_eq!(report.failed, 1);
        assert_eq!(report.completed, 1);

        let bad = store.get(bad.id).await.unwrap().unwrap();
        assert_eq!(bad.error.as_deref(), Some("handler panicked: kaboom"));
        assert_eq!(
            store.get(good.id).await.unwrap().unwrap().status,
            JobStatus::Completed
        );
    }

    #[tokio::test]
    async fn slow_handler_times_out() {
        let store = InMemoryJobStore::arc();
        let mut registry = HandlerRegistry::new();
        registry.register_fn("slow", |_, _| async {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok(())
        });
        let job = store
            .enqueue(NewJob::new("slow", Payload::new()).with_max_attempts(1))
            .await
            .unwrap();
        let dispatcher = Dispatcher::new(
            store.clone(),
            registry,
            DispatcherConfig::default().with_handler_timeout(Duration::from_millis(50)),
        )
        .unwrap();

        let report = dispatcher.tick().await.unwrap();
        assert_eq!(report.failed, 1);

        let job = store.get(job.id).await.unwrap().unwrap();
        assert_eq!(job.error.as_deref(), Some("handler timed out after 50ms"));
    }

    #[tokio::test]
    async fn backoff_delays_next_attempt() {
        let store = InMemoryJobStore::arc();
        let mut registry = HandlerRegistry::new();
        registry.register_fn("q", |_, _| async { anyhow::bail!("flaky") });
        let job = enqueue(&store, "q").await;
        let dispatcher = Dispatcher::new(
            store.clone(),
            registry,
            DispatcherConfig::default().with_backoff(BackoffPolicy::fixed(Duration::from_secs(60))),
        )
        .unwrap();

        assert_eq!(dispatcher.tick().await.unwrap().retried, 1);
        assert_eq!(dispatcher.tick().await.unwrap().fetched, 0);

        let job = store.get(job.id).await.unwrap().unwrap();
        assert_eq!(job.attempts, 1);
        assert!(job.next_eligible_at.is_some());
    }

    #[tokio::test]
    async fn tick_recovers_stale_claims() {
        let store = InMemoryJobStore::arc();
        let job = enqueue(&store, "q").await;
        store.mark_processing(job.id, 1).await.unwrap();

        let mut registry = HandlerRegistry::new();
        registry.register_fn("q", |_, _| async { Ok(()) });
        let dispatcher = Dispatcher::new(
            store.clone(),
            registry,
            DispatcherConfig::default()
                .with_handler_timeout(Duration::from_millis(20))
                .with_stale_after(Duration::from_millis(40)),
        )
        .unwrap();

        tokio::time::sleep(Duration::from_millis(60)).await;
        let report = dispatcher.tick().await.unwrap();
        assert_eq!(report.recovered, 1);
        assert_eq!(report.completed, 1);

        let job = store.get(job.id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.attempts, 2);
    }

    struct InFlight(Arc<AtomicU32>);

    impl Drop for InFlight {
        fn drop(&mut self) {
            self.0.fetch_sub(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn stale_recovery_never_reclaims_a_running_handler() {
        let store = InMemoryJobStore::arc();
        let job = enqueue(&store, "slow").await;

        let in_flight = Arc::new(AtomicU32::new(0));
        let peak = Arc::new(AtomicU32::new(0));
        let registry = || {
            let (in_flight, peak) = (in_flight.clone(), peak.clone());
            let mut registry = HandlerRegistry::new();
            registry.register_fn("slow", move |_, _| {
                let (in_flight, peak) = (in_flight.clone(), peak.clone());
                async move {
                    let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    let _guard = InFlight(in_flight);
                    tokio::time::sleep(Duration::from_millis(300)).await;
                    Ok(())
                }
            });
            registry
        };
        let config = DispatcherConfig::default()
            .with_handler_timeout(Duration::from_millis(50))
            .with_stale_after(Duration::from_millis(100));
        let a = Dispatcher::new(store.clone(), registry(), config.clone()).unwrap();
        let b = Dispatcher::new(store.clone(), registry(), config).unwrap();

        let (ra, rb) = tokio::join!(a.tick(), async {
            tokio::time::sleep(Duration::from_millis(150)).await;
            b.tick().await
        });
        let (ra, rb) = (ra.unwrap(), rb.unwrap());

        // A's attempt timed out and was settled before B could see a stale claim.
        assert_eq!(ra.retried, 1);
        assert_eq!(rb.recovered, 0);
        assert_eq!(rb.conflicts, 0);
        assert_eq!(rb.retried, 1);
        assert_eq!(peak.load(Ordering::SeqCst), 1);

        let job = store.get(job.id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.attempts, 2);
    }

    #[test]
    fn stale_recovery_requires_a_shorter_handler_timeout() {
        let store = InMemoryJobStore::arc();
        let stale = DispatcherConfig::default().with_stale_after(Duration::from_millis(100));

        let err = Dispatcher::new(
            store.clone(),
            HandlerRegistry::new(),
            stale.clone().with_handler_timeout(None),
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { ref key, .. } if key == "handler_timeout"));

        let err = stale
            .clone()
            .with_handler_timeout(Duration::from_millis(100))
            .validate()
            .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { ref key, .. } if key == "stale_after"));

        stale
            .clone()
            .with_handler_timeout(Duration::from_millis(99))
            .validate()
            .unwrap();
        DispatcherConfig::default()
            .with_handler_timeout(None)
            .with_stale_after(None)
            .validate()
            .unwrap();
        assert!(
            DispatcherConfig::default()
                .with_batch_size(0)
                .validate()
                .is_err()
        );
    }

    #[tokio::test]
    async fn exhausted_imports_do_not_starve_the_batch() {
        let store = InMemoryJobStore::arc();
        for _ in 0..10 {
            store
                .enqueue(NewJob::new("q", Payload::new()).with_max_attempts(3).with_attempts(3))
                .await
                .unwrap();
        }
        let fresh = enqueue(&store, "q").await;

        let mut registry = HandlerRegistry::new();
        registry.register_fn("q", |_, _| async { Ok(()) });
        let report = dispatcher(store.clone(), registry).tick().await.unwrap();

        assert_eq!(report.fetched, 1);
        assert_eq!(report.completed, 1);
        assert_eq!(report.conflicts, 0);
        assert_eq!(
            store.get(fresh.id).await.unwrap().unwrap().status,
            JobStatus::Completed
        );
    }

    #[tokio::test]
    async fn spawned_dispatcher_processes_and_shuts_down() {
        let store = InMemoryJobStore::arc();
        let mut registry = HandlerRegistry::new();
        registry.register_fn("q", |_, _| async { Ok(()) });
        let job = enqueue(&store, "q").await;

        let handle = Dispatcher::new(
            store.clone(),
            registry,
            DispatcherConfig::default().with_poll_interval(Duration::from_millis(10)),
        )
        .unwrap()
        .spawn();

        let mut stats = handle.stats();
        for _ in 0..100 {
            if stats.jobs_succeeded == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
            stats = handle.stats();
        }
        assert_eq!(stats.jobs_succeeded, 1, "job was not processed by the running dispatcher");
        assert_eq!(stats.jobs_processed, 1);
        assert!(stats.ticks >= 1);
        assert_eq!(
            store.get(job.id).await.unwrap().unwrap().status,
            JobStatus::Completed
        );

        handle.shutdown().await;
    }

    #[test]
    fn unroutable_policy_parses() {
        assert_eq!("skip".parse::<UnroutablePolicy>(), Ok(UnroutablePolicy::Skip));
        assert_eq!(
            "COUNT_ATTEMPT".parse::<UnroutablePolicy>(),
            Ok(UnroutablePolicy::CountAttempt)
        );
        assert_eq!("fail".parse::<UnroutablePolicy>(), Ok(UnroutablePolicy::Fail));
        assert!("drop".parse::<UnroutablePolicy>().is_err());
    }
}
