//! Handler registry: maps a queue name to the handler that executes its jobs.
//!
//! The registry is built once at startup and handed to the dispatcher, which
//! only ever reads it.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use tracing::debug;

use formjobs_core::JobId;

use super::types::Payload;

/// Per-invocation metadata passed to a handler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobContext {
    pub job_id: JobId,
    pub queue: String,
    /// 1-based attempt number of this invocation.
    pub attempt: u32,
    pub max_attempts: u32,
    /// When the dispatcher will stop waiting for this invocation.
    pub deadline: Option<DateTime<Utc>>,
}

impl JobContext {
    pub fn is_final_attempt(&self) -> bool {
        self.attempt >= self.max_attempts
    }

    /// Time left before the deadline, if one is set.
    pub fn remaining(&self) -> Option<std::time::Duration> {
        self.deadline
            .map(|deadline| (deadline - Utc::now()).to_std().unwrap_or_default())
    }
}

/// Executes the work for one job.
///
/// Returning `Err` marks the attempt as failed; the error (with its cause
/// chain) becomes the job's `error` text if no attempts remain. Handlers never
/// touch the job record themselves.
#[async_trait]
pub trait JobHandler: Send + Sync + 'static {
    async fn handle(&self, ctx: JobContext, payload: Payload) -> anyhow::Result<()>;
}

struct FnHandler<F>(F);

#[async_trait]
impl<F, Fut> JobHandler for FnHandler<F>
where
    F: Fn(JobContext, Payload) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    async fn handle(&self, ctx: JobContext, payload: Payload) -> anyhow::Result<()> {
        (self.0)(ctx, payload).await
    }
}

struct TypedHandler<P, F> {
    f: F,
    _payload: PhantomData<fn() -> P>,
}

#[async_trait]
impl<P, F, Fut> JobHandler for TypedHandler<P, F>
where
    P: DeserializeOwned + Send + 'static,
    F: Fn(JobContext, P) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    async fn handle(&self, ctx: JobContext, payload: Payload) -> anyhow::Result<()> {
        let payload: P = serde_json::from_value(serde_json::Value::Object(payload))
            .with_context(|| format!("invalid payload for queue '{}'", ctx.queue))?;
        (self.f)(ctx, payload).await
    }
}

/// Queue name -> handler. Last registration for a name wins.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn JobHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler for `queue`, replacing any existing one.
    pub fn register<H>(&mut self, queue: impl Into<String>, handler: H) -> &mut Self
    where
        H: JobHandler,
    {
        self.register_arc(queue, Arc::new(handler))
    }

    pub fn register_arc(
        &mut self,
        queue: impl Into<String>,
        handler: Arc<dyn JobHandler>,
    ) -> &mut Self {
        let queue = queue.into();
        if self.handlers.insert(queue.clone(), handler).is_some() {
            debug!(queue = %queue, "replaced existing job handler");
        }
        self
    }

    /// Register an async closure.
    pub fn register_fn<F, Fut>(&mut self, queue: impl Into<String>, f: F) -> &mut Self
    where
        F: Fn(JobContext, Payload) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.register(queue, FnHandler(f))
    }

    /// Register an async closure that receives the payload decoded as `P`.
    ///
    /// A payload that does not decode is an ordinary handler failure.
    pub fn register_typed<P, F, Fut>(&mut self, queue: impl Into<String>, f: F) -> &mut Self
    where
        P: DeserializeOwned + Send + 'static,
        F: Fn(JobContext, P) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.register(
            queue,
            TypedHandler {
                f,
                _payload: PhantomData,
            },
        )
    }

    pub fn lookup(&self, queue: &str) -> Option<Arc<dyn JobHandler>> {
        self.handlers.get(queue).cloned()
    }

    pub fn contains(&self, queue: &str) -> bool {
        self.handlers.contains_key(queue)
    }

    /// Registered queue names, sorted.
    pub fn queues(&self) -> Vec<&str> {
        let mut queues: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        queues.sort_unstable();
        queues
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("queues", &self.queues())
            .finish()
    }
}
