//! Handlers built into the worker.

use async_trait::async_trait;
use formjobs_jobs::{HandlerRegistry, JobContext, JobHandler, Payload};
use tracing::info;

/// Queue served by [`LogPayload`].
pub const LOG_PAYLOAD_QUEUE: &str = "log_payload";

/// Logs the payload and succeeds. Useful for checking a deployment end to end.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogPayload;

#[async_trait]
impl JobHandler for LogPayload {
    async fn handle(&self, ctx: JobContext, payload: Payload) -> anyhow::Result<()> {
        let payload = serde_json::Value::Object(payload);
        info!(
            job_id = %ctx.job_id,
            queue = %ctx.queue,
            attempt = ctx.attempt,
            payload = %payload,
            "log_payload job"
        );
        Ok(())
    }
}

/// Registry with every built-in handler.
pub fn registry() -> HandlerRegistry {
    let mut registry = HandlerRegistry::new();
    registry.register(LOG_PAYLOAD_QUEUE, LogPayload);
    registry
}
