mod handlers;

use anyhow::Context;
use formjobs_jobs::{Dispatcher, JobsConfig, SqliteJobStore};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    formjobs_observability::init();

    let config = JobsConfig::from_env().context("invalid job configuration")?;

    let store = SqliteJobStore::connect(&config.database_url)
        .await
        .with_context(|| format!("failed to open job database {}", config.database_url))?;
    store
        .migrate()
        .await
        .context("failed to migrate job schema")?;

    let dispatcher = Dispatcher::new(
        store,
        handlers::registry(),
        config.dispatcher_config().with_name("formjobs-worker"),
    )
    .context("invalid dispatcher configuration")?;
    let handle = dispatcher.spawn();

    tracing::info!(database_url = %config.database_url, "worker running; press Ctrl-C to stop");

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for Ctrl-C")?;

    tracing::info!("shutdown requested");
    let stats = handle.stats();
    handle.shutdown().await;
    tracing::info!(?stats, "worker stopped");

    Ok(())
}
