//! The `run` and `once` commands.

use anyhow::Context;
use retouch_agent::{Claimer, Pipeline, PipelineError, RunLock, WebhookNotifier, WorkerPool};
use retouch_backup::BackupStore;
use retouch_config::AgentConfig;
use retouch_core::notify::{Notifier, NoopNotifier};
use retouch_core::transform::Transformer;
use retouch_core::ResourceId;
use retouch_db::repo::JobStore;
use retouch_transform::CliTransformer;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{info, warn};

pub(crate) fn build_transformer(config: &AgentConfig) -> Arc<dyn Transformer> {
    Arc::new(CliTransformer::new(
        config.transform.command.clone(),
        config.transform.args.clone(),
    ))
}

fn build_notifier(config: &AgentConfig) -> Arc<dyn Notifier> {
    match &config.notify.webhook_url {
        Some(url) => Arc::new(WebhookNotifier::new(url.clone())),
        None => Arc::new(NoopNotifier),
    }
}

/// Run the worker pool until Ctrl-C.
pub async fn run(config: AgentConfig) -> anyhow::Result<()> {
    let _lock = RunLock::acquire(&config.run_lock_path, config.run_lock_staleness)?
        .context("another agent instance holds the run lock")?;

    let (jobs, contents) = super::connect(&config).await?;
    let backups = Arc::new(BackupStore::new(config.backup_dir.clone()));

    // The run lock guarantees no other instance is working, so any
    // processing row is a leftover from an unclean exit.
    let released = jobs.release_all_processing().await?;
    if released > 0 {
        warn!(released, "released stuck processing rows from a previous run");
    }

    let pool = WorkerPool::new(
        jobs,
        contents,
        backups,
        build_transformer(&config),
        build_notifier(&config),
        config.pool.clone(),
        config.transform.timeout,
    );
    info!(instance = %pool.instance(), "starting agent");

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("shutdown requested");
                let _ = shutdown_tx.send(true);
            }
            Err(e) => {
                // Keep the sender alive; dropping it would read as a
                // shutdown signal to the pool.
                warn!(error = %e, "could not register signal handler");
                std::future::pending::<()>().await;
            }
        }
    });

    pool.run(shutdown_rx).await;
    Ok(())
}

/// Drain the queue in a single pass and exit.
pub async fn once(config: AgentConfig) -> anyhow::Result<()> {
    let _lock = RunLock::acquire(&config.run_lock_path, config.run_lock_staleness)?
        .context("another agent instance holds the run lock")?;

    let (jobs, contents) = super::connect(&config).await?;
    let backups = Arc::new(BackupStore::new(config.backup_dir.clone()));

    let released = jobs.release_all_processing().await?;
    if released > 0 {
        warn!(released, "released stuck processing rows from a previous run");
    }

    let pipeline = Pipeline::new(
        jobs.clone(),
        contents.clone(),
        backups,
        build_transformer(&config),
        build_notifier(&config),
        config.transform.timeout,
    );
    let claimer = Claimer::new(jobs.clone(), contents);
    let worker_id = format!("once-{}", ResourceId::new().short());

    let mut completed = 0u64;
    let mut failed = 0u64;
    while let Some(job) = claimer.claim_next(&worker_id).await? {
        match pipeline.run(&job).await {
            Ok(outcome) => {
                completed += 1;
                println!("completed {}: {}", job.request.id, outcome.summary);
            }
            Err(e) if e.is_terminal() => {
                failed += 1;
                warn!(request_id = %job.request.id, error = %e, "request failed");
                jobs.mark_failed(job.request.id, &e.to_string()).await?;
            }
            Err(PipelineError::CompletionPending { summary, .. }) => {
                // The revision is live; releasing the claim would
                // replay the deploy. One more attempt at the mark,
                // then leave the row claimed and stop the pass.
                jobs.mark_completed(job.request.id, &summary)
                    .await
                    .context("edit deployed but completion could not be recorded")?;
                completed += 1;
                println!("completed {}: {}", job.request.id, summary);
            }
            Err(e) => {
                // Transient: release our claim and stop the pass.
                jobs.release_claimed_by(&worker_id).await?;
                return Err(e.into());
            }
        }
    }

    println!("queue drained: {completed} completed, {failed} failed");
    Ok(())
}
