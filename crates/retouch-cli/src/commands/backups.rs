//! The `backups` subcommands.

use anyhow::Context;
use retouch_agent::claim::resolve_base;
use retouch_agent::Pipeline;
use retouch_backup::{Backup, BackupStore};
use retouch_config::AgentConfig;
use retouch_core::notify::NoopNotifier;
use std::sync::Arc;

pub async fn list(config: &AgentConfig, content_id: &str) -> anyhow::Result<()> {
    let content_id = super::parse_content_id(content_id)?;
    let store = BackupStore::new(config.backup_dir.clone());

    let backups = store.list(content_id).await?;
    if backups.is_empty() {
        println!("no backups for {content_id}");
        return Ok(());
    }

    for backup in backups {
        println!(
            "{}  {:>8}B  {}  {}",
            backup.meta.backed_up_at.format("%Y-%m-%d %H:%M:%S"),
            backup.meta.payload_size,
            backup.meta.payload_file,
            backup.meta.description,
        );
    }
    Ok(())
}

pub async fn create(config: &AgentConfig, content_id: &str) -> anyhow::Result<()> {
    let content_id = super::parse_content_id(content_id)?;
    let (_, contents) = super::connect(config).await?;
    let store = BackupStore::new(config.backup_dir.clone());

    let (live, _) = resolve_base(contents.as_ref(), content_id).await?;
    let backup = store.snapshot(content_id, &live, "manual backup").await?;

    println!("backup created: {}", backup.meta.payload_file);
    Ok(())
}

pub async fn restore(
    config: &AgentConfig,
    content_id: &str,
    file: Option<String>,
) -> anyhow::Result<()> {
    let content_id = super::parse_content_id(content_id)?;
    let (jobs, contents) = super::connect(config).await?;
    let store = Arc::new(BackupStore::new(config.backup_dir.clone()));

    let backup = find_backup(&store, content_id, file.as_deref()).await?;

    let pipeline = Pipeline::new(
        jobs,
        contents,
        store.clone(),
        super::run::build_transformer(config),
        Arc::new(NoopNotifier),
        config.transform.timeout,
    );
    let revision_id = pipeline.restore(&backup).await?;

    println!(
        "restored {} from {} as revision {}",
        content_id, backup.meta.payload_file, revision_id
    );
    Ok(())
}

async fn find_backup(
    store: &BackupStore,
    content_id: uuid::Uuid,
    file: Option<&str>,
) -> anyhow::Result<Backup> {
    match file {
        Some(file) => store
            .list(content_id)
            .await?
            .into_iter()
            .find(|b| b.meta.payload_file == file || b.meta.payload_file.ends_with(file))
            .with_context(|| format!("no backup matching {file} for {content_id}")),
        None => store
            .latest(content_id)
            .await?
            .with_context(|| format!("no backups for {content_id}")),
    }
}
