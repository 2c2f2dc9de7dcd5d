pub mod backups;
pub mod run;
mod submit;
mod validate;

pub use submit::submit;
pub use validate::validate;

use anyhow::Context;
use retouch_config::AgentConfig;
use retouch_db::repo::{ContentStore, JobStore};
use retouch_db::{PgContentStore, PgJobStore};
use std::sync::Arc;

/// Connect to the database, run migrations, and hand back the stores.
pub(crate) async fn connect(
    config: &AgentConfig,
) -> anyhow::Result<(Arc<dyn JobStore>, Arc<dyn ContentStore>)> {
    let database_url = config
        .database_url
        .clone()
        .or_else(|| std::env::var("DATABASE_URL").ok())
        .context("no database URL: set database-url in the config file or DATABASE_URL")?;

    let pool = retouch_db::create_pool(&database_url).await?;
    retouch_db::run_migrations(&pool).await?;

    Ok((
        Arc::new(PgJobStore::new(pool.clone())),
        Arc::new(PgContentStore::new(pool)),
    ))
}

pub(crate) fn parse_content_id(raw: &str) -> anyhow::Result<uuid::Uuid> {
    raw.parse()
        .with_context(|| format!("invalid content id: {raw}"))
}
