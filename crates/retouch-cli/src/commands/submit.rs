//! The `submit` command.

use retouch_config::AgentConfig;
use retouch_core::request::NewEditRequest;
use retouch_db::repo::{ContentStore, JobStore};

pub async fn submit(
    config: &AgentConfig,
    content_id: &str,
    instruction: &str,
    requester: Option<String>,
) -> anyhow::Result<()> {
    let content_id = super::parse_content_id(content_id)?;
    let (jobs, contents) = super::connect(config).await?;

    // Fail early on an unknown content item rather than queueing a
    // request that can only fail at deploy time.
    contents.get_content(content_id).await?;

    let request = jobs
        .insert(NewEditRequest {
            content_id,
            instruction: instruction.to_string(),
            requester,
        })
        .await?;

    println!("submitted edit request {}", request.id);
    Ok(())
}
