//! The `validate` command: offline payload checks.

use anyhow::Context;
use retouch_core::validate;

pub async fn validate(path: &str) -> anyhow::Result<()> {
    let payload = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("cannot read {path}"))?;

    let validation = validate::validate(&payload);
    println!("kind: {}", validation.kind);

    if validation.is_valid() {
        println!("valid");
        return Ok(());
    }

    for issue in &validation.issues {
        println!("  - {issue}");
    }
    anyhow::bail!("{} validation issue(s)", validation.issues.len());
}
