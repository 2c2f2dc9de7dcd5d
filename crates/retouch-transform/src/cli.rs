//! CLI transformer: spawns the configured generation command.

use async_trait::async_trait;
use retouch_core::transform::{TransformError, TransformOutput, Transformer};
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, info, warn};

/// Invokes an external generation CLI.
///
/// The prompt is written to a temp file and fed to the tool on stdin;
/// large payloads are unreliable over argv. One bounded retry through a
/// simpler `sh -c` pipeline is attempted on timeout only; structural
/// failures mean the tool misunderstood the task and retrying the same
/// prompt will not help.
pub struct CliTransformer {
    command: String,
    args: Vec<String>,
}

impl CliTransformer {
    pub fn new(command: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            command: command.into(),
            args,
        }
    }

    fn build_prompt(instruction: &str, payload: &str) -> String {
        format!(
            "## User's Edit Request\n\
             \"{instruction}\"\n\n\
             ## Current Document\n\
             {payload}\n\n\
             ## Instructions\n\
             Edit the document above according to the user's request. \
             Return ONLY the complete modified document with no \
             explanations or markdown code blocks."
        )
    }

    async fn write_prompt_file(prompt: &str) -> Result<PathBuf, TransformError> {
        let path = std::env::temp_dir().join(format!(
            "retouch-prompt-{}.txt",
            uuid::Uuid::now_v7().simple()
        ));
        tokio::fs::write(&path, prompt)
            .await
            .map_err(|e| TransformError::Tool(format!("failed to write prompt file: {e}")))?;
        Ok(path)
    }

    /// Primary invocation: spawn the tool directly with the prompt
    /// piped to stdin.
    async fn run_direct(&self, prompt: &str, timeout: Duration) -> Result<String, TransformError> {
        let mut child = Command::new(&self.command)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| TransformError::Tool(format!("failed to start {}: {e}", self.command)))?;

        // Feed stdin from a separate task so a large prompt cannot
        // deadlock against a full stdout pipe.
        if let Some(mut stdin) = child.stdin.take() {
            let prompt = prompt.to_owned();
            tokio::spawn(async move {
                if let Err(e) = stdin.write_all(prompt.as_bytes()).await {
                    warn!(error = %e, "failed to feed prompt to tool stdin");
                }
                // Dropping stdin closes the pipe so the tool sees EOF.
            });
        }

        let output = match tokio::time::timeout(timeout, child.wait_with_output()).await {
            Ok(result) => {
                result.map_err(|e| TransformError::Tool(format!("tool wait failed: {e}")))?
            }
            // kill_on_drop reaps the child; the tool process itself may
            // keep running in the background until the kill lands.
            Err(_) => return Err(TransformError::Timeout(timeout)),
        };

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(TransformError::Tool(format!(
                "tool exited with {}: {}",
                output.status,
                stderr.trim()
            )));
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    /// Fallback invocation after a timeout: a plain shell pipeline
    /// reading the prompt file, mirroring how the tool is driven by
    /// hand.
    async fn run_via_shell(
        &self,
        prompt: &str,
        timeout: Duration,
    ) -> Result<String, TransformError> {
        let prompt_file = Self::write_prompt_file(prompt).await?;
        let mut cmdline = shell_quote(&self.command);
        for arg in &self.args {
            cmdline.push(' ');
            cmdline.push_str(&shell_quote(arg));
        }
        let script = format!(
            "{cmdline} < {}",
            shell_quote(&prompt_file.display().to_string())
        );

        let mut child = Command::new("sh")
            .arg("-c")
            .arg(&script)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| TransformError::Tool(format!("failed to start shell: {e}")))?;

        let result = tokio::time::timeout(timeout, child.wait_with_output()).await;
        let _ = tokio::fs::remove_file(&prompt_file).await;

        let output = match result {
            Ok(r) => r.map_err(|e| TransformError::Tool(format!("tool wait failed: {e}")))?,
            Err(_) => return Err(TransformError::Timeout(timeout)),
        };

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(TransformError::Tool(format!(
                "tool exited with {}: {}",
                output.status,
                stderr.trim()
            )));
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

#[async_trait]
impl Transformer for CliTransformer {
    fn name(&self) -> &'static str {
        "cli"
    }

    async fn transform(
        &self,
        instruction: &str,
        payload: &str,
        timeout: Duration,
    ) -> Result<TransformOutput, TransformError> {
        let prompt = Self::build_prompt(instruction, payload);
        debug!(
            command = %self.command,
            prompt_kb = prompt.len() / 1024,
            "invoking transformation tool"
        );

        let raw = match self.run_direct(&prompt, timeout).await {
            Ok(raw) => raw,
            Err(TransformError::Timeout(_)) => {
                warn!(command = %self.command, "tool timed out, retrying via shell");
                self.run_via_shell(&prompt, timeout).await?
            }
            Err(e) => return Err(e),
        };

        let cleaned = strip_markdown_fences(raw.trim());
        sniff_document(&cleaned)?;

        info!(output_kb = cleaned.len() / 1024, "transformation tool returned a document");
        Ok(TransformOutput { payload: cleaned })
    }
}

/// Single-quote a string for `sh -c`. Arguments often carry spaces and
/// prompt fragments; passing them bare would let the shell split and
/// expand them.
fn shell_quote(arg: &str) -> String {
    format!("'{}'", arg.replace('\'', r"'\''"))
}

/// Remove markdown code fences the tool sometimes wraps around its
/// output despite instructions.
pub fn strip_markdown_fences(output: &str) -> String {
    let mut text = output.trim();
    if let Some(rest) = text.strip_prefix("```html") {
        text = rest;
    } else if let Some(rest) = text.strip_prefix("```") {
        text = rest;
    }
    if let Some(rest) = text.strip_suffix("```") {
        text = rest;
    }
    text.trim().to_string()
}

/// Minimal structural sniff: the output has to at least resemble a
/// document. Full validation happens in the Validate stage.
fn sniff_document(output: &str) -> Result<(), TransformError> {
    if output.contains("<!DOCTYPE") || output.contains("<html") {
        Ok(())
    } else {
        let head: String = output.chars().take(80).collect();
        Err(TransformError::Malformed(format!(
            "output does not resemble a document (starts with: {head:?})"
        )))
    }
}
