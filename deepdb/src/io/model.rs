//! Model invocation abstraction.
//!
//! The [`ModelExecutor`] trait decouples stages from the model backend
//! (currently a `codex exec` style CLI). Tests use scripted executors that
//! write predetermined replies without spawning processes.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use tracing::{debug, info, instrument, warn};

use crate::io::process::{CommandOutput, run_command_with_timeout};

/// Parameters for one model turn.
#[derive(Debug, Clone)]
pub struct ExecRequest {
    /// Working directory for the model process.
    pub workdir: PathBuf,
    /// Model identifier passed through to the backend.
    pub model: String,
    pub prompt: String,
    /// JSON Schema constraining the reply, when the stage has one.
    pub output_schema_path: Option<PathBuf>,
    /// Path where the backend must write its final reply.
    pub output_path: PathBuf,
    /// Path to write backend stdout/stderr.
    pub log_path: PathBuf,
    pub timeout: Duration,
    /// Truncate backend logs beyond this many bytes.
    pub output_limit_bytes: usize,
}

/// Abstraction over model backends.
pub trait ModelExecutor {
    /// Run one turn. Must write the reply to `request.output_path`.
    fn exec(&self, request: &ExecRequest) -> Result<()>;
}

/// Executor that spawns a `codex exec` compatible CLI.
pub struct CodexExecutor {
    /// Program and leading arguments, e.g. `["codex", "exec"]`.
    command: Vec<String>,
}

impl CodexExecutor {
    pub fn new(command: Vec<String>) -> Result<Self> {
        if command.first().is_none_or(|program| program.trim().is_empty()) {
            bail!("model command must name a program");
        }
        Ok(Self { command })
    }
}

impl ModelExecutor for CodexExecutor {
    #[instrument(skip_all, fields(model = %request.model, timeout_secs = request.timeout.as_secs()))]
    fn exec(&self, request: &ExecRequest) -> Result<()> {
        info!(workdir = %request.workdir.display(), "starting model turn");

        if let Some(schema) = &request.output_schema_path
            && !schema.exists()
        {
            return Err(anyhow!("missing output schema {}", schema.display()));
        }
        if let Some(parent) = request.output_path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("create output dir {}", parent.display()))?;
        }

        let (program, leading) = self
            .command
            .split_first()
            .ok_or_else(|| anyhow!("model command is empty"))?;
        let mut cmd = Command::new(program);
        cmd.args(leading)
            .arg("-m")
            .arg(&request.model)
            // Stages only read; warehouse access goes through the tool protocol.
            .arg("--sandbox")
            .arg("read-only")
            .arg("--skip-git-repo-check");
        if let Some(schema) = &request.output_schema_path {
            cmd.arg("--output-schema").arg(schema);
        }
        cmd.arg("--output-last-message")
            .arg(&request.output_path)
            .arg("-")
            .current_dir(&request.workdir);

        let output = run_command_with_timeout(
            cmd,
            Some(request.prompt.as_bytes()),
            request.timeout,
            request.output_limit_bytes,
        )
        .with_context(|| format!("run {program}"))?;

        write_model_log(&request.log_path, &output)?;

        if output.timed_out {
            warn!(timeout_secs = request.timeout.as_secs(), "model turn timed out");
            bail!("{program} timed out after {:?}", request.timeout);
        }
        if !output.status.success() {
            warn!(exit_code = ?output.status.code(), "model turn failed");
            bail!("{program} failed with status {:?}", output.status.code());
        }

        debug!("model turn completed");
        Ok(())
    }
}

/// Run one turn and return the reply text.
#[instrument(skip_all, fields(output_path = %request.output_path.display()))]
pub fn invoke_and_load<E: ModelExecutor + ?Sized>(
    executor: &E,
    request: &ExecRequest,
) -> Result<String> {
    executor.exec(request)?;
    if !request.output_path.exists() {
        bail!("missing model output {}", request.output_path.display());
    }
    let reply = fs::read_to_string(&request.output_path)
        .with_context(|| format!("read model output {}", request.output_path.display()))?;
    if reply.trim().is_empty() {
        bail!("model output {} is empty", request.output_path.display());
    }
    Ok(reply)
}

fn write_model_log(path: &Path, output: &CommandOutput) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("create model log dir {}", parent.display()))?;
    }
    fs::write(path, output.log_text("model"))
        .with_context(|| format!("write model log {}", path.display()))
}
