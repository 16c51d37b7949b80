//! External command execution.
//!
//! Each process id maps to a configured argv. Parameters are written to the
//! child's stdin as one JSON object; the child prints its outputs to stdout as
//! one JSON object and exits 0. A non-zero exit is a business failure and its
//! stderr becomes the error detail.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, warn};

use super::{ExecutionContext, ExecutionTier};
use crate::config::SubprocessConfig;
use crate::error::TierError;
use crate::process::{Parameters, Process, TierKind};

#[derive(Debug, Clone, Default)]
pub struct SubprocessTier {
    commands: BTreeMap<String, Vec<String>>,
    working_dir: Option<PathBuf>,
}

impl SubprocessTier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_config(config: &SubprocessConfig) -> Self {
        Self {
            commands: config.commands.clone(),
            working_dir: config.working_dir.clone(),
        }
    }

    pub fn with_command(mut self, process_id: &str, argv: &[&str]) -> Self {
        self.commands.insert(
            process_id.to_string(),
            argv.iter().map(|s| s.to_string()).collect(),
        );
        self
    }
}

#[async_trait]
impl ExecutionTier for SubprocessTier {
    fn kind(&self) -> TierKind {
        TierKind::Subprocess
    }

    async fn execute(
        &self,
        ctx: &ExecutionContext,
        process: &Process,
        params: &Parameters,
    ) -> Result<Parameters, TierError> {
        let Some((program, args)) = self
            .commands
            .get(&process.id)
            .and_then(|argv| argv.split_first())
        else {
            return Err(TierError::Unavailable(format!(
                "no command configured for {}",
                process.id
            )));
        };

        let payload = serde_json::to_vec(params)
            .map_err(|e| TierError::Execution(format!("cannot encode parameters: {e}")))?;

        let mut command = Command::new(program);
        command
            .args(args)
            .env("GEOPROC_JOB_ID", &ctx.job_id)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &self.working_dir {
            command.current_dir(dir);
        }

        let mut child = command.spawn().map_err(|e| {
            warn!(process = %process.id, %program, error = %e, "cannot spawn command");
            TierError::Unavailable(format!("cannot spawn {program}: {e}"))
        })?;
        debug!(job = %ctx.job_id, %program, pid = ?child.id(), "subprocess started");

        if let Some(mut stdin) = child.stdin.take() {
            tokio::spawn(async move {
                // The child may exit without reading its input.
                let _ = stdin.write_all(&payload).await;
            });
        }

        // Dropping the wait future drops the child, which kills it.
        let output = tokio::select! {
            _ = ctx.cancel.cancelled() => return Err(TierError::Cancelled),
            output = child.wait_with_output() => output
                .map_err(|e| TierError::Execution(format!("waiting for {program}: {e}")))?,
        };

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            let detail = if stderr.is_empty() {
                format!("{program} exited with {}", output.status)
            } else {
                stderr
            };
            return Err(TierError::Execution(detail));
        }

        serde_json::from_slice::<Parameters>(&output.stdout)
            .map_err(|e| TierError::Execution(format!("{program} printed invalid output: {e}")))
    }
}
