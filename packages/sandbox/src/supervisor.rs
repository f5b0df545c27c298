// ABOUTME: Process supervision inside sandboxes
// ABOUTME: Runs setup commands to completion and starts long-lived server processes detached

use crate::providers::{Provider, ProviderError, SandboxRef};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Longest stderr tail kept on a failed command
const STDERR_TAIL: usize = 4096;

#[derive(Error, Debug)]
pub enum SupervisorError {
    #[error("Command '{command}' exited with code {code}")]
    NonZeroExit {
        command: String,
        code: i64,
        stderr: String,
    },

    #[error("Command line is empty")]
    EmptyCommand,

    #[error(transparent)]
    Provider(#[from] ProviderError),
}

pub type Result<T> = std::result::Result<T, SupervisorError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessKind {
    Setup,
    Server,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "state", content = "code", rename_all = "snake_case")]
pub enum Liveness {
    Running,
    Exited(i64),
    Unknown,
}

#[derive(Debug, Clone, Serialize)]
pub struct SupervisedProcess {
    pub command_line: String,
    pub working_dir: Option<String>,
    pub kind: ProcessKind,
    /// Platform exec id; present for detached processes
    pub exec_id: Option<String>,
    pub liveness: Liveness,
    pub started_at: DateTime<Utc>,
}

pub struct ProcessSupervisor {
    provider: Arc<dyn Provider>,
}

impl ProcessSupervisor {
    pub fn new(provider: Arc<dyn Provider>) -> Self {
        Self { provider }
    }

    /// Run `sh -c <command_line>` and wait for it to exit
    pub async fn run_to_completion(
        &self,
        sandbox: &SandboxRef,
        command_line: &str,
        working_dir: Option<&str>,
    ) -> Result<SupervisedProcess> {
        let command = shell(command_line)?;
        let started_at = Utc::now();

        info!(sandbox_id = %sandbox.sandbox_id, command = %command_line, "Running setup command");

        let result = self
            .provider
            .exec_command(
                &sandbox.container_id,
                command,
                working_dir.map(str::to_string),
                None,
            )
            .await?;

        if result.exit_code != 0 {
            let stderr = tail(&String::from_utf8_lossy(&result.stderr));
            warn!(
                sandbox_id = %sandbox.sandbox_id,
                command = %command_line,
                code = result.exit_code,
                "Setup command failed: {}",
                stderr
            );
            return Err(SupervisorError::NonZeroExit {
                command: command_line.to_string(),
                code: result.exit_code,
                stderr,
            });
        }

        Ok(SupervisedProcess {
            command_line: command_line.to_string(),
            working_dir: working_dir.map(str::to_string),
            kind: ProcessKind::Setup,
            exec_id: None,
            liveness: Liveness::Exited(0),
            started_at,
        })
    }

    /// Start `sh -c <command_line>` and return at once; it lives as long as the sandbox
    pub async fn run_detached(
        &self,
        sandbox: &SandboxRef,
        command_line: &str,
        working_dir: Option<&str>,
    ) -> Result<SupervisedProcess> {
        let command = shell(command_line)?;

        info!(sandbox_id = %sandbox.sandbox_id, command = %command_line, "Starting server process");

        let exec_id = self
            .provider
            .exec_detached(
                &sandbox.container_id,
                command,
                working_dir.map(str::to_string),
            )
            .await?;

        Ok(SupervisedProcess {
            command_line: command_line.to_string(),
            working_dir: working_dir.map(str::to_string),
            kind: ProcessKind::Server,
            exec_id: Some(exec_id),
            liveness: Liveness::Running,
            started_at: Utc::now(),
        })
    }

    /// Update `process.liveness` from the platform
    pub async fn refresh(&self, process: &mut SupervisedProcess) -> Result<Liveness> {
        let Some(exec_id) = process.exec_id.as_deref() else {
            return Ok(process.liveness);
        };

        process.liveness = match self.provider.exec_state(exec_id).await {
            Ok(state) if state.running => Liveness::Running,
            Ok(state) => state
                .exit_code
                .map(Liveness::Exited)
                .unwrap_or(Liveness::Unknown),
            Err(ProviderError::NotFound(_)) => Liveness::Unknown,
            Err(e) => return Err(e.into()),
        };

        debug!(exec_id = %exec_id, liveness = ?process.liveness, "Refreshed process");
        Ok(process.liveness)
    }
}

fn shell(command_line: &str) -> Result<Vec<String>> {
    if command_line.trim().is_empty() {
        return Err(SupervisorError::EmptyCommand);
    }
    Ok(vec![
        "sh".to_string(),
        "-c".to_string(),
        command_line.to_string(),
    ])
}

fn tail(output: &str) -> String {
    let trimmed = output.trim();
    if trimmed.len() <= STDERR_TAIL {
        return trimmed.to_string();
    }
    let mut start = trimmed.len() - STDERR_TAIL;
    while !trimmed.is_char_boundary(start) {
        start += 1;
    }
    trimmed[start..].to_string()
}
