use crate::catalog::CommandSpec;
use cg_channels::Classification;
use std::collections::BTreeMap;
use std::path::Path;
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::process::Command;
use uuid::Uuid;

const OUTPUT_BYTES_MAX: usize = 64_000;

/// Outcome of one command execution. Classification and the filtered flag
/// start empty and are filled in by the response filter after the fact.
#[derive(Debug, Clone)]
pub struct ExecutionResult {
    pub audit_id: String,
    pub success: bool,
    pub output: String,
    pub exit_code: Option<i32>,
    pub elapsed_ms: u64,
    pub timed_out: bool,
    pub detected_classification: Option<Classification>,
    pub filtered: bool,
}

impl ExecutionResult {
    fn failure(audit_id: String, output: impl Into<String>, elapsed_ms: u64) -> Self {
        Self {
            audit_id,
            success: false,
            output: output.into(),
            exit_code: None,
            elapsed_ms,
            timed_out: false,
            detected_classification: None,
            filtered: false,
        }
    }
}

/// Executes allowlisted programs in an isolated child process: hard timeout,
/// cleared environment with an allowlisted set of forwarded variables, argv
/// passed directly with no shell in between.
#[derive(Debug, Clone)]
pub struct CommandRunner {
    timeout: Duration,
    env_allowlist: Vec<String>,
}

impl CommandRunner {
    pub fn new(timeout: Duration, env_allowlist: Vec<String>) -> Self {
        Self {
            timeout,
            env_allowlist,
        }
    }

    /// Runs the backing program for an approved command. Every failure mode
    /// (missing program, launch failure, timeout, non-zero exit) converts to
    /// a structured result; nothing propagates to the HTTP worker.
    #[tracing::instrument(level = "info", skip_all, fields(command = %spec.name))]
    pub async fn execute(
        &self,
        spec: &CommandSpec,
        project_id: Option<&str>,
        args: &BTreeMap<String, String>,
    ) -> ExecutionResult {
        let audit_id = Uuid::new_v4().to_string();
        let started = Instant::now();

        let argv = match spec.build_args(project_id, args) {
            Ok(argv) => argv,
            Err(error) => {
                tracing::info!(%error, "argument validation rejected command invocation");
                return ExecutionResult::failure(audit_id, error.to_string(), elapsed_ms(started));
            }
        };

        // Absolute program paths are checked up front for a friendlier
        // message; bare names fall through to the spawn error.
        let program = Path::new(&spec.program);
        if program.is_absolute() && !program.exists() {
            tracing::warn!(program = %spec.program, "backing program missing");
            return ExecutionResult::failure(
                audit_id,
                format!("backing program for {} is not installed", spec.name),
                elapsed_ms(started),
            );
        }

        let mut cmd = Command::new(&spec.program);
        cmd.args(&argv)
            .env_clear()
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        for name in &self.env_allowlist {
            if let Ok(value) = std::env::var(name) {
                cmd.env(name, value);
            }
        }

        let output = match tokio::time::timeout(self.timeout, cmd.output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(error)) => {
                tracing::warn!(%error, program = %spec.program, "command launch failed");
                return ExecutionResult::failure(
                    audit_id,
                    format!("failed to launch {}: {error}", spec.name),
                    elapsed_ms(started),
                );
            }
            Err(_) => {
                tracing::warn!(
                    timeout_seconds = self.timeout.as_secs(),
                    program = %spec.program,
                    "command timed out"
                );
                let mut result = ExecutionResult::failure(
                    audit_id,
                    format!(
                        "{} timed out after {}s",
                        spec.name,
                        self.timeout.as_secs()
                    ),
                    elapsed_ms(started),
                );
                result.timed_out = true;
                return result;
            }
        };

        let exit_code = output.status.code();
        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        let mut combined = stdout.trim_end().to_string();
        if combined.is_empty() {
            combined = stderr.trim_end().to_string();
        }
        if combined.len() > OUTPUT_BYTES_MAX {
            combined.truncate(OUTPUT_BYTES_MAX);
        }

        let success = output.status.success();
        if !success && combined.is_empty() {
            combined = format!(
                "{} failed with exit code {}",
                spec.name,
                exit_code.unwrap_or(-1)
            );
        }

        ExecutionResult {
            audit_id,
            success,
            output: combined,
            exit_code,
            elapsed_ms: elapsed_ms(started),
            timed_out: false,
            detected_classification: None,
            filtered: false,
        }
    }
}

fn elapsed_ms(started: Instant) -> u64 {
    started.elapsed().as_millis() as u64
}
