//! Plain subprocess execution with a hard wall-clock timeout.
//!
//! Used for non-interactive commands and headless agent prompts. Success is
//! decided by the exit code alone.

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use tokio::process::Command;

use crate::error::EngineError;

/// Captured result of a finished (or timed out) subprocess.
#[derive(Debug, Clone, Default)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: Option<i32>,
    pub timed_out: bool,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        !self.timed_out && self.exit_code == Some(0)
    }

    /// Message describing a failed run, preferring stderr.
    pub fn failure_message(&self, timeout: Duration) -> String {
        if self.timed_out {
            return format!("timed out after {}s", timeout.as_secs());
        }
        let detail = if self.stderr.trim().is_empty() {
            self.stdout.trim()
        } else {
            self.stderr.trim()
        };
        match self.exit_code {
            Some(code) if detail.is_empty() => format!("exit code {}", code),
            Some(code) => format!("exit code {}: {}", code, detail),
            None if detail.is_empty() => "terminated by signal".to_string(),
            None => format!("terminated by signal: {}", detail),
        }
    }
}

/// Run `program args…` in `cwd`, killing it if it outlives `timeout`.
///
/// A spawn failure is a fatal `EngineError::Spawn`; a timeout or non-zero
/// exit is reported through `CommandOutput` for the caller to judge.
pub async fn run_command(
    program: &str,
    args: &[String],
    cwd: &Path,
    env: &[(String, String)],
    timeout: Duration,
) -> Result<CommandOutput, EngineError> {
    let mut cmd = Command::new(program);
    cmd.args(args)
        .current_dir(cwd)
        .envs(env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    tracing::debug!(
        "[Subprocess] Running: {} ({} args, cwd: {}, timeout: {}s)",
        program,
        args.len(),
        cwd.display(),
        timeout.as_secs()
    );

    let child = cmd.spawn().map_err(|e| {
        EngineError::Spawn(format!(
            "Failed to spawn '{}' in '{}': {}",
            program,
            cwd.display(),
            e
        ))
    })?;

    match tokio::time::timeout(timeout, child.wait_with_output()).await {
        Ok(Ok(output)) => Ok(CommandOutput {
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            exit_code: output.status.code(),
            timed_out: false,
        }),
        Ok(Err(e)) => Err(EngineError::Spawn(format!(
            "Failed to wait for '{}': {}",
            program, e
        ))),
        Err(_) => {
            tracing::warn!(
                "[Subprocess] '{}' exceeded {}s timeout, killed",
                program,
                timeout.as_secs()
            );
            Ok(CommandOutput {
                timed_out: true,
                ..CommandOutput::default()
            })
        }
    }
}

/// Run a shell command line through `sh -c`.
pub async fn run_shell(
    command: &str,
    cwd: &Path,
    env: &[(String, String)],
    timeout: Duration,
) -> Result<CommandOutput, EngineError> {
    run_command("sh", &["-c".to_string(), command.to_string()], cwd, env, timeout).await
}
