//! Terminal pane drivers.
//!
//! The orchestrator only needs four operations from a terminal multiplexer:
//! open a pane running a command, read its visible text, ask whether the
//! process in it is still alive, and close it. `TmuxDriver` implements them
//! on top of the `tmux` CLI.

use std::path::PathBuf;

use async_trait::async_trait;
use tokio::process::Command;

use crate::error::EngineError;

/// What to launch in a new pane.
#[derive(Debug, Clone)]
pub struct PaneRequest {
    /// Shell command line
    pub command: String,
    pub cwd: PathBuf,
    /// Extra environment for the launched process
    pub env: Vec<(String, String)>,
}

#[async_trait]
pub trait PaneDriver: Send + Sync {
    /// Open a pane and return its identifier.
    async fn open(&self, request: &PaneRequest) -> Result<String, EngineError>;

    /// Visible text of the pane.
    async fn capture(&self, pane_id: &str) -> Result<String, EngineError>;

    /// Whether the process in the pane is still running.
    async fn is_alive(&self, pane_id: &str) -> Result<bool, EngineError>;

    async fn close(&self, pane_id: &str) -> Result<(), EngineError>;
}

/// Pane driver backed by the `tmux` CLI.
#[derive(Debug, Clone)]
pub struct TmuxDriver {
    binary: String,
}

impl Default for TmuxDriver {
    fn default() -> Self {
        Self {
            binary: "tmux".to_string(),
        }
    }
}

impl TmuxDriver {
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    async fn tmux(&self, args: &[String]) -> Result<String, EngineError> {
        let output = Command::new(&self.binary)
            .args(args)
            .output()
            .await
            .map_err(|e| {
                EngineError::Spawn(format!(
                    "Failed to run '{}' - is tmux installed? Error: {}",
                    self.binary, e
                ))
            })?;

        if !output.status.success() {
            return Err(EngineError::Session(format!(
                "tmux {} failed: {}",
                args.first().map(String::as_str).unwrap_or(""),
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }
}

#[async_trait]
impl PaneDriver for TmuxDriver {
    async fn open(&self, request: &PaneRequest) -> Result<String, EngineError> {
        let mut args: Vec<String> = vec![
            "split-window".into(),
            "-d".into(),
            "-P".into(),
            "-F".into(),
            "#{pane_id}".into(),
            "-c".into(),
            request.cwd.to_string_lossy().to_string(),
        ];
        for (key, value) in &request.env {
            args.push("-e".into());
            args.push(format!("{}={}", key, value));
        }
        args.push(request.command.clone());

        let pane_id = self.tmux(&args).await?.trim().to_string();
        if pane_id.is_empty() {
            return Err(EngineError::Session("tmux returned no pane id".to_string()));
        }

        // Keep the pane around after its process exits so the final
        // output can still be captured.
        self.tmux(&[
            "set-option".into(),
            "-p".into(),
            "-t".into(),
            pane_id.clone(),
            "remain-on-exit".into(),
            "on".into(),
        ])
        .await?;

        tracing::info!(
            "[Tmux] Opened pane {} (cwd: {})",
            pane_id,
            request.cwd.display()
        );
        Ok(pane_id)
    }

    async fn capture(&self, pane_id: &str) -> Result<String, EngineError> {
        self.tmux(&[
            "capture-pane".into(),
            "-p".into(),
            "-J".into(),
            "-t".into(),
            pane_id.to_string(),
        ])
        .await
    }

    async fn is_alive(&self, pane_id: &str) -> Result<bool, EngineError> {
        let dead = self
            .tmux(&[
                "display-message".into(),
                "-p".into(),
                "-t".into(),
                pane_id.to_string(),
                "#{pane_dead}".into(),
            ])
            .await?;
        Ok(dead.trim() != "1")
    }

    async fn close(&self, pane_id: &str) -> Result<(), EngineError> {
        self.tmux(&["kill-pane".into(), "-t".into(), pane_id.to_string()])
            .await
            .map(|_| ())
    }
}

/// Quote a string for POSIX `sh`.
pub fn shell_quote(s: &str) -> String {
    if !s.is_empty()
        && s
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./=:@%+,".contains(c))
    {
        return s.to_string();
    }
    format!("'{}'", s.replace('\'', r#"'\''"#))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shell_quote() {
        assert_eq!(shell_quote("plain-word"), "plain-word");
        assert_eq!(shell_quote("two words"), "'two words'");
        assert_eq!(shell_quote("it's"), r#"'it'\''s'"#);
        assert_eq!(shell_quote(""), "''");
    }

    #[tokio::test]
    async fn test_missing_tmux_binary_is_spawn_error() {
        let driver = TmuxDriver::new("/no/such/tmux");
        let err = driver.capture("%1").await.unwrap_err();
        assert!(matches!(err, EngineError::Spawn(_)));
    }
}
