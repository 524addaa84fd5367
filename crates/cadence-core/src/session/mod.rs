//! Process orchestration protocol.
//!
//! Interactive steps run inside a terminal pane. Once the pane is open the
//! interpreter is suspended on that single step until one of two sources
//! reports completion:
//!
//! ```text
//!            ┌──────────────────────────────┐
//!  pane ───► │ hook ─► POST /complete|exited│──┐
//!            └──────────────────────────────┘  │   tokio::select!
//!            ┌──────────────────────────────┐  ├──► first one wins,
//!  pane ───► │ idle watcher (sha256 of text)│──┘   the other is cancelled
//!            └──────────────────────────────┘
//! ```
//!
//! The final pane text becomes the step output and the pane is closed.
//! Non-interactive commands bypass all of this and run through
//! [`subprocess::run_command`] with a hard timeout.

pub mod callback;
pub mod pane;
pub mod subprocess;

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use sha2::{Digest, Sha256};
use tokio::time::Instant;

use crate::config::EngineConfig;
use crate::error::EngineError;

pub use callback::{CallbackServer, CompletionSignal};
pub use pane::{shell_quote, PaneDriver, PaneRequest, TmuxDriver};
pub use subprocess::{run_command, run_shell, CommandOutput};

/// Environment variable carrying the callback port into spawned sessions.
pub const PORT_ENV: &str = "CADENCE_CALLBACK_PORT";
pub const TOKEN_ENV: &str = "CADENCE_CALLBACK_TOKEN";
pub const URL_ENV: &str = "CADENCE_CALLBACK_URL";

/// How an interactive session was judged complete.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CompletionSource {
    /// The tool's completion hook fired
    Hook,
    /// The session-end hook fired, or the pane process died
    Exited,
    /// Pane content stopped changing for the quiet period
    Idle,
}

impl From<CompletionSignal> for CompletionSource {
    fn from(signal: CompletionSignal) -> Self {
        match signal {
            CompletionSignal::Complete => CompletionSource::Hook,
            CompletionSignal::Exited => CompletionSource::Exited,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SessionOutcome {
    pub pane_id: String,
    pub output: String,
    pub completion: CompletionSource,
}

/// Runs interactive sessions for one workflow run.
pub struct SessionOrchestrator {
    driver: Arc<dyn PaneDriver>,
    callbacks: CallbackServer,
    poll_interval: Duration,
    quiet_period: Duration,
}

impl SessionOrchestrator {
    /// Start the callback listener on a free port.
    pub async fn start(
        driver: Arc<dyn PaneDriver>,
        config: &EngineConfig,
    ) -> Result<Self, EngineError> {
        let callbacks = CallbackServer::start(config.callback_port, config.port_search_span).await?;
        Ok(Self {
            driver,
            callbacks,
            poll_interval: config.idle_poll_interval,
            quiet_period: config.idle_quiet_period,
        })
    }

    pub fn callback_port(&self) -> u16 {
        self.callbacks.port()
    }

    pub fn callbacks(&self) -> &CallbackServer {
        &self.callbacks
    }

    /// Environment handed to every spawned session.
    pub fn session_env(&self) -> Vec<(String, String)> {
        vec![
            (PORT_ENV.to_string(), self.callbacks.port().to_string()),
            (TOKEN_ENV.to_string(), self.callbacks.token().to_string()),
            (URL_ENV.to_string(), self.callbacks.url()),
        ]
    }

    /// Open a pane running `command`, wait for completion, capture, close.
    pub async fn run_interactive(
        &self,
        command: &str,
        cwd: &Path,
    ) -> Result<SessionOutcome, EngineError> {
        let request = PaneRequest {
            command: command.to_string(),
            cwd: cwd.to_path_buf(),
            env: self.session_env(),
        };
        let pane_id = self.driver.open(&request).await?;
        tracing::info!("[Session] Waiting on pane {}", pane_id);

        let waited = self.wait_for_completion(&pane_id).await;
        let captured = match &waited {
            Ok(_) => self.driver.capture(&pane_id).await,
            Err(_) => Ok(String::new()),
        };

        self.callbacks.unregister(&pane_id).await;
        if let Err(e) = self.driver.close(&pane_id).await {
            tracing::warn!("[Session] Failed to close pane {}: {}", pane_id, e);
        }

        let completion = waited?;
        let output = captured?;
        tracing::info!(
            "[Session] Pane {} finished ({:?}, {} chars)",
            pane_id,
            completion,
            output.len()
        );
        Ok(SessionOutcome {
            pane_id,
            output: output.trim_end().to_string(),
            completion,
        })
    }

    async fn wait_for_completion(&self, pane_id: &str) -> Result<CompletionSource, EngineError> {
        let hook = self.callbacks.register(pane_id).await;
        let mut watcher = tokio::spawn(watch_idle(
            self.driver.clone(),
            pane_id.to_string(),
            self.poll_interval,
            self.quiet_period,
        ));

        let result = tokio::select! {
            signal = hook => match signal {
                Ok(signal) => Ok(signal.into()),
                // listener went away; the watcher is the only source left
                Err(_) => join_watcher((&mut watcher).await),
            },
            joined = &mut watcher => join_watcher(joined),
        };
        watcher.abort();
        result
    }
}

fn join_watcher(
    joined: Result<Result<CompletionSource, EngineError>, tokio::task::JoinError>,
) -> Result<CompletionSource, EngineError> {
    joined.map_err(|e| EngineError::Session(format!("Idle watcher failed: {}", e)))?
}

/// Poll the pane until its content is unchanged for `quiet` or its process dies.
async fn watch_idle(
    driver: Arc<dyn PaneDriver>,
    pane_id: String,
    poll: Duration,
    quiet: Duration,
) -> Result<CompletionSource, EngineError> {
    let mut last_digest: Option<Vec<u8>> = None;
    let mut last_change = Instant::now();

    loop {
        tokio::time::sleep(poll).await;

        if !driver.is_alive(&pane_id).await? {
            return Ok(CompletionSource::Exited);
        }

        let text = driver.capture(&pane_id).await?;
        let digest = Sha256::digest(text.as_bytes()).to_vec();
        if last_digest.as_ref() != Some(&digest) {
            last_digest = Some(digest);
            last_change = Instant::now();
        } else if last_change.elapsed() >= quiet {
            tracing::info!(
                "[Session] Pane {} idle for {}ms",
                pane_id,
                last_change.elapsed().as_millis()
            );
            return Ok(CompletionSource::Idle);
        }
    }
}
