//! Engine configuration.
//!
//! Every knob has a default; `EngineConfig::from_env` overlays `CADENCE_*`
//! environment variables on top of those defaults.

use std::path::PathBuf;
use std::time::Duration;

/// Values longer than this many characters are externalized to a file when
/// interpolated into a prompt.
pub const EXTERNALIZE_THRESHOLD: usize = 10_000;

/// Default hard timeout for non-interactive commands (10 minutes).
pub const DEFAULT_COMMAND_TIMEOUT_SECS: u64 = 600;

/// Runtime configuration shared by one `Interpreter`.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Project root; relative `cwd` values and `project:` references resolve here.
    pub project_dir: PathBuf,
    /// First port probed for the completion callback listener.
    pub callback_port: u16,
    /// How many consecutive ports are probed before giving up.
    pub port_search_span: u16,
    /// Maximum shared step nesting depth.
    pub max_shared_depth: usize,
    pub externalize_threshold: usize,
    /// Hard timeout for plain subprocesses.
    pub command_timeout: Duration,
    /// Interval between pane captures in the idle watcher.
    pub idle_poll_interval: Duration,
    /// Pane content must stay unchanged this long to count as idle.
    pub idle_quiet_period: Duration,
    /// Agent CLI binary (interactive and headless).
    pub agent_command: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            project_dir: PathBuf::from("."),
            callback_port: 7890,
            port_search_span: 100,
            max_shared_depth: 10,
            externalize_threshold: EXTERNALIZE_THRESHOLD,
            command_timeout: Duration::from_secs(DEFAULT_COMMAND_TIMEOUT_SECS),
            idle_poll_interval: Duration::from_millis(2000),
            idle_quiet_period: Duration::from_secs(30),
            agent_command: "claude".to_string(),
        }
    }
}

impl EngineConfig {
    pub fn new(project_dir: impl Into<PathBuf>) -> Self {
        Self {
            project_dir: project_dir.into(),
            ..Self::default()
        }
    }

    /// Build a config for `project_dir`, reading overrides from the environment.
    pub fn from_env(project_dir: impl Into<PathBuf>) -> Self {
        let mut config = Self::new(project_dir);

        if let Some(port) = env_parse::<u16>("CADENCE_CALLBACK_PORT") {
            config.callback_port = port;
        }
        if let Some(depth) = env_parse::<usize>("CADENCE_MAX_SHARED_DEPTH") {
            config.max_shared_depth = depth;
        }
        if let Some(secs) = env_parse::<u64>("CADENCE_COMMAND_TIMEOUT_SECS") {
            config.command_timeout = Duration::from_secs(secs);
        }
        if let Some(ms) = env_parse::<u64>("CADENCE_IDLE_POLL_MS") {
            config.idle_poll_interval = Duration::from_millis(ms);
        }
        if let Some(secs) = env_parse::<u64>("CADENCE_IDLE_QUIET_SECS") {
            config.idle_quiet_period = Duration::from_secs(secs);
        }
        if let Ok(cmd) = std::env::var("CADENCE_AGENT_COMMAND") {
            if !cmd.trim().is_empty() {
                config.agent_command = cmd;
            }
        }

        config
    }

    pub fn with_callback_port(mut self, port: u16) -> Self {
        self.callback_port = port;
        self
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    match std::env::var(key) {
        Ok(raw) => match raw.trim().parse::<T>() {
            Ok(v) => Some(v),
            Err(_) => {
                tracing::warn!("[Config] Ignoring unparseable {}={:?}", key, raw);
                None
            }
        },
        Err(_) => None,
    }
}
