//! Core error type for the Cadence engine.
//!
//! `EngineError` covers the full lifecycle of a run:
//!
//! - load-time validation (always fatal, raised before any step executes)
//! - step execution failures (governed per step by `on_error`)
//! - loop exhaustion (governed per loop by `on_exhausted`)
//! - orchestration protocol failures (always fatal)

#[derive(Debug, Clone, thiserror::Error)]
pub enum EngineError {
    // ── Load time ──────────────────────────────────────────────────────────
    #[error("Parse error: {0}")]
    Parse(String),

    #[error("I/O error: {0}")]
    Io(String),

    #[error("Workflow not found: {0}")]
    WorkflowNotFound(String),

    #[error("Duplicate step name '{name}' in {scope}")]
    DuplicateStep { scope: String, name: String },

    #[error("Step '{step}' jumps to unknown step '{target}'")]
    UnknownJumpTarget { step: String, target: String },

    #[error("Step '{step}' signals {signal} outside of a loop body")]
    SignalOutsideLoop { step: String, signal: String },

    #[error("Invalid step '{step}': {reason}")]
    InvalidStep { step: String, reason: String },

    #[error("Step '{step}' uses unknown adapter '{adapter}'")]
    UnknownAdapter { step: String, adapter: String },

    #[error("Shared step not found: {0}")]
    SharedNotFound(String),

    #[error("Shared step '{shared}' is missing required input '{input}'")]
    MissingInput { shared: String, input: String },

    #[error("Shared step '{shared}' input '{input}' does not match its schema: {reason}")]
    SchemaMismatch {
        shared: String,
        input: String,
        reason: String,
    },

    #[error("Circular shared step reference: {}", chain.join(" -> "))]
    CircularReference { chain: Vec<String> },

    #[error("Shared step nesting depth {depth} exceeds the maximum of {max}")]
    DepthExceeded { depth: usize, max: usize },

    // ── Run time ───────────────────────────────────────────────────────────
    #[error("Step '{step}' failed: {message}")]
    StepFailed { step: String, message: String },

    #[error("Loop '{step}' exhausted: {detail}")]
    LoopExhausted { step: String, detail: String },

    // ── Orchestration protocol ────────────────────────────────────────────
    #[error("No free callback port in {start}..={end}")]
    PortExhausted { start: u16, end: u16 },

    #[error("Spawn error: {0}")]
    Spawn(String),

    #[error("Session error: {0}")]
    Session(String),
}

impl EngineError {
    /// Errors detected while compiling a workflow, before anything runs.
    pub fn is_load_time(&self) -> bool {
        matches!(
            self,
            EngineError::Parse(_)
                | EngineError::Io(_)
                | EngineError::WorkflowNotFound(_)
                | EngineError::DuplicateStep { .. }
                | EngineError::UnknownJumpTarget { .. }
                | EngineError::SignalOutsideLoop { .. }
                | EngineError::InvalidStep { .. }
                | EngineError::UnknownAdapter { .. }
                | EngineError::SharedNotFound(_)
                | EngineError::MissingInput { .. }
                | EngineError::SchemaMismatch { .. }
                | EngineError::CircularReference { .. }
                | EngineError::DepthExceeded { .. }
        )
    }

    /// Failures that a step's `on_error: continue` policy (or an enclosing
    /// retry loop) may absorb.
    pub fn is_step_failure(&self) -> bool {
        matches!(self, EngineError::StepFailed { .. })
    }

    pub(crate) fn step_failed(step: &str, message: impl Into<String>) -> Self {
        EngineError::StepFailed {
            step: step.to_string(),
            message: message.into(),
        }
    }

    /// The bare failure message, without the step prefix.
    pub fn message(&self) -> String {
        match self {
            EngineError::StepFailed { message, .. } => message.clone(),
            other => other.to_string(),
        }
    }
}

impl From<std::io::Error> for EngineError {
    fn from(e: std::io::Error) -> Self {
        EngineError::Io(e.to_string())
    }
}

impl From<serde_yaml::Error> for EngineError {
    fn from(e: serde_yaml::Error) -> Self {
        EngineError::Parse(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        let dup = EngineError::DuplicateStep {
            scope: "workflow 'x'".into(),
            name: "a".into(),
        };
        assert!(dup.is_load_time());
        assert!(!dup.is_step_failure());

        let failed = EngineError::step_failed("build", "exit code 2");
        assert!(failed.is_step_failure());
        assert!(!failed.is_load_time());
        assert_eq!(failed.message(), "exit code 2");

        let port = EngineError::PortExhausted { start: 7890, end: 7989 };
        assert!(!port.is_load_time());
        assert!(!port.is_step_failure());
    }

    #[test]
    fn test_circular_reference_message() {
        let err = EngineError::CircularReference {
            chain: vec!["project:a".into(), "project:b".into(), "project:a".into()],
        };
        assert_eq!(
            err.to_string(),
            "Circular shared step reference: project:a -> project:b -> project:a"
        );
    }
}
