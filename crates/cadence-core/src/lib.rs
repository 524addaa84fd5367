//! Cadence Core: a workflow orchestration engine.
//!
//! Runs declarative step lists (agent sessions, shell commands, variable
//! transforms and structured control flow) against a project directory.
//!
//! - `workflow`: YAML schema and project discovery
//! - `interpreter`: compilation, the step state machine and loops
//! - `context` / `condition`: variables, `{path}` templates and conditions
//! - `shared`: reusable step bundles resolved by reference
//! - `session`: panes, the completion callback listener and idle detection
//! - `tools`: the adapter seam for external tools

pub mod condition;
pub mod config;
pub mod context;
pub mod error;
pub mod interpreter;
pub mod session;
pub mod shared;
pub mod tools;
pub mod workflow;

// Convenience re-exports
pub use config::EngineConfig;
pub use context::VariableContext;
pub use error::EngineError;
pub use interpreter::{ExecutionContext, Interpreter, RunReport, StepStatus, Workflow};
pub use workflow::{WorkflowDefinition, WorkflowLoader};
