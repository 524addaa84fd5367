//! Workflow definitions: YAML schema and project discovery.
//!
//! ```text
//! .cadence/workflows/**/*.yaml ──► WorkflowLoader ──► WorkflowDefinition
//!                                                          │
//!                                                   Workflow::compile
//!                                                          │
//!                                                     Interpreter::run
//! ```

pub mod loader;
pub mod schema;

pub use loader::{WorkflowEntry, WorkflowLoader};
pub use schema::{
    ForeachSpec, IntOrTemplate, LogLevel, OnError, OnExhausted, RangeSpec, RetrySpec,
    SharedCallSpec, SortOrder, StepSpec, ToolDefaults, ToolSpec, WhileSpec, WorkflowDefinition,
};
