//! YAML schema types for workflow definitions.
//!
//! A workflow YAML defines an ordered step list run against a project:
//!
//! ```yaml
//! name: "Triage"
//! description: "Summarize open issues and retry flaky checks"
//! version: "1.0"
//!
//! variables:
//!   repo: "cadence"
//!
//! defaults:
//!   model: "sonnet"
//!   permission_mode: "acceptEdits"
//!
//! steps:
//!   - name: list
//!     tool: bash
//!     command: "git log --oneline -n 5"
//!     output_var: commits
//!
//!   - name: each-commit
//!     tool: foreach
//!     items: "{commits}"
//!     steps:
//!       - name: explain
//!         tool: prompt
//!         prompt: "Explain commit {item}"
//!         on_error: continue
//!
//!   - name: checks
//!     tool: retry
//!     max_attempts: 3
//!     delay_ms: 500
//!     steps:
//!       - name: test
//!         tool: bash
//!         command: "make test"
//! ```

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::EngineError;

/// Top-level workflow definition loaded from a YAML file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    /// Workflow name
    pub name: String,

    /// Optional description
    #[serde(default)]
    pub description: Option<String>,

    /// Version string
    #[serde(default = "default_version")]
    pub version: String,

    /// Initial variable bindings
    #[serde(default)]
    pub variables: BTreeMap<String, Value>,

    /// Tool-wide defaults (model, permission policy, visibility)
    #[serde(default)]
    pub defaults: ToolDefaults,

    /// Ordered list of workflow steps
    pub steps: Vec<StepSpec>,
}

fn default_version() -> String {
    "1.0".to_string()
}

/// Defaults applied to every step that does not override them.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ToolDefaults {
    /// Model passed to agent tools
    #[serde(default)]
    pub model: Option<String>,

    /// Permission mode: "bypassPermissions" | "acceptEdits" | "plan" | "default"
    #[serde(default)]
    pub permission_mode: Option<String>,

    /// Whether commands run in a visible pane by default
    #[serde(default)]
    pub visible: bool,
}

/// What to do when a step fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum OnError {
    /// Halt the run (default)
    #[default]
    Stop,
    /// Record the failure in `last_step_error` and advance
    Continue,
}

/// What to do when a while/retry loop runs out of passes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum OnExhausted {
    /// Halt the run (default)
    #[default]
    Error,
    /// Log and proceed past the loop
    Continue,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SortOrder {
    #[default]
    Asc,
    Desc,
}

/// An integer that may also be given as a `{var}` template.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum IntOrTemplate {
    Int(i64),
    Template(String),
}

/// A single step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepSpec {
    /// Step name (unique within its own step list)
    pub name: String,

    /// Condition: only run this step if the expression evaluates to true
    #[serde(default)]
    pub when: Option<String>,

    /// Failure policy
    #[serde(default, alias = "onError")]
    pub on_error: OnError,

    /// Variable receiving the step output
    #[serde(default, alias = "outputVar")]
    pub output_var: Option<String>,

    /// Run in a visible pane (falls back to `defaults.visible`)
    #[serde(default)]
    pub visible: Option<bool>,

    /// Working directory (relative paths resolve against the project)
    #[serde(default)]
    pub cwd: Option<String>,

    /// Model override for agent tools
    #[serde(default)]
    pub model: Option<String>,

    /// The tool and its parameters
    #[serde(flatten)]
    pub tool: ToolSpec,
}

/// Every tool a step may use. The tag is the step's `tool` field.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "tool", rename_all = "snake_case")]
pub enum ToolSpec {
    /// Shell command (plain subprocess, or an interactive pane when visible)
    Bash {
        command: String,
        #[serde(default)]
        timeout_secs: Option<u64>,
    },
    /// Interactive agent session in a pane
    Agent { prompt: String },
    /// Headless agent invocation
    Prompt { prompt: String },
    /// Bind a variable
    Set {
        var: String,
        value: Value,
        #[serde(default)]
        parse_json: bool,
    },
    /// Emit a log line
    Log {
        message: String,
        #[serde(default)]
        level: LogLevel,
    },
    /// Jump to a named step in the same list
    Goto { target: String },
    /// Leave the innermost loop
    Break,
    /// Skip to the next pass of the innermost loop
    Continue,
    /// Iterate over a collection
    Foreach(ForeachSpec),
    /// Loop while a condition holds
    While(WhileSpec),
    /// Counted loop
    Range(RangeSpec),
    /// Re-run a body until it succeeds
    Retry(RetrySpec),
    /// Invoke a shared step bundle
    Shared(SharedCallSpec),
    /// Dispatch to a registered external adapter
    Adapter {
        adapter: String,
        #[serde(default)]
        params: Value,
    },
}

impl ToolSpec {
    pub fn kind(&self) -> &'static str {
        match self {
            ToolSpec::Bash { .. } => "bash",
            ToolSpec::Agent { .. } => "agent",
            ToolSpec::Prompt { .. } => "prompt",
            ToolSpec::Set { .. } => "set",
            ToolSpec::Log { .. } => "log",
            ToolSpec::Goto { .. } => "goto",
            ToolSpec::Break => "break",
            ToolSpec::Continue => "continue",
            ToolSpec::Foreach(_) => "foreach",
            ToolSpec::While(_) => "while",
            ToolSpec::Range(_) => "range",
            ToolSpec::Retry(_) => "retry",
            ToolSpec::Shared(_) => "shared",
            ToolSpec::Adapter { .. } => "adapter",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForeachSpec {
    /// A YAML list, or a template resolving to a JSON array / lines of text
    pub items: Value,
    #[serde(default = "default_item_var")]
    pub item_var: String,
    #[serde(default = "default_index_var")]
    pub index_var: String,
    /// Keep only items for which this condition holds
    #[serde(default)]
    pub filter: Option<String>,
    /// Path inside each item to sort by (`.` for the item itself)
    #[serde(default)]
    pub sort_by: Option<String>,
    #[serde(default)]
    pub sort_order: SortOrder,
    /// Stop after the element for which this condition becomes true
    #[serde(default)]
    pub until: Option<String>,
    pub steps: Vec<StepSpec>,
}

fn default_item_var() -> String {
    "item".to_string()
}

fn default_index_var() -> String {
    "index".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WhileSpec {
    pub condition: String,
    #[serde(default = "default_max_iterations")]
    pub max_iterations: u32,
    #[serde(default = "default_counter_var")]
    pub counter_var: String,
    #[serde(default)]
    pub on_exhausted: OnExhausted,
    pub steps: Vec<StepSpec>,
}

fn default_max_iterations() -> u32 {
    100
}

fn default_counter_var() -> String {
    "iteration".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RangeSpec {
    pub from: IntOrTemplate,
    pub to: IntOrTemplate,
    #[serde(default = "default_range_step")]
    pub step: i64,
    #[serde(default = "default_range_var")]
    pub var: String,
    pub steps: Vec<StepSpec>,
}

fn default_range_step() -> i64 {
    1
}

fn default_range_var() -> String {
    "i".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrySpec {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default)]
    pub delay_ms: u64,
    /// Success condition; absent means "body finished without failure"
    #[serde(default)]
    pub until: Option<String>,
    #[serde(default = "default_attempt_var")]
    pub attempt_var: String,
    #[serde(default)]
    pub on_exhausted: OnExhausted,
    pub steps: Vec<StepSpec>,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_attempt_var() -> String {
    "attempt".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SharedCallSpec {
    /// Reference: `builtin:<name>`, `project:<name>`, `./relative.yaml` or a bare name
    pub uses: String,
    #[serde(default)]
    pub inputs: BTreeMap<String, Value>,
    /// caller variable -> exposed output name
    #[serde(default)]
    pub outputs: BTreeMap<String, String>,
}

impl WorkflowDefinition {
    /// Parse a workflow definition from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self, EngineError> {
        serde_yaml::from_str(yaml)
            .map_err(|e| EngineError::Parse(format!("Failed to parse workflow YAML: {}", e)))
    }

    /// Load a workflow definition from a file path.
    pub fn from_file(path: impl AsRef<std::path::Path>) -> Result<Self, EngineError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            EngineError::Io(format!("Failed to read workflow file '{}': {}", path.display(), e))
        })?;
        Self::from_yaml(&content)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_minimal_workflow() {
        let yaml = r#"
name: "Test Flow"
steps:
  - name: hello
    tool: bash
    command: "echo hi"
"#;
        let wf = WorkflowDefinition::from_yaml(yaml).unwrap();
        assert_eq!(wf.name, "Test Flow");
        assert_eq!(wf.version, "1.0");
        assert_eq!(wf.steps.len(), 1);
        assert_eq!(wf.steps[0].on_error, OnError::Stop);
        assert!(matches!(wf.steps[0].tool, ToolSpec::Bash { ref command, .. } if command == "echo hi"));
    }

    #[test]
    fn test_parse_full_workflow() {
        let yaml = r#"
name: "Loops"
variables:
  limit: 3
  names: ["a", "b"]
defaults:
  model: "sonnet"
  visible: true
steps:
  - name: each
    tool: foreach
    items: "{names}"
    sort_by: "."
    sort_order: desc
    steps:
      - name: say
        tool: log
        message: "{item}"
        level: warn
  - name: count
    tool: range
    from: 5
    to: "{limit}"
    step: -1
    steps:
      - name: stop-early
        tool: break
        when: "{i} == 4"
  - name: flaky
    tool: retry
    max_attempts: 4
    onError: continue
    outputVar: flaky_result
    steps:
      - name: run
        tool: bash
        command: "true"
  - name: poll
    tool: while
    condition: "{done} is empty"
    max_iterations: 10
    on_exhausted: continue
    steps:
      - name: mark
        tool: set
        var: done
        value: "yes"
  - name: summarize
    tool: shared
    uses: "builtin:shell-capture"
    inputs:
      command: "ls"
    outputs:
      listing: output
"#;
        let wf = WorkflowDefinition::from_yaml(yaml).unwrap();
        assert_eq!(wf.defaults.model.as_deref(), Some("sonnet"));
        assert!(wf.defaults.visible);
        assert_eq!(wf.variables["limit"], serde_json::json!(3));

        match &wf.steps[0].tool {
            ToolSpec::Foreach(spec) => {
                assert_eq!(spec.item_var, "item");
                assert_eq!(spec.sort_order, SortOrder::Desc);
                assert_eq!(spec.steps.len(), 1);
            }
            other => panic!("unexpected tool {}", other.kind()),
        }
        match &wf.steps[1].tool {
            ToolSpec::Range(spec) => {
                assert_eq!(spec.from, IntOrTemplate::Int(5));
                assert_eq!(spec.to, IntOrTemplate::Template("{limit}".into()));
                assert_eq!(spec.step, -1);
                assert!(matches!(spec.steps[0].tool, ToolSpec::Break));
            }
            other => panic!("unexpected tool {}", other.kind()),
        }
        assert_eq!(wf.steps[2].on_error, OnError::Continue);
        assert_eq!(wf.steps[2].output_var.as_deref(), Some("flaky_result"));
        match &wf.steps[3].tool {
            ToolSpec::While(spec) => assert_eq!(spec.on_exhausted, OnExhausted::Continue),
            other => panic!("unexpected tool {}", other.kind()),
        }
        assert_eq!(wf.steps[4].tool.kind(), "shared");
    }

    #[test]
    fn test_unknown_tool_is_parse_error() {
        let yaml = r#"
name: "Bad"
steps:
  - name: x
    tool: teleport
"#;
        let err = WorkflowDefinition::from_yaml(yaml).unwrap_err();
        assert!(matches!(err, EngineError::Parse(_)));
    }
}
