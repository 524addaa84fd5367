//! Step interpreter.
//!
//! Walks a compiled [`Workflow`] one step at a time against a single
//! [`ExecutionContext`]. Per step `i`:
//!
//! ```text
//! Ready(i) ──when false──► Skipped(i) ──► i+1
//!    │
//!    └──► Running(i) ──ok──► capture output_var ──► signal? return to loop
//!              │                                   goto?   jump by name
//!              │                                   else    i+1
//!              └──fail──► on_error: continue ──► last_step_error, i+1
//!                         on_error: stop     ──► Errored(i), halt
//! ```
//!
//! Loops live in [`loops`], shared steps are run inline on the caller's
//! context, and interactive steps go through the session orchestrator, which
//! is started on first use.

pub mod compile;
pub mod loops;

use std::fmt;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::EngineConfig;
use crate::context::{value_to_string, Externalizer, VariableContext};
use crate::error::EngineError;
use crate::session::{run_command, run_shell, shell_quote, PaneDriver, SessionOrchestrator, TmuxDriver};
use crate::shared::{self, SharedInvocation, SharedResolver};
use crate::tools::{AdapterCall, AdapterRegistry};
use crate::workflow::{LogLevel, OnError, ToolDefaults, WorkflowDefinition};

pub use compile::{Action, AdapterHandle, Block, CompiledStep, Workflow};

/// Reserved variable holding the message of the last demoted failure.
pub const LAST_STEP_ERROR: &str = "last_step_error";

/// Variable a shared step body reads its inputs from.
pub const SHARED_INPUTS: &str = "inputs";

/// Loop control signal raised by `break` / `continue` steps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Signal {
    #[default]
    None,
    Break,
    Continue,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoopKind {
    Iteration,
    While,
    Range,
    Retry,
}

/// Prior value of a loop variable, restored when the loop exits.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SavedBinding {
    pub name: String,
    /// `None` when the variable did not exist before the loop
    pub value: Option<Value>,
}

/// Runtime record of one active loop.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoopFrame {
    pub kind: LoopKind,
    /// Name of the loop step
    pub step: String,
    /// Index of the loop step in its block
    pub entry_index: usize,
    /// 0-based pass number
    pub cursor: usize,
    /// Number of passes, when known up front
    pub total: Option<usize>,
    pub saved: Vec<SavedBinding>,
}

/// The live state of one run. Serializable, so a run can be snapshotted.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutionContext {
    pub variables: VariableContext,
    pub current_step_index: usize,
    pub loop_stack: Vec<LoopFrame>,
    pub signal: Signal,
    pub completed: bool,
    pub error: Option<String>,
    pub goto_target: Option<String>,
}

impl ExecutionContext {
    pub fn new(variables: VariableContext) -> Self {
        Self {
            variables,
            ..Self::default()
        }
    }

    /// Push a loop frame, saving the current values of `names`.
    pub fn enter_loop(&mut self, kind: LoopKind, step: &str, entry_index: usize, names: &[&str]) {
        let saved = names
            .iter()
            .map(|name| SavedBinding {
                name: name.to_string(),
                value: self.variables.get(name).cloned(),
            })
            .collect();
        self.loop_stack.push(LoopFrame {
            kind,
            step: step.to_string(),
            entry_index,
            cursor: 0,
            total: None,
            saved,
        });
    }

    /// Pop the innermost loop frame and restore its saved variables.
    pub fn exit_loop(&mut self) {
        let Some(frame) = self.loop_stack.pop() else {
            return;
        };
        // reverse order, so a name saved twice ends with its oldest value
        for binding in frame.saved.into_iter().rev() {
            match binding.value {
                Some(value) => self.variables.set(binding.name, value),
                None => {
                    self.variables.remove(&binding.name);
                }
            }
        }
        self.signal = Signal::None;
    }

    pub fn set_cursor(&mut self, cursor: usize) {
        if let Some(frame) = self.loop_stack.last_mut() {
            frame.cursor = cursor;
        }
    }

    pub fn set_total(&mut self, total: usize) {
        if let Some(frame) = self.loop_stack.last_mut() {
            frame.total = Some(total);
        }
    }

    /// Take the pending signal, leaving `Signal::None`.
    pub fn take_signal(&mut self) -> Signal {
        std::mem::take(&mut self.signal)
    }
}

/// Interpreter state transitions, reported through tracing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepState {
    Ready(usize),
    Skipped(usize),
    Running(usize),
    Errored(usize),
    Completed,
}

impl fmt::Display for StepState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StepState::Ready(i) => write!(f, "Ready({})", i),
            StepState::Skipped(i) => write!(f, "Skipped({})", i),
            StepState::Running(i) => write!(f, "Running({})", i),
            StepState::Errored(i) => write!(f, "Errored({})", i),
            StepState::Completed => write!(f, "Completed"),
        }
    }
}

fn transition(path: &str, state: StepState) {
    match state {
        StepState::Running(_) => tracing::info!("[Interpreter] {} -> {}", path, state),
        StepState::Errored(_) => tracing::warn!("[Interpreter] {} -> {}", path, state),
        _ => tracing::debug!("[Interpreter] {} -> {}", path, state),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Skipped,
    Succeeded,
    Failed,
}

/// Result of one executed (or skipped) step.
#[derive(Debug, Clone, Serialize)]
pub struct StepRecord {
    /// Slash-joined path for nested steps, e.g. `each/summarize`
    pub step_name: String,
    pub status: StepStatus,
    pub output_preview: String,
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl StepRecord {
    fn new(path: &str, status: StepStatus, started_at: DateTime<Utc>) -> Self {
        Self {
            step_name: path.to_string(),
            status,
            output_preview: String::new(),
            error: None,
            started_at,
            finished_at: Utc::now(),
        }
    }
}

/// Result of executing an entire workflow.
#[derive(Debug, Clone)]
pub struct RunReport {
    pub workflow_name: String,
    pub steps: Vec<StepRecord>,
    pub success: bool,
    pub failure: Option<EngineError>,
    pub context: ExecutionContext,
}

impl RunReport {
    pub fn records_for(&self, path: &str) -> impl Iterator<Item = &StepRecord> {
        let path = path.to_string();
        self.steps.iter().filter(move |r| r.step_name == path)
    }
}

/// Per-run mutable state handed down through dispatch.
pub(crate) struct RunState {
    pub(crate) ctx: ExecutionContext,
    pub(crate) records: Vec<StepRecord>,
    pub(crate) defaults: ToolDefaults,
    pub(crate) externalizer: Externalizer,
    /// Callback listener and pane race, started by the first interactive step
    pub(crate) sessions: Option<SessionOrchestrator>,
}

type BlockFuture<'a> = Pin<Box<dyn Future<Output = Result<(), EngineError>> + Send + 'a>>;

/// The workflow interpreter.
pub struct Interpreter {
    config: EngineConfig,
    adapters: AdapterRegistry,
    resolver: SharedResolver,
    pane_driver: Arc<dyn PaneDriver>,
}

impl Interpreter {
    pub fn new(config: EngineConfig) -> Self {
        let resolver = SharedResolver::new(config.project_dir.clone());
        Self {
            config,
            adapters: AdapterRegistry::new(),
            resolver,
            pane_driver: Arc::new(TmuxDriver::default()),
        }
    }

    pub fn with_adapters(mut self, adapters: AdapterRegistry) -> Self {
        self.adapters = adapters;
        self
    }

    pub fn with_pane_driver(mut self, driver: Arc<dyn PaneDriver>) -> Self {
        self.pane_driver = driver;
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn adapters(&self) -> &AdapterRegistry {
        &self.adapters
    }

    /// Validate and compile a definition. Nothing runs.
    pub fn compile(
        &mut self,
        definition: WorkflowDefinition,
        source: Option<&Path>,
    ) -> Result<Workflow, EngineError> {
        Workflow::compile(
            definition,
            source,
            &self.adapters,
            &mut self.resolver,
            self.config.max_shared_depth,
        )
    }

    /// Load and compile a workflow file.
    pub fn load(&mut self, path: &Path) -> Result<Workflow, EngineError> {
        let definition = WorkflowDefinition::from_file(path)?;
        self.compile(definition, Some(path))
    }

    pub async fn run(&self, workflow: &Workflow) -> Result<RunReport, EngineError> {
        self.run_with_variables(workflow, Vec::new()).await
    }

    /// Run with extra bindings layered over the workflow's own variables.
    ///
    /// Step failures do not surface as `Err`; they end the run and are
    /// reported through `RunReport::failure` and `context.error`. `Err` is
    /// only returned when the run could not be set up.
    ///
    /// Each run owns its callback listener and token, so concurrent runs on
    /// one interpreter do not share completion signals.
    pub async fn run_with_variables<I>(
        &self,
        workflow: &Workflow,
        overrides: I,
    ) -> Result<RunReport, EngineError>
    where
        I: IntoIterator<Item = (String, Value)>,
    {
        let mut variables = VariableContext::from_bindings(workflow.variables.clone());
        for (name, value) in overrides {
            variables.set(name, value);
        }

        let mut run = RunState {
            ctx: ExecutionContext::new(variables),
            records: Vec::new(),
            defaults: workflow.defaults.clone(),
            externalizer: Externalizer::new(self.config.externalize_threshold)?,
            sessions: None,
        };

        tracing::info!(
            "[Interpreter] Running workflow '{}' ({} steps)",
            workflow.name,
            workflow.body.len()
        );

        let failure = match self.run_block(&workflow.body, &mut run, "").await {
            Ok(()) => {
                run.ctx.completed = true;
                transition(&workflow.name, StepState::Completed);
                None
            }
            Err(e) => {
                tracing::error!("[Interpreter] Workflow '{}' halted: {}", workflow.name, e);
                run.ctx.error = Some(e.to_string());
                Some(e)
            }
        };

        Ok(RunReport {
            workflow_name: workflow.name.clone(),
            success: failure.is_none(),
            failure,
            steps: run.records,
            context: run.ctx,
        })
    }

    /// Execute `block` until it ends, raises a loop signal, or fails.
    pub(crate) fn run_block<'a>(
        &'a self,
        block: &'a Block,
        run: &'a mut RunState,
        scope: &'a str,
    ) -> BlockFuture<'a> {
        Box::pin(async move {
            let mut i = 0;
            while i < block.len() {
                let step = &block.steps[i];
                let path = step_path(scope, &step.name);
                run.ctx.current_step_index = i;
                transition(&path, StepState::Ready(i));

                if let Some(when) = &step.when {
                    if !crate::condition::evaluate(when, &run.ctx.variables) {
                        transition(&path, StepState::Skipped(i));
                        run.records
                            .push(StepRecord::new(&path, StepStatus::Skipped, Utc::now()));
                        i += 1;
                        continue;
                    }
                }

                transition(&path, StepState::Running(i));
                let started_at = Utc::now();
                match self.dispatch(step, i, run, &path).await {
                    Ok(output) => {
                        let mut record = StepRecord::new(&path, StepStatus::Succeeded, started_at);
                        record.output_preview = truncate(&value_to_string(&output), 200);
                        run.records.push(record);
                        if let Some(var) = &step.output_var {
                            run.ctx.variables.set(var.clone(), output);
                        }
                    }
                    Err(e) if e.is_step_failure() && step.on_error == OnError::Continue => {
                        tracing::warn!("[Interpreter] {} failed, continuing: {}", path, e);
                        let mut record = StepRecord::new(&path, StepStatus::Failed, started_at);
                        record.error = Some(e.message());
                        run.records.push(record);
                        run.ctx.variables.set(LAST_STEP_ERROR, e.message());
                    }
                    Err(e) => {
                        transition(&path, StepState::Errored(i));
                        let mut record = StepRecord::new(&path, StepStatus::Failed, started_at);
                        record.error = Some(e.to_string());
                        run.records.push(record);
                        return Err(e);
                    }
                }

                if run.ctx.signal != Signal::None {
                    return Ok(());
                }
                if let Some(target) = run.ctx.goto_target.take() {
                    let Some(j) = block.position(&target) else {
                        return Err(EngineError::UnknownJumpTarget {
                            step: step.name.clone(),
                            target,
                        });
                    };
                    tracing::debug!("[Interpreter] {} jumps to '{}' ({})", path, target, j);
                    i = j;
                    continue;
                }
                i += 1;
            }
            Ok(())
        })
    }

    async fn dispatch(
        &self,
        step: &CompiledStep,
        index: usize,
        run: &mut RunState,
        path: &str,
    ) -> Result<Value, EngineError> {
        match &step.action {
            Action::Bash { command, timeout } => self.run_bash(step, command, *timeout, run).await,
            Action::Agent { prompt } => self.run_agent(step, prompt, run).await,
            Action::Prompt { prompt } => self.run_prompt(step, prompt, run).await,
            Action::Set {
                var,
                value,
                parse_json,
            } => set_variable(step, var, value, *parse_json, &mut run.ctx.variables),
            Action::Log { message, level } => {
                let text = run.ctx.variables.interpolate(message);
                match level {
                    LogLevel::Debug => tracing::debug!("[Workflow] {}: {}", path, text),
                    LogLevel::Info => tracing::info!("[Workflow] {}: {}", path, text),
                    LogLevel::Warn => tracing::warn!("[Workflow] {}: {}", path, text),
                    LogLevel::Error => tracing::error!("[Workflow] {}: {}", path, text),
                }
                Ok(Value::String(text))
            }
            Action::Goto { target } => {
                run.ctx.goto_target = Some(target.clone());
                Ok(Value::Null)
            }
            Action::Break => {
                run.ctx.signal = Signal::Break;
                Ok(Value::Null)
            }
            Action::Continue => {
                run.ctx.signal = Signal::Continue;
                Ok(Value::Null)
            }
            Action::Foreach(spec, body) => self.run_foreach(step, index, spec, body, run, path).await,
            Action::While(spec, body) => self.run_while(step, index, spec, body, run, path).await,
            Action::Range(spec, body) => self.run_range(step, index, spec, body, run, path).await,
            Action::Retry(spec, body) => self.run_retry(step, index, spec, body, run, path).await,
            Action::Shared(invocation) => self.run_shared(step, invocation, run, path).await,
            Action::Adapter(handle, params) => {
                let call = AdapterCall {
                    step: step.name.clone(),
                    params: run.ctx.variables.interpolate_value(params),
                    cwd: self.resolve_cwd(step, &run.ctx.variables),
                };
                tracing::debug!("[Interpreter] {} -> adapter '{}'", path, handle.name);
                handle
                    .adapter
                    .invoke(call, &mut run.ctx.variables)
                    .await
                    .map_err(|message| EngineError::step_failed(&step.name, message))
            }
        }
    }

    async fn run_bash(
        &self,
        step: &CompiledStep,
        command: &str,
        timeout: Option<Duration>,
        run: &mut RunState,
    ) -> Result<Value, EngineError> {
        let command = run.ctx.variables.interpolate(command);
        let cwd = self.resolve_cwd(step, &run.ctx.variables);

        if step.visible.unwrap_or(run.defaults.visible) {
            let outcome = self.sessions(run).await?.run_interactive(&command, &cwd).await?;
            return Ok(Value::String(outcome.output));
        }

        let timeout = timeout.unwrap_or(self.config.command_timeout);
        let output = run_shell(&command, &cwd, &[], timeout).await?;
        if output.success() {
            Ok(Value::String(output.stdout.trim().to_string()))
        } else {
            Err(EngineError::step_failed(&step.name, output.failure_message(timeout)))
        }
    }

    async fn run_agent(
        &self,
        step: &CompiledStep,
        prompt: &str,
        run: &mut RunState,
    ) -> Result<Value, EngineError> {
        let prompt = run
            .ctx
            .variables
            .interpolate_with(prompt, &run.externalizer)?;
        let model = self.resolve_model(step, run);
        let command = agent_command_line(
            &self.config.agent_command,
            model.as_deref(),
            run.defaults.permission_mode.as_deref(),
            &prompt,
        );
        let cwd = self.resolve_cwd(step, &run.ctx.variables);

        let outcome = self.sessions(run).await?.run_interactive(&command, &cwd).await?;
        tracing::info!(
            "[Interpreter] Agent session for '{}' ended by {:?}",
            step.name,
            outcome.completion
        );
        Ok(Value::String(outcome.output))
    }

    async fn run_prompt(
        &self,
        step: &CompiledStep,
        prompt: &str,
        run: &mut RunState,
    ) -> Result<Value, EngineError> {
        let prompt = run
            .ctx
            .variables
            .interpolate_with(prompt, &run.externalizer)?;
        let model = self.resolve_model(step, run);
        let args = headless_args(
            model.as_deref(),
            run.defaults.permission_mode.as_deref(),
            &prompt,
        );
        let cwd = self.resolve_cwd(step, &run.ctx.variables);
        let timeout = self.config.command_timeout;

        let output = run_command(&self.config.agent_command, &args, &cwd, &[], timeout).await?;
        if output.success() {
            Ok(Value::String(output.stdout.trim().to_string()))
        } else {
            Err(EngineError::step_failed(&step.name, output.failure_message(timeout)))
        }
    }

    /// Bind inputs, run the shared body inline, then map outputs back.
    async fn run_shared(
        &self,
        step: &CompiledStep,
        invocation: &SharedInvocation,
        run: &mut RunState,
        path: &str,
    ) -> Result<Value, EngineError> {
        let shared = &invocation.shared;
        let inputs = shared::bind_inputs(shared, &invocation.inputs, &run.ctx.variables)
            .map_err(|e| EngineError::step_failed(&step.name, e.to_string()))?;

        tracing::info!("[Interpreter] {} -> shared '{}'", path, shared.name);
        let saved = run.ctx.variables.remove(SHARED_INPUTS);
        run.ctx.variables.set(SHARED_INPUTS, Value::Object(inputs));

        let result = self.run_block(&shared.body, run, path).await;

        match saved {
            Some(previous) => run.ctx.variables.set(SHARED_INPUTS, previous),
            None => {
                run.ctx.variables.remove(SHARED_INPUTS);
            }
        }
        result?;

        let exposed = shared::collect_outputs(shared, &run.ctx.variables);
        if invocation.outputs.is_empty() {
            for (name, value) in &exposed {
                run.ctx.variables.set(name.clone(), value.clone());
            }
        } else {
            for (caller_var, name) in &invocation.outputs {
                let value = exposed.get(name).cloned().unwrap_or(Value::Null);
                run.ctx.variables.set(caller_var.clone(), value);
            }
        }
        Ok(Value::Object(exposed))
    }

    async fn sessions<'r>(&self, run: &'r mut RunState) -> Result<&'r SessionOrchestrator, EngineError> {
        let sessions = match run.sessions.take() {
            Some(sessions) => sessions,
            None => SessionOrchestrator::start(self.pane_driver.clone(), &self.config).await?,
        };
        Ok(run.sessions.insert(sessions))
    }

    fn resolve_cwd(&self, step: &CompiledStep, vars: &VariableContext) -> PathBuf {
        match &step.cwd {
            Some(cwd) => {
                let path = PathBuf::from(vars.interpolate(cwd));
                if path.is_absolute() {
                    path
                } else {
                    self.config.project_dir.join(path)
                }
            }
            None => self.config.project_dir.clone(),
        }
    }

    fn resolve_model(&self, step: &CompiledStep, run: &RunState) -> Option<String> {
        step.model
            .as_ref()
            .or(run.defaults.model.as_ref())
            .map(|m| run.ctx.variables.interpolate(m))
            .filter(|m| !m.trim().is_empty())
    }
}

fn set_variable(
    step: &CompiledStep,
    var: &str,
    value: &Value,
    parse_json: bool,
    vars: &mut VariableContext,
) -> Result<Value, EngineError> {
    let mut value = vars.interpolate_value(value);
    if parse_json {
        if let Value::String(text) = &value {
            value = serde_json::from_str(text).map_err(|e| {
                EngineError::step_failed(&step.name, format!("'{}' is not valid JSON: {}", var, e))
            })?;
        }
    }
    vars.set(var.to_string(), value.clone());
    Ok(value)
}

fn step_path(scope: &str, name: &str) -> String {
    if scope.is_empty() {
        name.to_string()
    } else {
        format!("{}/{}", scope, name)
    }
}

fn permission_args(mode: Option<&str>) -> Vec<String> {
    match mode.map(str::trim) {
        None | Some("") => Vec::new(),
        Some("bypassPermissions") => vec!["--dangerously-skip-permissions".to_string()],
        Some(mode) => vec!["--permission-mode".to_string(), mode.to_string()],
    }
}

/// Shell command line for an interactive agent session.
fn agent_command_line(
    program: &str,
    model: Option<&str>,
    permission_mode: Option<&str>,
    prompt: &str,
) -> String {
    let mut parts = vec![shell_quote(program)];
    parts.extend(permission_args(permission_mode).iter().map(|a| shell_quote(a)));
    if let Some(model) = model {
        parts.push("--model".to_string());
        parts.push(shell_quote(model));
    }
    parts.push(shell_quote(prompt));
    parts.join(" ")
}

/// Arguments for a headless `-p` agent invocation.
fn headless_args(model: Option<&str>, permission_mode: Option<&str>, prompt: &str) -> Vec<String> {
    let mut args = vec!["-p".to_string(), prompt.to_string()];
    if let Some(model) = model {
        args.push("--model".to_string());
        args.push(model.to_string());
    }
    args.extend(permission_args(permission_mode));
    args
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let truncated: String = s.chars().take(max.saturating_sub(3)).collect();
        format!("{}...", truncated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    async fn run_yaml(yaml: &str) -> RunReport {
        let dir = tempfile::tempdir().unwrap();
        let mut interpreter = Interpreter::new(EngineConfig::new(dir.path()));
        let workflow = interpreter
            .compile(WorkflowDefinition::from_yaml(yaml).unwrap(), None)
            .unwrap();
        interpreter.run(&workflow).await.unwrap()
    }

    #[test]
    fn test_loop_frame_restores_bindings() {
        let mut ctx = ExecutionContext::default();
        ctx.variables.set("item", "outer");
        ctx.enter_loop(LoopKind::Iteration, "each", 0, &["item", "index"]);
        ctx.variables.set("item", "inner");
        ctx.variables.set("index", 3);
        ctx.signal = Signal::Break;

        ctx.exit_loop();
        assert_eq!(ctx.variables.get("item"), Some(&json!("outer")));
        assert!(!ctx.variables.contains("index"));
        assert!(ctx.loop_stack.is_empty());
        assert_eq!(ctx.signal, Signal::None);
    }

    #[test]
    fn test_execution_context_serializes() {
        let mut ctx = ExecutionContext::default();
        ctx.variables.set("x", json!({"a": [1, 2]}));
        ctx.enter_loop(LoopKind::Range, "count", 2, &["i"]);
        ctx.goto_target = Some("end".into());

        let text = serde_json::to_string(&ctx).unwrap();
        let back: ExecutionContext = serde_json::from_str(&text).unwrap();
        assert_eq!(back, ctx);
    }

    #[test]
    fn test_agent_command_line() {
        let line = agent_command_line("claude", Some("sonnet"), Some("bypassPermissions"), "fix it's bug");
        assert_eq!(
            line,
            r#"claude --dangerously-skip-permissions --model sonnet 'fix it'\''s bug'"#
        );

        let args = headless_args(None, Some("acceptEdits"), "hello");
        assert_eq!(args, vec!["-p", "hello", "--permission-mode", "acceptEdits"]);
        assert!(permission_args(None).is_empty());
    }

    #[tokio::test]
    async fn test_when_false_skips_step() {
        let report = run_yaml(
            r#"
name: skip
variables:
  flag: "no"
steps:
  - name: guarded
    tool: set
    when: "{flag} == yes"
    var: touched
    value: true
  - name: after
    tool: log
    message: "done"
"#,
        )
        .await;
        assert!(report.success);
        assert!(!report.context.variables.contains("touched"));
        let guarded: Vec<_> = report.records_for("guarded").collect();
        assert_eq!(guarded[0].status, StepStatus::Skipped);
        assert!(report.context.completed);
    }

    #[tokio::test]
    async fn test_goto_jumps_back_by_name() {
        let report = run_yaml(
            r#"
name: jumps
steps:
  - name: first
    tool: log
    message: "pass"
  - name: mark
    tool: set
    var: visited
    value: "{visited}x"
  - name: again
    tool: goto
    target: first
    when: "{visited} != xx"
  - name: end
    tool: set
    var: finished
    value: "{visited}"
"#,
        )
        .await;
        assert!(report.success);
        assert_eq!(report.context.variables.get("finished"), Some(&json!("xx")));
        assert_eq!(report.records_for("first").count(), 2);
    }

    #[tokio::test]
    async fn test_set_parse_json_and_output_var() {
        let report = run_yaml(
            r#"
name: json
variables:
  id: 7
steps:
  - name: build
    tool: set
    var: payload
    value: '{"id": {id}, "tags": ["a"]}'
    parse_json: true
  - name: echo
    tool: log
    message: "tag {payload.tags.0} for {payload.id}"
    output_var: line
  - name: broken
    tool: set
    var: bad
    value: "not json"
    parse_json: true
    on_error: continue
"#,
        )
        .await;
        assert!(report.success);
        let vars = &report.context.variables;
        assert_eq!(vars.get("payload"), Some(&json!({"id": 7, "tags": ["a"]})));
        assert_eq!(vars.get("line"), Some(&json!("tag a for 7")));
        assert!(vars
            .get(LAST_STEP_ERROR)
            .and_then(Value::as_str)
            .is_some_and(|e| e.contains("not valid JSON")));
    }

    #[tokio::test]
    async fn test_foreach_break_and_counts() {
        let report = run_yaml(
            r#"
name: counts
variables:
  item: "keep"
steps:
  - name: each
    tool: foreach
    items: [1, 2, 3, 4]
    output_var: summary
    steps:
      - name: stop
        tool: break
        when: "{item} == 3"
      - name: skip-even
        tool: continue
        when: "{item} == 2"
      - name: seen
        tool: set
        var: last_seen
        value: "{item}"
"#,
        )
        .await;
        assert!(report.success);
        let vars = &report.context.variables;
        assert_eq!(
            vars.get("summary"),
            Some(&json!({"iterations": 3, "completed": 2, "broken": true}))
        );
        assert_eq!(vars.get("last_seen"), Some(&json!("1")));
        assert_eq!(vars.get("item"), Some(&json!("keep")));
        assert!(!vars.contains("index"));
    }
}
