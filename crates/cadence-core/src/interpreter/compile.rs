//! Compilation of workflow definitions into executable blocks.
//!
//! Every step list becomes a [`Block`]: the compiled steps plus a name→index
//! table used for `goto`. Tool parameters become typed [`Action`]s, external
//! adapters are looked up once, and shared step references are resolved,
//! compiled and cached. All validation happens here, so a workflow that
//! compiles never fails on a structural problem mid-run.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;

use crate::error::EngineError;
use crate::shared::{check_call, CompiledShared, SharedInvocation, SharedResolver};
use crate::tools::{AdapterRegistry, ToolAdapter};
use crate::workflow::{
    LogLevel, OnError, SharedCallSpec, StepSpec, ToolDefaults, ToolSpec, WorkflowDefinition,
};

use super::loops::{ForeachLoop, RangeLoop, RetryLoop, WhileLoop};

/// A compiled, validated workflow ready to run.
#[derive(Debug)]
pub struct Workflow {
    pub name: String,
    pub description: Option<String>,
    /// File the workflow was loaded from, if any
    pub source: Option<PathBuf>,
    pub variables: BTreeMap<String, Value>,
    pub defaults: ToolDefaults,
    pub body: Block,
}

/// One compiled step list with its own goto scope.
#[derive(Debug, Default)]
pub struct Block {
    pub steps: Vec<CompiledStep>,
    index: HashMap<String, usize>,
}

impl Block {
    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Index of the step called `name` in this block.
    pub fn position(&self, name: &str) -> Option<usize> {
        self.index.get(name).copied()
    }

    /// Deepest chain of shared invocations reachable from this block.
    pub fn shared_height(&self) -> usize {
        self.steps
            .iter()
            .map(|step| match &step.action {
                Action::Shared(invocation) => invocation.shared.height,
                Action::Foreach(_, body)
                | Action::While(_, body)
                | Action::Range(_, body)
                | Action::Retry(_, body) => body.shared_height(),
                _ => 0,
            })
            .max()
            .unwrap_or(0)
    }

    /// Total number of steps, nested bodies included.
    pub fn step_count(&self) -> usize {
        self.steps
            .iter()
            .map(|step| {
                1 + match &step.action {
                    Action::Foreach(_, body)
                    | Action::While(_, body)
                    | Action::Range(_, body)
                    | Action::Retry(_, body) => body.step_count(),
                    _ => 0,
                }
            })
            .sum()
    }
}

#[derive(Debug)]
pub struct CompiledStep {
    pub name: String,
    pub when: Option<String>,
    pub on_error: OnError,
    pub output_var: Option<String>,
    pub visible: Option<bool>,
    pub cwd: Option<String>,
    pub model: Option<String>,
    pub action: Action,
}

/// A registered adapter bound at compile time.
#[derive(Clone)]
pub struct AdapterHandle {
    pub name: String,
    pub adapter: Arc<dyn ToolAdapter>,
}

impl std::fmt::Debug for AdapterHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("AdapterHandle").field(&self.name).finish()
    }
}

/// What a step does once it runs.
#[derive(Debug)]
pub enum Action {
    Bash {
        command: String,
        timeout: Option<Duration>,
    },
    Agent {
        prompt: String,
    },
    Prompt {
        prompt: String,
    },
    Set {
        var: String,
        value: Value,
        parse_json: bool,
    },
    Log {
        message: String,
        level: LogLevel,
    },
    Goto {
        target: String,
    },
    Break,
    Continue,
    Foreach(ForeachLoop, Block),
    While(WhileLoop, Block),
    Range(RangeLoop, Block),
    Retry(RetryLoop, Block),
    Shared(SharedInvocation),
    Adapter(AdapterHandle, Value),
}

impl Workflow {
    /// Validate and compile `definition`.
    ///
    /// `source` is the file the definition came from; relative shared step
    /// references resolve against its directory.
    pub fn compile(
        definition: WorkflowDefinition,
        source: Option<&Path>,
        adapters: &AdapterRegistry,
        resolver: &mut SharedResolver,
        max_shared_depth: usize,
    ) -> Result<Self, EngineError> {
        let origin = source
            .and_then(Path::parent)
            .map(Path::to_path_buf)
            .unwrap_or_else(|| resolver.project_dir().to_path_buf());

        let mut compiler = Compiler {
            adapters,
            resolver,
            max_depth: max_shared_depth,
            stack: Vec::new(),
        };
        let scope = format!("workflow '{}'", definition.name);
        let body = compiler.block(&definition.steps, &scope, false, &origin)?;

        tracing::debug!(
            "[Compile] Workflow '{}': {} steps ({} total)",
            definition.name,
            body.len(),
            body.step_count()
        );

        Ok(Self {
            name: definition.name,
            description: definition.description,
            source: source.map(Path::to_path_buf),
            variables: definition.variables,
            defaults: definition.defaults,
            body,
        })
    }
}

struct Compiler<'a> {
    adapters: &'a AdapterRegistry,
    resolver: &'a mut SharedResolver,
    max_depth: usize,
    /// Canonical keys of the shared steps being compiled, outermost first
    stack: Vec<String>,
}

impl Compiler<'_> {
    fn block(
        &mut self,
        steps: &[StepSpec],
        scope: &str,
        in_loop: bool,
        origin: &Path,
    ) -> Result<Block, EngineError> {
        let mut index = HashMap::with_capacity(steps.len());
        for (i, step) in steps.iter().enumerate() {
            if step.name.trim().is_empty() {
                return Err(EngineError::InvalidStep {
                    step: format!("{}[{}]", scope, i),
                    reason: "step name must not be empty".to_string(),
                });
            }
            if index.insert(step.name.clone(), i).is_some() {
                return Err(EngineError::DuplicateStep {
                    scope: scope.to_string(),
                    name: step.name.clone(),
                });
            }
        }

        let mut compiled = Vec::with_capacity(steps.len());
        for step in steps {
            if let ToolSpec::Goto { target } = &step.tool {
                if !index.contains_key(target) {
                    return Err(EngineError::UnknownJumpTarget {
                        step: step.name.clone(),
                        target: target.clone(),
                    });
                }
            }
            compiled.push(self.step(step, scope, in_loop, origin)?);
        }

        Ok(Block {
            steps: compiled,
            index,
        })
    }

    fn step(
        &mut self,
        spec: &StepSpec,
        scope: &str,
        in_loop: bool,
        origin: &Path,
    ) -> Result<CompiledStep, EngineError> {
        let body_scope = format!("{}/{}", scope, spec.name);
        let invalid = |reason: &str| EngineError::InvalidStep {
            step: spec.name.clone(),
            reason: reason.to_string(),
        };

        let action = match &spec.tool {
            ToolSpec::Bash {
                command,
                timeout_secs,
            } => Action::Bash {
                command: command.clone(),
                timeout: timeout_secs.map(Duration::from_secs),
            },
            ToolSpec::Agent { prompt } => Action::Agent {
                prompt: prompt.clone(),
            },
            ToolSpec::Prompt { prompt } => Action::Prompt {
                prompt: prompt.clone(),
            },
            ToolSpec::Set {
                var,
                value,
                parse_json,
            } => {
                if var.trim().is_empty() {
                    return Err(invalid("set requires a variable name"));
                }
                Action::Set {
                    var: var.clone(),
                    value: value.clone(),
                    parse_json: *parse_json,
                }
            }
            ToolSpec::Log { message, level } => Action::Log {
                message: message.clone(),
                level: *level,
            },
            ToolSpec::Goto { target } => Action::Goto {
                target: target.clone(),
            },
            ToolSpec::Break | ToolSpec::Continue if !in_loop => {
                return Err(EngineError::SignalOutsideLoop {
                    step: spec.name.clone(),
                    signal: spec.tool.kind().to_string(),
                });
            }
            ToolSpec::Break => Action::Break,
            ToolSpec::Continue => Action::Continue,
            ToolSpec::Foreach(foreach) => Action::Foreach(
                ForeachLoop::from(foreach),
                self.block(&foreach.steps, &body_scope, true, origin)?,
            ),
            ToolSpec::While(w) => {
                if w.max_iterations == 0 {
                    return Err(invalid("while max_iterations must be greater than 0"));
                }
                Action::While(
                    WhileLoop::from(w),
                    self.block(&w.steps, &body_scope, true, origin)?,
                )
            }
            ToolSpec::Range(range) => {
                if range.step == 0 {
                    return Err(invalid("range step must not be 0"));
                }
                Action::Range(
                    RangeLoop::from(range),
                    self.block(&range.steps, &body_scope, true, origin)?,
                )
            }
            ToolSpec::Retry(retry) => {
                if retry.max_attempts == 0 {
                    return Err(invalid("retry max_attempts must be greater than 0"));
                }
                Action::Retry(
                    RetryLoop::from(retry),
                    self.block(&retry.steps, &body_scope, true, origin)?,
                )
            }
            ToolSpec::Shared(call) => Action::Shared(self.shared(&spec.name, call, origin)?),
            ToolSpec::Adapter { adapter, params } => {
                let handle = self.adapters.get(adapter).ok_or_else(|| {
                    EngineError::UnknownAdapter {
                        step: spec.name.clone(),
                        adapter: adapter.clone(),
                    }
                })?;
                Action::Adapter(
                    AdapterHandle {
                        name: adapter.clone(),
                        adapter: handle,
                    },
                    params.clone(),
                )
            }
        };

        Ok(CompiledStep {
            name: spec.name.clone(),
            when: spec.when.clone(),
            on_error: spec.on_error,
            output_var: spec.output_var.clone(),
            visible: spec.visible,
            cwd: spec.cwd.clone(),
            model: spec.model.clone(),
            action,
        })
    }

    /// Resolve and compile a shared step reference.
    ///
    /// The stack holds the keys of every shared step currently being
    /// compiled; meeting one of them again is a cycle.
    fn shared(
        &mut self,
        step: &str,
        call: &SharedCallSpec,
        origin: &Path,
    ) -> Result<SharedInvocation, EngineError> {
        let resolved = self.resolver.resolve(&call.uses, origin)?;

        if let Some(pos) = self.stack.iter().position(|k| k == &resolved.key) {
            let mut chain = self.stack[pos..].to_vec();
            chain.push(resolved.key);
            return Err(EngineError::CircularReference { chain });
        }

        let depth = self.stack.len() + 1;
        if depth > self.max_depth {
            return Err(EngineError::DepthExceeded {
                depth,
                max: self.max_depth,
            });
        }

        let shared = match self.resolver.cached(&resolved.key) {
            Some(cached) => {
                let total = self.stack.len() + cached.height;
                if total > self.max_depth {
                    return Err(EngineError::DepthExceeded {
                        depth: total,
                        max: self.max_depth,
                    });
                }
                cached
            }
            None => {
                let definition = resolved.load()?;
                let inner_origin = resolved.origin(self.resolver.project_dir());
                let scope = format!("shared '{}'", definition.name);

                self.stack.push(resolved.key.clone());
                // a shared body is its own loop scope
                let body = self.block(&definition.steps, &scope, false, &inner_origin);
                self.stack.pop();
                let body = body?;

                let compiled = Arc::new(CompiledShared {
                    key: resolved.key,
                    name: definition.name,
                    inputs: definition.inputs,
                    outputs: definition.outputs,
                    height: 1 + body.shared_height(),
                    body,
                });
                self.resolver.insert(compiled.clone());
                compiled
            }
        };

        check_call(step, &shared, call)?;
        Ok(SharedInvocation {
            shared,
            inputs: call.inputs.clone(),
            outputs: call.outputs.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn compile_yaml(yaml: &str) -> Result<Workflow, EngineError> {
        let dir = std::env::temp_dir();
        let mut resolver = SharedResolver::new(&dir);
        Workflow::compile(
            WorkflowDefinition::from_yaml(yaml)?,
            None,
            &AdapterRegistry::new(),
            &mut resolver,
            10,
        )
    }

    #[test]
    fn test_compile_builds_index() {
        let wf = compile_yaml(
            r#"
name: ok
steps:
  - name: a
    tool: log
    message: "a"
  - name: loop
    tool: range
    from: 1
    to: 2
    steps:
      - name: a
        tool: continue
  - name: back
    tool: goto
    target: a
"#,
        )
        .unwrap();
        assert_eq!(wf.body.len(), 3);
        assert_eq!(wf.body.position("back"), Some(2));
        assert_eq!(wf.body.step_count(), 4);
    }

    #[test]
    fn test_duplicate_names_rejected_per_block() {
        let err = compile_yaml(
            r#"
name: dup
steps:
  - name: a
    tool: log
    message: "1"
  - name: a
    tool: log
    message: "2"
"#,
        )
        .unwrap_err();
        assert!(matches!(err, EngineError::DuplicateStep { ref name, .. } if name == "a"));
    }

    #[test]
    fn test_goto_cannot_leave_its_block() {
        let err = compile_yaml(
            r#"
name: jump
steps:
  - name: outer
    tool: log
    message: "x"
  - name: loop
    tool: foreach
    items: [1, 2]
    steps:
      - name: escape
        tool: goto
        target: outer
"#,
        )
        .unwrap_err();
        assert!(matches!(err, EngineError::UnknownJumpTarget { ref target, .. } if target == "outer"));
    }

    #[test]
    fn test_break_outside_loop_rejected() {
        let err = compile_yaml(
            r#"
name: stray
steps:
  - name: stop
    tool: break
"#,
        )
        .unwrap_err();
        assert!(matches!(err, EngineError::SignalOutsideLoop { .. }));
    }

    #[test]
    fn test_invalid_loop_parameters() {
        for (tool, extra) in [
            ("range", "from: 1\n    to: 3\n    step: 0"),
            ("while", "condition: \"1 == 1\"\n    max_iterations: 0"),
            ("retry", "max_attempts: 0"),
        ] {
            let yaml = format!(
                "name: bad\nsteps:\n  - name: l\n    tool: {}\n    {}\n    steps: []\n",
                tool, extra
            );
            let err = compile_yaml(&yaml).unwrap_err();
            assert!(
                matches!(err, EngineError::InvalidStep { .. }),
                "{} should be invalid, got {:?}",
                tool,
                err
            );
        }
    }

    #[test]
    fn test_unknown_adapter_rejected() {
        let err = compile_yaml(
            r#"
name: adapters
steps:
  - name: fetch
    tool: adapter
    adapter: jira
"#,
        )
        .unwrap_err();
        assert!(matches!(err, EngineError::UnknownAdapter { ref adapter, .. } if adapter == "jira"));
    }

    #[test]
    fn test_builtin_shared_resolves_and_caches() {
        let dir = tempfile::tempdir().unwrap();
        let mut resolver = SharedResolver::new(dir.path());
        let def = WorkflowDefinition::from_yaml(
            r#"
name: uses
steps:
  - name: one
    tool: shared
    uses: "builtin:shell-capture"
    inputs:
      command: "echo hi"
  - name: two
    tool: shared
    uses: shell-capture
    inputs:
      command: "echo again"
"#,
        )
        .unwrap();
        let wf = Workflow::compile(def, None, &AdapterRegistry::new(), &mut resolver, 10).unwrap();
        assert_eq!(wf.body.shared_height(), 1);
        assert!(resolver.cached("builtin:shell-capture").is_some());
    }
}
