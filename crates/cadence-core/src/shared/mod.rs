//! Shared steps: reusable, parameterized step bundles invoked by reference.
//!
//! ```yaml
//! name: summarize
//! description: "Summarize a blob of text"
//! inputs:
//!   - name: text
//!     required: true
//!   - name: style
//!     default: "bullets"
//!     schema: { type: string, enum: ["bullets", "prose"] }
//! outputs:
//!   summary: result          # exposed name -> internal variable
//! steps:
//!   - name: run
//!     tool: prompt
//!     prompt: "Summarize as {inputs.style}: {inputs.text}"
//!     output_var: result
//! ```
//!
//! References are resolved from three places:
//!
//! | Reference            | Location                                      |
//! |----------------------|-----------------------------------------------|
//! | `builtin:<name>`     | definitions compiled into the engine          |
//! | `project:<name>`     | `<project>/.cadence/shared/<name>.yaml`       |
//! | `./x.yaml`           | relative to the file holding the reference    |
//! | `<name>`             | project first, then builtin                   |

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::context::{has_placeholders, single_placeholder, value_to_string, VariableContext};
use crate::error::EngineError;
use crate::interpreter::Block;
use crate::workflow::{SharedCallSpec, StepSpec};

/// Project-local directory holding shared step definitions.
pub const SHARED_DIR: &str = ".cadence/shared";

const BUILTINS: &[(&str, &str)] = &[
    ("shell-capture", include_str!("builtin/shell-capture.yaml")),
    ("retry-command", include_str!("builtin/retry-command.yaml")),
    ("announce", include_str!("builtin/announce.yaml")),
];

/// A shared step definition loaded from YAML.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SharedStepDefinition {
    pub name: String,

    #[serde(default)]
    pub description: Option<String>,

    #[serde(default)]
    pub inputs: Vec<InputSpec>,

    /// Exposed output name -> internal variable name
    #[serde(default)]
    pub outputs: BTreeMap<String, String>,

    pub steps: Vec<StepSpec>,
}

impl SharedStepDefinition {
    pub fn from_yaml(yaml: &str) -> Result<Self, EngineError> {
        serde_yaml::from_str(yaml)
            .map_err(|e| EngineError::Parse(format!("Failed to parse shared step YAML: {}", e)))
    }

    pub fn from_file(path: &Path) -> Result<Self, EngineError> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            EngineError::Io(format!("Failed to read shared step '{}': {}", path.display(), e))
        })?;
        serde_yaml::from_str(&content).map_err(|e| {
            EngineError::Parse(format!("Failed to parse shared step '{}': {}", path.display(), e))
        })
    }
}

/// One declared input parameter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InputSpec {
    pub name: String,
    #[serde(default)]
    pub required: bool,
    #[serde(default)]
    pub default: Option<Value>,
    #[serde(default)]
    pub schema: Option<InputSchema>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InputSchema {
    #[serde(default, rename = "type")]
    pub kind: Option<SchemaType>,
    #[serde(default, rename = "enum")]
    pub allowed: Option<Vec<Value>>,
    #[serde(default)]
    pub pattern: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SchemaType {
    String,
    Number,
    Integer,
    Boolean,
    Array,
    Object,
}

impl SchemaType {
    /// Accept `value` as this type, converting text forms where unambiguous.
    fn coerce(self, value: &Value) -> Result<Value, String> {
        let mismatch = || format!("expected {}, got {}", format!("{:?}", self).to_lowercase(), value);
        match (self, value) {
            (SchemaType::String, Value::String(_)) => Ok(value.clone()),
            (SchemaType::String, Value::Number(_) | Value::Bool(_)) => {
                Ok(Value::String(value_to_string(value)))
            }
            (SchemaType::Number, Value::Number(_)) => Ok(value.clone()),
            (SchemaType::Number, Value::String(s)) => s
                .trim()
                .parse::<f64>()
                .ok()
                .and_then(serde_json::Number::from_f64)
                .map(Value::Number)
                .ok_or_else(mismatch),
            (SchemaType::Integer, Value::Number(n)) if n.is_i64() || n.is_u64() => Ok(value.clone()),
            (SchemaType::Integer, Value::String(s)) => s
                .trim()
                .parse::<i64>()
                .map(Value::from)
                .map_err(|_| mismatch()),
            (SchemaType::Boolean, Value::Bool(_)) => Ok(value.clone()),
            (SchemaType::Boolean, Value::String(s)) => match s.trim().to_lowercase().as_str() {
                "true" => Ok(Value::Bool(true)),
                "false" => Ok(Value::Bool(false)),
                _ => Err(mismatch()),
            },
            (SchemaType::Array, Value::Array(_)) | (SchemaType::Object, Value::Object(_)) => {
                Ok(value.clone())
            }
            (SchemaType::Array | SchemaType::Object, Value::String(s)) => {
                match serde_json::from_str::<Value>(s.trim()) {
                    Ok(v @ Value::Array(_)) if self == SchemaType::Array => Ok(v),
                    Ok(v @ Value::Object(_)) if self == SchemaType::Object => Ok(v),
                    _ => Err(mismatch()),
                }
            }
            _ => Err(mismatch()),
        }
    }
}

impl InputSchema {
    /// Validate a value, returning it in its coerced form.
    pub fn check(&self, value: &Value) -> Result<Value, String> {
        let value = match self.kind {
            Some(kind) => kind.coerce(value)?,
            None => value.clone(),
        };

        if let Some(allowed) = &self.allowed {
            let text = value_to_string(&value);
            if !allowed
                .iter()
                .any(|a| a == &value || value_to_string(a) == text)
            {
                let choices: Vec<String> = allowed.iter().map(value_to_string).collect();
                return Err(format!("'{}' is not one of [{}]", text, choices.join(", ")));
            }
        }

        if let Some(pattern) = &self.pattern {
            let re = Regex::new(pattern)
                .map_err(|e| format!("invalid pattern '{}': {}", pattern, e))?;
            let text = value_to_string(&value);
            if !re.is_match(&text) {
                return Err(format!("'{}' does not match /{}/", text, pattern));
            }
        }

        Ok(value)
    }
}

/// A shared definition with its body compiled.
#[derive(Debug)]
pub struct CompiledShared {
    /// Canonical reference key (`builtin:<name>` or an absolute file path)
    pub key: String,
    pub name: String,
    pub inputs: Vec<InputSpec>,
    pub outputs: BTreeMap<String, String>,
    pub body: Block,
    /// Shared nesting levels including this one
    pub height: usize,
}

/// A `tool: shared` step bound to its compiled definition.
#[derive(Debug, Clone)]
pub struct SharedInvocation {
    pub shared: Arc<CompiledShared>,
    pub inputs: BTreeMap<String, Value>,
    /// caller variable -> exposed output
    pub outputs: BTreeMap<String, String>,
}

/// Where a reference points, before it is loaded.
#[derive(Debug, Clone)]
pub enum SharedSource {
    Builtin { name: String, yaml: &'static str },
    File(PathBuf),
}

#[derive(Debug, Clone)]
pub struct ResolvedRef {
    pub key: String,
    pub source: SharedSource,
}

impl ResolvedRef {
    /// Directory relative references inside this definition resolve against.
    pub fn origin(&self, project_dir: &Path) -> PathBuf {
        match &self.source {
            SharedSource::File(path) => path
                .parent()
                .map(Path::to_path_buf)
                .unwrap_or_else(|| project_dir.to_path_buf()),
            SharedSource::Builtin { .. } => project_dir.to_path_buf(),
        }
    }

    pub fn load(&self) -> Result<SharedStepDefinition, EngineError> {
        match &self.source {
            SharedSource::Builtin { name, yaml } => SharedStepDefinition::from_yaml(yaml)
                .map_err(|e| EngineError::Parse(format!("builtin:{}: {}", name, e))),
            SharedSource::File(path) => SharedStepDefinition::from_file(path),
        }
    }
}

/// Maps references to definitions and caches compiled results.
#[derive(Debug)]
pub struct SharedResolver {
    project_dir: PathBuf,
    cache: HashMap<String, Arc<CompiledShared>>,
}

impl SharedResolver {
    pub fn new(project_dir: impl Into<PathBuf>) -> Self {
        Self {
            project_dir: project_dir.into(),
            cache: HashMap::new(),
        }
    }

    pub fn project_dir(&self) -> &Path {
        &self.project_dir
    }

    pub fn builtin_names() -> Vec<&'static str> {
        BUILTINS.iter().map(|(name, _)| *name).collect()
    }

    fn builtin(name: &str) -> Option<ResolvedRef> {
        BUILTINS
            .iter()
            .find(|(n, _)| *n == name)
            .map(|(n, yaml)| ResolvedRef {
                key: format!("builtin:{}", n),
                source: SharedSource::Builtin {
                    name: n.to_string(),
                    yaml,
                },
            })
    }

    fn project_file(&self, name: &str) -> Option<PathBuf> {
        let dir = self.project_dir.join(SHARED_DIR);
        ["yaml", "yml"]
            .iter()
            .map(|ext| dir.join(format!("{}.{}", name, ext)))
            .find(|p| p.is_file())
    }

    /// Resolve `reference` as written in a file living in `origin`.
    pub fn resolve(&self, reference: &str, origin: &Path) -> Result<ResolvedRef, EngineError> {
        let reference = reference.trim();
        let not_found = || EngineError::SharedNotFound(reference.to_string());

        if let Some(name) = reference.strip_prefix("builtin:") {
            return Self::builtin(name).ok_or_else(not_found);
        }
        if let Some(name) = reference.strip_prefix("project:") {
            let path = self.project_file(name).ok_or_else(not_found)?;
            return file_ref(&path);
        }
        if reference.starts_with("./") || reference.starts_with("../") {
            let path = origin.join(reference);
            if !path.is_file() {
                return Err(not_found());
            }
            return file_ref(&path);
        }

        match self.project_file(reference) {
            Some(path) => file_ref(&path),
            None => Self::builtin(reference).ok_or_else(not_found),
        }
    }

    pub fn cached(&self, key: &str) -> Option<Arc<CompiledShared>> {
        self.cache.get(key).cloned()
    }

    pub fn insert(&mut self, compiled: Arc<CompiledShared>) {
        tracing::debug!(
            "[Shared] Cached '{}' ({}, height {})",
            compiled.name,
            compiled.key,
            compiled.height
        );
        self.cache.insert(compiled.key.clone(), compiled);
    }
}

fn file_ref(path: &Path) -> Result<ResolvedRef, EngineError> {
    let canonical = path.canonicalize().map_err(|e| {
        EngineError::Io(format!("Failed to resolve '{}': {}", path.display(), e))
    })?;
    Ok(ResolvedRef {
        key: canonical.to_string_lossy().to_string(),
        source: SharedSource::File(canonical),
    })
}

/// Load-time check of a call site against the definition it resolved to.
///
/// Templated input values are only checked once they are interpolated, at
/// invocation.
pub fn check_call(
    step: &str,
    shared: &CompiledShared,
    call: &SharedCallSpec,
) -> Result<(), EngineError> {
    for input in &shared.inputs {
        match call.inputs.get(&input.name) {
            None if input.required && input.default.is_none() => {
                return Err(EngineError::MissingInput {
                    shared: shared.name.clone(),
                    input: input.name.clone(),
                });
            }
            Some(value) if !has_placeholders(value) => {
                if let Some(schema) = &input.schema {
                    schema
                        .check(value)
                        .map_err(|reason| EngineError::SchemaMismatch {
                            shared: shared.name.clone(),
                            input: input.name.clone(),
                            reason,
                        })?;
                }
            }
            _ => {}
        }
    }

    for exposed in call.outputs.values() {
        if !shared.outputs.contains_key(exposed) {
            return Err(EngineError::InvalidStep {
                step: step.to_string(),
                reason: format!(
                    "shared step '{}' has no output named '{}'",
                    shared.name, exposed
                ),
            });
        }
    }
    Ok(())
}

/// Interpolate, default and validate the inputs of one invocation.
pub fn bind_inputs(
    shared: &CompiledShared,
    provided: &BTreeMap<String, Value>,
    vars: &VariableContext,
) -> Result<Map<String, Value>, EngineError> {
    let mut bound = Map::new();

    for input in &shared.inputs {
        let value = match provided.get(&input.name) {
            Some(raw) => resolve_input(raw, vars),
            None => match &input.default {
                Some(default) => default.clone(),
                None if input.required => {
                    return Err(EngineError::MissingInput {
                        shared: shared.name.clone(),
                        input: input.name.clone(),
                    });
                }
                None => continue,
            },
        };

        let value = match &input.schema {
            Some(schema) => schema
                .check(&value)
                .map_err(|reason| EngineError::SchemaMismatch {
                    shared: shared.name.clone(),
                    input: input.name.clone(),
                    reason,
                })?,
            None => value,
        };
        bound.insert(input.name.clone(), value);
    }

    for (name, raw) in provided {
        if !shared.inputs.iter().any(|i| &i.name == name) {
            tracing::debug!("[Shared] '{}' passes undeclared input '{}'", shared.name, name);
            bound.insert(name.clone(), resolve_input(raw, vars));
        }
    }

    Ok(bound)
}

/// A lone `{path}` binds the raw value; anything else is interpolated.
fn resolve_input(raw: &Value, vars: &VariableContext) -> Value {
    match raw {
        Value::String(s) => match single_placeholder(s) {
            Some(path) => vars
                .resolve(path)
                .unwrap_or_else(|| Value::String(String::new())),
            None => Value::String(vars.interpolate(s)),
        },
        other => vars.interpolate_value(other),
    }
}

/// Exposed outputs read back from the variable context after the body ran.
pub fn collect_outputs(shared: &CompiledShared, vars: &VariableContext) -> Map<String, Value> {
    shared
        .outputs
        .iter()
        .map(|(exposed, internal)| {
            (
                exposed.clone(),
                vars.resolve(internal).unwrap_or(Value::Null),
            )
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn shared_with(inputs: Vec<InputSpec>) -> CompiledShared {
        CompiledShared {
            key: "builtin:test".into(),
            name: "test".into(),
            inputs,
            outputs: BTreeMap::from([("summary".to_string(), "result".to_string())]),
            body: Block::default(),
            height: 1,
        }
    }

    fn input(name: &str, required: bool, schema: Option<InputSchema>) -> InputSpec {
        InputSpec {
            name: name.into(),
            required,
            default: None,
            schema,
        }
    }

    #[test]
    fn test_builtins_parse() {
        for name in SharedResolver::builtin_names() {
            let resolved = SharedResolver::builtin(name).unwrap();
            let def = resolved.load().unwrap();
            assert_eq!(def.name, name);
            assert!(!def.steps.is_empty());
        }
    }

    #[test]
    fn test_resolve_namespaces() {
        let dir = tempfile::tempdir().unwrap();
        let shared_dir = dir.path().join(SHARED_DIR);
        std::fs::create_dir_all(&shared_dir).unwrap();
        std::fs::write(
            shared_dir.join("shell-capture.yaml"),
            "name: shadow\nsteps: []\n",
        )
        .unwrap();
        std::fs::write(dir.path().join("local.yml"), "name: local\nsteps: []\n").unwrap();

        let resolver = SharedResolver::new(dir.path());

        let builtin = resolver.resolve("builtin:shell-capture", dir.path()).unwrap();
        assert_eq!(builtin.key, "builtin:shell-capture");

        // bare names prefer the project copy
        let bare = resolver.resolve("shell-capture", dir.path()).unwrap();
        assert!(matches!(bare.source, SharedSource::File(_)));
        assert_eq!(bare.load().unwrap().name, "shadow");

        let relative = resolver.resolve("./local.yml", dir.path()).unwrap();
        assert_eq!(relative.load().unwrap().name, "local");

        let fallback = resolver.resolve("announce", dir.path()).unwrap();
        assert_eq!(fallback.key, "builtin:announce");

        assert!(matches!(
            resolver.resolve("project:missing", dir.path()),
            Err(EngineError::SharedNotFound(_))
        ));
        assert!(matches!(
            resolver.resolve("builtin:missing", dir.path()),
            Err(EngineError::SharedNotFound(_))
        ));
    }

    #[test]
    fn test_schema_checks() {
        let schema = InputSchema {
            kind: Some(SchemaType::String),
            allowed: Some(vec![json!("bullets"), json!("prose")]),
            pattern: None,
        };
        assert_eq!(schema.check(&json!("prose")).unwrap(), json!("prose"));
        assert!(schema.check(&json!("haiku")).is_err());

        let int = InputSchema {
            kind: Some(SchemaType::Integer),
            ..InputSchema::default()
        };
        assert_eq!(int.check(&json!("42")).unwrap(), json!(42));
        assert!(int.check(&json!("4.5")).is_err());
        assert!(int.check(&json!([1])).is_err());

        let pattern = InputSchema {
            pattern: Some("^[A-Z]+-[0-9]+$".into()),
            ..InputSchema::default()
        };
        assert!(pattern.check(&json!("CAD-12")).is_ok());
        assert!(pattern.check(&json!("cad12")).is_err());

        let array = InputSchema {
            kind: Some(SchemaType::Array),
            ..InputSchema::default()
        };
        assert_eq!(array.check(&json!("[1,2]")).unwrap(), json!([1, 2]));
        assert!(array.check(&json!("{}")).is_err());
    }

    #[test]
    fn test_check_call_missing_and_mismatch() {
        let shared = shared_with(vec![
            input("text", true, None),
            input(
                "count",
                false,
                Some(InputSchema {
                    kind: Some(SchemaType::Integer),
                    ..InputSchema::default()
                }),
            ),
        ]);

        let missing = SharedCallSpec {
            uses: "builtin:test".into(),
            inputs: BTreeMap::new(),
            outputs: BTreeMap::new(),
        };
        assert!(matches!(
            check_call("call", &shared, &missing),
            Err(EngineError::MissingInput { ref input, .. }) if input == "text"
        ));

        let bad_literal = SharedCallSpec {
            uses: "builtin:test".into(),
            inputs: BTreeMap::from([
                ("text".to_string(), json!("hello")),
                ("count".to_string(), json!("many")),
            ]),
            outputs: BTreeMap::new(),
        };
        assert!(matches!(
            check_call("call", &shared, &bad_literal),
            Err(EngineError::SchemaMismatch { .. })
        ));

        // templated values wait for invocation
        let templated = SharedCallSpec {
            uses: "builtin:test".into(),
            inputs: BTreeMap::from([
                ("text".to_string(), json!("hello")),
                ("count".to_string(), json!("{n}")),
            ]),
            outputs: BTreeMap::from([("mine".to_string(), "summary".to_string())]),
        };
        assert!(check_call("call", &shared, &templated).is_ok());

        let unknown_output = SharedCallSpec {
            outputs: BTreeMap::from([("mine".to_string(), "nope".to_string())]),
            ..templated
        };
        assert!(matches!(
            check_call("call", &shared, &unknown_output),
            Err(EngineError::InvalidStep { .. })
        ));
    }

    #[test]
    fn test_bind_inputs_interpolates_and_defaults() {
        let mut with_default = input("style", false, None);
        with_default.default = Some(json!("bullets"));
        let shared = shared_with(vec![input("text", true, None), with_default]);

        let mut vars = VariableContext::new();
        vars.set("body", "release notes");
        vars.set("list", json!(["a", "b"]));

        let provided = BTreeMap::from([
            ("text".to_string(), json!("Notes: {body}")),
            ("extra".to_string(), json!("{list}")),
        ]);
        let bound = bind_inputs(&shared, &provided, &vars).unwrap();
        assert_eq!(bound["text"], json!("Notes: release notes"));
        assert_eq!(bound["style"], json!("bullets"));
        assert_eq!(bound["extra"], json!(["a", "b"]));
    }

    #[test]
    fn test_bind_inputs_runtime_mismatch() {
        let shared = shared_with(vec![input(
            "count",
            true,
            Some(InputSchema {
                kind: Some(SchemaType::Number),
                ..InputSchema::default()
            }),
        )]);
        let mut vars = VariableContext::new();
        vars.set("n", "lots");
        let provided = BTreeMap::from([("count".to_string(), json!("{n}"))]);
        assert!(matches!(
            bind_inputs(&shared, &provided, &vars),
            Err(EngineError::SchemaMismatch { .. })
        ));
    }

    #[test]
    fn test_collect_outputs() {
        let shared = shared_with(vec![]);
        let mut vars = VariableContext::new();
        vars.set("result", "done");
        let outputs = collect_outputs(&shared, &vars);
        assert_eq!(outputs["summary"], json!("done"));
    }
}
