//! Variable context: the key/value store every step reads and writes.
//!
//! Templates reference variables with `{path}`, where `path` is a bare name,
//! a dot-separated field path (`issue.fields.summary`) or a path with numeric
//! array indexes (`items.2.title`). Missing paths interpolate to the empty
//! string.
//!
//! Prompt-bound interpolation (`interpolate_with`) additionally externalizes
//! oversized values: anything longer than the threshold is written to a file
//! in the run's managed temp dir and replaced with `@<path>`.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::EngineError;

lazy_static! {
    static ref PLACEHOLDER: Regex =
        Regex::new(r"\{([A-Za-z_][A-Za-z0-9_\-]*(?:\.[A-Za-z0-9_\-]+)*)\}").unwrap();
}

/// Live variable bindings of one run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VariableContext {
    vars: HashMap<String, Value>,
}

impl VariableContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_bindings<I, K>(bindings: I) -> Self
    where
        I: IntoIterator<Item = (K, Value)>,
        K: Into<String>,
    {
        Self {
            vars: bindings.into_iter().map(|(k, v)| (k.into(), v)).collect(),
        }
    }

    pub fn set(&mut self, name: impl Into<String>, value: impl Into<Value>) {
        self.vars.insert(name.into(), value.into());
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.vars.get(name)
    }

    pub fn get_or(&self, name: &str, default: Value) -> Value {
        self.vars.get(name).cloned().unwrap_or(default)
    }

    pub fn remove(&mut self, name: &str) -> Option<Value> {
        self.vars.remove(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.vars.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.vars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vars.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.vars.iter()
    }

    /// Resolve a (possibly nested) path to a value.
    ///
    /// An exact key match wins over path walking, so variables whose names
    /// contain dots stay addressable.
    pub fn resolve(&self, path: &str) -> Option<Value> {
        if let Some(v) = self.vars.get(path) {
            return Some(v.clone());
        }
        let segments: Vec<&str> = path.split('.').collect();
        let (head, rest) = segments.split_first()?;
        walk(self.vars.get(*head)?, rest)
    }

    /// Resolve a path and render it as interpolation text.
    pub fn render(&self, path: &str) -> Option<String> {
        self.resolve(path).map(|v| value_to_string(&v))
    }

    /// Replace every `{path}` in `template` with its inline string form.
    pub fn interpolate(&self, template: &str) -> String {
        PLACEHOLDER
            .replace_all(template, |caps: &regex::Captures| {
                self.render(&caps[1]).unwrap_or_default()
            })
            .into_owned()
    }

    /// Interpolate for a tool that accepts file references.
    pub fn interpolate_with(
        &self,
        template: &str,
        externalizer: &Externalizer,
    ) -> Result<String, EngineError> {
        let mut out = String::with_capacity(template.len());
        let mut last = 0;

        for caps in PLACEHOLDER.captures_iter(template) {
            let Some(whole) = caps.get(0) else { continue };
            out.push_str(&template[last..whole.start()]);

            let path = &caps[1];
            let rendered = self.render(path).unwrap_or_default();
            if rendered.chars().count() > externalizer.threshold() {
                let file = externalizer.write(path, &rendered)?;
                tracing::debug!(
                    "[Context] Externalized '{}' ({} chars) to {}",
                    path,
                    rendered.chars().count(),
                    file.display()
                );
                out.push('@');
                out.push_str(&file.to_string_lossy());
            } else {
                out.push_str(&rendered);
            }
            last = whole.end();
        }

        out.push_str(&template[last..]);
        Ok(out)
    }

    /// Interpolate every string nested inside a JSON value.
    pub fn interpolate_value(&self, value: &Value) -> Value {
        match value {
            Value::String(s) => Value::String(self.interpolate(s)),
            Value::Array(items) => {
                Value::Array(items.iter().map(|v| self.interpolate_value(v)).collect())
            }
            Value::Object(map) => Value::Object(
                map.iter()
                    .map(|(k, v)| (k.clone(), self.interpolate_value(v)))
                    .collect(),
            ),
            other => other.clone(),
        }
    }
}

/// The path of a template that consists of exactly one `{path}` and nothing
/// else. Such templates can bind the raw value instead of its text.
pub fn single_placeholder(template: &str) -> Option<&str> {
    let trimmed = template.trim();
    let caps = PLACEHOLDER.captures(trimmed)?;
    let whole = caps.get(0)?;
    if whole.start() == 0 && whole.end() == trimmed.len() {
        caps.get(1).map(|m| m.as_str())
    } else {
        None
    }
}

/// Whether a JSON value contains any `{path}` reference in its strings.
pub fn has_placeholders(value: &Value) -> bool {
    match value {
        Value::String(s) => PLACEHOLDER.is_match(s),
        Value::Array(items) => items.iter().any(has_placeholders),
        Value::Object(map) => map.values().any(has_placeholders),
        _ => false,
    }
}

/// String form used for interpolation.
pub fn value_to_string(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        Value::Array(_) | Value::Object(_) => serde_json::to_string(value).unwrap_or_default(),
    }
}

/// Walk `segments` into `value`. Strings holding JSON documents are parsed
/// on the way down.
pub fn walk(value: &Value, segments: &[&str]) -> Option<Value> {
    let Some((head, rest)) = segments.split_first() else {
        return Some(value.clone());
    };
    match value {
        Value::Object(map) => walk(map.get(*head)?, rest),
        Value::Array(items) => walk(items.get(head.parse::<usize>().ok()?)?, rest),
        Value::String(s) => walk(&parse_embedded_json(s)?, segments),
        _ => None,
    }
}

fn parse_embedded_json(s: &str) -> Option<Value> {
    let trimmed = s.trim_start();
    if trimmed.starts_with('{') || trimmed.starts_with('[') {
        serde_json::from_str(trimmed).ok()
    } else {
        None
    }
}

// ─── Externalization ────────────────────────────────────────────────────

/// Managed temp directory holding externalized values for one run.
/// The directory is removed when the externalizer is dropped.
pub struct Externalizer {
    dir: tempfile::TempDir,
    threshold: usize,
}

impl Externalizer {
    pub fn new(threshold: usize) -> Result<Self, EngineError> {
        let dir = tempfile::Builder::new().prefix("cadence-vars-").tempdir()?;
        Ok(Self { dir, threshold })
    }

    pub fn threshold(&self) -> usize {
        self.threshold
    }

    pub fn dir(&self) -> &Path {
        self.dir.path()
    }

    /// File name for a variable path: segments joined by underscores.
    pub fn file_name(path: &str) -> String {
        let stem: String = path
            .split('.')
            .collect::<Vec<_>>()
            .join("_")
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '_' || c == '-' { c } else { '_' })
            .collect();
        format!("{}.txt", stem)
    }

    pub fn write(&self, path: &str, content: &str) -> Result<PathBuf, EngineError> {
        let file = self.dir.path().join(Self::file_name(path));
        std::fs::write(&file, content)?;
        Ok(file)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ctx() -> VariableContext {
        let mut ctx = VariableContext::new();
        ctx.set("name", "cadence");
        ctx.set("count", 5);
        ctx.set(
            "issue",
            json!({"fields": {"summary": "Fix login", "labels": ["bug", "auth"]}}),
        );
        ctx
    }

    #[test]
    fn test_interpolate_bare_and_nested() {
        let ctx = ctx();
        assert_eq!(ctx.interpolate("hi {name} x{count}"), "hi cadence x5");
        assert_eq!(ctx.interpolate("{issue.fields.summary}"), "Fix login");
        assert_eq!(ctx.interpolate("{issue.fields.labels.1}"), "auth");
    }

    #[test]
    fn test_missing_path_is_empty() {
        let ctx = ctx();
        assert_eq!(ctx.interpolate("[{nope}]"), "[]");
        assert_eq!(ctx.interpolate("[{issue.fields.labels.9}]"), "[]");
        assert_eq!(ctx.interpolate("[{name.deeper}]"), "[]");
    }

    #[test]
    fn test_objects_render_as_json() {
        let ctx = ctx();
        assert_eq!(
            ctx.interpolate("{issue.fields.labels}"),
            r#"["bug","auth"]"#
        );
    }

    #[test]
    fn test_json_text_is_walkable() {
        let mut ctx = VariableContext::new();
        ctx.set("out", r#"{"items": [{"id": 7}]}"#);
        assert_eq!(ctx.interpolate("{out.items.0.id}"), "7");
    }

    #[test]
    fn test_non_identifier_braces_untouched() {
        let ctx = ctx();
        assert_eq!(ctx.interpolate(r#"{"a": 1} {name}"#), r#"{"a": 1} cadence"#);
    }

    #[test]
    fn test_interpolation_idempotent_once_substituted() {
        let ctx = ctx();
        let once = ctx.interpolate("{name}-{count}-{issue.fields.summary}");
        assert_eq!(ctx.interpolate(&once), once);
    }

    #[test]
    fn test_externalization_boundary() {
        let externalizer = Externalizer::new(10_000).unwrap();
        let mut ctx = VariableContext::new();
        ctx.set("exact", "a".repeat(10_000));
        ctx.set("over", "b".repeat(10_001));

        let inline = ctx.interpolate_with("{exact}", &externalizer).unwrap();
        assert_eq!(inline.len(), 10_000);

        let reference = ctx.interpolate_with("see {over}", &externalizer).unwrap();
        let expected = externalizer.dir().join("over.txt");
        assert_eq!(reference, format!("see @{}", expected.display()));
        assert_eq!(std::fs::read_to_string(expected).unwrap().len(), 10_001);
    }

    #[test]
    fn test_nested_externalization_file_name() {
        let externalizer = Externalizer::new(3).unwrap();
        let mut ctx = VariableContext::new();
        ctx.set("a", json!({"b": [0, 0, {"c": "long value"}]}));
        let out = ctx.interpolate_with("{a.b.2.c}", &externalizer).unwrap();
        assert!(out.ends_with("a_b_2_c.txt"));
        assert_eq!(Externalizer::file_name("a.b.2.c"), "a_b_2_c.txt");
    }

    #[test]
    fn test_plain_interpolate_never_externalizes() {
        let mut ctx = VariableContext::new();
        ctx.set("big", "z".repeat(20_000));
        assert_eq!(ctx.interpolate("{big}").len(), 20_000);
    }

    #[test]
    fn test_single_placeholder() {
        assert_eq!(single_placeholder("{items}"), Some("items"));
        assert_eq!(single_placeholder(" {a.b.0} "), Some("a.b.0"));
        assert_eq!(single_placeholder("x {items}"), None);
        assert_eq!(single_placeholder("{a}{b}"), None);
        assert!(has_placeholders(&json!(["plain", {"k": "{v}"}])));
        assert!(!has_placeholders(&json!({"k": "plain", "n": 3})));
    }

    #[test]
    fn test_interpolate_value_recurses() {
        let ctx = ctx();
        let v = ctx.interpolate_value(&json!({"k": ["{name}", 1], "n": "{count}"}));
        assert_eq!(v, json!({"k": ["cadence", 1], "n": "5"}));
    }
}
