//! Loop controller: foreach, while, range and retry.
//!
//! Every loop follows the same contract:
//!
//! - a [`LoopFrame`](super::LoopFrame) is pushed on entry, saving the prior
//!   values of the loop's own variables, and popped on every exit path
//!   (normal end, `break`, ceiling, error), restoring those values;
//! - after each pass the loop consumes the block's signal, so `continue`
//!   ends the pass and `break` ends the loop;
//! - the loop's output is a small JSON summary object.

use std::cmp::Ordering;
use std::time::Duration;

use serde_json::{json, Value};

use crate::condition;
use crate::context::{single_placeholder, value_to_string, walk, VariableContext};
use crate::error::EngineError;
use crate::workflow::{
    ForeachSpec, IntOrTemplate, OnExhausted, RangeSpec, RetrySpec, SortOrder, WhileSpec,
};

use super::compile::{Block, CompiledStep};
use super::{Interpreter, LoopKind, RunState, Signal};

#[derive(Debug, Clone)]
pub struct ForeachLoop {
    pub items: Value,
    pub item_var: String,
    pub index_var: String,
    pub filter: Option<String>,
    pub sort_by: Option<String>,
    pub sort_order: SortOrder,
    pub until: Option<String>,
}

impl From<&ForeachSpec> for ForeachLoop {
    fn from(spec: &ForeachSpec) -> Self {
        Self {
            items: spec.items.clone(),
            item_var: spec.item_var.clone(),
            index_var: spec.index_var.clone(),
            filter: spec.filter.clone(),
            sort_by: spec.sort_by.clone(),
            sort_order: spec.sort_order,
            until: spec.until.clone(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct WhileLoop {
    pub condition: String,
    pub max_iterations: u32,
    pub counter_var: String,
    pub on_exhausted: OnExhausted,
}

impl From<&WhileSpec> for WhileLoop {
    fn from(spec: &WhileSpec) -> Self {
        Self {
            condition: spec.condition.clone(),
            max_iterations: spec.max_iterations,
            counter_var: spec.counter_var.clone(),
            on_exhausted: spec.on_exhausted,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RangeLoop {
    pub from: IntOrTemplate,
    pub to: IntOrTemplate,
    pub step: i64,
    pub var: String,
}

impl From<&RangeSpec> for RangeLoop {
    fn from(spec: &RangeSpec) -> Self {
        Self {
            from: spec.from.clone(),
            to: spec.to.clone(),
            step: spec.step,
            var: spec.var.clone(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RetryLoop {
    pub max_attempts: u32,
    pub delay: Duration,
    pub until: Option<String>,
    pub attempt_var: String,
    pub on_exhausted: OnExhausted,
}

impl From<&RetrySpec> for RetryLoop {
    fn from(spec: &RetrySpec) -> Self {
        Self {
            max_attempts: spec.max_attempts,
            delay: Duration::from_millis(spec.delay_ms),
            until: spec.until.clone(),
            attempt_var: spec.attempt_var.clone(),
            on_exhausted: spec.on_exhausted,
        }
    }
}

impl Interpreter {
    pub(super) async fn run_foreach(
        &self,
        step: &CompiledStep,
        entry: usize,
        spec: &ForeachLoop,
        body: &Block,
        run: &mut RunState,
        path: &str,
    ) -> Result<Value, EngineError> {
        run.ctx.enter_loop(
            LoopKind::Iteration,
            &step.name,
            entry,
            &[spec.item_var.as_str(), spec.index_var.as_str()],
        );
        let result = self.foreach_passes(step, spec, body, run, path).await;
        run.ctx.exit_loop();
        result
    }

    async fn foreach_passes(
        &self,
        step: &CompiledStep,
        spec: &ForeachLoop,
        body: &Block,
        run: &mut RunState,
        path: &str,
    ) -> Result<Value, EngineError> {
        let items = resolve_items(&spec.items, &run.ctx.variables)
            .map_err(|m| EngineError::step_failed(&step.name, m))?;
        let items = match &spec.filter {
            Some(filter) => filter_items(items, filter, spec, &mut run.ctx.variables),
            None => items,
        };
        let items = sort_items(items, spec.sort_by.as_deref(), spec.sort_order);
        run.ctx.set_total(items.len());
        tracing::info!("[Loop] foreach '{}' over {} items", path, items.len());

        let mut iterations = 0usize;
        let mut completed = 0usize;
        let mut broken = false;

        for (index, item) in items.into_iter().enumerate() {
            run.ctx.variables.set(spec.item_var.clone(), item);
            run.ctx.variables.set(spec.index_var.clone(), index);
            run.ctx.set_cursor(index);

            iterations += 1;
            self.run_block(body, run, path).await?;
            if run.ctx.take_signal() == Signal::Break {
                broken = true;
                break;
            }
            completed += 1;

            if let Some(until) = &spec.until {
                if condition::evaluate(until, &run.ctx.variables) {
                    tracing::debug!("[Loop] foreach '{}' stopped by until after {}", path, index);
                    break;
                }
            }
        }

        Ok(json!({
            "iterations": iterations,
            "completed": completed,
            "broken": broken,
        }))
    }

    pub(super) async fn run_while(
        &self,
        step: &CompiledStep,
        entry: usize,
        spec: &WhileLoop,
        body: &Block,
        run: &mut RunState,
        path: &str,
    ) -> Result<Value, EngineError> {
        run.ctx
            .enter_loop(LoopKind::While, &step.name, entry, &[spec.counter_var.as_str()]);
        let result = self.while_passes(step, spec, body, run, path).await;
        run.ctx.exit_loop();
        result
    }

    async fn while_passes(
        &self,
        step: &CompiledStep,
        spec: &WhileLoop,
        body: &Block,
        run: &mut RunState,
        path: &str,
    ) -> Result<Value, EngineError> {
        let mut iterations = 0u32;

        let exhausted = loop {
            if !condition::evaluate(&spec.condition, &run.ctx.variables) {
                break false;
            }
            if iterations >= spec.max_iterations {
                break true;
            }

            run.ctx.set_cursor(iterations as usize);
            iterations += 1;
            run.ctx.variables.set(spec.counter_var.clone(), iterations);

            self.run_block(body, run, path).await?;
            if run.ctx.take_signal() == Signal::Break {
                break false;
            }
        };

        if exhausted {
            let detail = format!(
                "condition '{}' still true after {} iterations",
                spec.condition, spec.max_iterations
            );
            match spec.on_exhausted {
                OnExhausted::Error => {
                    return Err(EngineError::LoopExhausted {
                        step: step.name.clone(),
                        detail,
                    });
                }
                OnExhausted::Continue => {
                    tracing::warn!("[Loop] while '{}' exhausted: {}, continuing", path, detail);
                }
            }
        }

        Ok(json!({ "iterations": iterations, "exhausted": exhausted }))
    }

    pub(super) async fn run_range(
        &self,
        step: &CompiledStep,
        entry: usize,
        spec: &RangeLoop,
        body: &Block,
        run: &mut RunState,
        path: &str,
    ) -> Result<Value, EngineError> {
        run.ctx
            .enter_loop(LoopKind::Range, &step.name, entry, &[spec.var.as_str()]);
        let result = self.range_passes(step, spec, body, run, path).await;
        run.ctx.exit_loop();
        result
    }

    async fn range_passes(
        &self,
        step: &CompiledStep,
        spec: &RangeLoop,
        body: &Block,
        run: &mut RunState,
        path: &str,
    ) -> Result<Value, EngineError> {
        let vars = &run.ctx.variables;
        let from = resolve_bound(&spec.from, vars).map_err(|m| EngineError::step_failed(&step.name, m))?;
        let to = resolve_bound(&spec.to, vars).map_err(|m| EngineError::step_failed(&step.name, m))?;
        let total = range_len(from, to, spec.step);
        run.ctx.set_total(total);
        tracing::info!(
            "[Loop] range '{}' {}..={} step {} ({} passes)",
            path,
            from,
            to,
            spec.step,
            total
        );

        let mut iterations = 0usize;
        for k in 0..total {
            let value = (from as i128 + k as i128 * spec.step as i128) as i64;
            run.ctx.variables.set(spec.var.clone(), value);
            run.ctx.set_cursor(k);

            iterations += 1;
            self.run_block(body, run, path).await?;
            if run.ctx.take_signal() == Signal::Break {
                break;
            }
        }

        Ok(json!({ "iterations": iterations }))
    }

    pub(super) async fn run_retry(
        &self,
        step: &CompiledStep,
        entry: usize,
        spec: &RetryLoop,
        body: &Block,
        run: &mut RunState,
        path: &str,
    ) -> Result<Value, EngineError> {
        run.ctx
            .enter_loop(LoopKind::Retry, &step.name, entry, &[spec.attempt_var.as_str()]);
        run.ctx.set_total(spec.max_attempts as usize);
        let result = self.retry_passes(step, spec, body, run, path).await;
        run.ctx.exit_loop();
        result
    }

    async fn retry_passes(
        &self,
        step: &CompiledStep,
        spec: &RetryLoop,
        body: &Block,
        run: &mut RunState,
        path: &str,
    ) -> Result<Value, EngineError> {
        let mut attempts = 0u32;
        let mut success = false;
        let mut last_error: Option<String> = None;

        while attempts < spec.max_attempts {
            run.ctx.set_cursor(attempts as usize);
            attempts += 1;
            run.ctx.variables.set(spec.attempt_var.clone(), attempts);

            let failed = match self.run_block(body, run, path).await {
                Ok(()) => false,
                Err(e) if e.is_step_failure() => {
                    tracing::warn!(
                        "[Loop] retry '{}' attempt {}/{} failed: {}",
                        path,
                        attempts,
                        spec.max_attempts,
                        e
                    );
                    last_error = Some(e.message());
                    true
                }
                Err(e) => return Err(e),
            };
            let signal = run.ctx.take_signal();

            success = match &spec.until {
                Some(until) => condition::evaluate(until, &run.ctx.variables),
                None => !failed,
            };
            if success || signal == Signal::Break {
                break;
            }

            if attempts < spec.max_attempts && !spec.delay.is_zero() {
                tokio::time::sleep(spec.delay).await;
            }
        }

        if !success && attempts >= spec.max_attempts {
            let detail = format!(
                "{} attempts without success{}",
                attempts,
                last_error
                    .as_deref()
                    .map(|e| format!(" (last error: {})", e))
                    .unwrap_or_default()
            );
            match spec.on_exhausted {
                OnExhausted::Error => {
                    return Err(EngineError::LoopExhausted {
                        step: step.name.clone(),
                        detail,
                    });
                }
                OnExhausted::Continue => {
                    tracing::warn!("[Loop] retry '{}' exhausted: {}, continuing", path, detail);
                }
            }
        } else if success {
            tracing::info!("[Loop] retry '{}' succeeded on attempt {}", path, attempts);
        }

        Ok(json!({
            "success": success,
            "attempts": attempts,
            "last_error": last_error,
        }))
    }
}

/// Materialize a foreach `items` value into a list.
///
/// A YAML list has its strings interpolated. A template that is exactly
/// `{path}` binds the raw value; any other template is interpolated and then
/// read as a JSON array, or as non-empty lines.
fn resolve_items(items: &Value, vars: &VariableContext) -> Result<Vec<Value>, String> {
    match items {
        Value::Array(list) => Ok(list.iter().map(|v| vars.interpolate_value(v)).collect()),
        Value::String(template) => match single_placeholder(template) {
            Some(path) => Ok(match vars.resolve(path) {
                Some(Value::Array(list)) => list,
                Some(Value::String(text)) => split_text(&text),
                Some(Value::Null) | None => Vec::new(),
                Some(other) => vec![other],
            }),
            None => Ok(split_text(&vars.interpolate(template))),
        },
        Value::Null => Ok(Vec::new()),
        other => Err(format!("items must be a list or a template, got {}", other)),
    }
}

fn split_text(text: &str) -> Vec<Value> {
    let trimmed = text.trim();
    if trimmed.starts_with('[') {
        if let Ok(Value::Array(list)) = serde_json::from_str::<Value>(trimmed) {
            return list;
        }
    }
    trimmed
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(|line| Value::String(line.to_string()))
        .collect()
}

/// Keep the items for which `filter` holds with the item bound.
fn filter_items(
    items: Vec<Value>,
    filter: &str,
    spec: &ForeachLoop,
    vars: &mut VariableContext,
) -> Vec<Value> {
    items
        .into_iter()
        .enumerate()
        .filter_map(|(index, item)| {
            vars.set(spec.item_var.clone(), item.clone());
            vars.set(spec.index_var.clone(), index);
            condition::evaluate(filter, vars).then_some(item)
        })
        .collect()
}

/// Stable sort by the value at `sort_by` (`.` is the item itself).
fn sort_items(mut items: Vec<Value>, sort_by: Option<&str>, order: SortOrder) -> Vec<Value> {
    let Some(path) = sort_by else {
        return items;
    };
    let segments: Vec<&str> = path.split('.').collect();
    let key = |item: &Value| -> Value {
        if path == "." {
            item.clone()
        } else {
            walk(item, &segments).unwrap_or(Value::Null)
        }
    };

    items.sort_by(|a, b| {
        let ord = compare_keys(&key(a), &key(b));
        match order {
            SortOrder::Asc => ord,
            SortOrder::Desc => ord.reverse(),
        }
    });
    items
}

fn compare_keys(a: &Value, b: &Value) -> Ordering {
    match (as_number(a), as_number(b)) {
        (Some(x), Some(y)) => x.partial_cmp(&y).unwrap_or(Ordering::Equal),
        _ => value_to_string(a).cmp(&value_to_string(b)),
    }
}

fn as_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn resolve_bound(bound: &IntOrTemplate, vars: &VariableContext) -> Result<i64, String> {
    match bound {
        IntOrTemplate::Int(n) => Ok(*n),
        IntOrTemplate::Template(template) => {
            let text = vars.interpolate(template);
            text.trim()
                .parse::<i64>()
                .map_err(|_| format!("range bound '{}' is not an integer ('{}')", template, text))
        }
    }
}

/// Number of values in the inclusive range; zero when `step` points away
/// from `to`.
fn range_len(from: i64, to: i64, step: i64) -> usize {
    let (from, to, step) = (from as i128, to as i128, step as i128);
    let span = if step > 0 && from <= to {
        (to - from) / step + 1
    } else if step < 0 && from >= to {
        (from - to) / -step + 1
    } else {
        0
    };
    usize::try_from(span).unwrap_or(usize::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_range_len_directions() {
        assert_eq!(range_len(5, 1, 1), 0);
        assert_eq!(range_len(5, 1, -1), 5);
        assert_eq!(range_len(1, 5, 1), 5);
        assert_eq!(range_len(1, 5, 2), 3);
        assert_eq!(range_len(1, 6, 2), 3);
        assert_eq!(range_len(3, 3, -4), 1);
        assert_eq!(range_len(1, 5, -1), 0);
    }

    #[test]
    fn test_resolve_items_forms() {
        let mut vars = VariableContext::new();
        vars.set("list", json!([{"id": 1}, {"id": 2}]));
        vars.set("text", "alpha\n\n beta \n");
        vars.set("name", "x");

        assert_eq!(
            resolve_items(&json!("{list}"), &vars).unwrap(),
            vec![json!({"id": 1}), json!({"id": 2})]
        );
        assert_eq!(
            resolve_items(&json!("{text}"), &vars).unwrap(),
            vec![json!("alpha"), json!("beta")]
        );
        assert_eq!(
            resolve_items(&json!(["{name}-1", 2]), &vars).unwrap(),
            vec![json!("x-1"), json!(2)]
        );
        assert_eq!(
            resolve_items(&json!("[\"{name}\", \"y\"]"), &vars).unwrap(),
            vec![json!("x"), json!("y")]
        );
        assert!(resolve_items(&json!("{missing}"), &vars).unwrap().is_empty());
        assert!(resolve_items(&json!(7), &vars).is_err());
    }

    #[test]
    fn test_sort_items_numeric_and_stable() {
        let items = vec![
            json!({"n": "10", "tag": "a"}),
            json!({"n": 9, "tag": "b"}),
            json!({"n": "10", "tag": "c"}),
        ];
        let asc = sort_items(items.clone(), Some("n"), SortOrder::Asc);
        let tags: Vec<&str> = asc.iter().map(|v| v["tag"].as_str().unwrap()).collect();
        assert_eq!(tags, vec!["b", "a", "c"]);

        let desc = sort_items(items, Some("n"), SortOrder::Desc);
        let tags: Vec<&str> = desc.iter().map(|v| v["tag"].as_str().unwrap()).collect();
        assert_eq!(tags, vec!["a", "c", "b"]);

        let words = sort_items(vec![json!("pear"), json!("apple")], Some("."), SortOrder::Asc);
        assert_eq!(words, vec![json!("apple"), json!("pear")]);
    }

    #[test]
    fn test_filter_items_binds_item() {
        let spec = ForeachLoop {
            items: Value::Null,
            item_var: "item".into(),
            index_var: "index".into(),
            filter: None,
            sort_by: None,
            sort_order: SortOrder::Asc,
            until: None,
        };
        let mut vars = VariableContext::new();
        let kept = filter_items(
            vec![json!({"state": "open"}), json!({"state": "closed"})],
            "{item.state} == open",
            &spec,
            &mut vars,
        );
        assert_eq!(kept, vec![json!({"state": "open"})]);
    }

    #[test]
    fn test_resolve_bound_template() {
        let mut vars = VariableContext::new();
        vars.set("limit", 4);
        vars.set("word", "four");
        assert_eq!(
            resolve_bound(&IntOrTemplate::Template("{limit}".into()), &vars),
            Ok(4)
        );
        assert!(resolve_bound(&IntOrTemplate::Template("{word}".into()), &vars).is_err());
    }
}
