//! `cadence run | validate | list`: drive project workflows.

use std::path::Path;

use cadence_core::interpreter::StepStatus;
use cadence_core::shared::SharedResolver;
use cadence_core::{EngineConfig, Interpreter, RunReport, WorkflowLoader};

use super::{parse_var, print_json};

/// Options for `cadence run`.
#[derive(Debug, Default, Clone)]
pub struct RunOptions {
    /// `KEY=VALUE` overrides layered over the workflow's variables
    pub vars: Vec<String>,
    pub callback_port: Option<u16>,
    /// Print the final report as JSON instead of a step table
    pub json: bool,
}

/// Run a workflow selected by name, file stem or path.
pub async fn run(project_dir: &Path, selector: &str, opts: &RunOptions) -> Result<(), String> {
    let report = execute(project_dir, selector, opts).await?;

    if opts.json {
        print_json(&report_json(&report));
    } else {
        print_records(&report);
    }

    if report.success {
        println!("\n🎉 Workflow '{}' completed successfully!", report.workflow_name);
        Ok(())
    } else {
        let failed_steps: Vec<_> = report
            .steps
            .iter()
            .filter(|s| s.status == StepStatus::Failed)
            .map(|s| s.step_name.clone())
            .collect();
        Err(format!(
            "Workflow failed. Failed steps: {}",
            failed_steps.join(", ")
        ))
    }
}

/// Load, compile and execute a workflow, returning the raw report.
pub async fn execute(
    project_dir: &Path,
    selector: &str,
    opts: &RunOptions,
) -> Result<RunReport, String> {
    let overrides = opts
        .vars
        .iter()
        .map(|raw| parse_var(raw))
        .collect::<Result<Vec<_>, _>>()?;

    let loader = WorkflowLoader::new(project_dir);
    let (path, definition) = loader.find(selector).map_err(|e| e.to_string())?;

    println!("📄 Loaded workflow: {} ({})", definition.name, path.display());
    println!("   {} step(s)", definition.steps.len());
    println!();

    let mut config = EngineConfig::from_env(project_dir);
    if let Some(port) = opts.callback_port {
        config = config.with_callback_port(port);
    }

    let mut interpreter = Interpreter::new(config);
    let workflow = interpreter
        .compile(definition, Some(&path))
        .map_err(|e| e.to_string())?;

    interpreter
        .run_with_variables(&workflow, overrides)
        .await
        .map_err(|e| e.to_string())
}

/// Validate a workflow without executing it. Shared step references are
/// resolved and checked too.
pub fn validate(project_dir: &Path, selector: &str) -> Result<(), String> {
    let loader = WorkflowLoader::new(project_dir);
    let (path, definition) = loader.find(selector).map_err(|e| e.to_string())?;
    let steps: Vec<(String, &'static str)> = definition
        .steps
        .iter()
        .map(|s| (s.name.clone(), s.tool.kind()))
        .collect();
    let version = definition.version.clone();

    let mut interpreter = Interpreter::new(EngineConfig::new(project_dir));
    let workflow = interpreter
        .compile(definition, Some(&path))
        .map_err(|e| e.to_string())?;

    println!("✅ Workflow '{}' is valid", workflow.name);
    println!("   Version: {}", version);
    println!("   Steps: {} ({} including nested)", workflow.body.len(), workflow.body.step_count());

    for (i, (name, kind)) in steps.iter().enumerate() {
        println!("   {}. {} (tool: {})", i + 1, name, kind);
    }

    Ok(())
}

/// List discovered workflows and the shared steps available to them.
pub fn list(project_dir: &Path) -> Result<(), String> {
    let loader = WorkflowLoader::new(project_dir);
    let entries = loader.discover().map_err(|e| e.to_string())?;

    println!(
        "Found {} workflow(s) in '{}'",
        entries.len(),
        loader.workflow_dir().display()
    );
    println!();
    println!("┌──────────────────────┬───────┬──────────────────────────────────┐");
    println!("│ Name                 │ Steps │ Description                      │");
    println!("├──────────────────────┼───────┼──────────────────────────────────┤");

    for entry in &entries {
        println!(
            "│ {:<20} │ {:>5} │ {:<32} │",
            truncate(&entry.name, 20),
            entry.step_count,
            truncate(entry.description.as_deref().unwrap_or(""), 32),
        );
    }

    println!("└──────────────────────┴───────┴──────────────────────────────────┘");
    println!();
    println!("Built-in shared steps: {}", SharedResolver::builtin_names().join(", "));
    Ok(())
}

fn print_records(report: &RunReport) {
    for record in &report.steps {
        let icon = match record.status {
            StepStatus::Succeeded => "✓",
            StepStatus::Skipped => "-",
            StepStatus::Failed => "✗",
        };
        match &record.error {
            Some(err) => println!("  {} {}: {}", icon, record.step_name, truncate(err, 100)),
            None if record.output_preview.is_empty() => println!("  {} {}", icon, record.step_name),
            None => println!(
                "  {} {} → {}",
                icon,
                record.step_name,
                truncate(&record.output_preview.replace('\n', " "), 80)
            ),
        }
    }
}

/// JSON view of a finished run.
pub fn report_json(report: &RunReport) -> serde_json::Value {
    let variables: serde_json::Map<String, serde_json::Value> = report
        .context
        .variables
        .iter()
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();

    serde_json::json!({
        "workflow": report.workflow_name,
        "success": report.success,
        "error": report.context.error,
        "steps": report.steps,
        "variables": variables,
    })
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let head: String = s.chars().take(max.saturating_sub(1)).collect();
        format!("{}…", head)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truncate_is_char_safe() {
        assert_eq!(truncate("short", 10), "short");
        assert_eq!(truncate("ééééé", 3), "éé…");
    }
}
