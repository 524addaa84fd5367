//! Workflow discovery: finds workflow YAML files inside a project.
//!
//! Workflows live under `<project>/.cadence/workflows/`, at any depth.
//! A workflow can be selected by its `name`, by its file stem, or by a
//! direct file path.

use std::path::{Path, PathBuf};

use crate::error::EngineError;
use crate::workflow::schema::WorkflowDefinition;

/// Project-relative directory holding workflow files.
pub const WORKFLOW_DIR: &str = ".cadence/workflows";

/// A workflow file found during discovery.
#[derive(Debug, Clone)]
pub struct WorkflowEntry {
    pub name: String,
    pub path: PathBuf,
    pub step_count: usize,
    pub description: Option<String>,
}

/// Loads workflow definitions from a project directory.
pub struct WorkflowLoader {
    project_dir: PathBuf,
}

impl WorkflowLoader {
    pub fn new(project_dir: impl Into<PathBuf>) -> Self {
        Self {
            project_dir: project_dir.into(),
        }
    }

    pub fn workflow_dir(&self) -> PathBuf {
        self.project_dir.join(WORKFLOW_DIR)
    }

    /// Recursively list every workflow file. Unparseable files are skipped
    /// with a warning.
    pub fn discover(&self) -> Result<Vec<WorkflowEntry>, EngineError> {
        let root = self.workflow_dir();
        if !root.is_dir() {
            return Ok(Vec::new());
        }

        let mut entries = Vec::new();
        for ext in ["yaml", "yml"] {
            let pattern = format!("{}/**/*.{}", root.display(), ext);
            let paths = glob::glob(&pattern)
                .map_err(|e| EngineError::Io(format!("Invalid glob '{}': {}", pattern, e)))?;

            for path in paths.flatten() {
                match WorkflowDefinition::from_file(&path) {
                    Ok(def) => {
                        tracing::debug!("[WorkflowLoader] Found workflow: {} ({})", def.name, path.display());
                        entries.push(WorkflowEntry {
                            name: def.name,
                            step_count: def.steps.len(),
                            description: def.description,
                            path,
                        });
                    }
                    Err(e) => {
                        tracing::warn!("[WorkflowLoader] Skipping '{}': {}", path.display(), e);
                    }
                }
            }
        }

        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(entries)
    }

    /// Resolve a selector (file path, workflow name or file stem) to a
    /// loaded definition and its path.
    pub fn find(&self, selector: &str) -> Result<(PathBuf, WorkflowDefinition), EngineError> {
        let direct = Path::new(selector);
        let candidates = [direct.to_path_buf(), self.project_dir.join(selector)];
        for candidate in candidates {
            if candidate.is_file() {
                let def = WorkflowDefinition::from_file(&candidate)?;
                return Ok((candidate, def));
            }
        }

        for entry in self.discover()? {
            let stem = entry
                .path
                .file_stem()
                .map(|s| s.to_string_lossy().to_string())
                .unwrap_or_default();
            if entry.name == selector || stem == selector {
                let def = WorkflowDefinition::from_file(&entry.path)?;
                return Ok((entry.path, def));
            }
        }

        Err(EngineError::WorkflowNotFound(format!(
            "'{}' (searched {})",
            selector,
            self.workflow_dir().display()
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write(dir: &Path, rel: &str, body: &str) {
        let path = dir.join(rel);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, body).unwrap();
    }

    #[test]
    fn test_discover_recursive() {
        let tmp = tempfile::tempdir().unwrap();
        write(
            tmp.path(),
            ".cadence/workflows/a.yaml",
            "name: alpha\nsteps:\n  - name: s\n    tool: break\n",
        );
        write(
            tmp.path(),
            ".cadence/workflows/nested/deeper/b.yml",
            "name: beta\nsteps: []\n",
        );
        write(tmp.path(), ".cadence/workflows/broken.yaml", "not: [valid");

        let loader = WorkflowLoader::new(tmp.path());
        let found = loader.discover().unwrap();
        let names: Vec<_> = found.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["alpha", "beta"]);
        assert_eq!(found[0].step_count, 1);
    }

    #[test]
    fn test_find_by_name_stem_and_path() {
        let tmp = tempfile::tempdir().unwrap();
        write(
            tmp.path(),
            ".cadence/workflows/release.yaml",
            "name: Ship It\nsteps: []\n",
        );
        let loader = WorkflowLoader::new(tmp.path());

        assert_eq!(loader.find("Ship It").unwrap().1.name, "Ship It");
        assert_eq!(loader.find("release").unwrap().1.name, "Ship It");
        assert_eq!(
            loader.find(".cadence/workflows/release.yaml").unwrap().1.name,
            "Ship It"
        );
        assert!(matches!(
            loader.find("missing"),
            Err(EngineError::WorkflowNotFound(_))
        ));
    }
}
