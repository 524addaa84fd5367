//! External tool adapters.
//!
//! Built-in tools (bash, agent, prompt, set, log and the control-flow tools)
//! are part of the closed `ToolSpec` union. Anything else (issue trackers,
//! JSON query engines, file writers) plugs in here as a `ToolAdapter` and is
//! referenced from a step with `tool: adapter`.
//!
//! Adapter names are resolved once, when a workflow is compiled; a step that
//! names an unregistered adapter is a load-time error.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::context::VariableContext;

/// Everything an adapter receives for one invocation.
#[derive(Debug, Clone)]
pub struct AdapterCall {
    /// Name of the step being executed
    pub step: String,
    /// Step parameters, with every string already interpolated
    pub params: Value,
    /// Resolved working directory
    pub cwd: PathBuf,
}

#[async_trait]
pub trait ToolAdapter: Send + Sync {
    /// Name used in `adapter:` fields.
    fn name(&self) -> &str;

    /// Run the adapter. `Err` is a step failure, subject to `on_error`.
    async fn invoke(&self, call: AdapterCall, vars: &mut VariableContext) -> Result<Value, String>;
}

/// Registry of external adapters, keyed by name.
#[derive(Clone, Default)]
pub struct AdapterRegistry {
    adapters: HashMap<String, Arc<dyn ToolAdapter>>,
}

impl AdapterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, adapter: Arc<dyn ToolAdapter>) {
        tracing::debug!("[Adapters] Registered adapter '{}'", adapter.name());
        self.adapters.insert(adapter.name().to_string(), adapter);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn ToolAdapter>> {
        self.adapters.get(name).cloned()
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.adapters.keys().map(|k| k.as_str()).collect();
        names.sort_unstable();
        names
    }
}

impl std::fmt::Debug for AdapterRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdapterRegistry")
            .field("adapters", &self.names())
            .finish()
    }
}
