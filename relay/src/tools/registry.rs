//! Tool registry: name → plugin, plus schema exposure for the LLM request.

use std::sync::Arc;

use dashmap::DashMap;
use serde_json::Value;

use super::{ToolError, ToolPlugin};

/// Process-scoped plugin table; immutable after boot in normal operation.
#[derive(Default)]
pub struct ToolRegistry {
    plugins: DashMap<String, Arc<dyn ToolPlugin>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a plugin after checking metadata/schema consistency and
    /// running its `on_init`.
    pub async fn register(&self, plugin: Arc<dyn ToolPlugin>) -> Result<(), ToolError> {
        let meta = plugin.metadata();
        if meta.name.trim().is_empty() {
            return Err(ToolError::Validation("tool name must not be empty".into()));
        }
        let schema_name = plugin
            .schema()
            .pointer("/function/name")
            .and_then(Value::as_str)
            .map(str::to_string);
        if schema_name.as_deref() != Some(meta.name.as_str()) {
            return Err(ToolError::Validation(format!(
                "schema function name {:?} does not match tool name {:?}",
                schema_name, meta.name
            )));
        }
        plugin.on_init().await?;
        tracing::info!(tool = %meta.name, version = %meta.version, "tool registered");
        self.plugins.insert(meta.name, plugin);
        Ok(())
    }

    pub fn unregister(&self, name: &str) -> bool {
        self.plugins.remove(name).is_some()
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn ToolPlugin>> {
        self.plugins.get(name).map(|p| Arc::clone(p.value()))
    }

    /// Schemas of enabled tools only, for the provider request.
    pub fn enabled_schemas(&self) -> Vec<Value> {
        let mut schemas: Vec<(String, Value)> = self
            .plugins
            .iter()
            .filter(|entry| entry.value().metadata().enabled)
            .map(|entry| (entry.key().clone(), entry.value().schema()))
            .collect();
        schemas.sort_by(|a, b| a.0.cmp(&b.0));
        schemas.into_iter().map(|(_, schema)| schema).collect()
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.plugins.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }
}
