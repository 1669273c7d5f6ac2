//! Tool contract and registry.
//!
//! A tool exposes a name, a JSON schema for its parameters, and a
//! synchronous-looking contract: validated params in, result string out.
//! Concrete tools (RAG search, image generation, file access inside a
//! project sandbox) live with the outer layer; the core only needs the
//! contract, plus enough validation to turn malformed model output into an
//! error string the model can react to.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

/// A tool's name, description, and JSON schema, as handed to providers.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolSchema {
    pub name: String,
    pub description: String,
    /// JSON Schema for the parameters object.
    pub parameters: Value,
}

/// The tool contract.
#[async_trait]
pub trait Tool: Send + Sync {
    fn schema(&self) -> ToolSchema;

    /// Execute with already-validated params. Errors become strings that
    /// are fed back to the model, not worker failures.
    async fn execute(
        &self,
        params: Value,
        cancel: &CancellationToken,
    ) -> anyhow::Result<String>;
}

/// Name -> tool mapping, built once at composition time.
#[derive(Clone, Default)]
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        self.tools.insert(tool.schema().name, tool);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    /// Schemas for the named tools, in name order. Unknown names are
    /// skipped with a warning so one bad plan entry does not sink a task.
    pub fn schemas_for(&self, names: &[String]) -> Vec<ToolSchema> {
        let mut schemas = Vec::new();
        for name in names {
            match self.tools.get(name) {
                Some(tool) => schemas.push(tool.schema()),
                None => tracing::warn!(tool = %name, "requested tool is not registered"),
            }
        }
        schemas.sort_by(|a, b| a.name.cmp(&b.name));
        schemas
    }
}

/// Validate a params object against a tool's JSON schema.
///
/// Checks the level the model actually gets wrong: params must be an
/// object, every `required` property must be present, and declared
/// primitive types must match. Deeper schema features are the tool's own
/// responsibility.
pub fn validate_params(schema: &ToolSchema, params: &Value) -> Result<(), String> {
    let Value::Object(params_map) = params else {
        return Err(format!(
            "params for tool {:?} must be a JSON object, got {params}",
            schema.name
        ));
    };

    let properties = schema.parameters.get("properties").and_then(Value::as_object);

    if let Some(required) = schema.parameters.get("required").and_then(Value::as_array) {
        for name in required.iter().filter_map(Value::as_str) {
            if !params_map.contains_key(name) {
                return Err(format!(
                    "missing required parameter {name:?} for tool {:?}",
                    schema.name
                ));
            }
        }
    }

    if let Some(properties) = properties {
        for (name, value) in params_map {
            let Some(declared) = properties.get(name).and_then(|p| p.get("type")) else {
                continue;
            };
            let Some(expected) = declared.as_str() else {
                continue;
            };
            if !type_matches(expected, value) {
                return Err(format!(
                    "parameter {name:?} for tool {:?} should be {expected}, got {value}",
                    schema.name
                ));
            }
        }
    }

    Ok(())
}

fn type_matches(expected: &str, value: &Value) -> bool {
    match expected {
        "string" => value.is_string(),
        "number" => value.is_number(),
        "integer" => value.is_i64() || value.is_u64(),
        "boolean" => value.is_boolean(),
        "array" => value.is_array(),
        "object" => value.is_object(),
        "null" => value.is_null(),
        _ => true,
    }
}
