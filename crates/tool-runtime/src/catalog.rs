//! Read-only snapshot of the tools a provider exposes.

use std::collections::BTreeMap;
use std::time::Duration;

use serde_json::Value;
use tracing::{debug, info, warn};

use crate::backend::ToolBackend;
use crate::error::BridgeError;
use crate::tool::ToolDefinition;

/// Default bound on the introspection call. Generous because a cold tool
/// provider can take a long time to answer its first request.
pub const DEFAULT_CATALOG_TIMEOUT: Duration = Duration::from_secs(120);

/// Tools discovered from the provider, keyed by unique name.
///
/// Built once and never mutated, so it is shared as `Arc<ToolCatalog>`
/// between sessions without locking.
#[derive(Debug, Clone, Default)]
pub struct ToolCatalog {
    tools: BTreeMap<String, ToolDefinition>,
}

impl ToolCatalog {
    /// Fetch the tool list through `backend`, bounded by `timeout`.
    ///
    /// Does not retry; reconnect policy belongs to the supervisor.
    pub async fn fetch(backend: &dyn ToolBackend, timeout: Duration) -> Result<Self, BridgeError> {
        debug!(timeout_secs = timeout.as_secs(), "Fetching tool catalog");
        let listed = match tokio::time::timeout(timeout, backend.list_tools(timeout)).await {
            Ok(Ok(tools)) => tools,
            Ok(Err(BridgeError::CatalogUnavailable(reason))) => {
                return Err(BridgeError::CatalogUnavailable(reason))
            }
            Ok(Err(e)) => return Err(BridgeError::CatalogUnavailable(e.to_string())),
            Err(_) => {
                warn!(timeout_secs = timeout.as_secs(), "Tool catalog request timed out");
                return Err(BridgeError::CatalogUnavailable(format!(
                    "no answer within {}s",
                    timeout.as_secs()
                )));
            }
        };
        let catalog = Self::from_definitions(listed)?;
        info!(count = catalog.len(), "Tool catalog loaded");
        Ok(catalog)
    }

    /// Build a catalog from definitions, rejecting empty or duplicate names.
    pub fn from_definitions(definitions: Vec<ToolDefinition>) -> Result<Self, BridgeError> {
        let mut tools = BTreeMap::new();
        for def in definitions {
            if def.name.is_empty() {
                return Err(BridgeError::CatalogUnavailable(
                    "tool list contains an unnamed tool".to_string(),
                ));
            }
            if tools.contains_key(&def.name) {
                return Err(BridgeError::CatalogUnavailable(format!(
                    "tool '{}' listed more than once",
                    def.name
                )));
            }
            tools.insert(def.name.clone(), def);
        }
        Ok(Self { tools })
    }

    /// All definitions, ordered by name.
    pub fn list(&self) -> Vec<&ToolDefinition> {
        self.tools.values().collect()
    }

    /// Owned copies for submission to the model provider.
    pub fn definitions(&self) -> Vec<ToolDefinition> {
        self.tools.values().cloned().collect()
    }

    pub fn get(&self, name: &str) -> Option<&ToolDefinition> {
        self.tools.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// Check `arguments` against the tool's input schema.
    ///
    /// Covers the object shape, `required` keys and primitive `type`s of the
    /// properties that are present. Anything richer is left to the provider.
    pub fn validate(&self, name: &str, arguments: &Value) -> Result<(), String> {
        let def = self
            .get(name)
            .ok_or_else(|| format!("unknown tool '{}'", name))?;
        let schema = &def.input_schema;

        let Some(args) = arguments.as_object() else {
            return Err("arguments must be a JSON object".to_string());
        };

        if let Some(required) = schema.get("required").and_then(Value::as_array) {
            for key in required.iter().filter_map(Value::as_str) {
                if !args.contains_key(key) {
                    return Err(format!("missing required argument '{}'", key));
                }
            }
        }

        if let Some(properties) = schema.get("properties").and_then(Value::as_object) {
            for (key, value) in args {
                let Some(expected) = properties.get(key).and_then(|p| p.get("type")) else {
                    continue;
                };
                if !type_matches(expected, value) {
                    return Err(format!("argument '{}' should be of type {}", key, expected));
                }
            }
        }

        Ok(())
    }
}

fn type_matches(expected: &Value, value: &Value) -> bool {
    match expected {
        Value::String(ty) => primitive_matches(ty, value),
        Value::Array(options) => options
            .iter()
            .filter_map(Value::as_str)
            .any(|ty| primitive_matches(ty, value)),
        _ => true,
    }
}

fn primitive_matches(ty: &str, value: &Value) -> bool {
    match ty {
        "string" => value.is_string(),
        "number" => value.is_number(),
        "integer" => value.is_i64() || value.is_u64(),
        "boolean" => value.is_boolean(),
        "object" => value.is_object(),
        "array" => value.is_array(),
        "null" => value.is_null(),
        _ => true,
    }
}
