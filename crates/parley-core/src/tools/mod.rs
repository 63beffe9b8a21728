pub mod web;

use std::collections::HashMap;

use anyhow::Result;
use async_trait::async_trait;

/// Trait for tools callable by the model mid-turn.
#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;
    fn description(&self) -> &str;
    fn parameters_schema(&self) -> serde_json::Value;
    async fn execute(&self, params: serde_json::Value) -> Result<String>;
}

/// Registry of available tools.
pub struct ToolRegistry {
    tools: HashMap<String, Box<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            tools: HashMap::new(),
        }
    }

    pub fn register(&mut self, tool: Box<dyn Tool>) {
        self.tools.insert(tool.name().to_string(), tool);
    }

    pub fn get(&self, name: &str) -> Option<&dyn Tool> {
        self.tools.get(name).map(|t| t.as_ref())
    }

    /// Function declarations in the shape the generation provider expects.
    pub fn definitions(&self) -> Vec<serde_json::Value> {
        self.tools
            .values()
            .map(|t| {
                serde_json::json!({
                    "name": t.name(),
                    "description": t.description(),
                    "parameters": t.parameters_schema(),
                })
            })
            .collect()
    }

    /// Execute a tool by name. Parameter problems come back as Ok with a
    /// structured error payload so the generation loop can continue; only
    /// an unknown tool is an Err.
    pub async fn execute(&self, name: &str, params: serde_json::Value) -> Result<String> {
        let Some(tool) = self.tools.get(name) else {
            anyhow::bail!("unknown tool: {name}");
        };

        if let Some(missing) = missing_required(&params, &tool.parameters_schema()) {
            return Ok(serde_json::json!({
                "error": format!("invalid parameters for tool '{name}': missing required field '{missing}'"),
            })
            .to_string());
        }

        tool.execute(params).await
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Return the first required schema field absent from `params`, if any.
fn missing_required(params: &serde_json::Value, schema: &serde_json::Value) -> Option<String> {
    let required = schema.get("required")?.as_array()?;
    let obj = params.as_object();
    for field in required.iter().filter_map(|f| f.as_str()) {
        match obj {
            Some(map) if map.contains_key(field) => {}
            _ => return Some(field.to_string()),
        }
    }
    None
}
