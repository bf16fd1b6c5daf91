//! Tool schemas
//!
//! Tool plugins describe their callable operations in answer to an
//! `{"operation": "schema"}` execution. The answer comes from untrusted code,
//! so it is checked here before anything is built on top of it.

use super::protocol::PluginMetadata;
use crate::error::SchemaError;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;

/// Reserved payload key naming the operation to run
pub const OPERATION_KEY: &str = "operation";

/// Reserved operation asking a tool plugin to describe itself
pub const SCHEMA_OPERATION: &str = "schema";

const MAX_SCHEMA_DEPTH: usize = 16;

/// Parameter value kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParameterType {
    String,
    Number,
    Boolean,
    Object,
}

impl ParameterType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ParameterType::String => "string",
            ParameterType::Number => "number",
            ParameterType::Boolean => "boolean",
            ParameterType::Object => "object",
        }
    }
}

/// One parameter of a tool operation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolParameterSchema {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: ParameterType,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub optional: bool,
    #[serde(default)]
    pub array: bool,
    /// Nested fields, only for `object`
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<ToolParameterSchema>,
}

impl ToolParameterSchema {
    pub fn new(name: &str, kind: ParameterType, description: &str) -> Self {
        Self {
            name: name.to_string(),
            kind,
            description: description.to_string(),
            optional: false,
            array: false,
            children: vec![],
        }
    }
}

/// A named operation a tool plugin can run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolSchema {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(rename = "schema", alias = "parameters", default)]
    pub parameters: Vec<ToolParameterSchema>,
}

/// A loaded tool plugin together with its callable operations
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolPlugin {
    #[serde(flatten)]
    pub metadata: PluginMetadata,
    pub tool_schemas: Vec<ToolSchema>,
}

impl ToolPlugin {
    pub fn tool(&self, name: &str) -> Option<&ToolSchema> {
        self.tool_schemas.iter().find(|t| t.name == name)
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SchemaDocument {
    tool_schemas: Vec<ToolSchema>,
}

/// Parse and check a `schema` response.
///
/// Plugins may answer with the document itself or with a JSON-encoded string
/// of it.
pub fn parse_schema_response(value: Value) -> Result<Vec<ToolSchema>, SchemaError> {
    let document: SchemaDocument = match value {
        Value::String(text) => serde_json::from_str(&text),
        other => serde_json::from_value(other),
    }
    .map_err(|e| SchemaError::Parse(e.to_string()))?;

    if document.tool_schemas.is_empty() {
        return Err(SchemaError::Invalid("no tool schemas".to_string()));
    }

    let mut names = HashSet::new();
    for tool in &document.tool_schemas {
        if tool.name.is_empty() {
            return Err(SchemaError::Invalid("tool with an empty name".to_string()));
        }
        if tool.name == SCHEMA_OPERATION {
            return Err(SchemaError::Invalid(format!(
                "tool name '{}' is reserved",
                SCHEMA_OPERATION
            )));
        }
        if !names.insert(tool.name.as_str()) {
            return Err(SchemaError::Invalid(format!("duplicate tool '{}'", tool.name)));
        }
        check_parameters(&tool.name, &tool.parameters, 1)?;
    }

    Ok(document.tool_schemas)
}

fn check_parameters(
    path: &str,
    parameters: &[ToolParameterSchema],
    depth: usize,
) -> Result<(), SchemaError> {
    if depth > MAX_SCHEMA_DEPTH {
        return Err(SchemaError::Invalid(format!(
            "'{}' nests deeper than {} levels",
            path, MAX_SCHEMA_DEPTH
        )));
    }

    let mut names = HashSet::new();
    for parameter in parameters {
        let here = format!("{}.{}", path, parameter.name);
        if parameter.name.is_empty() {
            return Err(SchemaError::Invalid(format!("empty parameter name in '{}'", path)));
        }
        if depth == 1 && parameter.name == OPERATION_KEY {
            return Err(SchemaError::Invalid(format!(
                "'{}' uses the reserved parameter name '{}'",
                path, OPERATION_KEY
            )));
        }
        if !names.insert(parameter.name.as_str()) {
            return Err(SchemaError::Invalid(format!("duplicate parameter '{}'", here)));
        }
        match parameter.kind {
            ParameterType::Object => check_parameters(&here, &parameter.children, depth + 1)?,
            _ if !parameter.children.is_empty() => {
                return Err(SchemaError::Invalid(format!(
                    "'{}' is a {} and cannot have children",
                    here,
                    parameter.kind.as_str()
                )))
            }
            _ => {}
        }
    }
    Ok(())
}
