//! Tool argument binding
//!
//! Checks caller-supplied arguments against a tool's declared parameters,
//! builds the execute payload, and reports the outcome as a structured
//! result that never exposes protocol internals.

use super::manager::PluginManager;
use super::schema::{ParameterType, ToolParameterSchema, ToolSchema, OPERATION_KEY};
use crate::error::{BindError, ExecError};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

/// Outcome of a tool call, as reported to the orchestration layer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCallResult {
    /// Whether the call succeeded
    pub success: bool,
    /// Result data (if success)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    /// Error message (if failure)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Failure code (if failure)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
}

impl ToolCallResult {
    /// Create a success result
    pub fn success(data: Value) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
            code: None,
        }
    }

    /// Create a failure result
    pub fn failure(code: &str, message: &str) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(message.to_string()),
            code: Some(code.to_string()),
        }
    }
}

impl From<Result<Value, ExecError>> for ToolCallResult {
    fn from(result: Result<Value, ExecError>) -> Self {
        match result {
            Ok(data) => Self::success(data),
            Err(e) => Self::failure(e.code(), &e.to_string()),
        }
    }
}

impl From<BindError> for ToolCallResult {
    fn from(error: BindError) -> Self {
        Self::failure("invalid_arguments", &error.to_string())
    }
}

/// Binds arguments for one operation of one tool plugin
#[derive(Debug, Clone)]
pub struct ToolBinder {
    plugin: String,
    tool: ToolSchema,
}

impl ToolBinder {
    pub fn new(plugin: &str, tool: ToolSchema) -> Self {
        Self {
            plugin: plugin.to_string(),
            tool,
        }
    }

    pub fn plugin(&self) -> &str {
        &self.plugin
    }

    pub fn tool(&self) -> &ToolSchema {
        &self.tool
    }

    /// Validate `args` and build `{operation: <tool>, ...args}`.
    /// Keys that are not declared parameters are dropped.
    pub fn bind(&self, args: &Value) -> Result<Value, BindError> {
        let args = args.as_object().ok_or(BindError::NotAnObject)?;
        let mut payload = bind_fields(&self.tool.parameters, args, "")?;
        payload.insert(OPERATION_KEY.to_string(), Value::String(self.tool.name.clone()));
        Ok(Value::Object(payload))
    }

    /// JSON Schema for the arguments, for function-calling declarations
    pub fn json_schema(&self) -> Value {
        object_schema(&self.tool.parameters)
    }

    /// Bind and execute through the manager
    pub async fn invoke(&self, manager: &PluginManager, args: &Value) -> ToolCallResult {
        match self.bind(args) {
            Ok(payload) => manager.execute(&self.plugin, payload).await.into(),
            Err(e) => e.into(),
        }
    }
}

fn bind_fields(
    parameters: &[ToolParameterSchema],
    args: &Map<String, Value>,
    prefix: &str,
) -> Result<Map<String, Value>, BindError> {
    let mut bound = Map::new();
    for parameter in parameters {
        let path = format!("{}{}", prefix, parameter.name);
        match args.get(&parameter.name) {
            None | Some(Value::Null) if parameter.optional => continue,
            None | Some(Value::Null) => return Err(BindError::Missing(path)),
            Some(value) => {
                let value = if parameter.array {
                    let items = value.as_array().ok_or_else(|| BindError::TypeMismatch {
                        path: path.clone(),
                        expected: format!("an array of {}", parameter.kind.as_str()),
                    })?;
                    let mut bound_items = Vec::with_capacity(items.len());
                    for (i, item) in items.iter().enumerate() {
                        bound_items.push(bind_value(parameter, item, &format!("{}[{}]", path, i))?);
                    }
                    Value::Array(bound_items)
                } else {
                    bind_value(parameter, value, &path)?
                };
                bound.insert(parameter.name.clone(), value);
            }
        }
    }
    Ok(bound)
}

fn bind_value(
    parameter: &ToolParameterSchema,
    value: &Value,
    path: &str,
) -> Result<Value, BindError> {
    let mismatch = || BindError::TypeMismatch {
        path: path.to_string(),
        expected: format!("a {}", parameter.kind.as_str()),
    };
    match parameter.kind {
        ParameterType::String if value.is_string() => Ok(value.clone()),
        ParameterType::Number if value.is_number() => Ok(value.clone()),
        ParameterType::Boolean if value.is_boolean() => Ok(value.clone()),
        ParameterType::Object => {
            let fields = value.as_object().ok_or_else(mismatch)?;
            let prefix = format!("{}.", path);
            Ok(Value::Object(bind_fields(&parameter.children, fields, &prefix)?))
        }
        _ => Err(mismatch()),
    }
}

fn object_schema(parameters: &[ToolParameterSchema]) -> Value {
    let mut properties = Map::new();
    let mut required = Vec::new();
    for parameter in parameters {
        properties.insert(parameter.name.clone(), parameter_schema(parameter));
        if !parameter.optional {
            required.push(Value::String(parameter.name.clone()));
        }
    }
    json!({
        "type": "object",
        "properties": properties,
        "required": required,
    })
}

fn parameter_schema(parameter: &ToolParameterSchema) -> Value {
    let mut schema = match parameter.kind {
        ParameterType::Object => object_schema(&parameter.children),
        kind => json!({ "type": kind.as_str() }),
    };
    if !parameter.description.is_empty() {
        schema["description"] = Value::String(parameter.description.clone());
    }
    if parameter.array {
        json!({ "type": "array", "items": schema })
    } else {
        schema
    }
}
