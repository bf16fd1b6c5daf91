//! Plugin protocol definitions
//!
//! Defines the manifest format and the JSON messages exchanged with a
//! sandboxed plugin across its isolation boundary.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Message types, in both directions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    Init,
    InitResult,
    Ready,
    Execute,
    ExecutionResult,
    Info,
    Error,
    Debug,
    Panic,
    Progress,
    /// Anything this host does not understand
    #[serde(other)]
    Unknown,
}

/// A single protocol message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PluginMessage {
    /// Correlation id; empty for unsolicited messages
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub plugin_name: String,
    #[serde(rename = "type")]
    pub kind: MessageType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub success: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
}

impl PluginMessage {
    /// Create a host-to-plugin request
    pub fn request(kind: MessageType, id: &str, plugin_name: &str, data: Option<Value>) -> Self {
        Self {
            id: id.to_string(),
            plugin_name: plugin_name.to_string(),
            kind,
            data,
            success: None,
            code: None,
            error: None,
            stack: None,
        }
    }

    /// Create an unsolicited log-style message carrying plain text
    pub fn console(kind: MessageType, plugin_name: &str, text: &str) -> Self {
        Self::request(kind, "", plugin_name, Some(Value::String(text.to_string())))
    }

    /// Render `data` as text for logging
    pub fn data_text(&self) -> String {
        match &self.data {
            Some(Value::String(s)) => s.clone(),
            Some(other) => other.to_string(),
            None => String::new(),
        }
    }
}

/// Generate a correlation id: millisecond timestamp plus a random suffix
pub fn generate_request_id() -> String {
    let suffix = Uuid::new_v4().simple().to_string();
    format!("{}-{}", Utc::now().timestamp_millis(), &suffix[..12])
}

/// Whether a plugin exposes callable tools
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PluginKind {
    #[default]
    Plugin,
    Tool,
}

/// Manifest declared by each plugin package (`plugin.json`)
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PluginMetadata {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub version: String,
    /// Source file, relative to the package directory
    #[serde(default)]
    pub entry: String,
    #[serde(rename = "type", default)]
    pub kind: PluginKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enabled: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub permissions: Option<Vec<String>>,
}

impl PluginMetadata {
    /// Create minimal metadata, mostly useful in tests and tooling
    pub fn new(name: &str, version: &str, entry: &str, kind: PluginKind) -> Self {
        Self {
            name: name.to_string(),
            version: version.to_string(),
            entry: entry.to_string(),
            kind,
            ..Default::default()
        }
    }

    /// Add permissions
    pub fn with_permissions(mut self, permissions: &[&str]) -> Self {
        self.permissions = Some(permissions.iter().map(|p| p.to_string()).collect());
        self
    }

    /// Permissions that parse into the known vocabulary
    pub fn granted(&self) -> Vec<Permission> {
        self.permissions
            .iter()
            .flatten()
            .filter_map(|p| p.parse().ok())
            .collect()
    }

    pub fn is_tool(&self) -> bool {
        self.kind == PluginKind::Tool
    }
}

/// Permission vocabulary a manifest may request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Permission {
    Net,
    Read,
    Write,
    Env,
    Run,
}

impl Permission {
    pub const ALL: [Permission; 5] = [
        Permission::Net,
        Permission::Read,
        Permission::Write,
        Permission::Env,
        Permission::Run,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Permission::Net => "net",
            Permission::Read => "read",
            Permission::Write => "write",
            Permission::Env => "env",
            Permission::Run => "run",
        }
    }
}

impl FromStr for Permission {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Permission::ALL
            .into_iter()
            .find(|p| p.as_str() == s)
            .ok_or_else(|| format!("unknown permission: {}", s))
    }
}

impl fmt::Display for Permission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
