//! Error types for plugin-sandbox

use std::path::PathBuf;
use thiserror::Error;

/// Main error type for plugin-sandbox
#[derive(Error, Debug)]
pub enum SandboxError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Discovery error: {0}")]
    Discovery(#[from] DiscoveryError),

    #[error("Load error: {0}")]
    Load(#[from] LoadError),

    #[error("Execution error: {0}")]
    Exec(#[from] ExecError),

    #[error("Schema error: {0}")]
    Schema(#[from] SchemaError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Manifest rejections
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("missing required field: {0}")]
    MissingField(&'static str),

    #[error("invalid version '{0}', expected MAJOR.MINOR.PATCH")]
    InvalidVersion(String),

    #[error("unsafe entry path: {0}")]
    UnsafeEntry(String),

    #[error("unknown permission: {0}")]
    UnknownPermission(String),
}

/// Per-package discovery failures. None of these abort a batch load.
#[derive(Error, Debug)]
pub enum DiscoveryError {
    #[error("failed to read plugin directory {path:?}: {reason}")]
    Root { path: PathBuf, reason: String },

    #[error("no manifest found in {0:?}")]
    MissingManifest(PathBuf),

    #[error("failed to read {path:?}: {reason}")]
    Read { path: PathBuf, reason: String },

    #[error("failed to parse manifest {path:?}: {reason}")]
    Parse { path: PathBuf, reason: String },

    #[error("invalid manifest: {0}")]
    Invalid(#[from] ValidationError),

    #[error("plugin '{0}' is disabled")]
    Disabled(String),

    #[error("entry {0:?} resolves outside its package directory")]
    EntryOutsidePackage(PathBuf),
}

/// Failures while bringing a plugin to the Ready state
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LoadError {
    #[error("plugin '{0}' is already loaded")]
    Duplicate(String),

    #[error("failed to spawn sandbox for '{plugin}': {reason}")]
    Spawn { plugin: String, reason: String },

    #[error("plugin '{plugin}' initialization timed out after {timeout_ms}ms")]
    InitTimeout { plugin: String, timeout_ms: u64 },

    #[error("plugin '{plugin}' initialization failed: {reason}")]
    InitFailed { plugin: String, reason: String },

    #[error("plugin '{plugin}' crashed during initialization: {reason}")]
    Crashed { plugin: String, reason: String },
}

/// Failures surfaced to the caller of an execution
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ExecError {
    #[error("plugin '{0}' not found")]
    NotFound(String),

    #[error("plugin '{0}' is busy")]
    Busy(String),

    #[error("plugin '{plugin}' failed: {message}")]
    Panic {
        plugin: String,
        message: String,
        stack: Option<String>,
    },

    #[error("plugin '{plugin}' execution timed out after {timeout_ms}ms")]
    Timeout { plugin: String, timeout_ms: u64 },

    #[error("plugin '{0}' was terminated")]
    Terminated(String),

    #[error("plugin '{0}' is not accepting messages")]
    Disconnected(String),
}

impl ExecError {
    /// Stable machine-readable code for callers that report tool failures
    pub fn code(&self) -> &'static str {
        match self {
            ExecError::NotFound(_) => "not_found",
            ExecError::Busy(_) => "busy",
            ExecError::Panic { .. } => "panic",
            ExecError::Timeout { .. } => "timeout",
            ExecError::Terminated(_) => "terminated",
            ExecError::Disconnected(_) => "disconnected",
        }
    }
}

/// Malformed `schema` responses from tool plugins
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SchemaError {
    #[error("failed to parse tool schema: {0}")]
    Parse(String),

    #[error("invalid tool schema: {0}")]
    Invalid(String),
}

/// Tool arguments that do not fit the declared parameter schema
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BindError {
    #[error("arguments must be a JSON object")]
    NotAnObject,

    #[error("missing required parameter: {0}")]
    Missing(String),

    #[error("parameter '{path}' must be {expected}")]
    TypeMismatch { path: String, expected: String },
}

/// Configuration-related errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Read(String),

    #[error("Failed to parse config: {0}")]
    Parse(String),

    #[error("Invalid configuration: {0}")]
    Invalid(String),

    #[error("Missing required field: {0}")]
    MissingField(String),
}

/// Result type alias using SandboxError
pub type Result<T> = std::result::Result<T, SandboxError>;
