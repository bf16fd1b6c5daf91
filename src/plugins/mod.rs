//! Plugin system
//!
//! Plugins are discovered from package directories, validated, and run in
//! isolated execution contexts that talk JSON messages with the host.

mod binder;
mod executor;
mod manager;
mod protocol;
mod sandbox;
mod schema;
mod validator;

pub use binder::{ToolBinder, ToolCallResult};
pub use executor::{ExecutorOptions, PluginState, SandboxExecutor};
pub use manager::{Candidate, Discovered, PluginManager};
pub use protocol::{
    generate_request_id, MessageType, Permission, PluginKind, PluginMessage, PluginMetadata,
};
pub use sandbox::{
    ContextEvent, ContextHandle, ExecutionContext, IsolationBackend, ProcessSandbox,
    ResourceLimits, SandboxProfile,
};
pub use schema::{
    parse_schema_response, ParameterType, ToolParameterSchema, ToolPlugin, ToolSchema,
    OPERATION_KEY, SCHEMA_OPERATION,
};
pub use validator::MetadataValidator;
