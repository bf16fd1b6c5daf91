//! plugin-sandbox: discovery, isolation and invocation of untrusted plugins

pub mod config;
pub mod error;
pub mod logging;
pub mod plugins;

pub use config::Config;
pub use error::{Result, SandboxError};
pub use plugins::PluginManager;
