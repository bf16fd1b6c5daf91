//! Configuration management for plugin-sandbox
//!
//! Handles loading and merging configuration from multiple sources:
//! 1. Compiled defaults
//! 2. System config (/etc/plugin-sandbox/config.toml)
//! 3. User config (<config dir>/plugin-sandbox/config.toml)
//! 4. CLI-specified config file
//! 5. Environment variables

use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub plugins: PluginConfig,
    pub sandbox: SandboxConfig,
    pub logging: LoggingConfig,
}

/// Plugin discovery configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PluginConfig {
    /// Enable plugins
    pub enabled: bool,
    /// Plugins root; one package directory per plugin
    pub directory: PathBuf,
    /// Load every package found under the root
    pub auto_load: bool,
    /// Specific package directories to load
    pub load: Vec<String>,
    /// Manifest file name inside each package
    pub manifest: String,
}

/// Isolation and resource-limit configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxConfig {
    /// Per-request execution timeout
    pub execution_timeout_ms: u64,
    /// Initialization handshake timeout
    pub init_timeout_ms: u64,
    /// Address space limit; 0 disables it
    pub max_memory_mb: u64,
    /// CPU time limit; 0 disables it
    pub max_cpu_seconds: u64,
    /// File size limit applied when `write` is granted
    pub max_file_size_mb: u64,
    /// Open file descriptor limit; 0 disables it
    pub max_open_files: u64,
    /// Longest accepted protocol line
    pub max_message_bytes: usize,
    /// PATH visible inside the sandbox
    pub path: String,
    /// Host variables passed through when `env` is granted
    pub env_passthrough: Vec<String>,
    /// Capability allow-list advertised to plugins
    pub capabilities: Vec<String>,
    /// Interpreters keyed by entry file extension
    pub interpreters: HashMap<String, InterpreterConfig>,
}

/// How to run one kind of plugin source
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InterpreterConfig {
    /// Program and leading arguments; the source file is appended
    pub command: Vec<String>,
    /// Extra arguments added per granted permission
    pub permission_args: HashMap<String, Vec<String>>,
}

/// Logging and audit configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter when RUST_LOG is unset
    pub level: String,
    /// Output format: pretty or json
    pub format: String,
    /// Write an audit trail of plugin activity
    pub audit: bool,
    /// Audit log file path
    pub audit_path: PathBuf,
    /// Maximum audit file size before rotation
    pub max_audit_size: u64,
    /// Number of rotated audit logs to keep
    pub audit_retention: u32,
    /// Redact secrets from audit entries
    pub redact_secrets: bool,
}

// Default implementations

impl Default for PluginConfig {
    fn default() -> Self {
        let home = dirs::home_dir().unwrap_or_else(|| PathBuf::from("."));
        Self {
            enabled: true,
            directory: home.join(".plugin-sandbox/plugins"),
            auto_load: true,
            load: vec![],
            manifest: "plugin.json".to_string(),
        }
    }
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            execution_timeout_ms: 10_000,
            init_timeout_ms: 5_000,
            max_memory_mb: 512,
            max_cpu_seconds: 30,
            max_file_size_mb: 16,
            max_open_files: 64,
            max_message_bytes: 1024 * 1024, // 1MB
            path: "/usr/local/bin:/usr/bin:/bin".to_string(),
            env_passthrough: vec!["LANG".to_string(), "TZ".to_string()],
            capabilities: vec![
                "time".to_string(),
                "collections".to_string(),
                "logging".to_string(),
                "random".to_string(),
            ],
            interpreters: default_interpreters(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        let home = dirs::home_dir().unwrap_or_else(|| PathBuf::from("."));
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
            audit: false,
            audit_path: home.join(".plugin-sandbox/logs/audit.log"),
            max_audit_size: 10 * 1024 * 1024, // 10MB
            audit_retention: 5,
            redact_secrets: true,
        }
    }
}

fn default_interpreters() -> HashMap<String, InterpreterConfig> {
    let deno = InterpreterConfig {
        command: vec![
            "deno".to_string(),
            "run".to_string(),
            "--quiet".to_string(),
            "--no-prompt".to_string(),
        ],
        permission_args: [
            ("net", "--allow-net"),
            ("read", "--allow-read=."),
            ("write", "--allow-write=."),
            ("env", "--allow-env"),
            ("run", "--allow-run"),
        ]
        .into_iter()
        .map(|(perm, arg)| (perm.to_string(), vec![arg.to_string()]))
        .collect(),
    };

    let mut interpreters = HashMap::new();
    interpreters.insert(
        "sh".to_string(),
        InterpreterConfig {
            command: vec!["/bin/sh".to_string()],
            permission_args: HashMap::new(),
        },
    );
    interpreters.insert(
        "py".to_string(),
        InterpreterConfig {
            command: vec!["python3".to_string(), "-I".to_string(), "-u".to_string()],
            permission_args: HashMap::new(),
        },
    );
    interpreters.insert("js".to_string(), deno.clone());
    interpreters.insert("ts".to_string(), deno);
    interpreters
}

/// Boolean switches as written in one config file. Absent keys stay `None`
/// so a later file never resets an earlier one to the default.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct FileSwitches {
    plugins: PluginSwitches,
    logging: LoggingSwitches,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct PluginSwitches {
    enabled: Option<bool>,
    auto_load: Option<bool>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct LoggingSwitches {
    audit: Option<bool>,
    redact_secrets: Option<bool>,
}

impl SandboxConfig {
    pub fn execution_timeout(&self) -> Duration {
        Duration::from_millis(self.execution_timeout_ms)
    }

    pub fn init_timeout(&self) -> Duration {
        Duration::from_millis(self.init_timeout_ms)
    }
}

impl Config {
    /// Load configuration from all sources
    pub fn load(cli_config: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = Config::default();

        // Load system config
        let system_config = Path::new("/etc/plugin-sandbox/config.toml");
        if system_config.exists() {
            debug!("Loading system config from {:?}", system_config);
            config.merge_from_file(system_config)?;
        }

        // Load user config
        if let Some(dir) = dirs::config_dir() {
            let user_config = dir.join("plugin-sandbox/config.toml");
            if user_config.exists() {
                debug!("Loading user config from {:?}", user_config);
                config.merge_from_file(&user_config)?;
            }
        }

        // Load CLI-specified config
        if let Some(path) = cli_config {
            debug!("Loading CLI config from {:?}", path);
            config.merge_from_file(path)?;
        }

        config.apply_env_overrides();
        config.validate()?;

        Ok(config)
    }

    /// Merge configuration from a file
    fn merge_from_file(&mut self, path: &Path) -> Result<(), ConfigError> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::Read(format!("{}: {}", path.display(), e)))?;

        let parse_error =
            |e: toml::de::Error| ConfigError::Parse(format!("{}: {}", path.display(), e));
        let file_config: Config = toml::from_str(&contents).map_err(parse_error)?;
        let switches: FileSwitches = toml::from_str(&contents).map_err(parse_error)?;

        self.merge(file_config, switches);
        Ok(())
    }

    /// Merge another config into this one (other takes precedence)
    fn merge(&mut self, other: Config, switches: FileSwitches) {
        let plugin_defaults = PluginConfig::default();
        let sandbox_defaults = SandboxConfig::default();
        let logging_defaults = LoggingConfig::default();

        // Plugin config - switches only when the file sets them
        if let Some(enabled) = switches.plugins.enabled {
            self.plugins.enabled = enabled;
        }
        if let Some(auto_load) = switches.plugins.auto_load {
            self.plugins.auto_load = auto_load;
        }
        if other.plugins.directory != plugin_defaults.directory {
            self.plugins.directory = other.plugins.directory;
        }
        if !other.plugins.load.is_empty() {
            self.plugins.load = other.plugins.load;
        }
        if other.plugins.manifest != plugin_defaults.manifest {
            self.plugins.manifest = other.plugins.manifest;
        }

        // Sandbox config
        if other.sandbox.execution_timeout_ms != sandbox_defaults.execution_timeout_ms {
            self.sandbox.execution_timeout_ms = other.sandbox.execution_timeout_ms;
        }
        if other.sandbox.init_timeout_ms != sandbox_defaults.init_timeout_ms {
            self.sandbox.init_timeout_ms = other.sandbox.init_timeout_ms;
        }
        if other.sandbox.max_memory_mb != sandbox_defaults.max_memory_mb {
            self.sandbox.max_memory_mb = other.sandbox.max_memory_mb;
        }
        if other.sandbox.max_cpu_seconds != sandbox_defaults.max_cpu_seconds {
            self.sandbox.max_cpu_seconds = other.sandbox.max_cpu_seconds;
        }
        if other.sandbox.max_file_size_mb != sandbox_defaults.max_file_size_mb {
            self.sandbox.max_file_size_mb = other.sandbox.max_file_size_mb;
        }
        if other.sandbox.max_open_files != sandbox_defaults.max_open_files {
            self.sandbox.max_open_files = other.sandbox.max_open_files;
        }
        if other.sandbox.max_message_bytes != sandbox_defaults.max_message_bytes {
            self.sandbox.max_message_bytes = other.sandbox.max_message_bytes;
        }
        if other.sandbox.path != sandbox_defaults.path {
            self.sandbox.path = other.sandbox.path;
        }
        if other.sandbox.env_passthrough != sandbox_defaults.env_passthrough {
            self.sandbox.env_passthrough = other.sandbox.env_passthrough;
        }
        if other.sandbox.capabilities != sandbox_defaults.capabilities {
            self.sandbox.capabilities = other.sandbox.capabilities;
        }
        // Interpreters merge per extension
        for (ext, interpreter) in other.sandbox.interpreters {
            if sandbox_defaults.interpreters.get(&ext) != Some(&interpreter) {
                self.sandbox.interpreters.insert(ext, interpreter);
            }
        }

        // Logging config
        if other.logging.level != logging_defaults.level {
            self.logging.level = other.logging.level;
        }
        if other.logging.format != logging_defaults.format {
            self.logging.format = other.logging.format;
        }
        if other.logging.audit_path != logging_defaults.audit_path {
            self.logging.audit_path = other.logging.audit_path;
        }
        if other.logging.max_audit_size != logging_defaults.max_audit_size {
            self.logging.max_audit_size = other.logging.max_audit_size;
        }
        if other.logging.audit_retention != logging_defaults.audit_retention {
            self.logging.audit_retention = other.logging.audit_retention;
        }
        if let Some(audit) = switches.logging.audit {
            self.logging.audit = audit;
        }
        if let Some(redact_secrets) = switches.logging.redact_secrets {
            self.logging.redact_secrets = redact_secrets;
        }
    }

    /// Apply environment variable overrides
    fn apply_env_overrides(&mut self) {
        if let Ok(dir) = std::env::var("PLUGIN_SANDBOX_DIR") {
            self.plugins.directory = PathBuf::from(dir);
        }
        if let Ok(timeout) = std::env::var("PLUGIN_SANDBOX_TIMEOUT_MS") {
            match timeout.parse() {
                Ok(ms) => self.sandbox.execution_timeout_ms = ms,
                Err(_) => debug!("Ignoring invalid PLUGIN_SANDBOX_TIMEOUT_MS: {}", timeout),
            }
        }
        if let Ok(log) = std::env::var("PLUGIN_SANDBOX_LOG") {
            self.logging.audit = true;
            self.logging.audit_path = PathBuf::from(log);
        }
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.sandbox.execution_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "sandbox.execution_timeout_ms must be greater than 0".to_string(),
            ));
        }
        if self.sandbox.init_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "sandbox.init_timeout_ms must be greater than 0".to_string(),
            ));
        }
        if self.plugins.manifest.is_empty() {
            return Err(ConfigError::MissingField("plugins.manifest".to_string()));
        }
        for (ext, interpreter) in &self.sandbox.interpreters {
            if interpreter.command.is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "sandbox.interpreters.{} has an empty command",
                    ext
                )));
            }
        }

        let valid_formats = ["pretty", "json"];
        if !valid_formats.contains(&self.logging.format.as_str()) {
            return Err(ConfigError::Invalid(format!(
                "logging.format must be one of: {:?}",
                valid_formats
            )));
        }

        Ok(())
    }
}
