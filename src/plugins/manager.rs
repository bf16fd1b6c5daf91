//! Plugin manager
//!
//! Discovers plugin packages under the configured root, validates their
//! manifests, and loads the accepted ones into the executor. External
//! callers go through this type and never touch the executor directly.

use super::executor::{ExecutorOptions, SandboxExecutor};
use super::protocol::PluginMetadata;
use super::sandbox::ProcessSandbox;
use super::schema::{parse_schema_response, ToolPlugin, OPERATION_KEY, SCHEMA_OPERATION};
use super::validator::MetadataValidator;
use crate::config::{Config, PluginConfig};
use crate::error::{DiscoveryError, ExecError, SandboxError};
use crate::logging::AuditLogger;
use serde_json::{Map, Value};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

/// A package accepted by discovery
#[derive(Debug, Clone)]
pub struct Discovered {
    pub metadata: PluginMetadata,
    /// Canonical path of the entry source file
    pub entry_path: PathBuf,
}

/// One package directory under the plugins root and what discovery made of it
#[derive(Debug)]
pub struct Candidate {
    pub dir: PathBuf,
    pub result: Result<Discovered, DiscoveryError>,
}

impl Candidate {
    /// Directory name of the package
    pub fn package(&self) -> String {
        self.dir
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| self.dir.display().to_string())
    }
}

/// Discovers, loads and fronts plugins
pub struct PluginManager {
    config: PluginConfig,
    executor: SandboxExecutor,
    audit: Option<AuditLogger>,
}

impl PluginManager {
    /// Create a manager running plugins in OS processes
    pub fn new(config: &Config) -> Self {
        let backend = Arc::new(ProcessSandbox::new(config.sandbox.clone()));
        let executor = SandboxExecutor::new(backend, ExecutorOptions::from(&config.sandbox));
        let manager = Self::with_executor(config.plugins.clone(), executor);

        if config.logging.audit {
            manager.with_audit(AuditLogger::new(config.logging.clone()))
        } else {
            manager
        }
    }

    /// Create a manager around an existing executor
    pub fn with_executor(config: PluginConfig, executor: SandboxExecutor) -> Self {
        Self {
            config,
            executor,
            audit: None,
        }
    }

    /// Record plugin activity in an audit log
    pub fn with_audit(mut self, audit: AuditLogger) -> Self {
        self.audit = Some(audit);
        self
    }

    pub fn config(&self) -> &PluginConfig {
        &self.config
    }

    /// Enumerate and inspect package directories without loading anything.
    ///
    /// Only an unusable root is an error; per-package problems are reported
    /// in each candidate's `result`.
    pub fn discover(&self) -> Result<Vec<Candidate>, SandboxError> {
        let root = &self.config.directory;
        if !root.exists() {
            debug!("Plugin directory does not exist: {:?}", root);
            if let Err(e) = fs::create_dir_all(root) {
                warn!("Failed to create plugin directory: {}", e);
            }
            return Ok(vec![]);
        }

        let entries = fs::read_dir(root).map_err(|e| DiscoveryError::Root {
            path: root.clone(),
            reason: e.to_string(),
        })?;

        let mut dirs = Vec::new();
        for entry in entries {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    warn!("Failed to read entry in {:?}: {}", root, e);
                    continue;
                }
            };
            let name = entry.file_name().to_string_lossy().to_string();
            let path = entry.path();
            if name.starts_with('.') || !path.is_dir() {
                continue;
            }
            if !self.config.load.is_empty() && !self.config.load.contains(&name) {
                debug!("Plugin package {} is not in the load list", name);
                continue;
            }
            dirs.push(path);
        }
        dirs.sort();

        for wanted in &self.config.load {
            if !dirs.iter().any(|d| d.file_name().is_some_and(|n| n == wanted.as_str())) {
                warn!("Configured plugin package not found: {}", wanted);
            }
        }

        Ok(dirs
            .into_iter()
            .map(|dir| Candidate {
                result: self.inspect(&dir),
                dir,
            })
            .collect())
    }

    /// Read, parse and validate one package
    fn inspect(&self, dir: &Path) -> Result<Discovered, DiscoveryError> {
        let manifest = dir.join(&self.config.manifest);
        if !manifest.is_file() {
            return Err(DiscoveryError::MissingManifest(dir.to_path_buf()));
        }

        let content = fs::read_to_string(&manifest).map_err(|e| DiscoveryError::Read {
            path: manifest.clone(),
            reason: e.to_string(),
        })?;
        let metadata: PluginMetadata =
            serde_json::from_str(&content).map_err(|e| DiscoveryError::Parse {
                path: manifest.clone(),
                reason: e.to_string(),
            })?;

        MetadataValidator::check(&metadata)?;

        if metadata.enabled == Some(false) {
            return Err(DiscoveryError::Disabled(metadata.name));
        }

        let entry_path = resolve_entry(dir, &metadata.entry)?;
        Ok(Discovered {
            metadata,
            entry_path,
        })
    }

    /// Discover and load every acceptable package. Returns how many loaded.
    pub async fn load_all(&self) -> Result<usize, SandboxError> {
        if !self.config.enabled {
            debug!("Plugins disabled in configuration");
            return Ok(0);
        }
        if self.config.load.is_empty() && !self.config.auto_load {
            debug!("Plugin auto-load is off and no plugins are listed");
            return Ok(0);
        }

        let mut loaded = 0;
        for candidate in self.discover()? {
            let package = candidate.package();
            let found = match candidate.result {
                Ok(found) => found,
                Err(DiscoveryError::Disabled(name)) => {
                    info!(plugin = %name, "Skipping disabled plugin");
                    self.audit_skip(&package, "disabled");
                    continue;
                }
                Err(e) => {
                    warn!("Skipping plugin package {}: {}", package, e);
                    self.audit_skip(&package, &e.to_string());
                    continue;
                }
            };

            let name = found.metadata.name.clone();
            let source = match fs::read_to_string(&found.entry_path) {
                Ok(source) => source,
                Err(e) => {
                    warn!(plugin = %name, "Failed to read entry {:?}: {}", found.entry_path, e);
                    self.audit_skip(&package, &e.to_string());
                    continue;
                }
            };

            let version = found.metadata.version.clone();
            let started = Instant::now();
            match self.executor.load(&source, found.metadata).await {
                Ok(()) => {
                    info!(plugin = %name, version = %version, "Loaded plugin");
                    if let Some(audit) = &self.audit {
                        audit.log_load(&name, &version, elapsed_ms(started));
                    }
                    loaded += 1;
                }
                Err(e) => {
                    warn!(plugin = %name, "Failed to load plugin: {}", e);
                    if let Some(audit) = &self.audit {
                        audit.log_load_failed(&name, &e.to_string());
                    }
                }
            }
        }

        info!("Loaded {} plugin(s) from {:?}", loaded, self.config.directory);
        Ok(loaded)
    }

    /// Run one request against a loaded plugin
    pub async fn execute(&self, name: &str, payload: Value) -> Result<Value, ExecError> {
        let preview = self.audit.as_ref().map(|_| payload.to_string());
        let started = Instant::now();

        let result = self.executor.execute(name, payload).await;

        if let (Some(audit), Some(preview)) = (&self.audit, preview) {
            let duration_ms = elapsed_ms(started);
            match &result {
                Ok(data) => audit.log_execute(name, &preview, Ok(&data.to_string()), duration_ms),
                Err(e) => {
                    let message = e.to_string();
                    audit.log_execute(name, &preview, Err((e.code(), &message)), duration_ms)
                }
            }
        }
        result
    }

    /// Metadata of every loaded plugin
    pub fn plugins(&self) -> Vec<PluginMetadata> {
        self.executor.loaded_plugins()
    }

    pub fn is_loaded(&self, name: &str) -> bool {
        self.executor.is_loaded(name)
    }

    /// Ask every loaded tool plugin for its schema. Plugins that fail to
    /// answer, or answer with something unusable, are left out.
    pub async fn get_tool_plugins(&self) -> Vec<ToolPlugin> {
        let mut tools = Vec::new();

        for metadata in self.plugins().into_iter().filter(PluginMetadata::is_tool) {
            let mut request = Map::new();
            request.insert(OPERATION_KEY.to_string(), Value::from(SCHEMA_OPERATION));

            let response = match self.execute(&metadata.name, Value::Object(request)).await {
                Ok(response) => response,
                Err(e) => {
                    warn!(plugin = %metadata.name, "Schema request failed: {}", e);
                    continue;
                }
            };

            match parse_schema_response(response) {
                Ok(tool_schemas) => tools.push(ToolPlugin {
                    metadata,
                    tool_schemas,
                }),
                Err(e) => warn!(plugin = %metadata.name, "Ignoring tool plugin: {}", e),
            }
        }

        tools
    }

    /// Terminate one plugin. Returns false if it was not loaded.
    pub fn terminate(&self, name: &str) -> bool {
        self.executor.terminate(name)
    }

    /// Terminate every plugin
    pub fn cleanup_all(&self) {
        self.executor.cleanup_all();
    }

    fn audit_skip(&self, package: &str, reason: &str) {
        if let Some(audit) = &self.audit {
            audit.log_skip(package, reason);
        }
    }
}

/// Resolve `entry` inside `dir`, following symlinks, and make sure it stays there
fn resolve_entry(dir: &Path, entry: &str) -> Result<PathBuf, DiscoveryError> {
    let unreadable = |path: &Path, e: std::io::Error| DiscoveryError::Read {
        path: path.to_path_buf(),
        reason: e.to_string(),
    };

    let package = dir.canonicalize().map_err(|e| unreadable(dir, e))?;
    let joined = dir.join(entry);
    let resolved = joined.canonicalize().map_err(|e| unreadable(&joined, e))?;

    if !resolved.starts_with(&package) {
        return Err(DiscoveryError::EntryOutsidePackage(resolved));
    }
    if !resolved.is_file() {
        return Err(DiscoveryError::Read {
            path: resolved,
            reason: "entry is not a file".to_string(),
        });
    }
    Ok(resolved)
}

fn elapsed_ms(started: Instant) -> u64 {
    started.elapsed().as_millis() as u64
}
