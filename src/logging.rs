//! Logging setup and the plugin audit trail
//!
//! Diagnostics go through `tracing`. Plugin lifecycle and execution outcomes
//! can additionally be recorded as JSON lines for later review.

use crate::config::LoggingConfig;
use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::Mutex;
use tracing::{debug, error, warn};
use uuid::Uuid;

/// Session ID for the current process
static SESSION_ID: Lazy<String> = Lazy::new(|| Uuid::new_v4().to_string());

/// Secret patterns for redaction
static SECRET_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    vec![
        // API keys and tokens
        Regex::new(
            r#"(?i)(api[_-]?key|token|secret|password|passwd|pwd)"?\s*[=:]\s*['"]?([^'"\s,}]+)['"]?"#,
        )
        .unwrap(),
        // Bearer tokens
        Regex::new(r"(?i)bearer\s+[a-zA-Z0-9._-]+").unwrap(),
        // AWS keys
        Regex::new(r"AKIA[A-Z0-9]{16}").unwrap(),
        // Private keys
        Regex::new(r"-----BEGIN\s+(?:RSA\s+)?PRIVATE\s+KEY-----").unwrap(),
        // Long opaque strings that might be keys
        Regex::new(r"[a-zA-Z0-9_-]{32,}").unwrap(),
    ]
});

/// Initialize the tracing subscriber.
///
/// `RUST_LOG` wins over the configured level; `debug` overrides both.
pub fn init_logging(config: &LoggingConfig, debug: bool) {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = if debug {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level))
    };

    let registry = tracing_subscriber::registry().with(filter);
    if config.format == "json" {
        registry
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        registry
            .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
            .init();
    }
}

/// Audit log entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    pub session_id: String,
    pub timestamp: DateTime<Utc>,
    pub event: AuditEvent,
    /// Plugin name, or the package directory when the manifest was unusable
    pub plugin: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload_preview: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result_preview: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
}

/// Types of audit events
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditEvent {
    /// Plugin reached Ready
    Load,
    /// Package skipped during discovery
    Skip,
    /// Plugin failed to load
    LoadFailed,
    /// Execution finished, successfully or not
    Execute,
}

impl AuditEntry {
    fn new(event: AuditEvent, plugin: &str) -> Self {
        Self {
            session_id: SESSION_ID.clone(),
            timestamp: Utc::now(),
            event,
            plugin: plugin.to_string(),
            version: None,
            payload_preview: None,
            result_preview: None,
            code: None,
            reason: None,
            duration_ms: None,
        }
    }
}

/// Records plugin activity as JSON lines
pub struct AuditLogger {
    config: LoggingConfig,
    log_file: Mutex<Option<BufWriter<File>>>,
}

impl AuditLogger {
    /// Create a new audit logger
    pub fn new(config: LoggingConfig) -> Self {
        let log_file = if config.audit {
            Self::open_log_file(&config.audit_path)
        } else {
            None
        };

        Self {
            config,
            log_file: Mutex::new(log_file),
        }
    }

    /// Open or create the log file
    fn open_log_file(path: &Path) -> Option<BufWriter<File>> {
        if let Some(parent) = path.parent() {
            if let Err(e) = fs::create_dir_all(parent) {
                error!("Failed to create audit log directory: {}", e);
                return None;
            }
        }

        match OpenOptions::new().create(true).append(true).open(path) {
            Ok(file) => Some(BufWriter::new(file)),
            Err(e) => {
                error!("Failed to open audit log {:?}: {}", path, e);
                None
            }
        }
    }

    pub fn log_load(&self, plugin: &str, version: &str, duration_ms: u64) {
        let mut entry = AuditEntry::new(AuditEvent::Load, plugin);
        entry.version = Some(version.to_string());
        entry.duration_ms = Some(duration_ms);
        self.write_entry(&entry);
    }

    pub fn log_skip(&self, package: &str, reason: &str) {
        let mut entry = AuditEntry::new(AuditEvent::Skip, package);
        entry.reason = Some(self.redact_if_needed(reason));
        self.write_entry(&entry);
    }

    pub fn log_load_failed(&self, plugin: &str, reason: &str) {
        let mut entry = AuditEntry::new(AuditEvent::LoadFailed, plugin);
        entry.reason = Some(self.redact_if_needed(reason));
        self.write_entry(&entry);
    }

    /// Log an execution outcome. Failures are given as `(code, message)`.
    pub fn log_execute(
        &self,
        plugin: &str,
        payload: &str,
        outcome: Result<&str, (&str, &str)>,
        duration_ms: u64,
    ) {
        let mut entry = AuditEntry::new(AuditEvent::Execute, plugin);
        entry.payload_preview = Some(truncate_preview(&self.redact_if_needed(payload)));
        match outcome {
            Ok(result) => {
                entry.result_preview = Some(truncate_preview(&self.redact_if_needed(result)));
            }
            Err((code, message)) => {
                entry.code = Some(code.to_string());
                entry.reason = Some(self.redact_if_needed(message));
            }
        }
        entry.duration_ms = Some(duration_ms);
        self.write_entry(&entry);
    }

    /// Write a log entry
    fn write_entry(&self, entry: &AuditEntry) {
        if !self.config.audit {
            return;
        }

        let mut guard = match self.log_file.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        self.maybe_rotate(&mut guard);

        if let Some(ref mut file) = *guard {
            match serde_json::to_string(entry) {
                Ok(json) => {
                    if let Err(e) = writeln!(file, "{}", json) {
                        error!("Failed to write audit entry: {}", e);
                    }
                    if let Err(e) = file.flush() {
                        warn!("Failed to flush audit log: {}", e);
                    }
                }
                Err(e) => {
                    error!("Failed to serialize audit entry: {}", e);
                }
            }
        }
    }

    /// Redact secrets from text if configured
    fn redact_if_needed(&self, text: &str) -> String {
        if self.config.redact_secrets {
            redact_secrets(text)
        } else {
            text.to_string()
        }
    }

    /// Rotate the log file once it grows past the configured size
    fn maybe_rotate(&self, log_file: &mut Option<BufWriter<File>>) {
        let path = &self.config.audit_path;
        if let Ok(metadata) = fs::metadata(path) {
            if metadata.len() > self.config.max_audit_size {
                debug!("Rotating audit logs");

                // Close current file
                *log_file = None;

                for i in (1..self.config.audit_retention).rev() {
                    let old = format!("{}.{}", path.display(), i);
                    let new = format!("{}.{}", path.display(), i + 1);
                    let _ = fs::rename(&old, &new);
                }

                let rotated = format!("{}.1", path.display());
                let _ = fs::rename(path, &rotated);

                *log_file = Self::open_log_file(path);
            }
        }
    }

    /// Get session ID
    pub fn session_id() -> &'static str {
        &SESSION_ID
    }
}

/// Redact secrets from text
fn redact_secrets(text: &str) -> String {
    let mut result = text.to_string();

    for pattern in SECRET_PATTERNS.iter() {
        result = pattern.replace_all(&result, "[REDACTED]").to_string();
    }

    result
}

/// Truncate text for preview
fn truncate_preview(text: &str) -> String {
    const MAX_PREVIEW: usize = 500;
    match text.char_indices().nth(MAX_PREVIEW) {
        Some((cut, _)) => format!("{}...[truncated]", &text[..cut]),
        None => text.to_string(),
    }
}
