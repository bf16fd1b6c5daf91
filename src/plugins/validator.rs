//! Manifest validation
//!
//! Runs before anything from a plugin package is loaded. A manifest that
//! fails any check is rejected as a whole.

use super::protocol::{Permission, PluginMetadata};
use crate::error::ValidationError;
use once_cell::sync::Lazy;
use regex::Regex;

/// Strict MAJOR.MINOR.PATCH, ASCII digits only
static VERSION_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[0-9]+\.[0-9]+\.[0-9]+$").unwrap());

/// Entry paths that could escape the package directory
static UNSAFE_ENTRY_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    vec![
        Regex::new(r"\.\./").unwrap(),        // parent traversal
        Regex::new(r"\.\.\\").unwrap(),       // parent traversal, windows separator
        Regex::new(r"^/").unwrap(),           // absolute path
        Regex::new(r"^[a-zA-Z]:\\").unwrap(), // drive letter
    ]
});

/// Validates plugin manifests
pub struct MetadataValidator;

impl MetadataValidator {
    /// Whether the manifest passes every check
    pub fn validate(metadata: &PluginMetadata) -> bool {
        Self::check(metadata).is_ok()
    }

    /// Run the checks in order, reporting the first failure
    pub fn check(metadata: &PluginMetadata) -> Result<(), ValidationError> {
        if metadata.name.is_empty() {
            return Err(ValidationError::MissingField("name"));
        }
        if metadata.version.is_empty() {
            return Err(ValidationError::MissingField("version"));
        }
        if metadata.entry.is_empty() {
            return Err(ValidationError::MissingField("entry"));
        }

        if !VERSION_PATTERN.is_match(&metadata.version) {
            return Err(ValidationError::InvalidVersion(metadata.version.clone()));
        }

        if !is_safe_entry(&metadata.entry) {
            return Err(ValidationError::UnsafeEntry(metadata.entry.clone()));
        }

        if let Some(permissions) = &metadata.permissions {
            for permission in permissions {
                if permission.parse::<Permission>().is_err() {
                    return Err(ValidationError::UnknownPermission(permission.clone()));
                }
            }
        }

        Ok(())
    }
}

fn is_safe_entry(entry: &str) -> bool {
    !UNSAFE_ENTRY_PATTERNS.iter().any(|p| p.is_match(entry))
}
