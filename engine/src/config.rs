//! Engine configuration.
//!
//! Loaded from a TOML file; every field has a default so a partial file (or
//! no file) is valid. The policy mode found here is only a default: it is
//! resolved into each `TransferRequest` when the request is created.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::EngineError;
use crate::model::PolicyMode;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub policy: PolicyConfig,
    pub scan: ScanConfig,
    pub review: ReviewConfig,
    pub inspector: InspectorConfig,
    pub audit: AuditConfig,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PolicyConfig {
    pub default_mode: PolicyMode,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScanConfig {
    /// Per-delegate timeout; a delegate that exceeds it fails closed.
    pub timeout_ms: u64,
}

impl Default for ScanConfig {
    fn default() -> Self {
        ScanConfig {
            timeout_ms: 5 * 60 * 1000,
        }
    }
}

impl ScanConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Policy flags that shape the warning review.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReviewConfig {
    /// Proceeding through a warning needs a justification.
    pub require_justification: bool,
    /// Overrides `require_justification` for this deployment.
    pub bypass_justification: bool,
}

impl ReviewConfig {
    pub fn justification_required(&self) -> bool {
        self.require_justification && !self.bypass_justification
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InspectorConfig {
    pub blocked_patterns: Vec<String>,
    pub warned_patterns: Vec<String>,
}

impl Default for InspectorConfig {
    fn default() -> Self {
        InspectorConfig {
            blocked_patterns: vec!["blocked".to_string()],
            warned_patterns: vec!["warned".to_string()],
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AuditConfig {
    /// Append audit reports as JSON lines to this file.
    pub log_path: Option<PathBuf>,
    /// Attach a SHA-256 digest of every considered file to its audit record.
    pub include_digests: bool,
}

impl EngineConfig {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    /// Returns `EngineError::ConfigLoad` if the file cannot be read or parsed.
    pub fn load(path: &Path) -> Result<Self, EngineError> {
        let raw = fs::read_to_string(path).map_err(|e| EngineError::ConfigLoad {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;
        Self::from_toml(&raw).map_err(|e| match e {
            EngineError::ConfigLoad { message, .. } => EngineError::ConfigLoad {
                path: path.to_path_buf(),
                message,
            },
            other => other,
        })
    }

    /// Parse configuration from TOML text.
    pub fn from_toml(raw: &str) -> Result<Self, EngineError> {
        toml::from_str(raw).map_err(|e| EngineError::ConfigLoad {
            path: PathBuf::new(),
            message: e.to_string(),
        })
    }
}
