//! Configuration System
//!
//! Hierarchical configuration for the sync server and its logging, loaded
//! through the `config` crate with environment variable overrides.

use crate::error::SyncError;
use crate::logging::LoggingConfig;
use serde::{Deserialize, Serialize};

mod loader;
mod merge;
mod sources;

pub use loader::{ConfigLoader, ENV_PREFIX};
pub use sources::global_file::global_config_path;
pub use sources::workspace_file::ENV_NAME_VAR;

/// Root configuration structure
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SyncConfig {
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Server behavior
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Close contexts left without members after a leave, disconnect or
    /// failed join
    #[serde(default = "default_true")]
    pub evict_empty_contexts: bool,
}

fn default_true() -> bool {
    true
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            evict_empty_contexts: default_true(),
        }
    }
}

/// Configuration validation errors
#[derive(Debug, Clone)]
pub enum ValidationError {
    Logging(String),
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ValidationError::Logging(msg) => write!(f, "Logging: {}", msg),
        }
    }
}

impl std::error::Error for ValidationError {}

impl SyncConfig {
    /// Validate the entire configuration
    pub fn validate(&self) -> Result<(), Vec<ValidationError>> {
        let mut errors = Vec::new();

        if let Err(e) = self.logging.validate() {
            errors.push(ValidationError::Logging(e));
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    /// Load from `workspace_root` and validate in one step.
    pub fn load(workspace_root: &std::path::Path) -> Result<Self, SyncError> {
        let config = ConfigLoader::load(workspace_root)?;
        config.validate().map_err(|errors| {
            let error_msgs: Vec<String> = errors.iter().map(|e| e.to_string()).collect();
            SyncError::Config(format!(
                "Configuration validation failed:\n{}",
                error_msgs.join("\n")
            ))
        })?;
        Ok(config)
    }
}
