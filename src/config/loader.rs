//! Layered configuration loading.

use super::{merge, sources, SyncConfig};
use config::{Config, ConfigError, Environment, File, FileFormat};
use std::path::Path;

/// Prefix for environment overrides, e.g. `COSYNC__SERVER__EVICT_EMPTY_CONTEXTS=false`
pub const ENV_PREFIX: &str = "COSYNC";

pub struct ConfigLoader;

impl ConfigLoader {
    /// Load configuration for `workspace_root`.
    ///
    /// Precedence (lowest to highest): defaults, global file, workspace
    /// `config/config.toml`, workspace `config/{COSYNC_ENV}.toml`, environment.
    pub fn load(workspace_root: &Path) -> Result<SyncConfig, ConfigError> {
        let builder = merge::builder_with_defaults()?;
        let builder = sources::global_file::add_to_builder(builder)?;
        let builder = sources::workspace_file::add_to_builder(builder, workspace_root)?;
        let config = builder.add_source(environment()).build()?;
        config.try_deserialize()
    }

    /// Load a single TOML file on top of the defaults.
    pub fn load_from_file(path: &Path) -> Result<SyncConfig, ConfigError> {
        let config = merge::builder_with_defaults()?
            .add_source(File::from(path).format(FileFormat::Toml))
            .build()?;
        config.try_deserialize()
    }

    /// Defaults only
    pub fn defaults() -> Result<SyncConfig, ConfigError> {
        let config: Config = merge::builder_with_defaults()?.build()?;
        config.try_deserialize()
    }
}

fn environment() -> Environment {
    Environment::with_prefix(ENV_PREFIX)
        .separator("__")
        .try_parsing(true)
}
