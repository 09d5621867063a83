//! Global config file source: the platform config dir's `cosync/config.toml`

use config::builder::DefaultState;
use config::{ConfigBuilder, ConfigError, File, FileFormat};
use directories::ProjectDirs;
use std::path::PathBuf;
use tracing::debug;

/// Path to the global config file, if the platform has a home directory.
pub fn global_config_path() -> Option<PathBuf> {
    ProjectDirs::from("", "", "cosync").map(|dirs| dirs.config_dir().join("config.toml"))
}

/// Add the global config file to `builder` if it exists.
pub fn add_to_builder(
    builder: ConfigBuilder<DefaultState>,
) -> Result<ConfigBuilder<DefaultState>, ConfigError> {
    let Some(path) = global_config_path() else {
        return Ok(builder);
    };
    if !path.exists() {
        debug!(config_path = %path.display(), "No global configuration file");
        return Ok(builder);
    }
    Ok(builder.add_source(File::from(path).format(FileFormat::Toml).required(false)))
}
