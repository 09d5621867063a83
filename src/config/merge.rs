//! Merge rules: defaults first, later sources override earlier ones.

use config::builder::DefaultState;
use config::{Config, ConfigBuilder, ConfigError};

/// Config builder with every default applied.
pub fn builder_with_defaults() -> Result<ConfigBuilder<DefaultState>, ConfigError> {
    Config::builder()
        .set_default("server.evict_empty_contexts", true)?
        .set_default("logging.level", "warn")?
        .set_default("logging.format", "text")?
        .set_default("logging.output", "stderr")?
        .set_default("logging.color", true)
}
