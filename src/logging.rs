//! Logging System
//!
//! Structured logging built on `tracing`. Level, format and destination come
//! from `LoggingConfig`, with `COSYNC_LOG*` environment overrides.

use crate::error::SyncError;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing_subscriber::fmt::time::ChronoUtc;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Registry};

pub const LOG_ENV: &str = "COSYNC_LOG";
pub const LOG_FORMAT_ENV: &str = "COSYNC_LOG_FORMAT";
pub const LOG_OUTPUT_ENV: &str = "COSYNC_LOG_OUTPUT";

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level: trace, debug, info, warn, error, off
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Output format: json, text
    #[serde(default = "default_format")]
    pub format: String,

    /// Output destination: stdout, stderr
    #[serde(default = "default_output")]
    pub output: String,

    /// Colored output (text format only)
    #[serde(default = "default_true")]
    pub color: bool,

    /// Per-module levels, e.g. `cosync::context = "debug"`
    #[serde(default)]
    pub modules: HashMap<String, String>,
}

fn default_log_level() -> String {
    "warn".to_string()
}

fn default_format() -> String {
    "text".to_string()
}

fn default_output() -> String {
    "stderr".to_string()
}

fn default_true() -> bool {
    true
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_format(),
            output: default_output(),
            color: default_true(),
            modules: HashMap::new(),
        }
    }
}

const LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error", "off"];

impl LoggingConfig {
    pub fn validate(&self) -> Result<(), String> {
        if !LEVELS.contains(&self.level.as_str()) {
            return Err(format!(
                "Invalid log level: {} (must be one of {})",
                self.level,
                LEVELS.join(", ")
            ));
        }
        parse_format(&self.format)?;
        parse_output(&self.output)?;
        for (module, level) in &self.modules {
            if !LEVELS.contains(&level.as_str()) {
                return Err(format!("Invalid log level for module '{}': {}", module, level));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Format {
    Text,
    Json,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Output {
    Stdout,
    Stderr,
}

fn parse_format(format: &str) -> Result<Format, String> {
    match format {
        "text" => Ok(Format::Text),
        "json" => Ok(Format::Json),
        _ => Err(format!("Invalid log format: {} (must be 'json' or 'text')", format)),
    }
}

fn parse_output(output: &str) -> Result<Output, String> {
    match output {
        "stdout" => Ok(Output::Stdout),
        "stderr" => Ok(Output::Stderr),
        _ => Err(format!("Invalid log output: {} (must be 'stdout' or 'stderr')", output)),
    }
}

/// Initialize the global subscriber.
///
/// Priority order (highest to lowest):
/// 1. Environment variables (COSYNC_LOG, COSYNC_LOG_FORMAT, COSYNC_LOG_OUTPUT)
/// 2. `config`
/// 3. Defaults
///
/// A subscriber that is already installed is left in place.
pub fn init_logging(config: Option<&LoggingConfig>) -> Result<(), SyncError> {
    let filter = build_env_filter(config)?;
    let format = determine_format(config)?;
    let output = determine_output(config)?;
    let use_color = config.map(|c| c.color).unwrap_or(true);

    let base_subscriber = Registry::default().with(filter);

    // Each arm has a distinct layer type, so each installs separately
    let installed = match (format, output) {
        (Format::Json, Output::Stdout) => base_subscriber
            .with(
                fmt::layer()
                    .json()
                    .with_target(true)
                    .with_timer(ChronoUtc::rfc_3339())
                    .with_writer(std::io::stdout),
            )
            .try_init(),
        (Format::Json, Output::Stderr) => base_subscriber
            .with(
                fmt::layer()
                    .json()
                    .with_target(true)
                    .with_timer(ChronoUtc::rfc_3339())
                    .with_writer(std::io::stderr),
            )
            .try_init(),
        (Format::Text, Output::Stdout) => base_subscriber
            .with(
                fmt::layer()
                    .with_target(true)
                    .with_timer(ChronoUtc::rfc_3339())
                    .with_ansi(use_color)
                    .with_writer(std::io::stdout),
            )
            .try_init(),
        (Format::Text, Output::Stderr) => base_subscriber
            .with(
                fmt::layer()
                    .with_target(true)
                    .with_timer(ChronoUtc::rfc_3339())
                    .with_ansi(use_color)
                    .with_writer(std::io::stderr),
            )
            .try_init(),
    };

    if installed.is_err() {
        tracing::debug!("Logging already initialized");
    }
    Ok(())
}

fn build_env_filter(config: Option<&LoggingConfig>) -> Result<EnvFilter, SyncError> {
    if let Ok(filter) = EnvFilter::try_from_env(LOG_ENV) {
        return Ok(filter);
    }

    let level = config.map(|c| c.level.as_str()).unwrap_or("warn");
    if level == "off" {
        return Ok(EnvFilter::new("off"));
    }

    let mut filter = EnvFilter::new(level);
    if let Some(config) = config {
        let mut modules: Vec<_> = config.modules.iter().collect();
        modules.sort();
        for (module, module_level) in modules {
            let directive = format!("{}={}", module, module_level);
            filter = filter.add_directive(
                directive
                    .parse()
                    .map_err(|e| SyncError::Config(format!("Invalid log directive: {}", e)))?,
            );
        }
    }
    Ok(filter)
}

fn determine_format(config: Option<&LoggingConfig>) -> Result<Format, SyncError> {
    if let Ok(format) = std::env::var(LOG_FORMAT_ENV) {
        if let Ok(format) = parse_format(&format) {
            return Ok(format);
        }
    }
    let format = config.map(|c| c.format.as_str()).unwrap_or("text");
    parse_format(format).map_err(SyncError::Config)
}

fn determine_output(config: Option<&LoggingConfig>) -> Result<Output, SyncError> {
    if let Ok(output) = std::env::var(LOG_OUTPUT_ENV) {
        return parse_output(&output).map_err(SyncError::Config);
    }
    let output = config.map(|c| c.output.as_str()).unwrap_or("stderr");
    parse_output(output).map_err(SyncError::Config)
}
