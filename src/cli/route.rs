//! CLI route: run context and command dispatch.

use crate::cli::catalog::{demo_placeholders, DemoCatalog, DEMO_SCRIPT};
use crate::cli::output::Printer;
use crate::cli::parse::Commands;
use crate::config::{ConfigLoader, SyncConfig};
use crate::error::SyncError;
use crate::server::SyncServer;
use crate::transport::MemoryTransport;
use crate::types::{ConnectionId, ContextId};
use serde::Deserialize;
use serde_json::Value;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info};

/// One line of a replay script
#[derive(Debug, Deserialize)]
struct ScriptLine {
    connection: ConnectionId,
    /// Handshake auth, used the first time the connection appears
    #[serde(default)]
    auth: Option<Value>,
    #[serde(default)]
    message: Option<Value>,
    #[serde(default)]
    disconnect: bool,
}

/// Runtime context for CLI execution, built from the workspace and optional
/// config path.
pub struct RunContext {
    config: SyncConfig,
    printer: Printer,
}

impl RunContext {
    pub fn new(workspace_root: PathBuf, config_path: Option<PathBuf>, color: bool) -> Result<Self, SyncError> {
        let config = match config_path {
            Some(ref path) => ConfigLoader::load_from_file(path)?,
            None => SyncConfig::load(&workspace_root)?,
        };
        Ok(Self {
            config,
            printer: Printer::new(color),
        })
    }

    /// Run context over an already-loaded config
    pub fn with_config(config: SyncConfig, color: bool) -> Self {
        Self {
            config,
            printer: Printer::new(color),
        }
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn execute(&self, command: &Commands) -> Result<String, SyncError> {
        let runtime = tokio::runtime::Runtime::new()
            .map_err(|e| SyncError::Config(format!("Failed to create async runtime: {}", e)))?;
        match command {
            Commands::Replay { script } => {
                let text = std::fs::read_to_string(script)?;
                info!(script = %script.display(), "Replaying script");
                runtime.block_on(self.replay(&text, &[]))
            }
            Commands::Demo => runtime.block_on(self.replay(DEMO_SCRIPT, &demo_placeholders())),
        }
    }

    /// Drive a fresh server with the demo catalog through `script` and return
    /// the transcript. `$name` placeholders are replaced before decoding.
    pub async fn replay(&self, script: &str, placeholders: &[(&str, ContextId)]) -> Result<String, SyncError> {
        let transport = Arc::new(MemoryTransport::new());
        let server = SyncServer::new(self.config.server.clone(), transport.clone());
        DemoCatalog::new().install(&server).await?;

        let mut out = Vec::new();
        let mut delivered = 0;

        for (index, raw) in script.lines().enumerate() {
            let trimmed = raw.trim();
            if trimmed.is_empty() {
                continue;
            }
            if let Some(comment) = trimmed.strip_prefix('#') {
                out.push(self.printer.heading(comment.trim()));
                continue;
            }

            let mut line_text = trimmed.to_string();
            for (name, id) in placeholders {
                line_text = line_text.replace(name, id.as_str());
            }
            let line: ScriptLine = serde_json::from_str(&line_text).map_err(|e| {
                SyncError::Config(format!("Script line {}: {}", index + 1, e))
            })?;

            if !server.is_connected(&line.connection) {
                transport.attach(&line.connection);
                server.connect(&line.connection, line.auth.clone());
            }

            let reply = if line.disconnect {
                server.disconnect(&line.connection).await;
                transport.detach(&line.connection);
                out.push(self.printer.note(&format!("{} disconnected", line.connection)));
                None
            } else if let Some(message) = line.message {
                match server.handle_raw(&line.connection, &message.to_string()).await {
                    Ok(reply) => reply,
                    Err(err) => {
                        out.push(self.printer.note(&format!("{} dropped: {}", line.connection, err)));
                        None
                    }
                }
            } else {
                None
            };

            settle(&server).await;

            let log = transport.delivery_log();
            for (connection, event) in &log[delivered..] {
                out.push(self.printer.event(connection, event));
            }
            delivered = log.len();

            if let Some(reply) = reply {
                out.push(self.printer.reply(&line.connection, &reply));
            }
        }

        debug!(lines = out.len(), "Replay finished");
        Ok(out.join("\n"))
    }
}

/// Let flushes and spawned triggers run to completion.
async fn settle(server: &SyncServer) {
    for _ in 0..4 {
        server.settle().await;
        tokio::task::yield_now().await;
    }
    server.settle().await;
}
