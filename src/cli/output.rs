//! CLI output: line formatting for replies and delivered events.

use crate::error::SyncError;
use crate::protocol::{Reply, ServerEvent};
use crate::types::ConnectionId;
use owo_colors::OwoColorize;
use serde::Serialize;

/// Map domain errors to a string for CLI output.
pub fn map_error(e: &SyncError) -> String {
    e.to_string()
}

/// Formats replay transcript lines, optionally colored.
#[derive(Debug, Clone, Copy)]
pub struct Printer {
    color: bool,
}

impl Printer {
    pub fn new(color: bool) -> Self {
        Self { color }
    }

    pub fn heading(&self, title: &str) -> String {
        if self.color {
            format!("{}", title.bold().underline())
        } else {
            format!("== {} ==", title)
        }
    }

    pub fn reply(&self, connection: &ConnectionId, reply: &Reply) -> String {
        let body = compact(reply);
        let tag = if reply.success { "reply" } else { "reply!" };
        if !self.color {
            return format!("{} {} {}", connection, tag, body);
        }
        if reply.success {
            format!("{} {} {}", connection.bold(), tag.green(), body)
        } else {
            format!("{} {} {}", connection.bold(), tag.red(), body.red())
        }
    }

    pub fn event(&self, connection: &ConnectionId, event: &ServerEvent) -> String {
        let body = compact(event);
        if self.color {
            format!("{} {} {}", connection.bold(), event.name().cyan(), body.dimmed())
        } else {
            format!("{} <- {} {}", connection, event.name(), body)
        }
    }

    pub fn note(&self, text: &str) -> String {
        if self.color {
            format!("{}", text.yellow())
        } else {
            text.to_string()
        }
    }
}

fn compact<T: Serialize>(value: &T) -> String {
    serde_json::to_string(value).unwrap_or_else(|e| format!("<unserializable: {}>", e))
}
