//! Wire-level message shapes.
//!
//! Field names are logical; any serde format can carry them. JSON is what the
//! CLI harness and tests use.

use crate::error::{ErrorKind, ProtocolError, SyncError};
use crate::hasher::{compute_descriptor_hash, DescriptorKind};
use crate::types::{ContextId, QueryKey};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A named, parameterized query
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryDescriptor {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl QueryDescriptor {
    pub fn new(name: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            name: name.into(),
            params,
        }
    }

    pub fn key(&self) -> QueryKey {
        let hash = compute_descriptor_hash(DescriptorKind::Query, &self.name, self.params.as_ref());
        QueryKey::new(format!("q:{}", hex::encode(hash)))
    }
}

/// A named, parameterized shared context
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextDescriptor {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl ContextDescriptor {
    pub fn new(name: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            name: name.into(),
            params,
        }
    }

    pub fn id(&self) -> ContextId {
        let hash = compute_descriptor_hash(DescriptorKind::Context, &self.name, self.params.as_ref());
        ContextId::new(hex::encode(hash))
    }
}

/// A named request against a context
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestDescriptor {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

/// Client → server messages
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ClientMessage {
    Query {
        name: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        params: Option<Value>,
    },
    Close {
        key: QueryKey,
    },
    Join {
        #[serde(default)]
        credential: Value,
        context: ContextDescriptor,
    },
    Request {
        context_id: ContextId,
        request: RequestDescriptor,
    },
    Leave {
        context_id: ContextId,
    },
}

impl ClientMessage {
    /// Decode a JSON payload, rejecting malformed input at the boundary.
    pub fn decode(payload: &str) -> Result<Self, ProtocolError> {
        if payload.trim().is_empty() {
            return Err(ProtocolError::Empty);
        }
        Ok(serde_json::from_str(payload)?)
    }
}

/// Query identity echoed back with every update
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryRef {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
    pub key: QueryKey,
}

/// Server → client pushes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ServerEvent {
    Update {
        query: QueryRef,
        response: Value,
    },
    /// First delivery of a query failed for this subscriber
    Error {
        query: QueryRef,
        reply: Reply,
    },
    Data {
        id: ContextId,
        data: Value,
    },
    Status {
        id: ContextId,
        status: Value,
    },
    Close {
        name: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        params: Option<Value>,
        id: ContextId,
    },
}

impl ServerEvent {
    pub fn name(&self) -> &'static str {
        match self {
            ServerEvent::Update { .. } => "update",
            ServerEvent::Error { .. } => "error",
            ServerEvent::Data { .. } => "data",
            ServerEvent::Status { .. } => "status",
            ServerEvent::Close { .. } => "close",
        }
    }
}

/// Acknowledgement for join, request and leave
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reply {
    pub success: bool,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<ErrorKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<ContextId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<Value>,
}

impl Reply {
    pub fn success(descriptor: &ContextDescriptor, id: &ContextId, message: Option<Value>) -> Self {
        Self {
            success: true,
            kind: None,
            name: Some(descriptor.name.clone()),
            params: descriptor.params.clone(),
            id: Some(id.clone()),
            message,
        }
    }

    pub fn failure(kind: ErrorKind, descriptor: Option<&ContextDescriptor>, message: impl Into<String>) -> Self {
        Self {
            success: false,
            kind: Some(kind),
            name: descriptor.map(|d| d.name.clone()),
            params: descriptor.and_then(|d| d.params.clone()),
            id: descriptor.map(ContextDescriptor::id),
            message: Some(Value::String(message.into())),
        }
    }

    /// Failure reply for an engine error. Ambient errors report as handler errors.
    pub fn from_error(err: &SyncError, descriptor: Option<&ContextDescriptor>) -> Self {
        let kind = err.kind().unwrap_or(ErrorKind::HandlerError);
        Self::failure(kind, descriptor, err.to_string())
    }

    pub fn message_str(&self) -> Option<&str> {
        self.message.as_ref().and_then(Value::as_str)
    }
}
