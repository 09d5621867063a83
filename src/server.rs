//! Sync server
//!
//! Binds the invalidation tree, query registry and context engine to one
//! transport and routes decoded client messages to them.

use crate::config::ServerConfig;
use crate::context::{ContextConfig, ContextEngine};
use crate::error::SyncError;
use crate::events::{EventPath, PathEventTree};
use crate::protocol::{ClientMessage, Reply};
use crate::query::{QueryHandler, QueryRegistry};
use crate::transport::Transport;
use crate::types::{ConnectionId, ContextId};
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

pub struct SyncServer {
    config: ServerConfig,
    tree: PathEventTree,
    registry: QueryRegistry,
    engine: ContextEngine,
    /// Handshake auth per connected connection
    connections: Mutex<HashMap<ConnectionId, Option<Value>>>,
}

impl SyncServer {
    pub fn new(config: ServerConfig, transport: Arc<dyn Transport>) -> Self {
        let tree = PathEventTree::new();
        let registry = QueryRegistry::new(tree.clone(), Arc::clone(&transport));
        let engine = ContextEngine::new(transport);
        Self {
            config,
            tree,
            registry,
            engine,
            connections: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn tree(&self) -> &PathEventTree {
        &self.tree
    }

    pub fn registry(&self) -> &QueryRegistry {
        &self.registry
    }

    pub fn engine(&self) -> &ContextEngine {
        &self.engine
    }

    // ---- catalog ----

    pub fn register_query<H>(&self, name: impl Into<String>, handler: H)
    where
        H: QueryHandler + 'static,
    {
        self.registry.register(name, handler);
    }

    pub fn register_query_with_trigger<H, P>(&self, name: impl Into<String>, handler: H, trigger_path: P)
    where
        H: QueryHandler + 'static,
        P: Fn(Option<&Value>) -> EventPath + Send + Sync + 'static,
    {
        self.registry.register_with_trigger(name, handler, trigger_path);
    }

    pub async fn add_context(&self, config: ContextConfig) -> Result<(), SyncError> {
        self.engine.add_config(config).await
    }

    pub async fn remove_context(&self, name: &str) -> usize {
        self.engine.remove_config(name).await
    }

    // ---- connections ----

    /// Accept a connection with its handshake auth.
    pub fn connect(&self, connection: &ConnectionId, auth: Option<Value>) {
        self.connections.lock().insert(connection.clone(), auth);
        debug!(connection = %connection, "Connection accepted");
    }

    pub fn is_connected(&self, connection: &ConnectionId) -> bool {
        self.connections.lock().contains_key(connection)
    }

    pub fn connection_count(&self) -> usize {
        self.connections.lock().len()
    }

    fn auth_of(&self, connection: &ConnectionId) -> Option<Value> {
        self.connections.lock().get(connection).cloned().flatten()
    }

    /// Drop every query subscription and context membership of `connection`.
    pub async fn disconnect(&self, connection: &ConnectionId) {
        self.connections.lock().remove(connection);
        let keys = self.registry.unsubscribe_all(connection).await;
        let contexts = self.engine.disconnect(connection).await;
        for id in &contexts {
            self.maybe_evict(id).await;
        }
        debug!(
            connection = %connection,
            queries = keys.len(),
            contexts = contexts.len(),
            "Connection closed"
        );
    }

    // ---- messages ----

    /// Route one client message. Query subscriptions reply through the
    /// transport, so `query` and `close` return `None`.
    pub async fn handle(&self, connection: &ConnectionId, message: ClientMessage) -> Option<Reply> {
        match message {
            ClientMessage::Query { name, params } => {
                let auth = self.auth_of(connection);
                if let Err(err) = self.registry.subscribe(connection, &name, params, auth).await {
                    debug!(connection = %connection, query = %name, error = %err, "Query subscription rejected");
                }
                None
            }
            ClientMessage::Close { key } => {
                if let Err(err) = self.registry.unsubscribe(connection, &key).await {
                    debug!(connection = %connection, key = %key, error = %err, "Query close rejected");
                }
                None
            }
            ClientMessage::Join { credential, context } => {
                let id = context.id();
                let reply = self.engine.join(connection, credential, context).await;
                if !reply.success {
                    self.maybe_evict(&id).await;
                }
                Some(reply)
            }
            ClientMessage::Request { context_id, request } => {
                Some(self.engine.request(connection, &context_id, request).await)
            }
            ClientMessage::Leave { context_id } => {
                let reply = self.engine.leave(connection, &context_id).await;
                self.maybe_evict(&context_id).await;
                Some(reply)
            }
        }
    }

    /// Decode and route a raw JSON payload. Malformed payloads never reach
    /// the engine; they are logged and dropped.
    pub async fn handle_raw(&self, connection: &ConnectionId, payload: &str) -> Result<Option<Reply>, SyncError> {
        match ClientMessage::decode(payload) {
            Ok(message) => Ok(self.handle(connection, message).await),
            Err(err) => {
                warn!(connection = %connection, error = %err, "Dropped malformed client message");
                Err(err.into())
            }
        }
    }

    async fn maybe_evict(&self, id: &ContextId) {
        if self.config.evict_empty_contexts && self.engine.evict_if_empty(id).await {
            debug!(context_id = %id, "Evicted empty context");
        }
    }

    /// Wait until all pending invalidations have been delivered.
    pub async fn settle(&self) {
        self.tree.settle().await;
    }

    /// Drop all process-wide state: catalog, active queries, contexts,
    /// connections and the tree.
    pub fn reset(&self) {
        self.registry.reset();
        self.engine.reset();
        self.tree.reset();
        self.connections.lock().clear();
    }
}
