//! Continuous Query Registry
//!
//! Deduplicates subscriptions by query key, binds each active query to a node
//! of the invalidation tree, and fans recomputed results out to subscribers.

use crate::concurrency::KeyedLocks;
use crate::error::{ErrorKind, SyncError};
use crate::events::{CallbackId, EventPath, PathEventTree};
use crate::membership::MembershipIndex;
use crate::protocol::{QueryDescriptor, QueryRef, Reply, ServerEvent};
use crate::query::handler::{QueryCall, QueryDefinition, QueryHandler, TriggerFn};
use crate::transport::Transport;
use crate::types::{ConnectionId, GroupId, QueryKey};
use futures::FutureExt;
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Weak};
use tracing::{debug, warn};

struct ActiveQuery {
    descriptor: QueryDescriptor,
    callback: CallbackId,
    last_result: Option<Value>,
}

#[derive(Default)]
struct RegistryState {
    active: HashMap<QueryKey, ActiveQuery>,
    subscribers: MembershipIndex<QueryKey, ConnectionId>,
}

struct RegistryInner {
    tree: PathEventTree,
    transport: Arc<dyn Transport>,
    definitions: RwLock<HashMap<String, QueryDefinition>>,
    state: Mutex<RegistryState>,
    locks: KeyedLocks<QueryKey>,
}

/// Cloneable handle to the process-wide query registry.
#[derive(Clone)]
pub struct QueryRegistry {
    inner: Arc<RegistryInner>,
}

impl QueryRegistry {
    pub fn new(tree: PathEventTree, transport: Arc<dyn Transport>) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                tree,
                transport,
                definitions: RwLock::new(HashMap::new()),
                state: Mutex::new(RegistryState::default()),
                locks: KeyedLocks::new(),
            }),
        }
    }

    pub fn tree(&self) -> &PathEventTree {
        &self.inner.tree
    }

    /// Register a query endpoint bound to the path named after the query.
    pub fn register<H>(&self, name: impl Into<String>, handler: H)
    where
        H: QueryHandler + 'static,
    {
        self.insert_definition(name.into(), Arc::new(handler), None);
    }

    /// Register a query endpoint whose recomputation binds to `trigger_path(params)`.
    pub fn register_with_trigger<H, P>(&self, name: impl Into<String>, handler: H, trigger_path: P)
    where
        H: QueryHandler + 'static,
        P: Fn(Option<&Value>) -> EventPath + Send + Sync + 'static,
    {
        self.insert_definition(name.into(), Arc::new(handler), Some(Arc::new(trigger_path)));
    }

    fn insert_definition(
        &self,
        name: String,
        handler: Arc<dyn QueryHandler>,
        trigger_path: Option<crate::query::handler::TriggerPathFn>,
    ) {
        debug!(query = %name, "Registered query handler");
        self.inner.definitions.write().insert(
            name,
            QueryDefinition {
                handler,
                trigger_path,
            },
        );
    }

    pub fn is_registered(&self, name: &str) -> bool {
        self.inner.definitions.read().contains_key(name)
    }

    fn definition(&self, name: &str) -> Result<QueryDefinition, SyncError> {
        self.inner
            .definitions
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| SyncError::UnknownTarget(format!("No query registered as '{}'", name)))
    }

    /// Subscribe `connection` to `(name, params)`.
    ///
    /// The first subscriber creates the active entry and runs the handler;
    /// later subscribers receive the current result. Either way only the new
    /// connection is sent anything.
    pub async fn subscribe(
        &self,
        connection: &ConnectionId,
        name: &str,
        params: Option<Value>,
        auth: Option<Value>,
    ) -> Result<QueryKey, SyncError> {
        let definition = self.definition(name)?;
        let descriptor = QueryDescriptor::new(name, params);
        let key = descriptor.key();
        let _guard = self.inner.locks.lock(&key).await;

        let cached = {
            let mut state = self.inner.state.lock();
            let cached = match state.active.get(&key) {
                Some(entry) => entry.last_result.clone(),
                None => {
                    let path = definition.path_for(name, descriptor.params.as_ref());
                    let callback = self.bind_recompute(&path, &key);
                    state.active.insert(
                        key.clone(),
                        ActiveQuery {
                            descriptor: descriptor.clone(),
                            callback,
                            last_result: None,
                        },
                    );
                    debug!(query = %name, key = %key, path = %path, "Created active query");
                    None
                }
            };
            state.subscribers.add(key.clone(), connection.clone());
            cached
        };
        self.inner
            .transport
            .join_group(connection, &GroupId::from(&key));

        let query = QueryRef {
            name: descriptor.name.clone(),
            params: descriptor.params.clone(),
            key: key.clone(),
        };

        let response = match cached {
            Some(result) => Ok(result),
            None => {
                let call = self.call(descriptor.params.clone(), auth, Some(connection.clone()));
                let outcome = invoke(&*definition.handler, call).await;
                if let Ok(result) = &outcome {
                    self.store_result(&key, result.clone());
                }
                outcome
            }
        };

        match response {
            Ok(response) => {
                self.inner
                    .transport
                    .unicast(connection, ServerEvent::Update { query, response });
            }
            Err(err) => {
                warn!(query = %name, key = %key, error = %err, "Query handler failed on first delivery");
                let reply = Reply::failure(ErrorKind::HandlerError, None, err.to_string());
                self.inner
                    .transport
                    .unicast(connection, ServerEvent::Error { query, reply });
            }
        }

        Ok(key)
    }

    /// Remove `connection` from `key`. The last unsubscribe destroys the entry.
    pub async fn unsubscribe(&self, connection: &ConnectionId, key: &QueryKey) -> Result<(), SyncError> {
        let _guard = self.inner.locks.lock(key).await;
        let detached = {
            let mut state = self.inner.state.lock();
            if !state.active.contains_key(key) {
                return Err(SyncError::UnknownTarget(format!("No active query '{}'", key)));
            }
            state.subscribers.remove(key, connection);
            if state.subscribers.has_key(key) {
                None
            } else {
                state.active.remove(key).map(|entry| entry.callback)
            }
        };
        self.inner
            .transport
            .leave_group(connection, &GroupId::from(key));

        if let Some(callback) = detached {
            self.inner.tree.detach(callback);
            debug!(key = %key, "Removed active query with no subscribers");
        }
        Ok(())
    }

    /// Unsubscribe `connection` from everything. Returns the affected keys.
    pub async fn unsubscribe_all(&self, connection: &ConnectionId) -> Vec<QueryKey> {
        let keys: Vec<QueryKey> = {
            let state = self.inner.state.lock();
            state.subscribers.keys_of(connection).cloned().collect()
        };
        for key in &keys {
            // Entry may have vanished concurrently
            let _ = self.unsubscribe(connection, key).await;
        }
        keys
    }

    /// Recompute every active query named `name` and broadcast the results.
    ///
    /// Scans all active entries; cost grows with the number of live queries.
    pub async fn trigger(&self, name: &str) -> usize {
        let keys: Vec<QueryKey> = {
            let state = self.inner.state.lock();
            state
                .active
                .iter()
                .filter(|(_, entry)| entry.descriptor.name == name)
                .map(|(key, _)| key.clone())
                .collect()
        };

        let mut recomputed = 0;
        for key in &keys {
            match self.recompute(key).await {
                Ok(true) => recomputed += 1,
                Ok(false) => {}
                Err(err) => warn!(query = %name, key = %key, error = %err, "Query recompute failed"),
            }
        }
        recomputed
    }

    /// Re-run the handler for `key` and broadcast to all subscribers.
    /// Returns false if the entry no longer exists.
    pub async fn recompute(&self, key: &QueryKey) -> Result<bool, SyncError> {
        let _guard = self.inner.locks.lock(key).await;
        let descriptor = {
            let state = self.inner.state.lock();
            match state.active.get(key) {
                Some(entry) => entry.descriptor.clone(),
                None => return Ok(false),
            }
        };
        let definition = self.definition(&descriptor.name)?;

        let call = self.call(descriptor.params.clone(), None, None);
        let response = invoke(&*definition.handler, call)
            .await
            .map_err(|err| SyncError::handler(&err))?;

        self.store_result(key, response.clone());
        self.inner.transport.broadcast(
            &GroupId::from(key),
            ServerEvent::Update {
                query: QueryRef {
                    name: descriptor.name,
                    params: descriptor.params,
                    key: key.clone(),
                },
                response,
            },
        );
        debug!(key = %key, "Recomputed active query");
        Ok(true)
    }

    fn bind_recompute(&self, path: &EventPath, key: &QueryKey) -> CallbackId {
        let weak: Weak<RegistryInner> = Arc::downgrade(&self.inner);
        let key = key.clone();
        self.inner.tree.subscribe(path, move || {
            let weak = weak.clone();
            let key = key.clone();
            async move {
                if let Some(inner) = weak.upgrade() {
                    QueryRegistry { inner }.recompute(&key).await?;
                }
                Ok(())
            }
        })
    }

    fn call(&self, params: Option<Value>, auth: Option<Value>, connection: Option<ConnectionId>) -> QueryCall {
        let weak = Arc::downgrade(&self.inner);
        let trigger: TriggerFn = Arc::new(move |name: String| {
            if let Some(inner) = weak.upgrade() {
                tokio::spawn(async move {
                    QueryRegistry { inner }.trigger(&name).await;
                });
            }
        });
        QueryCall::new(params, auth, connection, self.inner.tree.clone(), trigger)
    }

    fn store_result(&self, key: &QueryKey, result: Value) {
        if let Some(entry) = self.inner.state.lock().active.get_mut(key) {
            entry.last_result = Some(result);
        }
    }

    pub fn active_count(&self) -> usize {
        self.inner.state.lock().active.len()
    }

    pub fn is_active(&self, key: &QueryKey) -> bool {
        self.inner.state.lock().active.contains_key(key)
    }

    pub fn subscriber_count(&self, key: &QueryKey) -> usize {
        self.inner.state.lock().subscribers.count(key)
    }

    pub fn current_result(&self, key: &QueryKey) -> Option<Value> {
        self.inner
            .state
            .lock()
            .active
            .get(key)
            .and_then(|entry| entry.last_result.clone())
    }

    /// Drop all definitions and active entries, detaching their tree bindings.
    pub fn reset(&self) {
        let callbacks: Vec<CallbackId> = {
            let mut state = self.inner.state.lock();
            let callbacks = state.active.values().map(|entry| entry.callback).collect();
            state.active.clear();
            state.subscribers.clear();
            callbacks
        };
        for callback in callbacks {
            self.inner.tree.detach(callback);
        }
        self.inner.definitions.write().clear();
    }
}

/// Run a handler, turning a panic into an error.
async fn invoke(handler: &dyn QueryHandler, call: QueryCall) -> anyhow::Result<Value> {
    match AssertUnwindSafe(handler.call(call)).catch_unwind().await {
        Ok(outcome) => outcome,
        Err(_) => Err(anyhow::anyhow!("query handler panicked")),
    }
}
