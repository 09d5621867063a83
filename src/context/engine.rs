//! Shared Context Engine
//!
//! Owns every live context, keyed by the hash of its name and params.
//! Joins, requests, leaves and closes on one context id are serialized; a
//! successful request refreshes and diff-broadcasts data and status to every
//! member before its reply is produced.

use crate::change_cache::Channel;
use crate::concurrency::KeyedLocks;
use crate::context::config::{guarded, ContextConfig, ContextInfo, RequestCall};
use crate::context::instance::{Context, Phase};
use crate::error::SyncError;
use crate::membership::MembershipIndex;
use crate::protocol::{ContextDescriptor, Reply, RequestDescriptor, ServerEvent};
use crate::transport::Transport;
use crate::types::{ClientId, ConnectionId, ContextId, GroupId};
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use tracing::{debug, info, warn};

struct EngineInner {
    transport: Arc<dyn Transport>,
    configs: RwLock<HashMap<String, Arc<ContextConfig>>>,
    contexts: Mutex<HashMap<ContextId, Arc<Context>>>,
    /// connection → contexts it belongs to, for implicit leave on disconnect
    memberships: Mutex<MembershipIndex<ConnectionId, ContextId>>,
    locks: KeyedLocks<ContextId>,
}

/// Cloneable handle to the process-wide context engine.
#[derive(Clone)]
pub struct ContextEngine {
    inner: Arc<EngineInner>,
}

/// Lets a config drive its own context outside of a request.
///
/// Both operations run as separate tasks, so calling them from inside a hook
/// of the same context cannot deadlock.
#[derive(Clone)]
pub struct ContextHandle {
    engine: Weak<EngineInner>,
    info: ContextInfo,
}

impl ContextHandle {
    pub fn info(&self) -> &ContextInfo {
        &self.info
    }

    pub fn id(&self) -> &ContextId {
        &self.info.id
    }

    /// Re-read data and status and push changes to members.
    pub fn refresh(&self) {
        if let Some(inner) = self.engine.upgrade() {
            let id = self.info.id.clone();
            tokio::spawn(async move {
                if let Err(err) = (ContextEngine { inner }).refresh(&id).await {
                    debug!(context_id = %id, error = %err, "Context refresh skipped");
                }
            });
        }
    }

    /// Close the context, notifying every member.
    pub fn close(&self) {
        if let Some(inner) = self.engine.upgrade() {
            let id = self.info.id.clone();
            tokio::spawn(async move {
                (ContextEngine { inner }).close(&id).await;
            });
        }
    }
}

impl ContextEngine {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            inner: Arc::new(EngineInner {
                transport,
                configs: RwLock::new(HashMap::new()),
                contexts: Mutex::new(HashMap::new()),
                memberships: Mutex::new(MembershipIndex::new()),
                locks: KeyedLocks::new(),
            }),
        }
    }

    // ---- config registry ----

    /// Register a context config. Replacing a name closes the contexts of the
    /// config it replaces.
    pub async fn add_config(&self, config: ContextConfig) -> Result<(), SyncError> {
        if config.name().trim().is_empty() {
            return Err(SyncError::Config("Context config requires a name".to_string()));
        }
        let name = config.name().to_string();
        if self.has_config(&name) {
            self.close_all_named(&name).await;
        }
        self.inner
            .configs
            .write()
            .insert(name.clone(), Arc::new(config));
        info!(context = %name, "Registered context config");
        Ok(())
    }

    /// Remove a config and close its live contexts. Unknown names are ignored.
    /// Returns the number of contexts closed.
    pub async fn remove_config(&self, name: &str) -> usize {
        let removed = self.inner.configs.write().remove(name).is_some();
        if !removed {
            return 0;
        }
        let closed = self.close_all_named(name).await;
        info!(context = %name, closed, "Removed context config");
        closed
    }

    pub fn has_config(&self, name: &str) -> bool {
        self.inner.configs.read().contains_key(name)
    }

    pub fn config_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.inner.configs.read().keys().cloned().collect();
        names.sort();
        names
    }

    async fn close_all_named(&self, name: &str) -> usize {
        let ids: Vec<ContextId> = self
            .inner
            .contexts
            .lock()
            .values()
            .filter(|context| context.descriptor.name == name)
            .map(|context| context.id.clone())
            .collect();
        let mut closed = 0;
        for id in ids {
            if self.close(&id).await {
                closed += 1;
            }
        }
        closed
    }

    fn config(&self, name: &str) -> Result<Arc<ContextConfig>, SyncError> {
        self.inner
            .configs
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| SyncError::UnknownTarget(format!("No context registered as '{}'", name)))
    }

    fn context(&self, id: &ContextId) -> Option<Arc<Context>> {
        self.inner
            .contexts
            .lock()
            .get(id)
            .filter(|context| context.phase() == Phase::Active)
            .cloned()
    }

    fn unknown_context(id: &ContextId) -> SyncError {
        SyncError::UnknownTarget(format!("No active context '{}'", id))
    }

    // ---- protocol operations ----

    /// Join `connection` to the context described by `descriptor`, creating it
    /// on first use.
    pub async fn join(&self, connection: &ConnectionId, credential: Value, descriptor: ContextDescriptor) -> Reply {
        let id = descriptor.id();
        match self.try_join(connection, credential, &descriptor, &id).await {
            Ok(()) => Reply::success(&descriptor, &id, None),
            Err(err) => {
                debug!(context = %descriptor.name, context_id = %id, connection = %connection, error = %err, "Join rejected");
                Reply::from_error(&err, Some(&descriptor))
            }
        }
    }

    async fn try_join(
        &self,
        connection: &ConnectionId,
        credential: Value,
        descriptor: &ContextDescriptor,
        id: &ContextId,
    ) -> Result<(), SyncError> {
        let config = self.config(&descriptor.name)?;
        let _guard = self.inner.locks.lock(id).await;

        let context = match self.context(id) {
            Some(context) => context,
            None => self.create(descriptor, id, config).await?,
        };

        let client = context
            .config
            .authorize(credential)
            .await
            .map_err(|err| SyncError::Unauthorized(err.to_string()))?;

        context
            .config
            .admit(client.clone(), context.clients())
            .await
            .map_err(|err| SyncError::AdmissionDenied(err.to_string()))?;

        // A connection belongs to one client; switching identity leaves first
        if let Some(previous) = context.client_of(connection) {
            if previous != client {
                self.leave_locked(&context, connection).await;
            }
        }

        context.add_member(client.clone(), connection.clone());
        self.inner
            .memberships
            .lock()
            .add(connection.clone(), id.clone());
        self.inner.transport.join_group(connection, &GroupId::from(id));

        // Newcomer gets one data push; status is diffed to every member
        self.push_data(&context, &[connection.clone()]).await;
        let members = context.connections();
        self.push_status(&context, &members).await;

        if let Err(err) = context
            .config
            .run_joined(context.info(), connection.clone(), client.clone())
            .await
        {
            warn!(context_id = %id, error = %err, "Context joined hook failed");
        }

        debug!(context_id = %id, connection = %connection, client = %client, "Connection joined context");
        Ok(())
    }

    async fn create(
        &self,
        descriptor: &ContextDescriptor,
        id: &ContextId,
        config: Arc<ContextConfig>,
    ) -> Result<Arc<Context>, SyncError> {
        config
            .check_params(descriptor.params.clone())
            .await
            .map_err(|err| SyncError::InvalidParams(err.to_string()))?;

        let context = Arc::new(Context::new(descriptor.clone(), id.clone(), config));
        let handle = ContextHandle {
            engine: Arc::downgrade(&self.inner),
            info: context.info(),
        };
        context
            .config
            .run_init(handle)
            .await
            .map_err(|err| SyncError::handler(&err))?;

        context.set_phase(Phase::Active);
        self.inner
            .contexts
            .lock()
            .insert(id.clone(), Arc::clone(&context));
        info!(context = %descriptor.name, context_id = %id, "Created context");
        Ok(context)
    }

    /// Run a named request. On success, data and status changes reach every
    /// member before the reply is returned.
    pub async fn request(&self, connection: &ConnectionId, id: &ContextId, request: RequestDescriptor) -> Reply {
        let _guard = self.inner.locks.lock(id).await;
        let Some(context) = self.context(id) else {
            return failure_for(&Self::unknown_context(id), id);
        };

        match self.try_request(&context, connection, request).await {
            Ok(result) => Reply::success(&context.descriptor, id, Some(result)),
            Err(err) => {
                debug!(context_id = %id, connection = %connection, error = %err, "Request rejected");
                Reply::from_error(&err, Some(&context.descriptor))
            }
        }
    }

    async fn try_request(
        &self,
        context: &Arc<Context>,
        connection: &ConnectionId,
        request: RequestDescriptor,
    ) -> Result<Value, SyncError> {
        let handler = context.config.request_handler(&request.name).ok_or_else(|| {
            SyncError::UnknownRequest(format!("Unknown request '{}'", request.name))
        })?;

        let client = context.client_of(connection).ok_or_else(|| {
            SyncError::NotAMember(format!("Connection '{}' is not a member", connection))
        })?;

        let call = RequestCall {
            info: context.info(),
            client,
            connection: connection.clone(),
            params: request.params,
        };
        let result = guarded(handler(call))
            .await
            .map_err(|err| SyncError::handler(&err))?;

        self.refresh_context(context).await;
        Ok(result)
    }

    /// Remove `connection` from a context. Succeeds for non-members.
    pub async fn leave(&self, connection: &ConnectionId, id: &ContextId) -> Reply {
        let _guard = self.inner.locks.lock(id).await;
        let Some(context) = self.context(id) else {
            return failure_for(&Self::unknown_context(id), id);
        };
        self.leave_locked(&context, connection).await;
        Reply::success(&context.descriptor, id, None)
    }

    async fn leave_locked(&self, context: &Arc<Context>, connection: &ConnectionId) {
        let Some((client, last)) = context.remove_connection(connection) else {
            return;
        };
        self.inner
            .memberships
            .lock()
            .remove(connection, &context.id);
        self.inner
            .transport
            .leave_group(connection, &GroupId::from(&context.id));
        debug!(context_id = %context.id, connection = %connection, client = %client, last, "Connection left context");

        if last {
            if let Err(err) = context.config.run_on_leave(context.info(), client).await {
                warn!(context_id = %context.id, error = %err, "Context on_leave hook failed");
            }
            let targets = context.connections();
            self.push_status(context, &targets).await;
        }
    }

    /// Implicit leave of every context `connection` belongs to.
    /// Returns the ids of the contexts it left.
    pub async fn disconnect(&self, connection: &ConnectionId) -> Vec<ContextId> {
        let mut ids: Vec<ContextId> = self
            .inner
            .memberships
            .lock()
            .values_of(connection)
            .cloned()
            .collect();
        ids.sort();

        for id in &ids {
            let _guard = self.inner.locks.lock(id).await;
            if let Some(context) = self.context(id) {
                self.leave_locked(&context, connection).await;
            }
        }
        // Drop stale entries for contexts closed in the meantime
        self.inner.memberships.lock().remove_key(connection);
        ids
    }

    /// Close a context: run `on_close`, notify every member, discard it.
    pub async fn close(&self, id: &ContextId) -> bool {
        let _guard = self.inner.locks.lock(id).await;
        self.close_locked(id).await
    }

    async fn close_locked(&self, id: &ContextId) -> bool {
        let Some(context) = self.inner.contexts.lock().remove(id) else {
            return false;
        };
        context.set_phase(Phase::Closed);

        if let Err(err) = context.config.run_on_close(context.info()).await {
            warn!(context_id = %id, error = %err, "Context on_close hook failed");
        }

        let group = GroupId::from(id);
        self.inner.transport.broadcast(
            &group,
            ServerEvent::Close {
                name: context.descriptor.name.clone(),
                params: context.descriptor.params.clone(),
                id: id.clone(),
            },
        );

        let connections = context.clear_members();
        {
            let mut memberships = self.inner.memberships.lock();
            for connection in &connections {
                memberships.remove(connection, id);
            }
        }
        for connection in &connections {
            self.inner.transport.leave_group(connection, &group);
        }

        info!(context_id = %id, members = connections.len(), "Closed context");
        true
    }

    /// Close `id` if it has no members. Eviction is always caller-driven.
    pub async fn evict_if_empty(&self, id: &ContextId) -> bool {
        let _guard = self.inner.locks.lock(id).await;
        let empty = match self.inner.contexts.lock().get(id) {
            Some(context) => context.member_count() == 0,
            None => false,
        };
        if empty {
            self.close_locked(id).await
        } else {
            false
        }
    }

    /// Re-read data and status and diff-broadcast them to every member.
    pub async fn refresh(&self, id: &ContextId) -> Result<(), SyncError> {
        let _guard = self.inner.locks.lock(id).await;
        let context = self.context(id).ok_or_else(|| Self::unknown_context(id))?;
        self.refresh_context(&context).await;
        Ok(())
    }

    async fn refresh_context(&self, context: &Arc<Context>) {
        let targets = context.connections();
        self.push_data(context, &targets).await;
        self.push_status(context, &targets).await;
    }

    async fn push_data(&self, context: &Arc<Context>, targets: &[ConnectionId]) {
        match context.config.snapshot_data(context.info()).await {
            Ok(data) => {
                context.push(&*self.inner.transport, Channel::Data, targets, &data);
            }
            Err(err) => warn!(context_id = %context.id, error = %err, "Context data snapshot failed"),
        }
    }

    async fn push_status(&self, context: &Arc<Context>, targets: &[ConnectionId]) {
        match context
            .config
            .snapshot_status(context.info(), context.clients())
            .await
        {
            Ok(status) => {
                context.push(&*self.inner.transport, Channel::Status, targets, &status);
            }
            Err(err) => warn!(context_id = %context.id, error = %err, "Context status snapshot failed"),
        }
    }

    // ---- introspection ----

    /// Number of member connections
    pub fn member_count(&self, id: &ContextId) -> usize {
        self.context(id).map(|c| c.member_count()).unwrap_or(0)
    }

    /// Number of distinct clients
    pub fn client_count(&self, id: &ContextId) -> usize {
        self.context(id).map(|c| c.client_count()).unwrap_or(0)
    }

    pub fn clients(&self, id: &ContextId) -> Vec<ClientId> {
        self.context(id).map(|c| c.clients()).unwrap_or_default()
    }

    pub fn is_member(&self, id: &ContextId, connection: &ConnectionId) -> bool {
        self.context(id)
            .map(|c| c.is_member(connection))
            .unwrap_or(false)
    }

    pub fn is_live(&self, id: &ContextId) -> bool {
        self.context(id).is_some()
    }

    pub fn context_ids(&self) -> Vec<ContextId> {
        let mut ids: Vec<ContextId> = self.inner.contexts.lock().keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn context_count(&self) -> usize {
        self.inner.contexts.lock().len()
    }

    /// Contexts `connection` currently belongs to
    pub fn memberships_of(&self, connection: &ConnectionId) -> Vec<ContextId> {
        let mut ids: Vec<ContextId> = self
            .inner
            .memberships
            .lock()
            .values_of(connection)
            .cloned()
            .collect();
        ids.sort();
        ids
    }

    /// Forget every config and context without running hooks.
    pub fn reset(&self) {
        self.inner.contexts.lock().clear();
        self.inner.memberships.lock().clear();
        self.inner.configs.write().clear();
    }
}

fn failure_for(err: &SyncError, id: &ContextId) -> Reply {
    let mut reply = Reply::from_error(err, None);
    reply.id = Some(id.clone());
    reply
}
