//! Context capability configuration
//!
//! A `ContextConfig` is the injected capability set behind every context of
//! one name. Only `name` and `authorize` are required; every other hook is an
//! `Option` and behaves as a no-op when absent.

use crate::context::engine::ContextHandle;
use crate::types::{ClientId, ConnectionId, ContextId};
use futures::future::BoxFuture;
use futures::FutureExt;
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

/// Identity of a live context, passed to every hook
#[derive(Debug, Clone, PartialEq)]
pub struct ContextInfo {
    pub id: ContextId,
    pub name: String,
    pub params: Option<Value>,
}

/// Input to a named request handler
#[derive(Debug, Clone)]
pub struct RequestCall {
    pub info: ContextInfo,
    pub client: ClientId,
    pub connection: ConnectionId,
    pub params: Option<Value>,
}

type Hook<A, T> = Arc<dyn Fn(A) -> BoxFuture<'static, anyhow::Result<T>> + Send + Sync>;

pub type AuthorizeFn = Hook<Value, ClientId>;
pub type IsValidFn = Hook<Option<Value>, ()>;
pub type CanJoinFn = Hook<(ClientId, Vec<ClientId>), ()>;
pub type DataFn = Hook<ContextInfo, Value>;
pub type StatusFn = Hook<(ContextInfo, Vec<ClientId>), Value>;
pub type RequestFn = Hook<RequestCall, Value>;
pub type InitFn = Hook<ContextHandle, ()>;
pub type JoinedFn = Hook<(ContextInfo, ConnectionId, ClientId), ()>;
pub type LeaveFn = Hook<(ContextInfo, ClientId), ()>;
pub type CloseFn = Hook<ContextInfo, ()>;

fn hook<A, T, F, Fut>(f: F) -> Hook<A, T>
where
    A: 'static,
    T: 'static,
    F: Fn(A) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<T>> + Send + 'static,
{
    Arc::new(move |arg: A| f(arg).boxed())
}

/// Await a user hook, converting a panic into an error.
pub(crate) async fn guarded<T>(future: BoxFuture<'static, anyhow::Result<T>>) -> anyhow::Result<T> {
    match AssertUnwindSafe(future).catch_unwind().await {
        Ok(outcome) => outcome,
        Err(_) => Err(anyhow::anyhow!("context hook panicked")),
    }
}

#[derive(Clone)]
pub struct ContextConfig {
    name: String,
    authorize: AuthorizeFn,
    is_valid: Option<IsValidFn>,
    can_join: Option<CanJoinFn>,
    data: Option<DataFn>,
    status: Option<StatusFn>,
    requests: BTreeMap<String, RequestFn>,
    init: Option<InitFn>,
    joined: Option<JoinedFn>,
    on_leave: Option<LeaveFn>,
    on_close: Option<CloseFn>,
}

impl fmt::Debug for ContextConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContextConfig")
            .field("name", &self.name)
            .field("requests", &self.requests.keys().collect::<Vec<_>>())
            .field("is_valid", &self.is_valid.is_some())
            .field("can_join", &self.can_join.is_some())
            .field("data", &self.data.is_some())
            .field("status", &self.status.is_some())
            .finish_non_exhaustive()
    }
}

impl ContextConfig {
    pub fn new<F, Fut>(name: impl Into<String>, authorize: F) -> Self
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<ClientId>> + Send + 'static,
    {
        Self {
            name: name.into(),
            authorize: hook(authorize),
            is_valid: None,
            can_join: None,
            data: None,
            status: None,
            requests: BTreeMap::new(),
            init: None,
            joined: None,
            on_leave: None,
            on_close: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Reject context creation when params are invalid
    pub fn is_valid<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(Option<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.is_valid = Some(hook(f));
        self
    }

    /// Admission check against the distinct clients already present
    pub fn can_join<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(ClientId, Vec<ClientId>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.can_join = Some(hook(move |(client, clients): (ClientId, Vec<ClientId>)| f(client, clients)));
        self
    }

    pub fn data<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(ContextInfo) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
    {
        self.data = Some(hook(f));
        self
    }

    pub fn status<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(ContextInfo, Vec<ClientId>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
    {
        self.status = Some(hook(move |(info, clients): (ContextInfo, Vec<ClientId>)| f(info, clients)));
        self
    }

    /// Add a named request handler
    pub fn request<F, Fut>(mut self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(RequestCall) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
    {
        self.requests.insert(name.into(), hook(f));
        self
    }

    /// Runs once when a context is created. The handle outlives the call.
    pub fn init<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(ContextHandle) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.init = Some(hook(f));
        self
    }

    pub fn joined<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(ContextInfo, ConnectionId, ClientId) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.joined = Some(hook(
            move |(info, connection, client): (ContextInfo, ConnectionId, ClientId)| {
                f(info, connection, client)
            },
        ));
        self
    }

    /// Runs when a client's last connection leaves
    pub fn on_leave<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(ContextInfo, ClientId) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.on_leave = Some(hook(move |(info, client): (ContextInfo, ClientId)| f(info, client)));
        self
    }

    pub fn on_close<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(ContextInfo) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.on_close = Some(hook(f));
        self
    }

    pub fn has_request(&self, name: &str) -> bool {
        self.requests.contains_key(name)
    }

    pub fn request_names(&self) -> impl Iterator<Item = &str> {
        self.requests.keys().map(String::as_str)
    }

    pub(crate) fn request_handler(&self, name: &str) -> Option<RequestFn> {
        self.requests.get(name).cloned()
    }

    pub(crate) async fn authorize(&self, credential: Value) -> anyhow::Result<ClientId> {
        guarded((self.authorize)(credential)).await
    }

    pub(crate) async fn check_params(&self, params: Option<Value>) -> anyhow::Result<()> {
        match &self.is_valid {
            Some(is_valid) => guarded(is_valid(params)).await,
            None => Ok(()),
        }
    }

    pub(crate) async fn admit(&self, client: ClientId, clients: Vec<ClientId>) -> anyhow::Result<()> {
        match &self.can_join {
            Some(can_join) => guarded(can_join((client, clients))).await,
            None => Ok(()),
        }
    }

    pub(crate) async fn snapshot_data(&self, info: ContextInfo) -> anyhow::Result<Value> {
        match &self.data {
            Some(data) => guarded(data(info)).await,
            None => Ok(Value::Null),
        }
    }

    pub(crate) async fn snapshot_status(&self, info: ContextInfo, clients: Vec<ClientId>) -> anyhow::Result<Value> {
        match &self.status {
            Some(status) => guarded(status((info, clients))).await,
            None => Ok(Value::Null),
        }
    }

    pub(crate) async fn run_init(&self, handle: ContextHandle) -> anyhow::Result<()> {
        match &self.init {
            Some(init) => guarded(init(handle)).await,
            None => Ok(()),
        }
    }

    pub(crate) async fn run_joined(&self, info: ContextInfo, connection: ConnectionId, client: ClientId) -> anyhow::Result<()> {
        match &self.joined {
            Some(joined) => guarded(joined((info, connection, client))).await,
            None => Ok(()),
        }
    }

    pub(crate) async fn run_on_leave(&self, info: ContextInfo, client: ClientId) -> anyhow::Result<()> {
        match &self.on_leave {
            Some(on_leave) => guarded(on_leave((info, client))).await,
            None => Ok(()),
        }
    }

    pub(crate) async fn run_on_close(&self, info: ContextInfo) -> anyhow::Result<()> {
        match &self.on_close {
            Some(on_close) => guarded(on_close(info)).await,
            None => Ok(()),
        }
    }
}
