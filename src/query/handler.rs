//! Query handler capability

use crate::events::{EventPath, PathEventTree};
use crate::types::ConnectionId;
use async_trait::async_trait;
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;

/// Maps a query's params to the tree node its recomputation binds to
pub type TriggerPathFn = Arc<dyn Fn(Option<&Value>) -> EventPath + Send + Sync>;

pub(crate) type TriggerFn = Arc<dyn Fn(String) + Send + Sync>;

/// Everything a handler may use while computing a result
#[derive(Clone)]
pub struct QueryCall {
    /// Query params as sent by the client
    pub params: Option<Value>,
    /// Handshake auth of the subscribing connection. `None` on recompute.
    pub auth: Option<Value>,
    /// Subscribing connection. `None` on recompute.
    pub connection: Option<ConnectionId>,
    tree: PathEventTree,
    trigger: TriggerFn,
}

impl QueryCall {
    pub(crate) fn new(
        params: Option<Value>,
        auth: Option<Value>,
        connection: Option<ConnectionId>,
        tree: PathEventTree,
        trigger: TriggerFn,
    ) -> Self {
        Self {
            params,
            auth,
            connection,
            tree,
            trigger,
        }
    }

    /// Invalidate a path; bound queries recompute on the next flush.
    pub fn touch(&self, path: impl Into<EventPath>) {
        self.tree.touch(&path.into());
    }

    /// Recompute every active query named `name`. Runs as a separate task,
    /// so a handler may trigger its own name.
    pub fn trigger(&self, name: impl Into<String>) {
        (self.trigger)(name.into());
    }

    /// Params field lookup, `Null` when absent
    pub fn param(&self, field: &str) -> &Value {
        self.params
            .as_ref()
            .and_then(|params| params.get(field))
            .unwrap_or(&Value::Null)
    }
}

/// Computes the result delivered to a query's subscribers
#[async_trait]
pub trait QueryHandler: Send + Sync {
    async fn call(&self, call: QueryCall) -> anyhow::Result<Value>;
}

#[async_trait]
impl<F, Fut> QueryHandler for F
where
    F: Fn(QueryCall) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
{
    async fn call(&self, call: QueryCall) -> anyhow::Result<Value> {
        (self)(call).await
    }
}

/// A registered query endpoint
#[derive(Clone)]
pub(crate) struct QueryDefinition {
    pub handler: Arc<dyn QueryHandler>,
    pub trigger_path: Option<TriggerPathFn>,
}

impl QueryDefinition {
    /// Bound path for `params`; queries without a trigger bind to their own name.
    pub fn path_for(&self, name: &str, params: Option<&Value>) -> EventPath {
        match &self.trigger_path {
            Some(trigger_path) => trigger_path(params),
            None => EventPath::parse(name),
        }
    }
}
