//! Path Event Tree
//!
//! Hierarchical invalidation bus. Callbacks are registered at trie nodes
//! addressed by [`EventPath`]. `touch` marks the root and every node it
//! traverses along a path, then schedules one coalesced flush; the flush walks
//! the whole tree and invokes the callbacks of every touched node.

use crate::events::path::EventPath;
use futures::future::{join_all, BoxFuture};
use futures::FutureExt;
use parking_lot::Mutex;
use std::any::Any;
use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;
use tracing::{debug, warn};

/// Callback invoked when its node is flushed while touched
pub type EventCallback = Arc<dyn Fn() -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

type CallbackOutcome = Result<anyhow::Result<()>, Box<dyn Any + Send>>;

/// Handle returned by `subscribe`, used to detach the callback later.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CallbackId(u64);

/// Outcome of a single flush
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushReport {
    pub invoked: usize,
    pub failed: usize,
}

#[derive(Default)]
struct Node {
    callbacks: Vec<(CallbackId, EventCallback)>,
    touched: bool,
    children: HashMap<String, Node>,
}

impl Node {
    fn detach(&mut self, id: CallbackId) -> bool {
        let before = self.callbacks.len();
        self.callbacks.retain(|(cb_id, _)| *cb_id != id);
        let mut removed = self.callbacks.len() != before;
        for child in self.children.values_mut() {
            removed |= child.detach(id);
        }
        removed
    }

    fn prune(&mut self) {
        self.children.retain(|_, child| {
            child.prune();
            !child.callbacks.is_empty() || !child.children.is_empty()
        });
    }

    fn collect_touched(&mut self, out: &mut Vec<(CallbackId, EventCallback)>) {
        if self.touched {
            self.touched = false;
            out.extend(self.callbacks.iter().cloned());
        }
        for child in self.children.values_mut() {
            child.collect_touched(out);
        }
    }

    fn count_nodes(&self) -> usize {
        self.children
            .values()
            .map(|child| 1 + child.count_nodes())
            .sum()
    }

    fn count_callbacks(&self) -> usize {
        self.callbacks.len()
            + self
                .children
                .values()
                .map(Node::count_callbacks)
                .sum::<usize>()
    }
}

struct TreeState {
    root: Node,
    next_id: u64,
}

struct Shared {
    state: Mutex<TreeState>,
    scheduled: AtomicBool,
    flushing: AtomicUsize,
    idle: Notify,
}

/// Cloneable handle to a shared invalidation tree.
#[derive(Clone)]
pub struct PathEventTree {
    shared: Arc<Shared>,
}

impl Default for PathEventTree {
    fn default() -> Self {
        Self::new()
    }
}

impl PathEventTree {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(TreeState {
                    root: Node::default(),
                    next_id: 1,
                }),
                scheduled: AtomicBool::new(false),
                flushing: AtomicUsize::new(0),
                idle: Notify::new(),
            }),
        }
    }

    /// Register `callback` at `path`
    pub fn subscribe<F, Fut>(&self, path: &EventPath, callback: F) -> CallbackId
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let callback: EventCallback = Arc::new(move || callback().boxed());
        self.subscribe_boxed(path, callback)
    }

    pub fn subscribe_boxed(&self, path: &EventPath, callback: EventCallback) -> CallbackId {
        let mut state = self.shared.state.lock();
        let id = CallbackId(state.next_id);
        state.next_id += 1;

        let mut node = &mut state.root;
        for segment in path.segments() {
            node = node.children.entry(segment.clone()).or_default();
        }
        node.callbacks.push((id, callback));
        debug!(path = %path, callback_id = id.0, "Subscribed path event callback");
        id
    }

    /// Mark `path` dirty and schedule a flush.
    pub fn touch(&self, path: &EventPath) {
        self.mark(path);
        self.schedule();
    }

    /// Mark the root and every existing node along `path` as touched.
    fn mark(&self, path: &EventPath) {
        let mut state = self.shared.state.lock();
        let mut node = &mut state.root;
        node.touched = true;
        for segment in path.segments() {
            match node.children.get_mut(segment) {
                Some(child) => {
                    child.touched = true;
                    node = child;
                }
                None => break,
            }
        }
    }

    /// Remove `id` everywhere and garbage-collect empty branches.
    pub fn detach(&self, id: CallbackId) -> bool {
        let mut state = self.shared.state.lock();
        let removed = state.root.detach(id);
        state.root.prune();
        debug!(callback_id = id.0, removed, "Detached path event callback");
        removed
    }

    /// Invoke the callbacks of every touched node, clearing the marks.
    ///
    /// Callbacks run outside the tree lock and are isolated from one another:
    /// an error or panic in one is logged and does not stop the rest.
    pub async fn flush(&self) -> FlushReport {
        let callbacks = {
            let mut state = self.shared.state.lock();
            let mut out = Vec::new();
            state.root.collect_touched(&mut out);
            out
        };

        let invoked = callbacks.len();
        let pending: Vec<BoxFuture<'static, (CallbackId, CallbackOutcome)>> = callbacks
            .into_iter()
            .map(|(id, callback)| {
                async move { (id, AssertUnwindSafe(callback()).catch_unwind().await) }.boxed()
            })
            .collect();
        let outcomes = join_all(pending).await;

        let mut failed = 0;
        for (id, outcome) in outcomes {
            match outcome {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    failed += 1;
                    warn!(callback_id = id.0, error = %err, "Path event callback failed");
                }
                Err(_) => {
                    failed += 1;
                    warn!(callback_id = id.0, "Path event callback panicked");
                }
            }
        }

        debug!(invoked, failed, "Flushed path event tree");
        FlushReport { invoked, failed }
    }

    fn schedule(&self) {
        if self.shared.scheduled.swap(true, Ordering::SeqCst) {
            return;
        }

        let handle = match tokio::runtime::Handle::try_current() {
            Ok(handle) => handle,
            Err(_) => {
                // Marks stay in place for an explicit flush
                self.shared.scheduled.store(false, Ordering::SeqCst);
                warn!("No async runtime available, path event flush not scheduled");
                return;
            }
        };

        let tree = self.clone();
        handle.spawn(async move {
            tokio::task::yield_now().await;
            tree.shared.flushing.fetch_add(1, Ordering::SeqCst);
            // Touches made by callbacks from here on schedule a new flush
            tree.shared.scheduled.store(false, Ordering::SeqCst);
            tree.flush().await;
            tree.shared.flushing.fetch_sub(1, Ordering::SeqCst);
            tree.shared.idle.notify_waiters();
        });
    }

    fn busy(&self) -> bool {
        self.shared.scheduled.load(Ordering::SeqCst) || self.shared.flushing.load(Ordering::SeqCst) > 0
    }

    /// Wait until no flush is pending or running.
    pub async fn settle(&self) {
        loop {
            let notified = self.shared.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if !self.busy() {
                return;
            }
            notified.await;
        }
    }

    pub fn is_flush_pending(&self) -> bool {
        self.shared.scheduled.load(Ordering::SeqCst)
    }

    /// Whether the node at exactly `path` exists and is touched
    pub fn is_touched(&self, path: &EventPath) -> bool {
        let state = self.shared.state.lock();
        let mut node = &state.root;
        for segment in path.segments() {
            match node.children.get(segment) {
                Some(child) => node = child,
                None => return false,
            }
        }
        node.touched
    }

    /// Number of nodes below the root
    pub fn node_count(&self) -> usize {
        self.shared.state.lock().root.count_nodes()
    }

    pub fn callback_count(&self) -> usize {
        self.shared.state.lock().root.count_callbacks()
    }

    /// Drop every node and callback.
    pub fn reset(&self) {
        let mut state = self.shared.state.lock();
        state.root = Node::default();
    }
}
