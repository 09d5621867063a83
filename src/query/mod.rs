//! Continuous queries
//!
//! A client subscribes to a named query with params; the registry keeps one
//! active entry per distinct `(name, params)` and re-delivers results when the
//! entry's trigger path is touched or the query is triggered by name.

pub mod handler;
pub mod registry;

pub use handler::{QueryCall, QueryHandler, TriggerPathFn};
pub use registry::QueryRegistry;
