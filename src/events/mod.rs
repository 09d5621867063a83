//! Path-addressed invalidation events

pub mod path;
pub mod tree;

pub use path::EventPath;
pub use tree::{CallbackId, EventCallback, FlushReport, PathEventTree};
