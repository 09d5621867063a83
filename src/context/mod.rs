//! Shared authenticated contexts
//!
//! A context is a named, parameterized session. Clients join with a
//! credential, receive diffed `data` and `status` pushes, and issue named
//! requests whose effects are broadcast to every member before the reply.

pub mod config;
pub mod engine;
pub mod instance;

pub use config::{ContextConfig, ContextInfo, RequestCall};
pub use engine::{ContextEngine, ContextHandle};
pub use instance::Phase;
