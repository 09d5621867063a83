//! cosync: Continuous Queries and Shared Contexts
//!
//! A real-time synchronization engine that sits between clients and a message
//! transport. Clients subscribe to named, parameterized queries and receive
//! recomputed results when the data they depend on is invalidated; they join
//! shared, authenticated contexts whose state is diff-broadcast to every
//! member.

pub mod change_cache;
pub mod cli;
pub mod concurrency;
pub mod config;
pub mod context;
pub mod error;
pub mod events;
pub mod hasher;
pub mod logging;
pub mod membership;
pub mod protocol;
pub mod query;
pub mod server;
pub mod transport;
pub mod types;

pub use context::{ContextConfig, ContextEngine, ContextHandle, ContextInfo, RequestCall};
pub use error::{ErrorKind, SyncError};
pub use events::{EventPath, PathEventTree};
pub use protocol::{ClientMessage, ContextDescriptor, QueryDescriptor, Reply, ServerEvent};
pub use query::{QueryCall, QueryHandler, QueryRegistry};
pub use server::SyncServer;
pub use transport::{MemoryTransport, Transport};
pub use types::{ClientId, ConnectionId, ContextId, QueryKey};
