//! CLI domain: parse, route, demo catalog and output.
//! Commands drive a `SyncServer` over an in-memory transport.

mod catalog;
mod output;
mod parse;
mod route;

pub use catalog::{demo_placeholders, DemoCatalog, DEMO_SCRIPT, LIST_PATH};
pub use output::{map_error, Printer};
pub use parse::{Cli, Commands};
pub use route::RunContext;
