//! `rusty-engine`: the shared query-execution substrate a distributed SQL
//! processor's connectors plug into — type/block layer, predicate algebra,
//! connector SPI, split enumeration, the shard/index engine, data exchange,
//! task/stage/query lifecycle, aggregation state, and the row-cursor
//! contract. The SQL grammar, planner, concrete connectors, and HTTP/CLI
//! wiring sit on top of (or alongside) this crate.

pub mod api;
pub mod catalog;
pub mod config;
pub mod engine;
pub mod error;
pub mod session;

pub use config::EngineConfig;
pub use error::{EngineError, ErrorCategory, ErrorKind, Result};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
