//! The query-execution substrate: types and blocks, predicate algebra,
//! connector SPI, split enumeration, the shard/index engine, data exchange,
//! the task/stage/query lifecycle, aggregation state, and the row-cursor
//! contract.

pub mod aggregation;
pub mod block;
pub mod connector;
pub mod cursor;
pub mod domain;
pub mod exchange;
pub mod query;
pub mod shard;
pub mod split;
pub mod stage;
pub mod task;
pub mod types;
