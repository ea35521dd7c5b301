//! Split enumeration (C4): the opaque unit of work handed to one worker,
//! and the lazy, batched source that produces them.
//!
//! The in-memory split source is an `Arc<Mutex<VecDeque<_>>>` queue with a
//! `tokio::sync::Notify` a caller can await when no more splits are
//! available yet but the source isn't finished.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::sync::Arc;

use crate::error::{EngineError, ErrorKind, Result};

/// An opaque unit of work assigned to one worker.
#[derive(Debug, Clone)]
pub struct Split {
    pub locality_hints: Vec<String>,
    pub remotely_accessible: bool,
    pub payload: SplitPayload,
}

/// Connector-specific split payload; one variant per source kind named in
/// the data model.
#[derive(Debug, Clone, PartialEq)]
pub enum SplitPayload {
    File { path: String, start: u64, len: u64 },
    Shard { shard_uuid: uuid::Uuid, predicate_summary: String },
    Topic { topic: String, partition: i32, start_offset: i64, end_offset: i64 },
    WideColumn { token_range: (i64, i64), cql_where: String },
}

/// A lazy, batched producer of splits. At most one in-flight `next_batch`
/// per source; `close()` must be callable once, from any state, and must
/// cancel any in-flight batch.
#[async_trait]
pub trait SplitSource: Send + Sync {
    /// Fewer than `max` splits does not imply end; only `is_finished()` does.
    async fn next_batch(&self, max: usize) -> Result<Vec<Split>>;
    fn is_finished(&self) -> bool;
    fn close(&self);
}

/// An in-memory, pre-enumerated split source — what a connector hands back
/// once it has already computed the full split list (the common case for
/// the native shard engine).
pub struct FixedSplitSource {
    remaining: Mutex<VecDeque<Split>>,
    closed: AtomicBool,
    in_flight: AtomicBool,
}

impl FixedSplitSource {
    pub fn new(splits: Vec<Split>) -> Self {
        Self {
            remaining: Mutex::new(splits.into()),
            closed: AtomicBool::new(false),
            in_flight: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl SplitSource for FixedSplitSource {
    async fn next_batch(&self, max: usize) -> Result<Vec<Split>> {
        if self.closed.load(AtomicOrdering::Acquire) {
            return Ok(Vec::new());
        }
        if self
            .in_flight
            .compare_exchange(false, true, AtomicOrdering::AcqRel, AtomicOrdering::Acquire)
            .is_err()
        {
            return Err(EngineError::new(
                ErrorKind::InternalError,
                "next_batch called while a previous batch is still in flight",
            ));
        }
        let mut remaining = self.remaining.lock();
        let take = max.min(remaining.len());
        let batch: Vec<Split> = remaining.drain(..take).collect();
        drop(remaining);
        self.in_flight.store(false, AtomicOrdering::Release);
        Ok(batch)
    }

    fn is_finished(&self) -> bool {
        self.closed.load(AtomicOrdering::Acquire) || self.remaining.lock().is_empty()
    }

    fn close(&self) {
        self.closed.store(true, AtomicOrdering::Release);
        self.remaining.lock().clear();
    }
}

/// Convenience for tests and single-shot connectors: wraps an already-known
/// list of splits behind an `Arc<dyn SplitSource>`.
pub fn fixed_source(splits: Vec<Split>) -> Arc<dyn SplitSource> {
    Arc::new(FixedSplitSource::new(splits))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn split(path: &str) -> Split {
        Split {
            locality_hints: vec![],
            remotely_accessible: true,
            payload: SplitPayload::File { path: path.to_string(), start: 0, len: 100 },
        }
    }

    #[tokio::test]
    async fn returning_fewer_than_max_does_not_imply_finished() {
        let source = FixedSplitSource::new(vec![split("a"), split("b")]);
        let batch = source.next_batch(10).await.unwrap();
        assert_eq!(batch.len(), 2);
        assert!(source.is_finished());
    }

    #[tokio::test]
    async fn close_is_safe_to_call_once_from_any_state_and_drains_remaining() {
        let source = FixedSplitSource::new(vec![split("a")]);
        source.close();
        let batch = source.next_batch(10).await.unwrap();
        assert!(batch.is_empty());
        assert!(source.is_finished());
    }

    #[tokio::test]
    async fn batches_are_served_in_insertion_order_within_a_batch() {
        let source = FixedSplitSource::new(vec![split("a"), split("b"), split("c")]);
        let batch = source.next_batch(2).await.unwrap();
        assert_eq!(batch.len(), 2);
        let rest = source.next_batch(2).await.unwrap();
        assert_eq!(rest.len(), 1);
        assert!(source.is_finished());
    }
}
