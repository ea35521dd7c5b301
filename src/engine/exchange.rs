//! Data exchange (C6): output buffers, token-based replay, backpressure,
//! and partition functions.
//!
//! Each buffer is a `parking_lot::Mutex`-guarded `VecDeque` plus a
//! `tokio::sync::Notify`, so producers and consumers `await` buffer space or
//! new pages instead of blocking an OS thread.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};
use std::sync::Arc;
use tokio::sync::Notify;

use crate::error::{EngineError, ErrorKind, Result};

use super::block::Block;
use super::types::Type;

/// A page is a tuple of equal-length blocks, the unit of inter-stage
/// transport.
#[derive(Debug, Clone)]
pub struct Page {
    pub blocks: Vec<Block>,
}

impl Page {
    pub fn new(blocks: Vec<Block>) -> Result<Self> {
        if let Some(first) = blocks.first() {
            let len = first.len();
            if blocks.iter().any(|b| b.len() != len) {
                return Err(EngineError::new(ErrorKind::InternalError, "page blocks must have equal length"));
            }
        }
        Ok(Self { blocks })
    }

    pub fn position_count(&self) -> usize {
        self.blocks.first().map(Block::len).unwrap_or(0)
    }

    pub fn size_in_bytes(&self) -> usize {
        self.blocks.iter().map(|b| b.encode().len()).sum()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferState {
    Open,
    NoMoreBuffers,
    NoMorePages,
    Finished,
}

/// A single consumer's queue of pages plus its replay token.
struct BufferQueue {
    pages: Vec<Arc<Page>>,
    /// Token of the first page still in `pages` (earlier pages were acked
    /// and dropped).
    base_token: u64,
    no_more_pages: bool,
}

/// One task's set of output buffers. Producers push pages; downstream tasks
/// pull `(bufferId, nextToken, maxBytes)` and get a contiguous slice plus a
/// new token. Re-requesting an already-delivered token replays the same
/// pages until the client acknowledges by advancing.
pub struct OutputBuffer {
    buffers: Mutex<HashMap<String, BufferQueue>>,
    capacity_bytes: usize,
    used_bytes: AtomicUsize,
    state: Mutex<BufferState>,
    space_available: Notify,
    pages_available: Notify,
}

impl OutputBuffer {
    pub fn new(buffer_ids: Vec<String>, capacity_bytes: usize) -> Self {
        let mut buffers = HashMap::new();
        for id in buffer_ids {
            buffers.insert(id, BufferQueue { pages: Vec::new(), base_token: 0, no_more_pages: false });
        }
        Self {
            buffers: Mutex::new(buffers),
            capacity_bytes,
            used_bytes: AtomicUsize::new(0),
            state: Mutex::new(BufferState::Open),
            space_available: Notify::new(),
            pages_available: Notify::new(),
        }
    }

    pub fn state(&self) -> BufferState {
        *self.state.lock()
    }

    /// Producers await buffer space before emitting. Broadcasts a pages
    /// update to waiting consumers.
    pub async fn enqueue(&self, buffer_id: &str, page: Page) -> Result<()> {
        let page_size = page.size_in_bytes();
        loop {
            let used = self.used_bytes.load(AtomicOrdering::Acquire);
            if used + page_size <= self.capacity_bytes {
                break;
            }
            self.space_available.notified().await;
        }

        let mut buffers = self.buffers.lock();
        let queue = buffers
            .get_mut(buffer_id)
            .ok_or_else(|| EngineError::not_found(format!("output buffer '{buffer_id}' not found")))?;
        queue.pages.push(Arc::new(page));
        self.used_bytes.fetch_add(page_size, AtomicOrdering::AcqRel);
        drop(buffers);
        self.pages_available.notify_waiters();
        Ok(())
    }

    /// `(bufferId, nextToken, maxBytes)` → a contiguous slice of pages and a
    /// new token. Idempotent: the same token always returns the same pages
    /// until the client advances past them.
    pub fn get_pages(&self, buffer_id: &str, token: u64, max_bytes: usize) -> Result<(Vec<Arc<Page>>, u64)> {
        let buffers = self.buffers.lock();
        let queue = buffers
            .get(buffer_id)
            .ok_or_else(|| EngineError::not_found(format!("output buffer '{buffer_id}' not found")))?;

        if token < queue.base_token {
            return Err(EngineError::new(
                ErrorKind::InternalError,
                format!("token {token} has already been acknowledged past (base {})", queue.base_token),
            ));
        }

        let skip = (token - queue.base_token) as usize;
        let mut out = Vec::new();
        let mut used = 0usize;
        let mut next_token = token;
        for page in queue.pages.iter().skip(skip) {
            let size = page.size_in_bytes();
            if !out.is_empty() && used + size > max_bytes {
                break;
            }
            out.push(page.clone());
            used += size;
            next_token += 1;
        }
        Ok((out, next_token))
    }

    /// Acknowledges delivery up to (not including) `token`, allowing the
    /// buffer to drop those pages and free their byte budget.
    pub fn acknowledge(&self, buffer_id: &str, token: u64) -> Result<()> {
        let mut buffers = self.buffers.lock();
        let queue = buffers
            .get_mut(buffer_id)
            .ok_or_else(|| EngineError::not_found(format!("output buffer '{buffer_id}' not found")))?;
        if token <= queue.base_token {
            return Ok(());
        }
        let drop_count = (token - queue.base_token) as usize;
        let freed: usize = queue.pages.drain(..drop_count.min(queue.pages.len())).map(|p| p.size_in_bytes()).sum();
        queue.base_token = token;
        self.maybe_finish(&buffers);
        drop(buffers);
        self.used_bytes.fetch_sub(freed, AtomicOrdering::AcqRel);
        self.space_available.notify_waiters();
        Ok(())
    }

    pub fn set_no_more_pages(&self, buffer_id: &str) -> Result<()> {
        let mut buffers = self.buffers.lock();
        let queue = buffers
            .get_mut(buffer_id)
            .ok_or_else(|| EngineError::not_found(format!("output buffer '{buffer_id}' not found")))?;
        queue.no_more_pages = true;
        self.maybe_finish(&buffers);
        Ok(())
    }

    pub fn set_no_more_buffers(&self) {
        let mut state = self.state.lock();
        if *state == BufferState::Open {
            *state = BufferState::NoMoreBuffers;
        }
    }

    fn maybe_finish(&self, buffers: &HashMap<String, BufferQueue>) {
        let all_drained = buffers.values().all(|q| q.no_more_pages && q.pages.is_empty());
        if all_drained {
            let mut state = self.state.lock();
            if *state != BufferState::Finished {
                *state = BufferState::Finished;
            }
        }
    }

    pub fn abandon(&self, buffer_id: &str) -> Result<()> {
        let mut buffers = self.buffers.lock();
        if let Some(queue) = buffers.get_mut(buffer_id) {
            let freed: usize = queue.pages.drain(..).map(|p| p.size_in_bytes()).sum();
            queue.no_more_pages = true;
            self.used_bytes.fetch_sub(freed, AtomicOrdering::AcqRel);
        }
        self.maybe_finish(&buffers);
        Ok(())
    }
}

/// Partition functions: unpartitioned, hash(columns, n), and
/// single_partition.
pub enum PartitionFunction {
    Unpartitioned,
    Hash { columns: Vec<usize>, partition_count: usize },
    SinglePartition,
}

impl PartitionFunction {
    /// Deterministic, stable hash based on `Type::hash_position`; collisions
    /// are accepted as false positives, re-checked by equality downstream.
    pub fn partition(&self, page: &Page, types: &[std::sync::Arc<dyn Type>]) -> Result<Vec<usize>> {
        match self {
            PartitionFunction::Unpartitioned | PartitionFunction::SinglePartition => {
                Ok(vec![0; page.position_count()])
            }
            PartitionFunction::Hash { columns, partition_count } => {
                let mut out = Vec::with_capacity(page.position_count());
                for position in 0..page.position_count() {
                    let mut hash: u64 = 0;
                    for &col in columns {
                        let block = &page.blocks[col];
                        let ty = &types[col];
                        let part_hash = if block.is_null(position) { 0 } else { ty.hash_position(block, position)? };
                        hash = hash.wrapping_mul(31).wrapping_add(part_hash);
                    }
                    out.push((hash as usize) % (*partition_count).max(1));
                }
                Ok(out)
            }
        }
    }
}
