//! Streaming cursor contract (C9): a row-at-a-time pull interface over
//! blocks, plus the coarser page-source sibling that batches rows directly
//! into pages. An explicit `advance`-then-`accessor` protocol, with no
//! implicit iterator state, connector-neutral by construction.

use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::error::{EngineError, ErrorKind, Result};

use super::block::{Block, BlockBuilder};
use super::exchange::Page;
use super::types::Type;

/// One row at a time, primitive accessors plus progress reporting.
/// Contract: exactly one successful `advance_next_position` is required
/// before any accessor; a type mismatch raises a programming error;
/// `close()` is idempotent; `get_completed_bytes` is monotonic and bounded
/// by `get_total_bytes` after close.
pub trait RecordCursor: Send {
    fn get_type(&self, field: usize) -> Arc<dyn Type>;
    fn advance_next_position(&mut self) -> Result<bool>;
    fn is_null(&self, field: usize) -> bool;
    fn get_bool(&self, field: usize) -> Result<bool>;
    fn get_long(&self, field: usize) -> Result<i64>;
    fn get_double(&self, field: usize) -> Result<f64>;
    fn get_slice(&self, field: usize) -> Result<Vec<u8>>;
    fn get_object(&self, field: usize) -> Result<super::types::Value>;
    fn get_total_bytes(&self) -> u64;
    fn get_completed_bytes(&self) -> u64;
    fn get_read_time_nanos(&self) -> u64;
    fn close(&mut self);
}

/// A factory for cursors over one split's rows, carrying the column types
/// the cursor will hand back.
pub trait RecordSet: Send {
    fn column_types(&self) -> Vec<Arc<dyn Type>>;
    fn cursor(&self) -> Box<dyn RecordCursor>;
}

/// An in-memory record set: rows are pre-materialized per column, one
/// `Vec<Value>` per column. Partition-key columns are typically constant
/// across every row in a split and are produced the same way any other
/// column is.
pub struct InMemoryRecordSet {
    types: Vec<Arc<dyn Type>>,
    columns: Vec<Vec<super::types::Value>>,
}

impl InMemoryRecordSet {
    pub fn new(types: Vec<Arc<dyn Type>>, columns: Vec<Vec<super::types::Value>>) -> Result<Self> {
        if columns.len() != types.len() {
            return Err(EngineError::new(
                ErrorKind::InternalError,
                "record set column count does not match type count",
            ));
        }
        let row_count = columns.first().map(|c| c.len());
        if let Some(expected) = row_count {
            if columns.iter().any(|c| c.len() != expected) {
                return Err(EngineError::new(ErrorKind::InternalError, "record set columns have unequal length"));
            }
        }
        Ok(Self { types, columns })
    }
}

impl RecordSet for InMemoryRecordSet {
    fn column_types(&self) -> Vec<Arc<dyn Type>> {
        self.types.clone()
    }

    fn cursor(&self) -> Box<dyn RecordCursor> {
        Box::new(InMemoryRecordCursor {
            types: self.types.clone(),
            columns: self.columns.clone(),
            position: None,
            row_count: self.columns.first().map(Vec::len).unwrap_or(0),
            started_at: Instant::now(),
            closed: false,
            bytes_per_row: estimate_bytes_per_row(&self.columns),
        })
    }
}

fn estimate_bytes_per_row(columns: &[Vec<super::types::Value>]) -> u64 {
    use super::types::Value;
    fn value_size(v: &Value) -> u64 {
        match v {
            Value::Null | Value::Boolean(_) => 1,
            Value::Int64(_) => 8,
            Value::Float64(_) => 8,
            Value::Slice(s) => s.len() as u64,
            Value::Array(items) | Value::Row(items) => items.iter().map(value_size).sum(),
            Value::Map(pairs) => pairs.iter().map(|(k, v)| value_size(k) + value_size(v)).sum(),
        }
    }
    let row_count = columns.first().map(Vec::len).unwrap_or(0).max(1);
    let total: u64 = columns.iter().flatten().map(value_size).sum();
    total / row_count as u64
}

struct InMemoryRecordCursor {
    types: Vec<Arc<dyn Type>>,
    columns: Vec<Vec<super::types::Value>>,
    position: Option<usize>,
    row_count: usize,
    started_at: Instant,
    closed: bool,
    bytes_per_row: u64,
}

impl InMemoryRecordCursor {
    fn require_advanced(&self) -> Result<usize> {
        self.position.ok_or_else(|| {
            EngineError::new(ErrorKind::InternalError, "accessor called before advance_next_position succeeded")
        })
    }

    fn value(&self, field: usize) -> Result<&super::types::Value> {
        let position = self.require_advanced()?;
        self.columns
            .get(field)
            .and_then(|col| col.get(position))
            .ok_or_else(|| EngineError::new(ErrorKind::InternalError, format!("no such field {field}")))
    }
}

impl RecordCursor for InMemoryRecordCursor {
    fn get_type(&self, field: usize) -> Arc<dyn Type> {
        self.types[field].clone()
    }

    fn advance_next_position(&mut self) -> Result<bool> {
        if self.closed {
            return Ok(false);
        }
        let next = self.position.map(|p| p + 1).unwrap_or(0);
        if next >= self.row_count {
            return Ok(false);
        }
        self.position = Some(next);
        Ok(true)
    }

    fn is_null(&self, field: usize) -> bool {
        matches!(self.value(field), Ok(super::types::Value::Null))
    }

    fn get_bool(&self, field: usize) -> Result<bool> {
        match self.value(field)? {
            super::types::Value::Boolean(b) => Ok(*b),
            other => Err(type_error("bool", other)),
        }
    }

    fn get_long(&self, field: usize) -> Result<i64> {
        match self.value(field)? {
            super::types::Value::Int64(v) => Ok(*v),
            other => Err(type_error("int64", other)),
        }
    }

    fn get_double(&self, field: usize) -> Result<f64> {
        match self.value(field)? {
            super::types::Value::Float64(v) => Ok(*v),
            other => Err(type_error("double", other)),
        }
    }

    fn get_slice(&self, field: usize) -> Result<Vec<u8>> {
        match self.value(field)? {
            super::types::Value::Slice(v) => Ok(v.clone()),
            other => Err(type_error("slice", other)),
        }
    }

    fn get_object(&self, field: usize) -> Result<super::types::Value> {
        self.value(field).cloned()
    }

    fn get_total_bytes(&self) -> u64 {
        self.bytes_per_row * self.row_count as u64
    }

    fn get_completed_bytes(&self) -> u64 {
        let completed_rows = self.position.map(|p| p + 1).unwrap_or(0) as u64;
        (self.bytes_per_row * completed_rows).min(self.get_total_bytes())
    }

    fn get_read_time_nanos(&self) -> u64 {
        self.started_at.elapsed().as_nanos() as u64
    }

    fn close(&mut self) {
        self.closed = true;
    }
}

fn type_error(expected: &str, found: &super::types::Value) -> EngineError {
    EngineError::new(ErrorKind::InternalError, format!("expected {expected}, found {found:?}"))
}

/// Adapts a `RecordSet` into a page source: a coarser sibling that yields
/// pages directly, batching up to `batch_size` rows per page.
pub struct RecordSetPageSource {
    types: Vec<Arc<dyn Type>>,
    cursor: Box<dyn RecordCursor>,
    batch_size: usize,
    finished: bool,
}

impl RecordSetPageSource {
    pub fn new(record_set: &dyn RecordSet, batch_size: usize) -> Self {
        Self {
            types: record_set.column_types(),
            cursor: record_set.cursor(),
            batch_size: batch_size.max(1),
            finished: false,
        }
    }

    /// Pulls the next page, or `None` once the underlying cursor is
    /// exhausted. The cursor is closed automatically on exhaustion.
    pub fn next_page(&mut self) -> Result<Option<Page>> {
        if self.finished {
            return Ok(None);
        }
        let mut builders: Vec<BlockBuilder> =
            self.types.iter().map(|t| BlockBuilder::new(t.physical_category())).collect();
        let mut rows = 0;
        while rows < self.batch_size {
            if !self.cursor.advance_next_position()? {
                self.finished = true;
                self.cursor.close();
                break;
            }
            for (field, builder) in builders.iter_mut().enumerate() {
                if self.cursor.is_null(field) {
                    builder.append_null();
                } else {
                    let value = self.cursor.get_object(field)?;
                    self.types[field].write_value(builder, &value)?;
                }
            }
            rows += 1;
        }
        if rows == 0 {
            return Ok(None);
        }
        let blocks: Vec<Block> = builders.into_iter().map(BlockBuilder::build).collect();
        Ok(Some(Page::new(blocks)?))
    }

    pub fn elapsed(&self) -> Duration {
        Duration::from_nanos(self.cursor.get_read_time_nanos())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::types::{BigintType, Value};

    fn sample_record_set() -> InMemoryRecordSet {
        InMemoryRecordSet::new(
            vec![Arc::new(BigintType::new())],
            vec![vec![Value::Int64(1), Value::Int64(3), Value::Int64(2)]],
        )
        .unwrap()
    }

    #[test]
    fn accessor_before_advance_is_a_programming_error() {
        let rs = sample_record_set();
        let cursor = rs.cursor();
        assert!(cursor.get_long(0).is_err());
    }

    #[test]
    fn advancing_through_all_rows_then_stopping() {
        let rs = sample_record_set();
        let mut cursor = rs.cursor();
        let mut values = Vec::new();
        while cursor.advance_next_position().unwrap() {
            values.push(cursor.get_long(0).unwrap());
        }
        assert_eq!(values, vec![1, 3, 2]);
        assert!(!cursor.advance_next_position().unwrap());
    }

    #[test]
    fn completed_bytes_is_monotonic_and_bounded_by_total_after_close() {
        let rs = sample_record_set();
        let mut cursor = rs.cursor();
        let mut last = 0;
        while cursor.advance_next_position().unwrap() {
            let completed = cursor.get_completed_bytes();
            assert!(completed >= last);
            last = completed;
        }
        cursor.close();
        assert!(cursor.get_completed_bytes() <= cursor.get_total_bytes());
    }

    #[test]
    fn close_is_idempotent() {
        let rs = sample_record_set();
        let mut cursor = rs.cursor();
        cursor.close();
        cursor.close();
        assert!(!cursor.advance_next_position().unwrap());
    }

    #[test]
    fn page_source_batches_rows_into_pages() {
        let rs = sample_record_set();
        let mut source = RecordSetPageSource::new(&rs, 2);
        let first = source.next_page().unwrap().unwrap();
        assert_eq!(first.position_count(), 2);
        let second = source.next_page().unwrap().unwrap();
        assert_eq!(second.position_count(), 1);
        assert!(source.next_page().unwrap().is_none());
    }
}
