//! Aggregation state (C8): `TypedHistogram` and `TypedSet`, open-addressed
//! hash tables keyed by positions of a growing values collection, with
//! memory accounting against a per-state soft cap; plus the typed
//! state-object shapes aggregate operators declare for their accumulators,
//! each with a factory and a field-by-field block serializer.
//!
//! Growth past the 0.9 load factor doubles capacity and rehashes; inserts
//! that would push a state past its soft byte cap raise
//! `EXCEEDED_MEMORY_LIMIT` instead of growing unbounded.

use std::sync::Arc;

use crate::error::{EngineError, Result};

use super::block::{Block, BlockBuilder};
use super::exchange::Page;
use super::types::{PhysicalCategory, Type, Value};

/// Stable, type-routed hash of a materialized value: round-trips it through
/// a one-row block so the same `Type::hash_position` implementation used
/// for live block positions also governs rehashing of already-extracted
/// keys.
fn value_hash(element_type: &dyn Type, value: &Value) -> Result<u64> {
    if matches!(value, Value::Null) {
        return Ok(0);
    }
    let mut builder = BlockBuilder::new(element_type.physical_category());
    element_type.write_value(&mut builder, value)?;
    let block = builder.build();
    element_type.hash_position(&block, 0)
}

fn estimated_value_bytes(value: &Value) -> u64 {
    match value {
        Value::Null | Value::Boolean(_) => 1,
        Value::Int64(_) => 8,
        Value::Float64(_) => 8,
        Value::Slice(s) => s.len() as u64,
        Value::Array(items) | Value::Row(items) => items.iter().map(estimated_value_bytes).sum(),
        Value::Map(pairs) => pairs.iter().map(|(k, v)| estimated_value_bytes(k) + estimated_value_bytes(v)).sum(),
    }
}

const INITIAL_CAPACITY: usize = 16;
const LOAD_FACTOR: f64 = 0.9;
/// Fixed per-entry bookkeeping overhead (table slot + count word), added on
/// top of the value's own estimated size for the soft-cap accounting.
const ENTRY_OVERHEAD_BYTES: u64 = 24;

/// Open-addressed `(key, count)` table over a growing key collection.
/// `add` is the single mutator; `serialize` produces an interleaved
/// key/count transport page; `add_all` merges another histogram without
/// double-counting (duplicate keys accumulate).
pub struct TypedHistogram {
    element_type: Arc<dyn Type>,
    capacity: usize,
    table: Vec<Option<usize>>,
    keys: Vec<Value>,
    counts: Vec<u64>,
    null_count: u64,
    soft_cap_bytes: u64,
}

impl TypedHistogram {
    pub fn new(element_type: Arc<dyn Type>, soft_cap_bytes: u64) -> Self {
        Self {
            element_type,
            capacity: INITIAL_CAPACITY,
            table: vec![None; INITIAL_CAPACITY],
            keys: Vec::new(),
            counts: Vec::new(),
            null_count: 0,
            soft_cap_bytes,
        }
    }

    /// Distinct non-null key count.
    pub fn size(&self) -> usize {
        self.keys.len()
    }

    pub fn null_count(&self) -> u64 {
        self.null_count
    }

    pub fn count_of(&self, value: &Value) -> u64 {
        self.keys.iter().position(|k| k == value).map(|idx| self.counts[idx]).unwrap_or(0)
    }

    fn slot_for(&self, hash: u64) -> usize {
        (hash as usize) & (self.capacity - 1)
    }

    /// `add(pos, block, count)`: the single mutator. Null positions
    /// accumulate into a separate null counter rather than a table slot.
    pub fn add(&mut self, position: usize, block: &Block, count: u64) -> Result<()> {
        if count == 0 {
            return Ok(());
        }
        if block.is_null(position) {
            self.null_count += count;
            return Ok(());
        }
        let value = self.element_type.get_value(block, position)?;
        self.add_value(value, count)
    }

    fn add_value(&mut self, value: Value, count: u64) -> Result<()> {
        self.maybe_grow()?;
        let hash = value_hash(self.element_type.as_ref(), &value)?;
        let mut slot = self.slot_for(hash);
        loop {
            match self.table[slot] {
                None => {
                    self.check_memory_cap(&value)?;
                    let idx = self.keys.len();
                    self.keys.push(value);
                    self.counts.push(count);
                    self.table[slot] = Some(idx);
                    return Ok(());
                }
                Some(idx) if self.keys[idx] == value => {
                    self.counts[idx] += count;
                    return Ok(());
                }
                _ => {
                    slot = (slot + 1) % self.capacity;
                }
            }
        }
    }

    fn check_memory_cap(&self, incoming: &Value) -> Result<()> {
        let used: u64 = self
            .keys
            .iter()
            .map(|k| estimated_value_bytes(k) + ENTRY_OVERHEAD_BYTES)
            .sum::<u64>()
            + estimated_value_bytes(incoming)
            + ENTRY_OVERHEAD_BYTES;
        if used > self.soft_cap_bytes {
            return Err(EngineError::exceeded_memory_limit(format!(
                "aggregation state exceeded its {}-byte soft cap",
                self.soft_cap_bytes
            )));
        }
        Ok(())
    }

    /// Doubles capacity and rehashes once the 0.9 load factor would be
    /// exceeded by the next insert; probing always terminates because the
    /// table is kept below full.
    fn maybe_grow(&mut self) -> Result<()> {
        if (self.keys.len() + 1) as f64 <= self.capacity as f64 * LOAD_FACTOR {
            return Ok(());
        }
        self.capacity *= 2;
        self.table = vec![None; self.capacity];
        for (idx, key) in self.keys.iter().enumerate() {
            let hash = value_hash(self.element_type.as_ref(), key)?;
            let mut slot = self.slot_for(hash);
            while self.table[slot].is_some() {
                slot = (slot + 1) % self.capacity;
            }
            self.table[slot] = Some(idx);
        }
        Ok(())
    }

    /// Merges `other` into `self` without double-counting: matching keys
    /// accumulate, new keys are inserted.
    pub fn add_all(&mut self, other: &TypedHistogram) -> Result<()> {
        for (key, count) in other.keys.iter().zip(other.counts.iter()) {
            self.add_value(key.clone(), *count)?;
        }
        self.null_count += other.null_count;
        Ok(())
    }

    /// Produces an interleaved `(key, count)` transport page: a keys block
    /// and a parallel bigint counts block of the same length.
    pub fn serialize(&self) -> Result<Page> {
        let mut key_builder = BlockBuilder::new(self.element_type.physical_category());
        let mut count_builder = BlockBuilder::new(PhysicalCategory::Int64);
        for (key, count) in self.keys.iter().zip(self.counts.iter()) {
            self.element_type.write_value(&mut key_builder, key)?;
            count_builder.append_long(*count as i64);
        }
        Page::new(vec![key_builder.build(), count_builder.build()])
    }

    /// Reconstructs a histogram from a page produced by `serialize`.
    pub fn deserialize(element_type: Arc<dyn Type>, soft_cap_bytes: u64, page: &Page) -> Result<Self> {
        let mut histogram = Self::new(element_type, soft_cap_bytes);
        let keys = &page.blocks[0];
        let counts = &page.blocks[1];
        for position in 0..page.position_count() {
            let value = histogram.element_type.get_value(keys, position)?;
            let count = counts.get_long(position)? as u64;
            histogram.add_value(value, count)?;
        }
        Ok(histogram)
    }
}

/// Distinct-membership variant of `TypedHistogram`: counts are always 1 and
/// `size()` is the count of distinct non-null values inserted.
pub struct TypedSet {
    histogram: TypedHistogram,
}

impl TypedSet {
    pub fn new(element_type: Arc<dyn Type>, soft_cap_bytes: u64) -> Self {
        Self { histogram: TypedHistogram::new(element_type, soft_cap_bytes) }
    }

    /// Returns `true` if `position` was a previously-unseen non-null value.
    pub fn add(&mut self, position: usize, block: &Block) -> Result<bool> {
        if block.is_null(position) {
            self.histogram.null_count += 1;
            return Ok(false);
        }
        let already_present = self.histogram.count_of(&self.histogram.element_type.get_value(block, position)?) > 0;
        self.histogram.add(position, block, 1)?;
        Ok(!already_present)
    }

    pub fn size(&self) -> usize {
        self.histogram.size()
    }
}

/// A single primitive field in an aggregate operator's typed state shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateFieldKind {
    Boolean,
    Long,
    Double,
    Slice,
}

impl StateFieldKind {
    fn physical_category(self) -> PhysicalCategory {
        match self {
            StateFieldKind::Boolean => PhysicalCategory::Boolean,
            StateFieldKind::Long => PhysicalCategory::Int64,
            StateFieldKind::Double => PhysicalCategory::Float64,
            StateFieldKind::Slice => PhysicalCategory::Slice,
        }
    }
}

/// One named field of a [`StateShape`]: its primitive kind and whether it
/// may hold `Value::Null`.
#[derive(Debug, Clone, Copy)]
pub struct StateFieldDescriptor {
    pub name: &'static str,
    pub kind: StateFieldKind,
    pub nullable: bool,
}

/// The declared shape of an aggregate operator's accumulator: an ordered
/// list of primitive fields. `serialize_state`/`deserialize_state` round-trip
/// every field through the same block encoding C1 blocks use, independent of
/// which concrete `AggregationState` the shape belongs to.
#[derive(Debug, Clone)]
pub struct StateShape {
    pub name: &'static str,
    pub fields: &'static [StateFieldDescriptor],
}

/// An aggregate operator's accumulator, addressed field-by-field so the
/// serializer can walk `shape()` without knowing the concrete state type.
pub trait AggregationState: Send {
    fn shape(&self) -> &'static StateShape;
    fn field_value(&self, index: usize) -> Value;
    fn set_field_value(&mut self, index: usize, value: Value) -> Result<()>;
}

/// Builds a fresh, zeroed [`AggregationState`] for one shape. One factory per
/// shape stands in for the code-generated factory/serializer pair: the shape
/// is fixed at compile time, the factory just knows how to allocate it.
pub trait StateFactory: Send + Sync {
    fn shape(&self) -> &'static StateShape;
    fn create(&self) -> Box<dyn AggregationState>;
}

/// Serializes `state` field-by-field into a page with one single-position
/// block per field, in shape order.
pub fn serialize_state(state: &dyn AggregationState) -> Result<Page> {
    let shape = state.shape();
    let mut blocks = Vec::with_capacity(shape.fields.len());
    for (index, field) in shape.fields.iter().enumerate() {
        let mut builder = BlockBuilder::new(field.kind.physical_category());
        match state.field_value(index) {
            Value::Null => builder.append_null(),
            Value::Boolean(v) => builder.append_bool(v),
            Value::Int64(v) => builder.append_long(v),
            Value::Float64(v) => builder.append_double(v),
            Value::Slice(v) => builder.append_slice(&v),
            other => return Err(EngineError::internal(format!("state field '{}' holds non-scalar value {other:?}", field.name))),
        }
        blocks.push(builder.build());
    }
    Page::new(blocks)
}

/// Reconstructs a state of `factory`'s shape from a page produced by
/// [`serialize_state`].
pub fn deserialize_state(factory: &dyn StateFactory, page: &Page) -> Result<Box<dyn AggregationState>> {
    let shape = factory.shape();
    if page.blocks.len() != shape.fields.len() {
        return Err(EngineError::internal(format!(
            "state page for '{}' has {} blocks, shape declares {} fields",
            shape.name,
            page.blocks.len(),
            shape.fields.len()
        )));
    }
    let mut state = factory.create();
    for (index, field) in shape.fields.iter().enumerate() {
        let block = &page.blocks[index];
        let value = if block.is_null(0) {
            Value::Null
        } else {
            match field.kind {
                StateFieldKind::Boolean => Value::Boolean(block.get_bool(0)?),
                StateFieldKind::Long => Value::Int64(block.get_long(0)?),
                StateFieldKind::Double => Value::Float64(block.get_double(0)?),
                StateFieldKind::Slice => Value::Slice(block.get_slice(0)?.to_vec()),
            }
        };
        state.set_field_value(index, value)?;
    }
    Ok(state)
}

/// `sum(bigint)`: one nullable `Long` field, null until the first input.
#[derive(Debug, Default, Clone)]
pub struct LongSumState {
    pub sum: Option<i64>,
}

static LONG_SUM_SHAPE: StateShape =
    StateShape { name: "long_sum", fields: &[StateFieldDescriptor { name: "sum", kind: StateFieldKind::Long, nullable: true }] };

impl AggregationState for LongSumState {
    fn shape(&self) -> &'static StateShape {
        &LONG_SUM_SHAPE
    }

    fn field_value(&self, index: usize) -> Value {
        assert_eq!(index, 0);
        self.sum.map(Value::Int64).unwrap_or(Value::Null)
    }

    fn set_field_value(&mut self, index: usize, value: Value) -> Result<()> {
        assert_eq!(index, 0);
        self.sum = match value {
            Value::Null => None,
            Value::Int64(v) => Some(v),
            other => return Err(EngineError::internal(format!("long_sum.sum expected Int64 or Null, got {other:?}"))),
        };
        Ok(())
    }
}

pub struct LongSumStateFactory;

impl StateFactory for LongSumStateFactory {
    fn shape(&self) -> &'static StateShape {
        &LONG_SUM_SHAPE
    }

    fn create(&self) -> Box<dyn AggregationState> {
        Box::new(LongSumState::default())
    }
}

/// `avg(double)`: a not-nullable running `sum` and `count` pair.
#[derive(Debug, Default, Clone)]
pub struct AverageState {
    pub sum: f64,
    pub count: i64,
}

static AVERAGE_SHAPE: StateShape = StateShape {
    name: "average",
    fields: &[
        StateFieldDescriptor { name: "sum", kind: StateFieldKind::Double, nullable: false },
        StateFieldDescriptor { name: "count", kind: StateFieldKind::Long, nullable: false },
    ],
};

impl AggregationState for AverageState {
    fn shape(&self) -> &'static StateShape {
        &AVERAGE_SHAPE
    }

    fn field_value(&self, index: usize) -> Value {
        match index {
            0 => Value::Float64(self.sum),
            1 => Value::Int64(self.count),
            _ => panic!("average state has 2 fields, got index {index}"),
        }
    }

    fn set_field_value(&mut self, index: usize, value: Value) -> Result<()> {
        match (index, value) {
            (0, Value::Float64(v)) => self.sum = v,
            (1, Value::Int64(v)) => self.count = v,
            (i, v) => return Err(EngineError::internal(format!("average state field {i} rejected value {v:?}"))),
        }
        Ok(())
    }
}

pub struct AverageStateFactory;

impl StateFactory for AverageStateFactory {
    fn shape(&self) -> &'static StateShape {
        &AVERAGE_SHAPE
    }

    fn create(&self) -> Box<dyn AggregationState> {
        Box::new(AverageState::default())
    }
}

/// `bool_and(boolean)`: one nullable `Boolean` field, null until the first
/// input.
#[derive(Debug, Default, Clone)]
pub struct BooleanAndState {
    pub value: Option<bool>,
}

static BOOLEAN_AND_SHAPE: StateShape =
    StateShape { name: "bool_and", fields: &[StateFieldDescriptor { name: "value", kind: StateFieldKind::Boolean, nullable: true }] };

impl AggregationState for BooleanAndState {
    fn shape(&self) -> &'static StateShape {
        &BOOLEAN_AND_SHAPE
    }

    fn field_value(&self, index: usize) -> Value {
        assert_eq!(index, 0);
        self.value.map(Value::Boolean).unwrap_or(Value::Null)
    }

    fn set_field_value(&mut self, index: usize, value: Value) -> Result<()> {
        assert_eq!(index, 0);
        self.value = match value {
            Value::Null => None,
            Value::Boolean(v) => Some(v),
            other => return Err(EngineError::internal(format!("bool_and.value expected Boolean or Null, got {other:?}"))),
        };
        Ok(())
    }
}

pub struct BooleanAndStateFactory;

impl StateFactory for BooleanAndStateFactory {
    fn shape(&self) -> &'static StateShape {
        &BOOLEAN_AND_SHAPE
    }

    fn create(&self) -> Box<dyn AggregationState> {
        Box::new(BooleanAndState::default())
    }
}

/// `max(varchar)`/`max(varbinary)`: one nullable `Slice` field holding the
/// largest value seen so far.
#[derive(Debug, Default, Clone)]
pub struct MaxSliceState {
    pub value: Option<Vec<u8>>,
}

static MAX_SLICE_SHAPE: StateShape =
    StateShape { name: "max_slice", fields: &[StateFieldDescriptor { name: "value", kind: StateFieldKind::Slice, nullable: true }] };

impl AggregationState for MaxSliceState {
    fn shape(&self) -> &'static StateShape {
        &MAX_SLICE_SHAPE
    }

    fn field_value(&self, index: usize) -> Value {
        assert_eq!(index, 0);
        self.value.clone().map(Value::Slice).unwrap_or(Value::Null)
    }

    fn set_field_value(&mut self, index: usize, value: Value) -> Result<()> {
        assert_eq!(index, 0);
        self.value = match value {
            Value::Null => None,
            Value::Slice(v) => Some(v),
            other => return Err(EngineError::internal(format!("max_slice.value expected Slice or Null, got {other:?}"))),
        };
        Ok(())
    }
}

pub struct MaxSliceStateFactory;

impl StateFactory for MaxSliceStateFactory {
    fn shape(&self) -> &'static StateShape {
        &MAX_SLICE_SHAPE
    }

    fn create(&self) -> Box<dyn AggregationState> {
        Box::new(MaxSliceState::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::types::{BigintType, VarcharBaseType};

    fn block_of(values: &[i64]) -> Block {
        let mut builder = BlockBuilder::new(PhysicalCategory::Int64);
        for v in values {
            builder.append_long(*v);
        }
        builder.build()
    }

    /// S6: input `[a,b,c,d,e,e,c,a,a,a,...]` → counts `{a:25,b:10,c:12,d:1,e:2}`.
    #[test]
    fn histogram_counts_match_input_frequencies() {
        let ty: Arc<dyn Type> = Arc::new(VarcharBaseType::new());
        let mut histogram = TypedHistogram::new(ty, 4 * 1024 * 1024);
        let counts = [("a", 25u64), ("b", 10), ("c", 12), ("d", 1), ("e", 2)];
        for (key, count) in counts {
            let mut builder = BlockBuilder::new(PhysicalCategory::Slice);
            builder.append_slice(key.as_bytes());
            let block = builder.build();
            histogram.add(0, &block, count).unwrap();
        }
        assert_eq!(histogram.size(), 5);
        let total: u64 = counts.iter().map(|(_, c)| *c).sum();
        let observed: u64 = (0..histogram.size()).map(|i| histogram.counts[i]).sum();
        assert_eq!(observed, total);
    }

    #[test]
    fn serialize_then_deserialize_preserves_counts() {
        let ty: Arc<dyn Type> = Arc::new(BigintType::new());
        let mut histogram = TypedHistogram::new(ty.clone(), 4 * 1024 * 1024);
        let block = block_of(&[1, 2, 1, 3, 2, 1]);
        for pos in 0..block.len() {
            histogram.add(pos, &block, 1).unwrap();
        }
        let page = histogram.serialize().unwrap();
        let restored = TypedHistogram::deserialize(ty, 4 * 1024 * 1024, &page).unwrap();
        assert_eq!(restored.size(), histogram.size());
        for key in &histogram.keys {
            assert_eq!(restored.count_of(key), histogram.count_of(key));
        }
    }

    #[test]
    fn duplicate_keys_accumulate_rather_than_creating_new_entries() {
        let ty: Arc<dyn Type> = Arc::new(BigintType::new());
        let mut histogram = TypedHistogram::new(ty, 4 * 1024 * 1024);
        let block = block_of(&[7, 7, 7]);
        for pos in 0..block.len() {
            histogram.add(pos, &block, 1).unwrap();
        }
        assert_eq!(histogram.size(), 1);
        assert_eq!(histogram.count_of(&Value::Int64(7)), 3);
    }

    #[test]
    fn add_all_merges_without_double_counting() {
        let ty: Arc<dyn Type> = Arc::new(BigintType::new());
        let mut a = TypedHistogram::new(ty.clone(), 4 * 1024 * 1024);
        let mut b = TypedHistogram::new(ty, 4 * 1024 * 1024);
        let block = block_of(&[1, 2]);
        a.add(0, &block, 5).unwrap();
        b.add(0, &block, 2).unwrap();
        b.add(1, &block, 1).unwrap();
        a.add_all(&b).unwrap();
        assert_eq!(a.count_of(&Value::Int64(1)), 7);
        assert_eq!(a.count_of(&Value::Int64(2)), 1);
        assert_eq!(a.size(), 2);
    }

    #[test]
    fn growth_past_load_factor_preserves_all_entries() {
        let ty: Arc<dyn Type> = Arc::new(BigintType::new());
        let mut histogram = TypedHistogram::new(ty, 16 * 1024 * 1024);
        let values: Vec<i64> = (0..100).collect();
        let block = block_of(&values);
        for pos in 0..block.len() {
            histogram.add(pos, &block, 1).unwrap();
        }
        assert_eq!(histogram.size(), 100);
        for v in values {
            assert_eq!(histogram.count_of(&Value::Int64(v)), 1);
        }
    }

    #[test]
    fn exceeding_the_soft_cap_raises_exceeded_memory_limit() {
        let ty: Arc<dyn Type> = Arc::new(BigintType::new());
        let mut histogram = TypedHistogram::new(ty, 64);
        let values: Vec<i64> = (0..100).collect();
        let block = block_of(&values);
        let mut saw_error = false;
        for pos in 0..block.len() {
            if histogram.add(pos, &block, 1).is_err() {
                saw_error = true;
                break;
            }
        }
        assert!(saw_error);
    }

    #[test]
    fn typed_set_reports_first_insertion_as_new() {
        let ty: Arc<dyn Type> = Arc::new(BigintType::new());
        let mut set = TypedSet::new(ty, 4 * 1024 * 1024);
        let block = block_of(&[9, 9, 10]);
        assert!(set.add(0, &block).unwrap());
        assert!(!set.add(1, &block).unwrap());
        assert!(set.add(2, &block).unwrap());
        assert_eq!(set.size(), 2);
    }

    /// spec.md §4.8's state-object-compilation paragraph: per-field equality
    /// after serialize/deserialize, for every scalar field kind (Long,
    /// Double, Boolean, Slice) across the declared state shapes.
    #[test]
    fn long_sum_state_round_trips_its_long_field() {
        let state = LongSumState { sum: Some(42) };
        let page = serialize_state(&state).unwrap();
        let restored = deserialize_state(&LongSumStateFactory, &page).unwrap();
        assert_eq!(restored.field_value(0), Value::Int64(42));
    }

    #[test]
    fn long_sum_state_round_trips_a_null_field() {
        let state = LongSumState { sum: None };
        let page = serialize_state(&state).unwrap();
        let restored = deserialize_state(&LongSumStateFactory, &page).unwrap();
        assert_eq!(restored.field_value(0), Value::Null);
    }

    #[test]
    fn average_state_round_trips_its_double_and_long_fields() {
        let state = AverageState { sum: 17.5, count: 3 };
        let page = serialize_state(&state).unwrap();
        let restored = deserialize_state(&AverageStateFactory, &page).unwrap();
        assert_eq!(restored.field_value(0), Value::Float64(17.5));
        assert_eq!(restored.field_value(1), Value::Int64(3));
    }

    #[test]
    fn boolean_and_state_round_trips_its_boolean_field() {
        let state = BooleanAndState { value: Some(true) };
        let page = serialize_state(&state).unwrap();
        let restored = deserialize_state(&BooleanAndStateFactory, &page).unwrap();
        assert_eq!(restored.field_value(0), Value::Boolean(true));
    }

    #[test]
    fn max_slice_state_round_trips_its_slice_field() {
        let state = MaxSliceState { value: Some(b"zzz".to_vec()) };
        let page = serialize_state(&state).unwrap();
        let restored = deserialize_state(&MaxSliceStateFactory, &page).unwrap();
        assert_eq!(restored.field_value(0), Value::Slice(b"zzz".to_vec()));
    }

    #[test]
    fn state_shape_declares_field_names_and_nullability() {
        assert_eq!(AVERAGE_SHAPE.fields[0].name, "sum");
        assert!(!AVERAGE_SHAPE.fields[0].nullable);
        assert_eq!(LONG_SUM_SHAPE.fields[0].name, "sum");
        assert!(LONG_SUM_SHAPE.fields[0].nullable);
    }
}
