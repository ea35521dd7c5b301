//! Type system (C1): type signatures, the physical value model, and the
//! process-wide [`TypeRegistry`] that interns them.
//!
//! Each SQL type is a trait object rather than an enum variant, so
//! nested/parametric types (`array<T>`, `map<K,V>`, `row<...>`) can carry
//! child types without an explosion of variants. Types are process-wide
//! singletons reached through the registry, seeded once at startup.

use crate::error::{EngineError, ErrorKind, Result};
use once_cell::sync::Lazy;
use parking_lot::RwLock;
use std::cmp::Ordering;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use super::block::{Block, BlockBuilder};

/// Erased physical representation a type is stored as. Every concrete `Type`
/// maps to exactly one of these; block encodings are keyed by this, not by
/// the logical type name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PhysicalCategory {
    Boolean,
    Int64,
    Float64,
    Slice,
    Nested,
}

/// A type's name and, for parametric types, its type arguments. Two
/// `TypeSignature`s that compare equal intern to the same `Arc<dyn Type>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TypeSignature {
    Base(&'static str),
    Varchar(Option<u32>),
    Array(Box<TypeSignature>),
    Map(Box<TypeSignature>, Box<TypeSignature>),
    Row(Vec<(Option<String>, TypeSignature)>),
}

impl fmt::Display for TypeSignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TypeSignature::Base(name) => write!(f, "{name}"),
            TypeSignature::Varchar(None) => write!(f, "varchar"),
            TypeSignature::Varchar(Some(n)) => write!(f, "varchar({n})"),
            TypeSignature::Array(elem) => write!(f, "array<{elem}>"),
            TypeSignature::Map(k, v) => write!(f, "map<{k},{v}>"),
            TypeSignature::Row(fields) => {
                write!(f, "row<")?;
                for (i, (name, ty)) in fields.iter().enumerate() {
                    if i > 0 {
                        write!(f, ",")?;
                    }
                    match name {
                        Some(n) => write!(f, "{n} {ty}")?,
                        None => write!(f, "{ty}")?,
                    }
                }
                write!(f, ">")
            }
        }
    }
}

/// A materialized scalar or container value, as produced by
/// [`Type::get_value`] or consumed by [`Type::write_value`].
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Boolean(bool),
    Int64(i64),
    Float64(f64),
    Slice(Vec<u8>),
    Array(Vec<Value>),
    Map(Vec<(Value, Value)>),
    Row(Vec<Value>),
}

/// A SQL-visible type: a signature, a physical storage category, and the
/// block-level value/hash/equality/comparison operations every type
/// implements. Implementations are process-wide singletons reached through
/// [`TypeRegistry`], never constructed per-value.
pub trait Type: Send + Sync + fmt::Debug {
    fn signature(&self) -> &TypeSignature;
    fn physical_category(&self) -> PhysicalCategory;
    fn is_comparable(&self) -> bool;
    fn is_orderable(&self) -> bool;

    /// `unknown` returns null from every operator; everything else is
    /// expected to yield `Ok` when the position is non-null.
    fn is_unknown(&self) -> bool {
        false
    }

    fn is_null(&self, block: &Block, position: usize) -> bool {
        block.is_null(position)
    }

    /// Returns the value at `position`; fails if `position` is null (callers
    /// must check `is_null` first).
    fn get_value(&self, block: &Block, position: usize) -> Result<Value>;

    fn write_value(&self, builder: &mut BlockBuilder, value: &Value) -> Result<()>;

    /// Stable across process restarts for a deterministic type. Callers must
    /// never call this on a null position.
    fn hash_position(&self, block: &Block, position: usize) -> Result<u64>;

    fn equals_position(
        &self,
        left: &Block,
        left_pos: usize,
        right: &Block,
        right_pos: usize,
    ) -> Result<bool>;

    /// Only valid for orderable types; nested types containing a null
    /// element fail with a dedicated error kind rather than panicking.
    fn compare_position(
        &self,
        left: &Block,
        left_pos: usize,
        right: &Block,
        right_pos: usize,
    ) -> Result<Ordering> {
        let _ = (left, left_pos, right, right_pos);
        Err(EngineError::new(
            ErrorKind::NotSupported,
            format!("type {} is not orderable", self.signature()),
        ))
    }

    /// Materializes a value for client-facing JSON output. The default
    /// forwards to `get_value`'s scalar shape; session-timezone-aware types
    /// (date/time) override this.
    fn object_value(&self, session_time_zone: &str, block: &Block, position: usize) -> Result<serde_json::Value> {
        let _ = session_time_zone;
        if self.is_null(block, position) {
            return Ok(serde_json::Value::Null);
        }
        Ok(value_to_json(&self.get_value(block, position)?))
    }
}

fn value_to_json(value: &Value) -> serde_json::Value {
    match value {
        Value::Null => serde_json::Value::Null,
        Value::Boolean(b) => serde_json::Value::Bool(*b),
        Value::Int64(i) => serde_json::Value::Number((*i).into()),
        Value::Float64(f) => serde_json::Number::from_f64(*f)
            .map(serde_json::Value::Number)
            .unwrap_or(serde_json::Value::Null),
        Value::Slice(bytes) => serde_json::Value::String(hex_encode(bytes)),
        Value::Array(items) => serde_json::Value::Array(items.iter().map(value_to_json).collect()),
        Value::Map(pairs) => serde_json::Value::Array(
            pairs
                .iter()
                .map(|(k, v)| serde_json::json!([value_to_json(k), value_to_json(v)]))
                .collect(),
        ),
        Value::Row(fields) => serde_json::Value::Array(fields.iter().map(value_to_json).collect()),
    }
}

fn hex_encode(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

#[derive(Debug)]
pub struct BooleanType {
    signature: TypeSignature,
}
impl BooleanType {
    pub fn new() -> Self {
        Self { signature: TypeSignature::Base("boolean") }
    }
}
impl Default for BooleanType {
    fn default() -> Self {
        Self::new()
    }
}
impl Type for BooleanType {
    fn signature(&self) -> &TypeSignature {
        &self.signature
    }
    fn physical_category(&self) -> PhysicalCategory {
        PhysicalCategory::Boolean
    }
    fn is_comparable(&self) -> bool {
        true
    }
    fn is_orderable(&self) -> bool {
        true
    }
    fn get_value(&self, block: &Block, position: usize) -> Result<Value> {
        require_not_null(self, block, position)?;
        Ok(Value::Boolean(block.get_bool(position)?))
    }
    fn write_value(&self, builder: &mut BlockBuilder, value: &Value) -> Result<()> {
        match value {
            Value::Null => builder.append_null(),
            Value::Boolean(b) => builder.append_bool(*b),
            other => type_mismatch(self, other),
        }
    }
    fn hash_position(&self, block: &Block, position: usize) -> Result<u64> {
        Ok(if block.get_bool(position)? { 1 } else { 0 })
    }
    fn equals_position(&self, left: &Block, lp: usize, right: &Block, rp: usize) -> Result<bool> {
        Ok(left.get_bool(lp)? == right.get_bool(rp)?)
    }
    fn compare_position(&self, left: &Block, lp: usize, right: &Block, rp: usize) -> Result<Ordering> {
        Ok(left.get_bool(lp)?.cmp(&right.get_bool(rp)?))
    }
}

macro_rules! int64_like {
    ($name:ident, $sig_name:expr) => {
        #[derive(Debug)]
        pub struct $name {
            signature: TypeSignature,
        }
        impl $name {
            pub fn new() -> Self {
                Self { signature: TypeSignature::Base($sig_name) }
            }
        }
        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }
        impl Type for $name {
            fn signature(&self) -> &TypeSignature {
                &self.signature
            }
            fn physical_category(&self) -> PhysicalCategory {
                PhysicalCategory::Int64
            }
            fn is_comparable(&self) -> bool {
                true
            }
            fn is_orderable(&self) -> bool {
                true
            }
            fn get_value(&self, block: &Block, position: usize) -> Result<Value> {
                require_not_null(self, block, position)?;
                Ok(Value::Int64(block.get_long(position)?))
            }
            fn write_value(&self, builder: &mut BlockBuilder, value: &Value) -> Result<()> {
                match value {
                    Value::Null => builder.append_null(),
                    Value::Int64(v) => builder.append_long(*v),
                    other => type_mismatch(self, other),
                }
            }
            fn hash_position(&self, block: &Block, position: usize) -> Result<u64> {
                Ok(block.get_long(position)? as u64)
            }
            fn equals_position(&self, left: &Block, lp: usize, right: &Block, rp: usize) -> Result<bool> {
                Ok(left.get_long(lp)? == right.get_long(rp)?)
            }
            fn compare_position(&self, left: &Block, lp: usize, right: &Block, rp: usize) -> Result<Ordering> {
                Ok(left.get_long(lp)?.cmp(&right.get_long(rp)?))
            }
        }
    };
}

int64_like!(BigintType, "bigint");
int64_like!(DateType, "date");
int64_like!(TimestampType, "timestamp");
int64_like!(TimestampWithTimeZoneType, "timestamp with time zone");

#[derive(Debug)]
pub struct DoubleType {
    signature: TypeSignature,
}
impl DoubleType {
    pub fn new() -> Self {
        Self { signature: TypeSignature::Base("double") }
    }
}
impl Default for DoubleType {
    fn default() -> Self {
        Self::new()
    }
}
impl Type for DoubleType {
    fn signature(&self) -> &TypeSignature {
        &self.signature
    }
    fn physical_category(&self) -> PhysicalCategory {
        PhysicalCategory::Float64
    }
    fn is_comparable(&self) -> bool {
        true
    }
    fn is_orderable(&self) -> bool {
        true
    }
    fn get_value(&self, block: &Block, position: usize) -> Result<Value> {
        require_not_null(self, block, position)?;
        Ok(Value::Float64(block.get_double(position)?))
    }
    fn write_value(&self, builder: &mut BlockBuilder, value: &Value) -> Result<()> {
        match value {
            Value::Null => builder.append_null(),
            Value::Float64(v) => builder.append_double(*v),
            other => type_mismatch(self, other),
        }
    }
    fn hash_position(&self, block: &Block, position: usize) -> Result<u64> {
        Ok(block.get_double(position)?.to_bits())
    }
    fn equals_position(&self, left: &Block, lp: usize, right: &Block, rp: usize) -> Result<bool> {
        Ok(left.get_double(lp)?.to_bits() == right.get_double(rp)?.to_bits())
    }
    fn compare_position(&self, left: &Block, lp: usize, right: &Block, rp: usize) -> Result<Ordering> {
        left.get_double(lp)?
            .partial_cmp(&right.get_double(rp)?)
            .ok_or_else(|| EngineError::new(ErrorKind::NotSupported, "NaN is not orderable"))
    }
}

macro_rules! slice_like {
    ($name:ident, $sig_name:expr) => {
        #[derive(Debug)]
        pub struct $name {
            signature: TypeSignature,
        }
        impl $name {
            pub fn new() -> Self {
                Self { signature: TypeSignature::Base($sig_name) }
            }
        }
        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }
        impl Type for $name {
            fn signature(&self) -> &TypeSignature {
                &self.signature
            }
            fn physical_category(&self) -> PhysicalCategory {
                PhysicalCategory::Slice
            }
            fn is_comparable(&self) -> bool {
                true
            }
            fn is_orderable(&self) -> bool {
                true
            }
            fn get_value(&self, block: &Block, position: usize) -> Result<Value> {
                require_not_null(self, block, position)?;
                Ok(Value::Slice(block.get_slice(position)?.to_vec()))
            }
            fn write_value(&self, builder: &mut BlockBuilder, value: &Value) -> Result<()> {
                match value {
                    Value::Null => builder.append_null(),
                    Value::Slice(v) => builder.append_slice(v),
                    other => type_mismatch(self, other),
                }
            }
            fn hash_position(&self, block: &Block, position: usize) -> Result<u64> {
                Ok(fnv1a(block.get_slice(position)?))
            }
            fn equals_position(&self, left: &Block, lp: usize, right: &Block, rp: usize) -> Result<bool> {
                Ok(left.get_slice(lp)? == right.get_slice(rp)?)
            }
            fn compare_position(&self, left: &Block, lp: usize, right: &Block, rp: usize) -> Result<Ordering> {
                Ok(left.get_slice(lp)?.cmp(right.get_slice(rp)?))
            }
        }
    };
}

slice_like!(VarcharBaseType, "varchar");
slice_like!(VarbinaryType, "varbinary");

fn fnv1a(bytes: &[u8]) -> u64 {
    let mut hash: u64 = 0xcbf29ce484222325;
    for b in bytes {
        hash ^= *b as u64;
        hash = hash.wrapping_mul(0x100000001b3);
    }
    hash
}

/// `unknown`: the type of the null literal. Every operation returns null /
/// fails gracefully rather than reading a (nonexistent) payload.
#[derive(Debug)]
pub struct UnknownType {
    signature: TypeSignature,
}
impl UnknownType {
    pub fn new() -> Self {
        Self { signature: TypeSignature::Base("unknown") }
    }
}
impl Default for UnknownType {
    fn default() -> Self {
        Self::new()
    }
}
impl Type for UnknownType {
    fn signature(&self) -> &TypeSignature {
        &self.signature
    }
    fn physical_category(&self) -> PhysicalCategory {
        PhysicalCategory::Boolean
    }
    fn is_comparable(&self) -> bool {
        true
    }
    fn is_orderable(&self) -> bool {
        true
    }
    fn is_unknown(&self) -> bool {
        true
    }
    fn get_value(&self, _block: &Block, _position: usize) -> Result<Value> {
        Ok(Value::Null)
    }
    fn write_value(&self, builder: &mut BlockBuilder, _value: &Value) -> Result<()> {
        builder.append_null();
        Ok(())
    }
    fn hash_position(&self, _block: &Block, _position: usize) -> Result<u64> {
        Ok(0)
    }
    fn equals_position(&self, _left: &Block, _lp: usize, _right: &Block, _rp: usize) -> Result<bool> {
        Ok(true)
    }
    fn compare_position(&self, _left: &Block, _lp: usize, _right: &Block, _rp: usize) -> Result<Ordering> {
        Ok(Ordering::Equal)
    }
}

/// `array<T>`: one child block; comparisons of arrays containing a null
/// element fail rather than silently treating null as a sort key.
#[derive(Debug)]
pub struct ArrayType {
    signature: TypeSignature,
    element: Arc<dyn Type>,
}

impl ArrayType {
    pub fn new(element: Arc<dyn Type>) -> Self {
        let signature = TypeSignature::Array(Box::new(element.signature().clone()));
        Self { signature, element }
    }

    pub fn element_type(&self) -> &Arc<dyn Type> {
        &self.element
    }
}

impl Type for ArrayType {
    fn signature(&self) -> &TypeSignature {
        &self.signature
    }
    fn physical_category(&self) -> PhysicalCategory {
        PhysicalCategory::Nested
    }
    fn is_comparable(&self) -> bool {
        self.element.is_comparable()
    }
    fn is_orderable(&self) -> bool {
        self.element.is_orderable()
    }
    fn get_value(&self, block: &Block, position: usize) -> Result<Value> {
        require_not_null(self, block, position)?;
        let child = block.get_nested(position)?;
        let mut items = Vec::with_capacity(child.len());
        for pos in 0..child.len() {
            if child.is_null(pos) {
                items.push(Value::Null);
            } else {
                items.push(self.element.get_value(&child, pos)?);
            }
        }
        Ok(Value::Array(items))
    }
    fn write_value(&self, builder: &mut BlockBuilder, value: &Value) -> Result<()> {
        match value {
            Value::Null => builder.append_null(),
            Value::Array(items) => {
                let mut child = BlockBuilder::new(self.element.physical_category());
                for item in items {
                    self.element.write_value(&mut child, item)?;
                }
                builder.append_nested(child.build());
            }
            other => type_mismatch(self, other),
        }
        Ok(())
    }
    fn hash_position(&self, block: &Block, position: usize) -> Result<u64> {
        let child = block.get_nested(position)?;
        let mut hash: u64 = 0x9e3779b97f4a7c15;
        for pos in 0..child.len() {
            let elem_hash = if child.is_null(pos) { 0 } else { self.element.hash_position(&child, pos)? };
            hash = hash.wrapping_mul(31).wrapping_add(elem_hash);
        }
        Ok(hash)
    }
    fn equals_position(&self, left: &Block, lp: usize, right: &Block, rp: usize) -> Result<bool> {
        let (lc, rc) = (left.get_nested(lp)?, right.get_nested(rp)?);
        if lc.len() != rc.len() {
            return Ok(false);
        }
        for pos in 0..lc.len() {
            if lc.is_null(pos) != rc.is_null(pos) {
                return Ok(false);
            }
            if !lc.is_null(pos) && !self.element.equals_position(&lc, pos, &rc, pos)? {
                return Ok(false);
            }
        }
        Ok(true)
    }
    fn compare_position(&self, left: &Block, lp: usize, right: &Block, rp: usize) -> Result<Ordering> {
        let (lc, rc) = (left.get_nested(lp)?, right.get_nested(rp)?);
        for pos in 0..lc.len().min(rc.len()) {
            if lc.is_null(pos) || rc.is_null(pos) {
                return Err(EngineError::new(
                    ErrorKind::NotSupported,
                    "array comparison with a null element is not supported",
                ));
            }
            let cmp = self.element.compare_position(&lc, pos, &rc, pos)?;
            if cmp != Ordering::Equal {
                return Ok(cmp);
            }
        }
        Ok(lc.len().cmp(&rc.len()))
    }
}

/// `map<K,V>`: paired key/value child blocks, entry `i`'s key at `keys[i]`
/// and value at `values[i]`. Kept separate (rather than one interleaved
/// child, as `array<T>` uses) so `K` and `V` can have different physical
/// categories.
#[derive(Debug)]
pub struct MapType {
    signature: TypeSignature,
    key: Arc<dyn Type>,
    value: Arc<dyn Type>,
}

impl MapType {
    pub fn new(key: Arc<dyn Type>, value: Arc<dyn Type>) -> Self {
        let signature = TypeSignature::Map(Box::new(key.signature().clone()), Box::new(value.signature().clone()));
        Self { signature, key, value }
    }

    pub fn key_type(&self) -> &Arc<dyn Type> {
        &self.key
    }

    pub fn value_type(&self) -> &Arc<dyn Type> {
        &self.value
    }
}

impl Type for MapType {
    fn signature(&self) -> &TypeSignature {
        &self.signature
    }
    fn physical_category(&self) -> PhysicalCategory {
        PhysicalCategory::Nested
    }
    fn is_comparable(&self) -> bool {
        self.key.is_comparable() && self.value.is_comparable()
    }
    fn is_orderable(&self) -> bool {
        false
    }
    fn get_value(&self, block: &Block, position: usize) -> Result<Value> {
        require_not_null(self, block, position)?;
        let (keys, values) = block.get_map_entries(position)?;
        let entry_count = keys.len();
        let mut pairs = Vec::with_capacity(entry_count);
        for i in 0..entry_count {
            let key = if keys.is_null(i) { Value::Null } else { self.key.get_value(&keys, i)? };
            let value = if values.is_null(i) { Value::Null } else { self.value.get_value(&values, i)? };
            pairs.push((key, value));
        }
        Ok(Value::Map(pairs))
    }
    fn write_value(&self, builder: &mut BlockBuilder, value: &Value) -> Result<()> {
        match value {
            Value::Null => builder.append_null(),
            Value::Map(pairs) => {
                let mut keys = BlockBuilder::new(self.key.physical_category());
                let mut values = BlockBuilder::new(self.value.physical_category());
                for (k, v) in pairs {
                    self.key.write_value(&mut keys, k)?;
                    self.value.write_value(&mut values, v)?;
                }
                builder.append_map(keys.build(), values.build());
            }
            other => type_mismatch(self, other),
        }
        Ok(())
    }
    fn hash_position(&self, block: &Block, position: usize) -> Result<u64> {
        let (keys, values) = block.get_map_entries(position)?;
        let mut hash: u64 = 0x9e3779b97f4a7c15;
        for pos in 0..keys.len() {
            let key_hash = if keys.is_null(pos) { 0 } else { self.key.hash_position(&keys, pos)? };
            let value_hash = if values.is_null(pos) { 0 } else { self.value.hash_position(&values, pos)? };
            hash ^= key_hash.wrapping_add(0x9e3779b9).wrapping_add(hash << 6).wrapping_add(hash >> 2);
            hash ^= value_hash.wrapping_add(0x9e3779b9).wrapping_add(hash << 6).wrapping_add(hash >> 2);
        }
        Ok(hash)
    }
    fn equals_position(&self, left: &Block, lp: usize, right: &Block, rp: usize) -> Result<bool> {
        let (lk, lv) = left.get_map_entries(lp)?;
        let (rk, rv) = right.get_map_entries(rp)?;
        if lk.len() != rk.len() {
            return Ok(false);
        }
        for pos in 0..lk.len() {
            if lk.is_null(pos) != rk.is_null(pos) || lv.is_null(pos) != rv.is_null(pos) {
                return Ok(false);
            }
            if !lk.is_null(pos) && !self.key.equals_position(&lk, pos, &rk, pos)? {
                return Ok(false);
            }
            if !lv.is_null(pos) && !self.value.equals_position(&lv, pos, &rv, pos)? {
                return Ok(false);
            }
        }
        Ok(true)
    }
}

/// `row<T1,...,Tn>`: one child block per field, interleaved positionally.
#[derive(Debug)]
pub struct RowType {
    signature: TypeSignature,
    fields: Vec<(Option<String>, Arc<dyn Type>)>,
}

impl RowType {
    pub fn new(fields: Vec<(Option<String>, Arc<dyn Type>)>) -> Self {
        let signature = TypeSignature::Row(
            fields.iter().map(|(name, ty)| (name.clone(), ty.signature().clone())).collect(),
        );
        Self { signature, fields }
    }
}

impl Type for RowType {
    fn signature(&self) -> &TypeSignature {
        &self.signature
    }
    fn physical_category(&self) -> PhysicalCategory {
        PhysicalCategory::Nested
    }
    fn is_comparable(&self) -> bool {
        self.fields.iter().all(|(_, ty)| ty.is_comparable())
    }
    fn is_orderable(&self) -> bool {
        self.fields.iter().all(|(_, ty)| ty.is_orderable())
    }
    fn get_value(&self, block: &Block, position: usize) -> Result<Value> {
        require_not_null(self, block, position)?;
        let children = block.get_row_fields(position)?;
        let mut values = Vec::with_capacity(self.fields.len());
        for ((_, ty), field_block) in self.fields.iter().zip(children.iter()) {
            if field_block.is_null(0) {
                values.push(Value::Null);
            } else {
                values.push(ty.get_value(field_block, 0)?);
            }
        }
        Ok(Value::Row(values))
    }
    fn write_value(&self, builder: &mut BlockBuilder, value: &Value) -> Result<()> {
        match value {
            Value::Null => builder.append_null(),
            Value::Row(values) => {
                let mut children = Vec::with_capacity(self.fields.len());
                for ((_, ty), v) in self.fields.iter().zip(values.iter()) {
                    let mut field_builder = BlockBuilder::new(ty.physical_category());
                    ty.write_value(&mut field_builder, v)?;
                    children.push(field_builder.build());
                }
                builder.append_row(children);
            }
            other => type_mismatch(self, other),
        }
        Ok(())
    }
    fn hash_position(&self, block: &Block, position: usize) -> Result<u64> {
        let children = block.get_row_fields(position)?;
        let mut hash: u64 = 0x9e3779b97f4a7c15;
        for ((_, ty), field_block) in self.fields.iter().zip(children.iter()) {
            let field_hash = if field_block.is_null(0) { 0 } else { ty.hash_position(field_block, 0)? };
            hash = hash.wrapping_mul(31).wrapping_add(field_hash);
        }
        Ok(hash)
    }
    fn equals_position(&self, left: &Block, lp: usize, right: &Block, rp: usize) -> Result<bool> {
        let (lc, rc) = (left.get_row_fields(lp)?, right.get_row_fields(rp)?);
        for ((_, ty), (lf, rf)) in self.fields.iter().zip(lc.iter().zip(rc.iter())) {
            if lf.is_null(0) != rf.is_null(0) {
                return Ok(false);
            }
            if !lf.is_null(0) && !ty.equals_position(lf, 0, rf, 0)? {
                return Ok(false);
            }
        }
        Ok(true)
    }
}

fn require_not_null(ty: &dyn Type, block: &Block, position: usize) -> Result<()> {
    if block.is_null(position) {
        Err(EngineError::new(
            ErrorKind::InternalError,
            format!("get_* called on null position for type {}", ty.signature()),
        ))
    } else {
        Ok(())
    }
}

fn type_mismatch(ty: &dyn Type, value: &Value) -> Result<()> {
    Err(EngineError::new(
        ErrorKind::InternalError,
        format!("value {value:?} does not match type {}", ty.signature()),
    ))
}

/// Process-wide interning table: registering the same signature twice
/// returns the same `Arc<dyn Type>` rather than constructing a duplicate.
pub struct TypeRegistry {
    entries: RwLock<HashMap<String, Arc<dyn Type>>>,
}

impl TypeRegistry {
    pub fn new() -> Self {
        let registry = Self { entries: RwLock::new(HashMap::new()) };
        registry.register_builtin(Arc::new(BooleanType::new()));
        registry.register_builtin(Arc::new(BigintType::new()));
        registry.register_builtin(Arc::new(DoubleType::new()));
        registry.register_builtin(Arc::new(VarcharBaseType::new()));
        registry.register_builtin(Arc::new(VarbinaryType::new()));
        registry.register_builtin(Arc::new(DateType::new()));
        registry.register_builtin(Arc::new(TimestampType::new()));
        registry.register_builtin(Arc::new(TimestampWithTimeZoneType::new()));
        registry.register_builtin(Arc::new(UnknownType::new()));
        registry
    }

    fn register_builtin(&self, ty: Arc<dyn Type>) {
        self.entries.write().insert(ty.signature().to_string(), ty);
    }

    /// Interns `ty` under its signature; a previously registered type with
    /// the same signature is returned instead of the new instance.
    pub fn intern(&self, ty: Arc<dyn Type>) -> Arc<dyn Type> {
        let key = ty.signature().to_string();
        let mut entries = self.entries.write();
        entries.entry(key).or_insert(ty).clone()
    }

    pub fn get(&self, signature: &TypeSignature) -> Option<Arc<dyn Type>> {
        self.entries.read().get(&signature.to_string()).cloned()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for TypeRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// The process-wide type registry, seeded with the builtin scalar types at
/// first access.
pub static TYPE_REGISTRY: Lazy<TypeRegistry> = Lazy::new(TypeRegistry::new);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interning_returns_same_instance_for_same_signature() {
        let registry = TypeRegistry::new();
        let bigint_array_a = registry.intern(Arc::new(ArrayType::new(Arc::new(BigintType::new()))));
        let bigint_array_b = registry.intern(Arc::new(ArrayType::new(Arc::new(BigintType::new()))));
        assert!(Arc::ptr_eq(&bigint_array_a, &bigint_array_b));
    }

    #[test]
    fn boolean_round_trips_through_a_block() {
        let ty = BooleanType::new();
        let mut builder = BlockBuilder::new(ty.physical_category());
        ty.write_value(&mut builder, &Value::Boolean(true)).unwrap();
        ty.write_value(&mut builder, &Value::Null).unwrap();
        let block = builder.build();
        assert_eq!(ty.get_value(&block, 0).unwrap(), Value::Boolean(true));
        assert!(ty.is_null(&block, 1));
    }

    #[test]
    fn unknown_type_returns_null_from_every_operator() {
        let ty = UnknownType::new();
        let mut builder = BlockBuilder::new(ty.physical_category());
        ty.write_value(&mut builder, &Value::Boolean(true)).unwrap();
        let block = builder.build();
        assert_eq!(ty.get_value(&block, 0).unwrap(), Value::Null);
    }

    #[test]
    fn map_with_varchar_keys_and_bigint_values_round_trips() {
        let map_ty = MapType::new(Arc::new(VarcharBaseType::new()), Arc::new(BigintType::new()));
        let mut builder = BlockBuilder::new(map_ty.physical_category());
        map_ty
            .write_value(
                &mut builder,
                &Value::Map(vec![
                    (Value::Slice(b"a".to_vec()), Value::Int64(1)),
                    (Value::Slice(b"b".to_vec()), Value::Null),
                ]),
            )
            .unwrap();
        map_ty.write_value(&mut builder, &Value::Null).unwrap();
        let block = builder.build();

        let decoded = Block::decode(&block.encode()).unwrap();
        assert_eq!(block, decoded);

        let value = map_ty.get_value(&block, 0).unwrap();
        assert_eq!(
            value,
            Value::Map(vec![(Value::Slice(b"a".to_vec()), Value::Int64(1)), (Value::Slice(b"b".to_vec()), Value::Null)])
        );
        assert!(map_ty.is_null(&block, 1));
    }

    #[test]
    fn maps_with_same_entries_in_different_order_are_not_equal_by_position() {
        let map_ty = MapType::new(Arc::new(VarcharBaseType::new()), Arc::new(BigintType::new()));
        let mut left_builder = BlockBuilder::new(map_ty.physical_category());
        map_ty
            .write_value(
                &mut left_builder,
                &Value::Map(vec![(Value::Slice(b"a".to_vec()), Value::Int64(1))]),
            )
            .unwrap();
        let left = left_builder.build();
        let mut right_builder = BlockBuilder::new(map_ty.physical_category());
        map_ty
            .write_value(
                &mut right_builder,
                &Value::Map(vec![(Value::Slice(b"a".to_vec()), Value::Int64(2))]),
            )
            .unwrap();
        let right = right_builder.build();
        assert!(!map_ty.equals_position(&left, 0, &right, 0).unwrap());
    }

    #[test]
    fn array_comparison_with_null_element_fails() {
        let element = Arc::new(BigintType::new());
        let array_ty = ArrayType::new(element.clone());
        let mut left_builder = BlockBuilder::new(array_ty.physical_category());
        array_ty
            .write_value(&mut left_builder, &Value::Array(vec![Value::Null]))
            .unwrap();
        let left = left_builder.build();
        let mut right_builder = BlockBuilder::new(array_ty.physical_category());
        array_ty
            .write_value(&mut right_builder, &Value::Array(vec![Value::Int64(1)]))
            .unwrap();
        let right = right_builder.build();
        assert!(array_ty.compare_position(&left, 0, &right, 0).is_err());
    }
}
