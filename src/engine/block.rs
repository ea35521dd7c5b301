//! Columnar blocks and the wire encodings they round-trip through (C1).
//!
//! Each encoding writes a `[len][payload]` length-prefixed envelope, with
//! `bincode` as the wire format for the numeric array payloads. The
//! encoding registry is a process-wide singleton, seeded once at startup;
//! registering a name a second time is an error rather than a silent
//! overwrite.

use crate::error::{EngineError, ErrorKind, Result};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use once_cell::sync::Lazy;
use parking_lot::RwLock;
use std::collections::HashMap;

use super::types::PhysicalCategory;

/// An immutable columnar batch of values for one type: a flat value array for
/// scalars, one interleaved child for `array<T>`, a per-field tuple for
/// `row<...>`, or paired key/value children for `map<K,V>`. Invariant: the
/// position set is zero-indexed and contiguous — `len()` positions, no gaps.
#[derive(Debug, Clone, PartialEq)]
pub enum Block {
    Bit(BitStore),
    Long(LongStore),
    Double(DoubleStore),
    Slice(SliceStore),
    Nested(NestedStore),
    Row(RowStore),
    Map(MapStore),
}

#[derive(Debug, Clone, PartialEq)]
pub struct BitStore {
    pub nulls: Vec<bool>,
    pub values: Vec<bool>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LongStore {
    pub nulls: Vec<bool>,
    pub values: Vec<i64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DoubleStore {
    pub nulls: Vec<bool>,
    pub values: Vec<f64>,
}

/// Byte-offset table + bytes: `values[offsets[i]..offsets[i+1]]` is position
/// `i`'s payload.
#[derive(Debug, Clone, PartialEq)]
pub struct SliceStore {
    pub nulls: Vec<bool>,
    pub offsets: Vec<u32>,
    pub bytes: Vec<u8>,
}

/// Backs `array<T>`: one interleaved child, sliced per outer position.
#[derive(Debug, Clone, PartialEq)]
pub struct NestedStore {
    pub nulls: Vec<bool>,
    pub offsets: Vec<u32>,
    pub child: Box<Block>,
}

/// Backs `row<T1,...,Tn>`: one length-1 block per field, per position.
#[derive(Debug, Clone, PartialEq)]
pub struct RowStore {
    pub nulls: Vec<bool>,
    pub rows: Vec<Vec<Block>>,
}

/// Backs `map<K,V>`: keys and values are two equal-length child blocks
/// (entry `i`'s key is `keys` position `i`, its value is `values` position
/// `i`), sliced per outer position the same way `NestedStore` slices its
/// single child. Keeping keys/values as separate blocks (rather than one
/// truly interleaved block) lets `K` and `V` have different physical
/// categories.
#[derive(Debug, Clone, PartialEq)]
pub struct MapStore {
    pub nulls: Vec<bool>,
    pub offsets: Vec<u32>,
    pub keys: Box<Block>,
    pub values: Box<Block>,
}

impl Block {
    pub fn len(&self) -> usize {
        match self {
            Block::Bit(s) => s.nulls.len(),
            Block::Long(s) => s.nulls.len(),
            Block::Double(s) => s.nulls.len(),
            Block::Slice(s) => s.nulls.len(),
            Block::Nested(s) => s.nulls.len(),
            Block::Row(s) => s.nulls.len(),
            Block::Map(s) => s.nulls.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_null(&self, position: usize) -> bool {
        match self {
            Block::Bit(s) => s.nulls[position],
            Block::Long(s) => s.nulls[position],
            Block::Double(s) => s.nulls[position],
            Block::Slice(s) => s.nulls[position],
            Block::Nested(s) => s.nulls[position],
            Block::Row(s) => s.nulls[position],
            Block::Map(s) => s.nulls[position],
        }
    }

    pub fn physical_category(&self) -> PhysicalCategory {
        match self {
            Block::Bit(_) => PhysicalCategory::Boolean,
            Block::Long(_) => PhysicalCategory::Int64,
            Block::Double(_) => PhysicalCategory::Float64,
            Block::Slice(_) => PhysicalCategory::Slice,
            Block::Nested(_) | Block::Row(_) | Block::Map(_) => PhysicalCategory::Nested,
        }
    }

    pub fn get_bool(&self, position: usize) -> Result<bool> {
        match self {
            Block::Bit(s) => Ok(s.values[position]),
            _ => wrong_type("boolean"),
        }
    }

    pub fn get_long(&self, position: usize) -> Result<i64> {
        match self {
            Block::Long(s) => Ok(s.values[position]),
            _ => wrong_type("int64"),
        }
    }

    pub fn get_double(&self, position: usize) -> Result<f64> {
        match self {
            Block::Double(s) => Ok(s.values[position]),
            _ => wrong_type("float64"),
        }
    }

    pub fn get_slice(&self, position: usize) -> Result<&[u8]> {
        match self {
            Block::Slice(s) => {
                let start = s.offsets[position] as usize;
                let end = s.offsets[position + 1] as usize;
                Ok(&s.bytes[start..end])
            }
            _ => wrong_type("slice"),
        }
    }

    /// Returns an owned sub-block covering position `position`'s element
    /// range in the interleaved child.
    pub fn get_nested(&self, position: usize) -> Result<Block> {
        match self {
            Block::Nested(s) => {
                let start = s.offsets[position] as usize;
                let end = s.offsets[position + 1] as usize;
                Ok(s.child.slice(start, end - start))
            }
            _ => wrong_type("nested"),
        }
    }

    pub fn get_row_fields(&self, position: usize) -> Result<Vec<Block>> {
        match self {
            Block::Row(s) => Ok(s.rows[position].clone()),
            _ => wrong_type("row"),
        }
    }

    /// Returns position `position`'s `(keys, values)` sub-blocks, each
    /// sliced to that position's entry range.
    pub fn get_map_entries(&self, position: usize) -> Result<(Block, Block)> {
        match self {
            Block::Map(s) => {
                let start = s.offsets[position] as usize;
                let end = s.offsets[position + 1] as usize;
                Ok((s.keys.slice(start, end - start), s.values.slice(start, end - start)))
            }
            _ => wrong_type("map"),
        }
    }

    /// Returns a length-`len` view starting at `start`, used to carve a
    /// nested child into one element's range.
    pub fn slice(&self, start: usize, len: usize) -> Block {
        let end = start + len;
        match self {
            Block::Bit(s) => Block::Bit(BitStore {
                nulls: s.nulls[start..end].to_vec(),
                values: s.values[start..end].to_vec(),
            }),
            Block::Long(s) => Block::Long(LongStore {
                nulls: s.nulls[start..end].to_vec(),
                values: s.values[start..end].to_vec(),
            }),
            Block::Double(s) => Block::Double(DoubleStore {
                nulls: s.nulls[start..end].to_vec(),
                values: s.values[start..end].to_vec(),
            }),
            Block::Slice(s) => {
                let byte_start = s.offsets[start] as usize;
                let byte_end = s.offsets[end] as usize;
                let offsets = s.offsets[start..=end].iter().map(|o| o - s.offsets[start]).collect();
                Block::Slice(SliceStore {
                    nulls: s.nulls[start..end].to_vec(),
                    offsets,
                    bytes: s.bytes[byte_start..byte_end].to_vec(),
                })
            }
            Block::Nested(s) => {
                let elem_start = s.offsets[start] as usize;
                let elem_end = s.offsets[end] as usize;
                let offsets = s.offsets[start..=end].iter().map(|o| o - s.offsets[start]).collect();
                Block::Nested(NestedStore {
                    nulls: s.nulls[start..end].to_vec(),
                    offsets,
                    child: Box::new(s.child.slice(elem_start, elem_end - elem_start)),
                })
            }
            Block::Row(s) => Block::Row(RowStore {
                nulls: s.nulls[start..end].to_vec(),
                rows: s.rows[start..end].to_vec(),
            }),
            Block::Map(s) => {
                let entry_start = s.offsets[start] as usize;
                let entry_end = s.offsets[end] as usize;
                let offsets = s.offsets[start..=end].iter().map(|o| o - s.offsets[start]).collect();
                Block::Map(MapStore {
                    nulls: s.nulls[start..end].to_vec(),
                    offsets,
                    keys: Box::new(s.keys.slice(entry_start, entry_end - entry_start)),
                    values: Box::new(s.values.slice(entry_start, entry_end - entry_start)),
                })
            }
        }
    }

    /// `hash(b,i) == hash(b',j)` whenever `equals(b,i,b',j)` is the caller's
    /// (the owning `Type`'s) responsibility; this only serializes positions.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::new();
        write_envelope(&mut buf, self);
        buf.freeze()
    }

    pub fn decode(bytes: &[u8]) -> Result<Block> {
        let mut buf = bytes;
        read_envelope(&mut buf)
    }
}

/// Builds a block one appended value at a time. Single-threaded; the result
/// is immutable and freely shareable once built.
pub struct BlockBuilder {
    category: PhysicalCategory,
    nulls: Vec<bool>,
    bool_values: Vec<bool>,
    long_values: Vec<i64>,
    double_values: Vec<f64>,
    slice_offsets: Vec<u32>,
    slice_bytes: Vec<u8>,
    nested_offsets: Vec<u32>,
    nested_child: Option<Block>,
    row_values: Vec<Vec<Block>>,
    map_offsets: Vec<u32>,
    map_keys: Option<Block>,
    map_values: Option<Block>,
    /// Which of array/row/map shape this `Nested`-category builder is
    /// producing. Set on the first `append_nested`/`append_row`/`append_map`
    /// call and never inferred from vector emptiness, since a leading
    /// `append_null()` (a whole-value null, e.g. a null array) otherwise
    /// looks indistinguishable from "no rows appended yet".
    nested_shape: Option<NestedShape>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum NestedShape {
    Array,
    Row,
    Map,
}

impl BlockBuilder {
    pub fn new(category: PhysicalCategory) -> Self {
        Self {
            category,
            nulls: Vec::new(),
            bool_values: Vec::new(),
            long_values: Vec::new(),
            double_values: Vec::new(),
            slice_offsets: vec![0],
            slice_bytes: Vec::new(),
            nested_offsets: vec![0],
            nested_child: None,
            row_values: Vec::new(),
            map_offsets: vec![0],
            map_keys: None,
            map_values: None,
            nested_shape: None,
        }
    }

    pub fn append_null(&mut self) {
        self.nulls.push(true);
        match self.category {
            PhysicalCategory::Boolean => self.bool_values.push(false),
            PhysicalCategory::Int64 => self.long_values.push(0),
            PhysicalCategory::Float64 => self.double_values.push(0.0),
            PhysicalCategory::Slice => {
                let last = *self.slice_offsets.last().unwrap();
                self.slice_offsets.push(last);
            }
            PhysicalCategory::Nested => {
                let last = *self.nested_offsets.last().unwrap();
                self.nested_offsets.push(last);
                self.row_values.push(Vec::new());
                let map_last = *self.map_offsets.last().unwrap();
                self.map_offsets.push(map_last);
            }
        }
    }

    pub fn append_bool(&mut self, value: bool) {
        self.nulls.push(false);
        self.bool_values.push(value);
    }

    pub fn append_long(&mut self, value: i64) {
        self.nulls.push(false);
        self.long_values.push(value);
    }

    pub fn append_double(&mut self, value: f64) {
        self.nulls.push(false);
        self.double_values.push(value);
    }

    pub fn append_slice(&mut self, value: &[u8]) {
        self.nulls.push(false);
        self.slice_bytes.extend_from_slice(value);
        self.slice_offsets.push(self.slice_bytes.len() as u32);
    }

    /// Appends one `array` element's worth of child positions.
    pub fn append_nested(&mut self, child: Block) {
        self.nulls.push(false);
        self.nested_shape = Some(NestedShape::Array);
        let child_len = child.len() as u32;
        match &mut self.nested_child {
            None => self.nested_child = Some(child),
            Some(existing) => *existing = concat_blocks(existing, &child),
        }
        let last = *self.nested_offsets.last().unwrap();
        self.nested_offsets.push(last + child_len);
    }

    pub fn append_row(&mut self, fields: Vec<Block>) {
        self.nulls.push(false);
        self.nested_shape = Some(NestedShape::Row);
        self.row_values.push(fields);
    }

    /// Appends one `map` entry set: `keys` and `values` must have equal
    /// length (one position per entry) but may differ in physical category.
    pub fn append_map(&mut self, keys: Block, values: Block) {
        self.nulls.push(false);
        self.nested_shape = Some(NestedShape::Map);
        let entry_count = keys.len() as u32;
        match &mut self.map_keys {
            None => {
                self.map_keys = Some(keys);
                self.map_values = Some(values);
            }
            Some(existing_keys) => {
                *existing_keys = concat_blocks(existing_keys, &keys);
                let existing_values = self.map_values.as_mut().unwrap();
                *existing_values = concat_blocks(existing_values, &values);
            }
        }
        let last = *self.map_offsets.last().unwrap();
        self.map_offsets.push(last + entry_count);
    }

    pub fn build(self) -> Block {
        match self.category {
            PhysicalCategory::Boolean => Block::Bit(BitStore { nulls: self.nulls, values: self.bool_values }),
            PhysicalCategory::Int64 => Block::Long(LongStore { nulls: self.nulls, values: self.long_values }),
            PhysicalCategory::Float64 => Block::Double(DoubleStore { nulls: self.nulls, values: self.double_values }),
            PhysicalCategory::Slice => Block::Slice(SliceStore {
                nulls: self.nulls,
                offsets: self.slice_offsets,
                bytes: self.slice_bytes,
            }),
            PhysicalCategory::Nested => match self.nested_shape {
                Some(NestedShape::Map) => Block::Map(MapStore {
                    nulls: self.nulls,
                    offsets: self.map_offsets,
                    keys: Box::new(self.map_keys.unwrap()),
                    values: Box::new(self.map_values.unwrap()),
                }),
                Some(NestedShape::Array) => Block::Nested(NestedStore {
                    nulls: self.nulls,
                    offsets: self.nested_offsets,
                    child: Box::new(self.nested_child.unwrap()),
                }),
                Some(NestedShape::Row) | None => Block::Row(RowStore { nulls: self.nulls, rows: self.row_values }),
            },
        }
    }
}

fn concat_blocks(left: &Block, right: &Block) -> Block {
    match (left, right) {
        (Block::Bit(l), Block::Bit(r)) => Block::Bit(BitStore {
            nulls: [l.nulls.clone(), r.nulls.clone()].concat(),
            values: [l.values.clone(), r.values.clone()].concat(),
        }),
        (Block::Long(l), Block::Long(r)) => Block::Long(LongStore {
            nulls: [l.nulls.clone(), r.nulls.clone()].concat(),
            values: [l.values.clone(), r.values.clone()].concat(),
        }),
        (Block::Double(l), Block::Double(r)) => Block::Double(DoubleStore {
            nulls: [l.nulls.clone(), r.nulls.clone()].concat(),
            values: [l.values.clone(), r.values.clone()].concat(),
        }),
        (Block::Slice(l), Block::Slice(r)) => {
            let base = l.bytes.len() as u32;
            let mut offsets = l.offsets.clone();
            offsets.extend(r.offsets.iter().skip(1).map(|o| o + base));
            Block::Slice(SliceStore {
                nulls: [l.nulls.clone(), r.nulls.clone()].concat(),
                offsets,
                bytes: [l.bytes.clone(), r.bytes.clone()].concat(),
            })
        }
        (Block::Row(l), Block::Row(r)) => Block::Row(RowStore {
            nulls: [l.nulls.clone(), r.nulls.clone()].concat(),
            rows: [l.rows.clone(), r.rows.clone()].concat(),
        }),
        (Block::Nested(l), Block::Nested(r)) => {
            let base = l.offsets.last().copied().unwrap_or(0);
            let mut offsets = l.offsets.clone();
            offsets.extend(r.offsets.iter().skip(1).map(|o| o + base));
            Block::Nested(NestedStore {
                nulls: [l.nulls.clone(), r.nulls.clone()].concat(),
                offsets,
                child: Box::new(concat_blocks(&l.child, &r.child)),
            })
        }
        (Block::Map(l), Block::Map(r)) => {
            let base = l.offsets.last().copied().unwrap_or(0);
            let mut offsets = l.offsets.clone();
            offsets.extend(r.offsets.iter().skip(1).map(|o| o + base));
            Block::Map(MapStore {
                nulls: [l.nulls.clone(), r.nulls.clone()].concat(),
                offsets,
                keys: Box::new(concat_blocks(&l.keys, &r.keys)),
                values: Box::new(concat_blocks(&l.values, &r.values)),
            })
        }
        _ => left.clone(),
    }
}

// --- Wire encoding: [encoding_name_len:i32][encoding_name][payload] ---

type EncodeFn = fn(&Block, &mut BytesMut);
type DecodeFn = fn(&mut &[u8]) -> Result<Block>;

struct EncodingEntry {
    encode: EncodeFn,
    decode: DecodeFn,
}

/// Process-wide, name-keyed block encoding registry, seeded at startup.
/// Late registration is allowed but rejects a reused name.
pub static ENCODING_REGISTRY: Lazy<RwLock<HashMap<&'static str, EncodingEntry>>> = Lazy::new(|| {
    let mut map = HashMap::new();
    map.insert("BIT", EncodingEntry { encode: encode_bit, decode: decode_bit });
    map.insert("LONG_ARRAY", EncodingEntry { encode: encode_long, decode: decode_long });
    map.insert("DOUBLE_ARRAY", EncodingEntry { encode: encode_double, decode: decode_double });
    map.insert("VARIABLE_WIDTH", EncodingEntry { encode: encode_slice, decode: decode_slice });
    map.insert("ARRAY", EncodingEntry { encode: encode_nested, decode: decode_nested });
    map.insert("ROW", EncodingEntry { encode: encode_row, decode: decode_row });
    map.insert("MAP", EncodingEntry { encode: encode_map, decode: decode_map });
    RwLock::new(map)
});

/// Registers a new named encoding. Fails if the name is already taken,
/// matching the "late registration allowed but must fail on name reuse"
/// contract.
pub fn register_encoding(name: &'static str, encode: EncodeFn, decode: DecodeFn) -> Result<()> {
    let mut registry = ENCODING_REGISTRY.write();
    if registry.contains_key(name) {
        return Err(EngineError::new(
            ErrorKind::AlreadyExists,
            format!("block encoding '{name}' is already registered"),
        ));
    }
    registry.insert(name, EncodingEntry { encode, decode });
    Ok(())
}

fn encoding_name(block: &Block) -> &'static str {
    match block {
        Block::Bit(_) => "BIT",
        Block::Long(_) => "LONG_ARRAY",
        Block::Double(_) => "DOUBLE_ARRAY",
        Block::Slice(_) => "VARIABLE_WIDTH",
        Block::Nested(_) => "ARRAY",
        Block::Row(_) => "ROW",
        Block::Map(_) => "MAP",
    }
}

fn write_envelope(buf: &mut BytesMut, block: &Block) {
    let name = encoding_name(block);
    buf.put_i32(name.len() as i32);
    buf.put_slice(name.as_bytes());
    let registry = ENCODING_REGISTRY.read();
    (registry[name].encode)(block, buf);
}

fn read_envelope(buf: &mut &[u8]) -> Result<Block> {
    if buf.len() < 4 {
        return Err(EngineError::new(ErrorKind::InternalError, "truncated block envelope"));
    }
    let name_len = buf.get_i32() as usize;
    if buf.len() < name_len {
        return Err(EngineError::new(ErrorKind::InternalError, "truncated block encoding name"));
    }
    let name = std::str::from_utf8(&buf[..name_len])
        .map_err(|e| EngineError::with_cause(ErrorKind::InternalError, "invalid encoding name", e))?
        .to_string();
    buf.advance(name_len);
    let registry = ENCODING_REGISTRY.read();
    let entry = registry
        .get(name.as_str())
        .ok_or_else(|| EngineError::not_found(format!("unknown block encoding '{name}'")))?;
    (entry.decode)(buf)
}

fn encode_bit(block: &Block, buf: &mut BytesMut) {
    if let Block::Bit(s) = block {
        buf.put_i32(s.nulls.len() as i32);
        for (null, value) in s.nulls.iter().zip(s.values.iter()) {
            buf.put_u8(u8::from(*null) << 1 | u8::from(*value));
        }
    }
}

fn decode_bit(buf: &mut &[u8]) -> Result<Block> {
    let len = buf.get_i32() as usize;
    let mut nulls = Vec::with_capacity(len);
    let mut values = Vec::with_capacity(len);
    for _ in 0..len {
        let byte = buf.get_u8();
        nulls.push(byte & 0b10 != 0);
        values.push(byte & 0b01 != 0);
    }
    Ok(Block::Bit(BitStore { nulls, values }))
}

fn encode_long(block: &Block, buf: &mut BytesMut) {
    if let Block::Long(s) = block {
        let payload = bincode::serde::encode_to_vec(&s.values, bincode::config::standard()).unwrap_or_default();
        buf.put_i32(s.nulls.len() as i32);
        for null in &s.nulls {
            buf.put_u8(u8::from(*null));
        }
        buf.put_i32(payload.len() as i32);
        buf.put_slice(&payload);
    }
}

fn decode_long(buf: &mut &[u8]) -> Result<Block> {
    let len = buf.get_i32() as usize;
    let nulls = (0..len).map(|_| buf.get_u8() != 0).collect();
    let payload_len = buf.get_i32() as usize;
    let (values, _): (Vec<i64>, usize) =
        bincode::serde::decode_from_slice(&buf[..payload_len], bincode::config::standard())?;
    buf.advance(payload_len);
    Ok(Block::Long(LongStore { nulls, values }))
}

fn encode_double(block: &Block, buf: &mut BytesMut) {
    if let Block::Double(s) = block {
        let payload = bincode::serde::encode_to_vec(&s.values, bincode::config::standard()).unwrap_or_default();
        buf.put_i32(s.nulls.len() as i32);
        for null in &s.nulls {
            buf.put_u8(u8::from(*null));
        }
        buf.put_i32(payload.len() as i32);
        buf.put_slice(&payload);
    }
}

fn decode_double(buf: &mut &[u8]) -> Result<Block> {
    let len = buf.get_i32() as usize;
    let nulls = (0..len).map(|_| buf.get_u8() != 0).collect();
    let payload_len = buf.get_i32() as usize;
    let (values, _): (Vec<f64>, usize) =
        bincode::serde::decode_from_slice(&buf[..payload_len], bincode::config::standard())?;
    buf.advance(payload_len);
    Ok(Block::Double(DoubleStore { nulls, values }))
}

fn encode_slice(block: &Block, buf: &mut BytesMut) {
    if let Block::Slice(s) = block {
        buf.put_i32(s.nulls.len() as i32);
        for null in &s.nulls {
            buf.put_u8(u8::from(*null));
        }
        buf.put_i32(s.offsets.len() as i32);
        for offset in &s.offsets {
            buf.put_u32(*offset);
        }
        buf.put_i32(s.bytes.len() as i32);
        buf.put_slice(&s.bytes);
    }
}

fn decode_slice(buf: &mut &[u8]) -> Result<Block> {
    let len = buf.get_i32() as usize;
    let nulls = (0..len).map(|_| buf.get_u8() != 0).collect();
    let offsets_len = buf.get_i32() as usize;
    let offsets = (0..offsets_len).map(|_| buf.get_u32()).collect();
    let bytes_len = buf.get_i32() as usize;
    let bytes = buf[..bytes_len].to_vec();
    buf.advance(bytes_len);
    Ok(Block::Slice(SliceStore { nulls, offsets, bytes }))
}

fn encode_nested(block: &Block, buf: &mut BytesMut) {
    if let Block::Nested(s) = block {
        buf.put_i32(s.nulls.len() as i32);
        for null in &s.nulls {
            buf.put_u8(u8::from(*null));
        }
        buf.put_i32(s.offsets.len() as i32);
        for offset in &s.offsets {
            buf.put_u32(*offset);
        }
        write_envelope(buf, &s.child);
    }
}

fn decode_nested(buf: &mut &[u8]) -> Result<Block> {
    let len = buf.get_i32() as usize;
    let nulls = (0..len).map(|_| buf.get_u8() != 0).collect();
    let offsets_len = buf.get_i32() as usize;
    let offsets = (0..offsets_len).map(|_| buf.get_u32()).collect();
    let child = read_envelope(buf)?;
    Ok(Block::Nested(NestedStore { nulls, offsets, child: Box::new(child) }))
}

fn encode_row(block: &Block, buf: &mut BytesMut) {
    if let Block::Row(s) = block {
        buf.put_i32(s.nulls.len() as i32);
        for null in &s.nulls {
            buf.put_u8(u8::from(*null));
        }
        for row in &s.rows {
            buf.put_i32(row.len() as i32);
            for field in row {
                write_envelope(buf, field);
            }
        }
    }
}

fn decode_row(buf: &mut &[u8]) -> Result<Block> {
    let len = buf.get_i32() as usize;
    let nulls: Vec<bool> = (0..len).map(|_| buf.get_u8() != 0).collect();
    let mut rows = Vec::with_capacity(len);
    for _ in 0..len {
        let field_count = buf.get_i32() as usize;
        let mut fields = Vec::with_capacity(field_count);
        for _ in 0..field_count {
            fields.push(read_envelope(buf)?);
        }
        rows.push(fields);
    }
    Ok(Block::Row(RowStore { nulls, rows }))
}

fn encode_map(block: &Block, buf: &mut BytesMut) {
    if let Block::Map(s) = block {
        buf.put_i32(s.nulls.len() as i32);
        for null in &s.nulls {
            buf.put_u8(u8::from(*null));
        }
        buf.put_i32(s.offsets.len() as i32);
        for offset in &s.offsets {
            buf.put_u32(*offset);
        }
        write_envelope(buf, &s.keys);
        write_envelope(buf, &s.values);
    }
}

fn decode_map(buf: &mut &[u8]) -> Result<Block> {
    let len = buf.get_i32() as usize;
    let nulls = (0..len).map(|_| buf.get_u8() != 0).collect();
    let offsets_len = buf.get_i32() as usize;
    let offsets = (0..offsets_len).map(|_| buf.get_u32()).collect();
    let keys = read_envelope(buf)?;
    let values = read_envelope(buf)?;
    Ok(Block::Map(MapStore { nulls, offsets, keys: Box::new(keys), values: Box::new(values) }))
}

fn wrong_type<T>(expected: &str) -> Result<T> {
    Err(EngineError::new(
        ErrorKind::InternalError,
        format!("block accessor called with mismatched physical type, expected {expected}"),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn long_block_round_trips_through_wire_encoding() {
        let mut builder = BlockBuilder::new(PhysicalCategory::Int64);
        builder.append_long(1);
        builder.append_null();
        builder.append_long(-42);
        let block = builder.build();

        let encoded = block.encode();
        let decoded = Block::decode(&encoded).unwrap();
        assert_eq!(block, decoded);
    }

    #[test]
    fn slice_block_round_trips() {
        let mut builder = BlockBuilder::new(PhysicalCategory::Slice);
        builder.append_slice(b"hello");
        builder.append_null();
        builder.append_slice(b"");
        let block = builder.build();
        let decoded = Block::decode(&block.encode()).unwrap();
        assert_eq!(block, decoded);
    }

    #[test]
    fn nested_array_block_round_trips() {
        let mut inner = BlockBuilder::new(PhysicalCategory::Int64);
        inner.append_long(10);
        inner.append_long(20);
        let mut outer = BlockBuilder::new(PhysicalCategory::Nested);
        outer.append_nested(inner.build());
        let block = outer.build();
        let decoded = Block::decode(&block.encode()).unwrap();
        assert_eq!(block, decoded);
    }

    #[test]
    fn map_block_with_heterogeneous_key_value_categories_round_trips() {
        let mut keys = BlockBuilder::new(PhysicalCategory::Slice);
        keys.append_slice(b"a");
        keys.append_slice(b"b");
        let mut values = BlockBuilder::new(PhysicalCategory::Int64);
        values.append_long(1);
        values.append_long(2);
        let mut outer = BlockBuilder::new(PhysicalCategory::Nested);
        outer.append_map(keys.build(), values.build());
        outer.append_null();
        let block = outer.build();
        assert!(matches!(block, Block::Map(_)));

        let decoded = Block::decode(&block.encode()).unwrap();
        assert_eq!(block, decoded);

        let (entry_keys, entry_values) = block.get_map_entries(0).unwrap();
        assert_eq!(entry_keys.get_slice(0).unwrap(), b"a");
        assert_eq!(entry_values.get_long(1).unwrap(), 2);
        assert!(block.is_null(1));
    }

    #[test]
    fn a_leading_null_array_value_does_not_get_mistaken_for_a_row() {
        let mut outer = BlockBuilder::new(PhysicalCategory::Nested);
        outer.append_null();
        let mut inner = BlockBuilder::new(PhysicalCategory::Int64);
        inner.append_long(7);
        outer.append_nested(inner.build());
        let block = outer.build();
        assert!(matches!(block, Block::Nested(_)));
        assert!(block.is_null(0));
        assert_eq!(block.get_nested(1).unwrap().get_long(0).unwrap(), 7);
    }

    #[test]
    fn registering_a_duplicate_encoding_name_fails() {
        let result = register_encoding("BIT", encode_bit, decode_bit);
        assert!(result.is_err());
    }

    #[test]
    fn block_positions_are_contiguous_and_zero_indexed() {
        let mut builder = BlockBuilder::new(PhysicalCategory::Boolean);
        builder.append_bool(true);
        builder.append_bool(false);
        builder.append_null();
        let block = builder.build();
        assert_eq!(block.len(), 3);
        for i in 0..block.len() {
            let _ = block.is_null(i);
        }
    }
}
