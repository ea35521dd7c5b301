//! Predicate and `TupleDomain` algebra (C2): ranges, sorted range sets,
//! per-column domains, and the tuple-level lattice over column handles.
//!
//! Grounded in the risingwave `plan_fragmenter`-neighbor value-set shape
//! from the pack (predicate/value-set algebra over column handles) and the
//! lattice laws spec'd for intersect/union/contains; canonicalization is
//! enforced at every public constructor rather than trusted to callers.

use crate::error::{EngineError, ErrorKind, Result};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::HashMap;
use std::hash::Hash;

/// A comparable, serializable scalar usable as a range endpoint. Mirrors the
/// orderable subset of [`super::types::Value`] without pulling in the
/// container variants (arrays/maps/rows are never range-comparable).
#[derive(Debug, Clone, PartialEq, PartialOrd, Serialize, Deserialize)]
pub enum Scalar {
    Boolean(bool),
    Int64(i64),
    Float64(f64),
    Slice(Vec<u8>),
}

impl Eq for Scalar {}
impl Ord for Scalar {
    fn cmp(&self, other: &Self) -> Ordering {
        self.partial_cmp(other).unwrap_or(Ordering::Equal)
    }
}

/// `[lo, lo_incl, hi, hi_incl]`; either bound may be absent (unbounded).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Range {
    pub low: Option<Scalar>,
    pub low_inclusive: bool,
    pub high: Option<Scalar>,
    pub high_inclusive: bool,
}

impl Range {
    pub fn all() -> Self {
        Self { low: None, low_inclusive: true, high: None, high_inclusive: true }
    }

    pub fn equal(value: Scalar) -> Self {
        Self { low: Some(value.clone()), low_inclusive: true, high: Some(value), high_inclusive: true }
    }

    pub fn greater_than(value: Scalar) -> Self {
        Self { low: Some(value), low_inclusive: false, high: None, high_inclusive: true }
    }

    pub fn at_most(value: Scalar) -> Self {
        Self { low: None, low_inclusive: true, high: Some(value), high_inclusive: true }
    }

    fn low_bound_less_than_or_touching(&self, other: &Range) -> bool {
        match (&self.high, &other.low) {
            (None, _) => false,
            (_, None) => true,
            (Some(h), Some(l)) => match h.cmp(l) {
                Ordering::Less => true,
                Ordering::Equal => !(self.high_inclusive && other.low_inclusive),
                Ordering::Greater => false,
            },
        }
    }

    pub fn overlaps(&self, other: &Range) -> bool {
        !self.strictly_before(other) && !other.strictly_before(self)
    }

    fn strictly_before(&self, other: &Range) -> bool {
        match (&self.high, &other.low) {
            (None, _) => false,
            (_, None) => false,
            (Some(h), Some(l)) => match h.cmp(l) {
                Ordering::Less => true,
                Ordering::Equal => !self.high_inclusive || !other.low_inclusive,
                Ordering::Greater => false,
            },
        }
    }

    fn span(&self, other: &Range) -> Range {
        let (low, low_inclusive) = match (&self.low, &other.low) {
            (None, _) | (_, None) => (None, true),
            (Some(a), Some(b)) => match a.cmp(b) {
                Ordering::Less => (Some(a.clone()), self.low_inclusive),
                Ordering::Greater => (Some(b.clone()), other.low_inclusive),
                Ordering::Equal => (Some(a.clone()), self.low_inclusive || other.low_inclusive),
            },
        };
        let (high, high_inclusive) = match (&self.high, &other.high) {
            (None, _) | (_, None) => (None, true),
            (Some(a), Some(b)) => match a.cmp(b) {
                Ordering::Greater => (Some(a.clone()), self.high_inclusive),
                Ordering::Less => (Some(b.clone()), other.high_inclusive),
                Ordering::Equal => (Some(a.clone()), self.high_inclusive || other.high_inclusive),
            },
        };
        Range { low, low_inclusive, high, high_inclusive }
    }

    fn intersect(&self, other: &Range) -> Option<Range> {
        if !self.overlaps(other) {
            return None;
        }
        let (low, low_inclusive) = match (&self.low, &other.low) {
            (None, b) => (b.clone(), other.low_inclusive),
            (a, None) => (a.clone(), self.low_inclusive),
            (Some(a), Some(b)) => match a.cmp(b) {
                Ordering::Greater => (Some(a.clone()), self.low_inclusive),
                Ordering::Less => (Some(b.clone()), other.low_inclusive),
                Ordering::Equal => (Some(a.clone()), self.low_inclusive && other.low_inclusive),
            },
        };
        let (high, high_inclusive) = match (&self.high, &other.high) {
            (None, b) => (b.clone(), other.high_inclusive),
            (a, None) => (a.clone(), self.high_inclusive),
            (Some(a), Some(b)) => match a.cmp(b) {
                Ordering::Less => (Some(a.clone()), self.high_inclusive),
                Ordering::Greater => (Some(b.clone()), other.high_inclusive),
                Ordering::Equal => (Some(a.clone()), self.high_inclusive && other.high_inclusive),
            },
        };
        Some(Range { low, low_inclusive, high, high_inclusive })
    }

    pub fn contains(&self, value: &Scalar) -> bool {
        let low_ok = match &self.low {
            None => true,
            Some(l) => match value.cmp(l) {
                Ordering::Greater => true,
                Ordering::Equal => self.low_inclusive,
                Ordering::Less => false,
            },
        };
        let high_ok = match &self.high {
            None => true,
            Some(h) => match value.cmp(h) {
                Ordering::Less => true,
                Ordering::Equal => self.high_inclusive,
                Ordering::Greater => false,
            },
        };
        low_ok && high_ok
    }
}

/// A disjoint, ascending-sorted union of ranges. Canonicalized at every
/// constructor: adjacent/overlapping ranges are merged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SortedRangeSet {
    ranges: Vec<Range>,
}

impl SortedRangeSet {
    pub fn empty() -> Self {
        Self { ranges: Vec::new() }
    }

    pub fn all() -> Self {
        Self { ranges: vec![Range::all()] }
    }

    /// Builds a canonical set from arbitrary (possibly overlapping,
    /// unordered) ranges.
    pub fn of(mut ranges: Vec<Range>) -> Self {
        ranges.sort_by(|a, b| cmp_low(a, b));
        let mut merged: Vec<Range> = Vec::with_capacity(ranges.len());
        for range in ranges {
            match merged.last_mut() {
                Some(last) if last.overlaps(&range) || touching(last, &range) => {
                    *last = last.span(&range);
                }
                _ => merged.push(range),
            }
        }
        Self { ranges: merged }
    }

    pub fn ranges(&self) -> &[Range] {
        &self.ranges
    }

    pub fn is_all(&self) -> bool {
        self.ranges.len() == 1 && self.ranges[0] == Range::all()
    }

    pub fn is_none(&self) -> bool {
        self.ranges.is_empty()
    }

    pub fn contains(&self, value: &Scalar) -> bool {
        self.ranges.iter().any(|r| r.contains(value))
    }

    pub fn intersect(&self, other: &SortedRangeSet) -> SortedRangeSet {
        let mut out = Vec::new();
        for a in &self.ranges {
            for b in &other.ranges {
                if let Some(r) = a.intersect(b) {
                    out.push(r);
                }
            }
        }
        SortedRangeSet::of(out)
    }

    pub fn union(&self, other: &SortedRangeSet) -> SortedRangeSet {
        let mut all = self.ranges.clone();
        all.extend(other.ranges.clone());
        SortedRangeSet::of(all)
    }

    pub fn overlaps(&self, other: &SortedRangeSet) -> bool {
        self.ranges.iter().any(|a| other.ranges.iter().any(|b| a.overlaps(b)))
    }
}

fn cmp_low(a: &Range, b: &Range) -> Ordering {
    match (&a.low, &b.low) {
        (None, None) => Ordering::Equal,
        (None, Some(_)) => Ordering::Less,
        (Some(_), None) => Ordering::Greater,
        (Some(x), Some(y)) => x.cmp(y).then(a.low_inclusive.cmp(&b.low_inclusive).reverse()),
    }
}

fn touching(a: &Range, b: &Range) -> bool {
    match (&a.high, &b.low) {
        (Some(h), Some(l)) => h == l && (a.high_inclusive || b.low_inclusive),
        _ => false,
    }
}

/// A `SortedRangeSet` plus a "null allowed" bit — the per-column value set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Domain {
    pub values: SortedRangeSet,
    pub null_allowed: bool,
}

impl Domain {
    pub fn all() -> Self {
        Self { values: SortedRangeSet::all(), null_allowed: true }
    }

    pub fn none() -> Self {
        Self { values: SortedRangeSet::empty(), null_allowed: false }
    }

    pub fn only_null() -> Self {
        Self { values: SortedRangeSet::empty(), null_allowed: true }
    }

    pub fn single_value(value: Scalar) -> Self {
        Self { values: SortedRangeSet::of(vec![Range::equal(value)]), null_allowed: false }
    }

    pub fn is_none(&self) -> bool {
        self.values.is_none() && !self.null_allowed
    }

    pub fn is_all(&self) -> bool {
        self.values.is_all() && self.null_allowed
    }

    pub fn intersect(&self, other: &Domain) -> Domain {
        Domain {
            values: self.values.intersect(&other.values),
            null_allowed: self.null_allowed && other.null_allowed,
        }
    }

    pub fn union(&self, other: &Domain) -> Domain {
        Domain {
            values: self.values.union(&other.values),
            null_allowed: self.null_allowed || other.null_allowed,
        }
    }

    pub fn contains(&self, other: &Domain) -> bool {
        let union = self.union(other);
        &union == self
    }

    pub fn overlaps(&self, other: &Domain) -> bool {
        self.values.overlaps(&other.values) || (self.null_allowed && other.null_allowed)
    }

    /// `Some(v)` when this domain pins its column to exactly one non-null value.
    pub fn single_value_scalar(&self) -> Option<&Scalar> {
        if self.null_allowed || self.values.ranges().len() != 1 {
            return None;
        }
        let range = &self.values.ranges()[0];
        match (&range.low, &range.high) {
            (Some(l), Some(h)) if l == h && range.low_inclusive && range.high_inclusive => Some(l),
            _ => None,
        }
    }
}

/// `NONE` (unsatisfiable), `ALL` (no constraint), or a column-handle → domain
/// map (absence = `ALL`).
#[derive(Debug, Clone, PartialEq)]
pub enum TupleDomain<K: Eq + Hash + Clone> {
    None,
    All,
    Some(HashMap<K, Domain>),
}

impl<K: Eq + Hash + Clone> TupleDomain<K> {
    /// Canonicalizes: a `NONE` entry collapses the whole map to `NONE`; an
    /// all-`ALL` map (empty, after dropping `ALL` entries) collapses to `ALL`.
    pub fn from_map(mut map: HashMap<K, Domain>) -> Self {
        if map.values().any(Domain::is_none) {
            return TupleDomain::None;
        }
        map.retain(|_, d| !d.is_all());
        if map.is_empty() {
            TupleDomain::All
        } else {
            TupleDomain::Some(map)
        }
    }

    pub fn domain(&self, key: &K) -> Domain {
        match self {
            TupleDomain::None => Domain::none(),
            TupleDomain::All => Domain::all(),
            TupleDomain::Some(map) => map.get(key).cloned().unwrap_or_else(Domain::all),
        }
    }

    pub fn intersect(&self, other: &TupleDomain<K>) -> TupleDomain<K> {
        match (self, other) {
            (TupleDomain::None, _) | (_, TupleDomain::None) => TupleDomain::None,
            (TupleDomain::All, x) => x.clone(),
            (x, TupleDomain::All) => x.clone(),
            (TupleDomain::Some(a), TupleDomain::Some(b)) => {
                let mut merged = a.clone();
                for (k, bd) in b {
                    merged
                        .entry(k.clone())
                        .and_modify(|ad| *ad = ad.intersect(bd))
                        .or_insert_with(|| bd.clone());
                }
                TupleDomain::from_map(merged)
            }
        }
    }

    /// Column-by-column union; a column missing from either side widens to `ALL`.
    pub fn column_wise_union(&self, other: &TupleDomain<K>) -> TupleDomain<K> {
        match (self, other) {
            (TupleDomain::None, x) => x.clone(),
            (x, TupleDomain::None) => x.clone(),
            (TupleDomain::All, _) | (_, TupleDomain::All) => TupleDomain::All,
            (TupleDomain::Some(a), TupleDomain::Some(b)) => {
                let mut merged = HashMap::new();
                for k in a.keys().chain(b.keys()) {
                    if merged.contains_key(k) {
                        continue;
                    }
                    let domain = match (a.get(k), b.get(k)) {
                        (Some(ad), Some(bd)) => ad.union(bd),
                        _ => Domain::all(),
                    };
                    merged.insert(k.clone(), domain);
                }
                TupleDomain::from_map(merged)
            }
        }
    }

    pub fn contains(&self, other: &TupleDomain<K>) -> bool {
        &self.column_wise_union(other) == self
    }

    pub fn overlaps(&self, other: &TupleDomain<K>) -> bool {
        !matches!(self.intersect(other), TupleDomain::None)
    }

    /// Columns pinned to exactly one non-null value.
    pub fn extract_single_values(&self) -> HashMap<K, Scalar> {
        match self {
            TupleDomain::Some(map) => map
                .iter()
                .filter_map(|(k, d)| d.single_value_scalar().map(|v| (k.clone(), v.clone())))
                .collect(),
            _ => HashMap::new(),
        }
    }

    pub fn with_fixed_values(fixed: HashMap<K, Scalar>) -> Self {
        let map = fixed.into_iter().map(|(k, v)| (k, Domain::single_value(v))).collect();
        TupleDomain::from_map(map)
    }

    /// Relabels columns with `f`; fails if `f` collapses two distinct keys
    /// to the same output label.
    pub fn transform<K2: Eq + Hash + Clone>(&self, f: impl Fn(&K) -> K2) -> Result<TupleDomain<K2>> {
        match self {
            TupleDomain::None => Ok(TupleDomain::None),
            TupleDomain::All => Ok(TupleDomain::All),
            TupleDomain::Some(map) => {
                let mut out = HashMap::new();
                for (k, v) in map {
                    let k2 = f(k);
                    if out.insert(k2, v.clone()).is_some() {
                        return Err(EngineError::new(
                            ErrorKind::InternalError,
                            "transform collapsed two columns onto the same label",
                        ));
                    }
                }
                Ok(TupleDomain::Some(out))
            }
        }
    }
}

/// Bernoulli row sampling for sampled-table reads: whether a row with the
/// given stable key is kept at sampling ratio `p` (`0.0..=1.0`).
///
/// Deterministic sampling hashes `row_key` into `[0, 1)` so the same row
/// is kept or dropped identically on every worker and every re-read — the
/// rewrite `rand() < p` becomes `hash(row_key) < p`. Non-deterministic
/// sampling draws fresh per call, so repeated reads of the same table (or
/// the same row from two different workers) can disagree.
pub fn sample_row(row_key: &[u8], p: f64, deterministic: bool) -> bool {
    if p <= 0.0 {
        return false;
    }
    if p >= 1.0 {
        return true;
    }
    if deterministic {
        deterministic_unit_interval(row_key) < p
    } else {
        rand::random::<f64>() < p
    }
}

/// FNV-1a over `row_key`, rescaled into `[0, 1)`. Plain FNV rather than a
/// cryptographic hash: sampling only needs a stable, well-distributed key,
/// not collision resistance.
fn deterministic_unit_interval(row_key: &[u8]) -> f64 {
    const FNV_OFFSET_BASIS: u64 = 0xcbf29ce484222325;
    const FNV_PRIME: u64 = 0x100000001b3;
    let mut hash = FNV_OFFSET_BASIS;
    for byte in row_key {
        hash ^= *byte as u64;
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    (hash >> 11) as f64 / (1u64 << 53) as f64
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dom(ranges: Vec<Range>) -> Domain {
        Domain { values: SortedRangeSet::of(ranges), null_allowed: false }
    }

    #[test]
    fn sorted_range_set_merges_overlapping_and_touching_ranges() {
        let set = SortedRangeSet::of(vec![
            Range::equal(Scalar::Int64(1)),
            Range { low: Some(Scalar::Int64(2)), low_inclusive: true, high: Some(Scalar::Int64(5)), high_inclusive: true },
            Range { low: Some(Scalar::Int64(1)), low_inclusive: true, high: Some(Scalar::Int64(1)), high_inclusive: true },
        ]);
        assert_eq!(set.ranges().len(), 1);
    }

    #[test]
    fn none_absorbs_intersect() {
        let none: TupleDomain<&str> = TupleDomain::None;
        let all: TupleDomain<&str> = TupleDomain::All;
        assert_eq!(none.intersect(&all), TupleDomain::None);
    }

    #[test]
    fn all_is_identity_for_intersect() {
        let mut map = HashMap::new();
        map.insert("c1", dom(vec![Range::equal(Scalar::Int64(5))]));
        let some = TupleDomain::Some(map.clone());
        let all: TupleDomain<&str> = TupleDomain::All;
        assert_eq!(some.intersect(&all), TupleDomain::Some(map));
    }

    #[test]
    fn a_none_domain_in_the_map_collapses_the_whole_tuple_domain() {
        let mut map = HashMap::new();
        map.insert("c1", Domain::none());
        assert_eq!(TupleDomain::<&str>::from_map(map), TupleDomain::None);
    }

    #[test]
    fn an_all_all_map_collapses_to_all() {
        let mut map = HashMap::new();
        map.insert("c1", Domain::all());
        assert_eq!(TupleDomain::<&str>::from_map(map), TupleDomain::All);
    }

    #[test]
    fn contains_obeys_lattice_law() {
        let mut narrow_map = HashMap::new();
        narrow_map.insert("c1", dom(vec![Range::equal(Scalar::Int64(5))]));
        let narrow = TupleDomain::Some(narrow_map);
        let wide: TupleDomain<&str> = TupleDomain::All;
        assert!(wide.contains(&narrow));
        assert!(!narrow.contains(&wide));
    }

    #[test]
    fn transform_fails_when_two_keys_collapse() {
        let mut map = HashMap::new();
        map.insert(1u32, dom(vec![Range::equal(Scalar::Int64(1))]));
        map.insert(2u32, dom(vec![Range::equal(Scalar::Int64(2))]));
        let td = TupleDomain::Some(map);
        let result = td.transform(|_| "same_label");
        assert!(result.is_err());
    }

    #[test]
    fn column_wise_union_widens_missing_columns_to_all() {
        let mut left_map = HashMap::new();
        left_map.insert("c1", dom(vec![Range::equal(Scalar::Int64(1))]));
        left_map.insert("c2", dom(vec![Range::equal(Scalar::Int64(9))]));
        let left = TupleDomain::Some(left_map);
        let mut right_map = HashMap::new();
        right_map.insert("c1", dom(vec![Range::equal(Scalar::Int64(2))]));
        let right = TupleDomain::Some(right_map);
        let result = left.column_wise_union(&right);
        match result {
            TupleDomain::Some(map) => assert!(!map.contains_key("c2")),
            other => panic!("expected Some, got {other:?}"),
        }
    }

    #[test]
    fn deterministic_sampling_is_stable_across_repeated_calls() {
        let key = b"row-42";
        let first = sample_row(key, 0.5, true);
        for _ in 0..10 {
            assert_eq!(sample_row(key, 0.5, true), first);
        }
    }

    #[test]
    fn deterministic_sampling_respects_the_boundary_ratios() {
        assert!(!sample_row(b"anything", 0.0, true));
        assert!(sample_row(b"anything", 1.0, true));
    }

    #[test]
    fn deterministic_sampling_distributes_across_many_keys() {
        let kept = (0..1000).filter(|i: &u32| sample_row(&i.to_be_bytes(), 0.3, true)).count();
        assert!((200..400).contains(&kept), "expected roughly 30% of 1000 keys kept, got {kept}");
    }
}
