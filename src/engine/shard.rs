//! Shard/Index engine (C5): the native, Raptor-shaped metadata store that
//! tracks which shards exist, which nodes own them, and a per-column
//! `(min, max)` summary used to prune shards out of a scan.
//!
//! `create_table` is check-then-insert under one lock, `ALREADY_EXISTS` on
//! conflict; `commit_shards` extends that to the multi-table write set a
//! shard commit needs. Per-node shard lookups go through `dashmap` for
//! lock-free reads on the hot path.

use dashmap::DashMap;
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use uuid::Uuid;

use crate::error::{EngineError, ErrorKind, Result};

use super::domain::{Scalar, TupleDomain};

pub type TableId = u64;
pub type ShardColumnId = u32;

/// Per-column `(min, max)` summary for an indexable column (bool, int64,
/// float64, byte-slice truncated to a fixed max length).
#[derive(Debug, Clone, PartialEq)]
pub struct ColumnSummary {
    pub min: Scalar,
    pub max: Scalar,
}

/// A shard: row/byte counts and the per-column summaries used for pruning.
#[derive(Debug, Clone)]
pub struct Shard {
    pub uuid: Uuid,
    pub table_id: TableId,
    pub row_count: u64,
    pub compressed_bytes: u64,
    pub uncompressed_bytes: u64,
    pub column_summaries: HashMap<ShardColumnId, ColumnSummary>,
    pub node_ids: Vec<String>,
}

impl Shard {
    /// Invariant (ii): `min <= max` for every summary.
    fn validate(&self) -> Result<()> {
        for (column, summary) in &self.column_summaries {
            if summary.min > summary.max {
                return Err(EngineError::new(
                    ErrorKind::RaptorError,
                    format!("shard {} column {column}: min > max", self.uuid),
                ));
            }
        }
        if self.node_ids.is_empty() {
            return Err(EngineError::new(
                ErrorKind::RaptorError,
                format!("shard {} has no owning nodes", self.uuid),
            ));
        }
        Ok(())
    }
}

struct TableState {
    columns: Vec<ShardColumnId>,
    shards: HashMap<Uuid, Shard>,
}

/// The index-row store: `create_table`, `commit_shards`,
/// `replace_shard_uuids`, node/predicate lookups, and `assign_shard`.
///
/// The in-memory implementation stands in for a real metadata-store-backed
/// one (Postgres, etcd, ...) behind the same trait seam.
pub trait ShardCatalog: Send + Sync {
    fn create_table(&self, table_id: TableId, columns: Vec<ShardColumnId>) -> Result<()>;
    fn commit_shards(
        &self,
        table_id: TableId,
        shards: Vec<Shard>,
        external_batch_id: Option<String>,
    ) -> Result<()>;
    fn replace_shard_uuids(
        &self,
        table_id: TableId,
        old_uuids: Vec<Uuid>,
        new_shards: Vec<Shard>,
    ) -> Result<()>;
    fn get_node_table_shards(&self, node_id: &str, table_id: TableId) -> Result<Vec<Uuid>>;
    fn get_shard_nodes(&self, table_id: TableId, predicate: &TupleDomain<ShardColumnId>) -> Result<Vec<(Uuid, Vec<String>)>>;
    fn assign_shard(&self, table_id: TableId, uuid: Uuid, node_id: String) -> Result<()>;
    fn drop_table(&self, table_id: TableId) -> Result<()>;
    /// A separate sweeper that eventually reclaims per-table index tables
    /// whose owning table has already been dropped (best-effort drop at
    /// `drop_table` time is not guaranteed to succeed).
    fn sweep_orphaned_index_tables(&self) -> Result<usize>;
}

pub struct InMemoryShardCatalog {
    tables: RwLock<HashMap<TableId, TableState>>,
    external_batches: RwLock<HashSet<String>>,
    node_shard_cache: DashMap<(String, TableId), HashSet<Uuid>>,
    orphaned_tables: RwLock<HashSet<TableId>>,
}

impl InMemoryShardCatalog {
    pub fn new() -> Self {
        Self {
            tables: RwLock::new(HashMap::new()),
            external_batches: RwLock::new(HashSet::new()),
            node_shard_cache: DashMap::new(),
            orphaned_tables: RwLock::new(HashSet::new()),
        }
    }

    fn refresh_node_cache(&self, table_id: TableId, shard: &Shard) {
        for node in &shard.node_ids {
            self.node_shard_cache
                .entry((node.clone(), table_id))
                .or_default()
                .insert(shard.uuid);
        }
    }
}

impl Default for InMemoryShardCatalog {
    fn default() -> Self {
        Self::new()
    }
}

impl ShardCatalog for InMemoryShardCatalog {
    fn create_table(&self, table_id: TableId, columns: Vec<ShardColumnId>) -> Result<()> {
        let mut tables = self.tables.write();
        if tables.contains_key(&table_id) {
            return Err(EngineError::already_exists(format!("table {table_id} already has a shard index")));
        }
        tables.insert(table_id, TableState { columns, shards: HashMap::new() });
        Ok(())
    }

    fn commit_shards(
        &self,
        table_id: TableId,
        shards: Vec<Shard>,
        external_batch_id: Option<String>,
    ) -> Result<()> {
        for shard in &shards {
            shard.validate()?;
        }

        // Pre-check, then constraint-tolerant insert: both paths for the
        // duplicate-batch-id rejection.
        if let Some(batch_id) = &external_batch_id {
            if self.external_batches.read().contains(batch_id) {
                return Err(EngineError::new(
                    ErrorKind::ExternalBatchAlreadyExists,
                    format!("external batch '{batch_id}' was already committed"),
                ));
            }
        }

        let mut tables = self.tables.write();
        let table = tables
            .get_mut(&table_id)
            .ok_or_else(|| EngineError::not_found(format!("table {table_id} has no shard index")))?;

        if let Some(batch_id) = &external_batch_id {
            let mut batches = self.external_batches.write();
            if !batches.insert(batch_id.clone()) {
                return Err(EngineError::new(
                    ErrorKind::ExternalBatchAlreadyExists,
                    format!("external batch '{batch_id}' was already committed"),
                ));
            }
        }

        for shard in shards {
            self.refresh_node_cache(table_id, &shard);
            table.shards.insert(shard.uuid, shard);
        }
        Ok(())
    }

    fn replace_shard_uuids(
        &self,
        table_id: TableId,
        old_uuids: Vec<Uuid>,
        new_shards: Vec<Shard>,
    ) -> Result<()> {
        for shard in &new_shards {
            shard.validate()?;
        }

        let mut tables = self.tables.write();
        let table = tables
            .get_mut(&table_id)
            .ok_or_else(|| EngineError::not_found(format!("table {table_id} has no shard index")))?;

        let present = old_uuids
            .iter()
            .filter(|uuid| table.shards.contains_key(uuid))
            .count();
        if present != old_uuids.len() {
            return Err(EngineError::new(
                ErrorKind::TransactionConflict,
                format!("expected to remove {} shards, found {present}", old_uuids.len()),
            ));
        }
        for uuid in &old_uuids {
            table.shards.remove(uuid);
        }
        for shard in new_shards {
            self.refresh_node_cache(table_id, &shard);
            table.shards.insert(shard.uuid, shard);
        }
        Ok(())
    }

    fn get_node_table_shards(&self, node_id: &str, table_id: TableId) -> Result<Vec<Uuid>> {
        Ok(self
            .node_shard_cache
            .get(&(node_id.to_string(), table_id))
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default())
    }

    fn get_shard_nodes(&self, table_id: TableId, predicate: &TupleDomain<ShardColumnId>) -> Result<Vec<(Uuid, Vec<String>)>> {
        let tables = self.tables.read();
        let table = tables
            .get(&table_id)
            .ok_or_else(|| EngineError::not_found(format!("table {table_id} has no shard index")))?;

        let mut out = Vec::new();
        for shard in table.shards.values() {
            if !shard_is_pruned(shard, predicate) {
                out.push((shard.uuid, shard.node_ids.clone()));
            }
        }
        Ok(out)
    }

    fn assign_shard(&self, table_id: TableId, uuid: Uuid, node_id: String) -> Result<()> {
        let mut tables = self.tables.write();
        let table = tables
            .get_mut(&table_id)
            .ok_or_else(|| EngineError::not_found(format!("table {table_id} has no shard index")))?;
        let shard = table
            .shards
            .get_mut(&uuid)
            .ok_or_else(|| EngineError::not_found(format!("shard {uuid} not found")))?;
        if !shard.node_ids.contains(&node_id) {
            shard.node_ids.push(node_id.clone());
        }
        self.node_shard_cache.entry((node_id, table_id)).or_default().insert(uuid);
        Ok(())
    }

    fn drop_table(&self, table_id: TableId) -> Result<()> {
        let mut tables = self.tables.write();
        tables
            .remove(&table_id)
            .ok_or_else(|| EngineError::not_found(format!("table {table_id} has no shard index")))?;
        // Best-effort index-table drop happens outside this transaction in
        // a real metadata store; here we just mark it for the sweeper.
        self.orphaned_tables.write().insert(table_id);
        Ok(())
    }

    fn sweep_orphaned_index_tables(&self) -> Result<usize> {
        let mut orphaned = self.orphaned_tables.write();
        let count = orphaned.len();
        orphaned.clear();
        Ok(count)
    }
}

/// Compiles the TupleDomain into the contrapositive over `cN_min/cN_max`:
/// a shard is excluded only when its `[min,max]` is disjoint from every
/// allowed range of every constrained column. Unindexable/absent columns
/// contribute no predicate and never prune.
fn shard_is_pruned(shard: &Shard, predicate: &TupleDomain<ShardColumnId>) -> bool {
    let constrained = match predicate {
        TupleDomain::None => return true,
        TupleDomain::All => return false,
        TupleDomain::Some(map) => map,
    };

    for (column, domain) in constrained {
        let Some(summary) = shard.column_summaries.get(column) else {
            continue;
        };
        let shard_range_contains_any_allowed_value = domain
            .values
            .ranges()
            .iter()
            .any(|range| ranges_overlap(&summary.min, &summary.max, range));
        if !shard_range_contains_any_allowed_value {
            return true;
        }
    }
    false
}

fn ranges_overlap(min: &Scalar, max: &Scalar, range: &super::domain::Range) -> bool {
    let shard_range = super::domain::Range {
        low: Some(min.clone()),
        low_inclusive: true,
        high: Some(max.clone()),
        high_inclusive: true,
    };
    shard_range.overlaps(range)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::domain::Range;

    fn shard(uuid: Uuid, min: i64, max: i64) -> Shard {
        let mut summaries = HashMap::new();
        summaries.insert(1, ColumnSummary { min: Scalar::Int64(min), max: Scalar::Int64(max) });
        Shard {
            uuid,
            table_id: 1,
            row_count: 100,
            compressed_bytes: 1000,
            uncompressed_bytes: 2000,
            column_summaries: summaries,
            node_ids: vec!["node-a".to_string()],
        }
    }

    #[test]
    fn index_row_exists_iff_shard_visible_and_commit_is_atomic() {
        let catalog = InMemoryShardCatalog::new();
        catalog.create_table(1, vec![1]).unwrap();
        let uuid = Uuid::new_v4();
        catalog.commit_shards(1, vec![shard(uuid, 0, 10)], None).unwrap();
        let nodes = catalog.get_shard_nodes(1, &TupleDomain::All).unwrap();
        assert_eq!(nodes.len(), 1);
        assert_eq!(nodes[0].0, uuid);
    }

    #[test]
    fn duplicate_external_batch_id_is_rejected() {
        let catalog = InMemoryShardCatalog::new();
        catalog.create_table(1, vec![1]).unwrap();
        catalog
            .commit_shards(1, vec![shard(Uuid::new_v4(), 0, 10)], Some("batch-1".into()))
            .unwrap();
        let err = catalog
            .commit_shards(1, vec![shard(Uuid::new_v4(), 0, 10)], Some("batch-1".into()))
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::ExternalBatchAlreadyExists);
    }

    #[test]
    fn replace_shard_uuids_mismatch_aborts_with_transaction_conflict() {
        let catalog = InMemoryShardCatalog::new();
        catalog.create_table(1, vec![1]).unwrap();
        let uuid = Uuid::new_v4();
        catalog.commit_shards(1, vec![shard(uuid, 0, 10)], None).unwrap();
        let err = catalog
            .replace_shard_uuids(1, vec![uuid, Uuid::new_v4()], vec![shard(Uuid::new_v4(), 0, 10)])
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::TransactionConflict);
        // Original shard must still be present: the failed replace did not
        // partially apply.
        let nodes = catalog.get_shard_nodes(1, &TupleDomain::All).unwrap();
        assert_eq!(nodes.len(), 1);
    }

    #[test]
    fn pruning_excludes_shards_disjoint_from_every_allowed_range() {
        let catalog = InMemoryShardCatalog::new();
        catalog.create_table(1, vec![1]).unwrap();
        let in_range = Uuid::new_v4();
        let out_of_range = Uuid::new_v4();
        catalog
            .commit_shards(1, vec![shard(in_range, 0, 10), shard(out_of_range, 100, 200)], None)
            .unwrap();

        let mut map = HashMap::new();
        map.insert(1u32, super::super::domain::Domain {
            values: super::super::domain::SortedRangeSet::of(vec![Range::equal(Scalar::Int64(5))]),
            null_allowed: false,
        });
        let predicate = TupleDomain::Some(map);
        let nodes = catalog.get_shard_nodes(1, &predicate).unwrap();
        assert_eq!(nodes.len(), 1);
        assert_eq!(nodes[0].0, in_range);
    }

    #[test]
    fn node_ids_subset_invariant_rejects_empty_owner_list() {
        let mut s = shard(Uuid::new_v4(), 0, 1);
        s.node_ids.clear();
        let catalog = InMemoryShardCatalog::new();
        catalog.create_table(1, vec![1]).unwrap();
        assert!(catalog.commit_shards(1, vec![s], None).is_err());
    }
}
