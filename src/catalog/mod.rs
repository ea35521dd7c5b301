//! Catalog: the coordinator-facing name a user-visible catalog is known by,
//! mapped onto the [`ConnectorId`] and connector instance that backs it.
//!
//! [`engine::connector::ConnectorRegistry`] is the connector-factory layer;
//! this module is one level up: create/get/drop a catalog by name, with
//! `NOT_FOUND`/`ALREADY_EXISTS` on misuse, over "one connector namespace"
//! rather than "one table namespace," since a catalog name a query
//! references (`hive`, `raptor`, …) need not equal the connector id that
//! instantiated it.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::engine::connector::{Connector, ConnectorId, ConnectorRegistry};
use crate::error::{EngineError, Result};

/// A catalog name bound to the connector that serves it.
#[derive(Clone)]
pub struct CatalogEntry {
    pub name: String,
    pub connector_id: ConnectorId,
    pub connector: Arc<dyn Connector>,
}

/// Resolves catalog names to connector instances. One coordinator owns
/// exactly one `CatalogManager`, backed by exactly one `ConnectorRegistry`.
pub struct CatalogManager {
    registry: Arc<ConnectorRegistry>,
    catalogs: RwLock<HashMap<String, CatalogEntry>>,
}

impl CatalogManager {
    pub fn new(registry: Arc<ConnectorRegistry>) -> Self {
        Self { registry, catalogs: RwLock::new(HashMap::new()) }
    }

    pub fn registry(&self) -> &Arc<ConnectorRegistry> {
        &self.registry
    }

    /// Instantiates `factory_name` as connector id `catalog_name` and binds
    /// it under that catalog name. Fails if the catalog name is already
    /// bound or the underlying connector id collides with another catalog.
    pub fn create_catalog(&self, catalog_name: impl Into<String>, factory_name: &str, properties: HashMap<String, String>) -> Result<()> {
        let catalog_name = catalog_name.into();
        let mut catalogs = self.catalogs.write();
        if catalogs.contains_key(&catalog_name) {
            return Err(EngineError::already_exists(format!("catalog '{catalog_name}' already exists")));
        }
        let connector_id = ConnectorId(catalog_name.clone());
        let connector = self.registry.create_connector(factory_name, connector_id.clone(), properties)?;
        catalogs.insert(catalog_name.clone(), CatalogEntry { name: catalog_name, connector_id, connector });
        Ok(())
    }

    pub fn get(&self, catalog_name: &str) -> Result<CatalogEntry> {
        self.catalogs.read().get(catalog_name).cloned().ok_or_else(|| EngineError::not_found(format!("catalog '{catalog_name}' not found")))
    }

    pub fn drop_catalog(&self, catalog_name: &str) -> Result<()> {
        self.catalogs.write().remove(catalog_name).map(|_| ()).ok_or_else(|| EngineError::not_found(format!("catalog '{catalog_name}' not found")))
    }

    pub fn list_catalogs(&self) -> Vec<String> {
        self.catalogs.read().keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::connector::ConnectorFactory;
    use async_trait::async_trait;

    struct NoopConnector(ConnectorId);

    #[async_trait]
    impl Connector for NoopConnector {
        fn id(&self) -> &ConnectorId {
            &self.0
        }
        async fn list_schemas(&self) -> Result<Vec<String>> {
            Ok(vec![])
        }
        async fn list_tables(&self, _schema: Option<&str>) -> Result<Vec<String>> {
            Ok(vec![])
        }
        async fn get_table_handle(&self, _schema: &str, _table: &str) -> Result<crate::engine::connector::TableHandle> {
            Err(EngineError::not_found("no tables"))
        }
        async fn get_table_metadata(&self, _handle: &crate::engine::connector::TableHandle) -> Result<Vec<crate::engine::connector::ColumnMetadata>> {
            Ok(vec![])
        }
        async fn get_column_handles(
            &self,
            _handle: &crate::engine::connector::TableHandle,
        ) -> Result<HashMap<String, crate::engine::connector::ColumnHandle>> {
            Ok(HashMap::new())
        }
        async fn get_partitions(
            &self,
            _handle: &crate::engine::connector::TableHandle,
            _predicate: &crate::engine::domain::TupleDomain<String>,
        ) -> Result<(Vec<crate::engine::connector::Partition>, crate::engine::domain::TupleDomain<String>)> {
            Ok((vec![], crate::engine::domain::TupleDomain::All))
        }
        async fn get_splits(
            &self,
            _handle: &crate::engine::connector::TableHandle,
            _partitions: &[crate::engine::connector::Partition],
        ) -> Result<Box<dyn crate::engine::split::SplitSource>> {
            Ok(Box::new(crate::engine::split::FixedSplitSource::new(vec![])))
        }
        async fn get_record_set(
            &self,
            _split: &crate::engine::split::Split,
            _columns: &[crate::engine::connector::ColumnHandle],
        ) -> Result<Box<dyn crate::engine::cursor::RecordSet>> {
            Err(EngineError::not_supported("noop connector has no data"))
        }
    }

    struct NoopFactory;
    impl ConnectorFactory for NoopFactory {
        fn name(&self) -> &str {
            "noop"
        }
        fn create(&self, connector_id: ConnectorId, _properties: HashMap<String, String>) -> Result<Arc<dyn Connector>> {
            Ok(Arc::new(NoopConnector(connector_id)))
        }
    }

    fn manager() -> CatalogManager {
        let registry = Arc::new(ConnectorRegistry::new());
        registry.register_factory(Arc::new(NoopFactory)).unwrap();
        CatalogManager::new(registry)
    }

    #[test]
    fn catalog_round_trips_by_name() {
        let manager = manager();
        manager.create_catalog("hive", "noop", HashMap::new()).unwrap();
        let entry = manager.get("hive").unwrap();
        assert_eq!(entry.connector_id, ConnectorId("hive".into()));
        assert_eq!(manager.list_catalogs(), vec!["hive".to_string()]);
    }

    #[test]
    fn creating_a_duplicate_catalog_name_fails_already_exists() {
        let manager = manager();
        manager.create_catalog("hive", "noop", HashMap::new()).unwrap();
        let err = manager.create_catalog("hive", "noop", HashMap::new()).unwrap_err();
        assert_eq!(err.kind, crate::error::ErrorKind::AlreadyExists);
    }

    #[test]
    fn dropping_an_unknown_catalog_fails_not_found() {
        let manager = manager();
        let err = manager.drop_catalog("hive").unwrap_err();
        assert_eq!(err.kind, crate::error::ErrorKind::NotFound);
    }
}
