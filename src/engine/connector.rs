//! Connector SPI (C3): the trait every data source implements, a
//! name-keyed factory registry, and connector-id-namespaced table/column
//! handles so the engine never downcasts a foreign handle.
//!
//! The registry is an `Arc<RwLock<HashMap<...>>>` of connector factories
//! with a create/get/drop-with-not-found-error contract: one registry of
//! connector factories, each producing a catalog of tables.

use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

use crate::error::{EngineError, Result};

use super::domain::TupleDomain;
use super::split::SplitSource;

/// Namespaces every handle a connector hands back so the engine can reject
/// a foreign handle by comparing namespaces, never by downcasting.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectorId(pub String);

impl std::fmt::Display for ConnectorId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// An opaque table handle, tagged with the connector that issued it. The
/// payload is connector-private; only the issuing connector interprets it.
#[derive(Debug, Clone)]
pub struct TableHandle {
    pub connector_id: ConnectorId,
    pub payload: Arc<dyn std::any::Any + Send + Sync>,
}

impl TableHandle {
    pub fn new(connector_id: ConnectorId, payload: Arc<dyn std::any::Any + Send + Sync>) -> Self {
        Self { connector_id, payload }
    }

    /// Rejects a handle minted by a different connector before any
    /// downcast is attempted.
    pub fn require_owner(&self, expected: &ConnectorId) -> Result<()> {
        if &self.connector_id != expected {
            return Err(EngineError::internal(format!(
                "table handle belongs to connector '{}', not '{expected}'",
                self.connector_id
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct ColumnHandle {
    pub connector_id: ConnectorId,
    pub name: String,
}

#[derive(Debug, Clone)]
pub struct ColumnMetadata {
    pub name: String,
    pub type_signature: super::types::TypeSignature,
    pub indexable: bool,
}

#[derive(Debug, Clone)]
pub struct Partition {
    pub handle: Arc<dyn std::any::Any + Send + Sync>,
}

#[derive(Debug, Clone)]
pub struct ViewDefinition {
    pub name: String,
    pub query: String,
}

/// The SPI every data source implements. Unsupported operations fail with
/// `NOT_SUPPORTED` and a human-readable reason rather than panicking.
#[async_trait]
pub trait Connector: Send + Sync {
    fn id(&self) -> &ConnectorId;

    async fn list_schemas(&self) -> Result<Vec<String>>;
    async fn list_tables(&self, schema: Option<&str>) -> Result<Vec<String>>;
    async fn get_table_handle(&self, schema: &str, table: &str) -> Result<TableHandle>;
    async fn get_table_metadata(&self, handle: &TableHandle) -> Result<Vec<ColumnMetadata>>;
    async fn get_column_handles(&self, handle: &TableHandle) -> Result<HashMap<String, ColumnHandle>>;

    async fn get_partitions(
        &self,
        handle: &TableHandle,
        predicate: &TupleDomain<String>,
    ) -> Result<(Vec<Partition>, TupleDomain<String>)>;

    async fn get_splits(&self, handle: &TableHandle, partitions: &[Partition]) -> Result<Box<dyn SplitSource>>;

    async fn get_record_set(
        &self,
        split: &super::split::Split,
        columns: &[ColumnHandle],
    ) -> Result<Box<dyn super::cursor::RecordSet>>;

    async fn begin_create_table(&self, _schema: &str, _table: &str, _columns: &[ColumnMetadata]) -> Result<()> {
        Err(EngineError::not_supported(format!("{} does not support create_table", self.id())))
    }
    async fn commit_create_table(&self, _schema: &str, _table: &str) -> Result<()> {
        Err(EngineError::not_supported(format!("{} does not support create_table", self.id())))
    }
    async fn begin_insert(&self, _handle: &TableHandle) -> Result<()> {
        Err(EngineError::not_supported(format!("{} does not support insert", self.id())))
    }
    async fn commit_insert(&self, _handle: &TableHandle) -> Result<()> {
        Err(EngineError::not_supported(format!("{} does not support insert", self.id())))
    }
    async fn drop_table(&self, _handle: &TableHandle) -> Result<()> {
        Err(EngineError::not_supported(format!("{} does not support drop_table", self.id())))
    }
    async fn rename_table(&self, _handle: &TableHandle, _new_name: &str) -> Result<()> {
        Err(EngineError::not_supported(format!("{} does not support rename_table", self.id())))
    }
    async fn create_view(&self, _schema: &str, _view: ViewDefinition) -> Result<()> {
        Err(EngineError::not_supported(format!("{} does not support views", self.id())))
    }
    async fn drop_view(&self, _schema: &str, _name: &str) -> Result<()> {
        Err(EngineError::not_supported(format!("{} does not support views", self.id())))
    }

    /// Drop-then-insert, outside any nested transaction: the default is
    /// last-writer-wins. Two concurrent callers racing on the same view
    /// name may both see their drop succeed and then both attempt the
    /// insert; the loser's `create_view` collides with the winner's and
    /// surfaces `ALREADY_EXISTS` rather than silently overwriting it.
    /// Connectors with a real atomic upsert should override this.
    async fn create_or_replace_view(&self, schema: &str, view: ViewDefinition) -> Result<()> {
        let _ = self.drop_view(schema, &view.name).await;
        self.create_view(schema, view).await
    }
    async fn list_views(&self, _schema: &str) -> Result<Vec<String>> {
        Err(EngineError::not_supported(format!("{} does not support views", self.id())))
    }
    async fn get_views(&self, _schema: &str) -> Result<Vec<ViewDefinition>> {
        Err(EngineError::not_supported(format!("{} does not support views", self.id())))
    }
}

/// Constructs a `Connector` from its declared configuration properties.
/// Explicit constructor wiring, not a DI container.
pub trait ConnectorFactory: Send + Sync {
    fn name(&self) -> &str;
    fn create(&self, connector_id: ConnectorId, properties: HashMap<String, String>) -> Result<Arc<dyn Connector>>;
}

/// Process-wide, name-keyed registry of connector factories and the live
/// connector instances created from them.
pub struct ConnectorRegistry {
    factories: RwLock<HashMap<String, Arc<dyn ConnectorFactory>>>,
    connectors: RwLock<HashMap<ConnectorId, Arc<dyn Connector>>>,
}

impl ConnectorRegistry {
    pub fn new() -> Self {
        Self { factories: RwLock::new(HashMap::new()), connectors: RwLock::new(HashMap::new()) }
    }

    pub fn register_factory(&self, factory: Arc<dyn ConnectorFactory>) -> Result<()> {
        let mut factories = self.factories.write();
        if factories.contains_key(factory.name()) {
            return Err(EngineError::already_exists(format!(
                "connector factory '{}' is already registered",
                factory.name()
            )));
        }
        factories.insert(factory.name().to_string(), factory);
        Ok(())
    }

    /// Instantiates a connector by factory name and stores it under
    /// `connector_id`; fails if the id is already in use.
    pub fn create_connector(
        &self,
        factory_name: &str,
        connector_id: ConnectorId,
        properties: HashMap<String, String>,
    ) -> Result<Arc<dyn Connector>> {
        let factory = self
            .factories
            .read()
            .get(factory_name)
            .cloned()
            .ok_or_else(|| EngineError::not_found(format!("connector factory '{factory_name}' not found")))?;

        let mut connectors = self.connectors.write();
        if connectors.contains_key(&connector_id) {
            return Err(EngineError::already_exists(format!("connector '{connector_id}' already exists")));
        }
        let connector = factory.create(connector_id.clone(), properties)?;
        connectors.insert(connector_id, connector.clone());
        Ok(connector)
    }

    pub fn get(&self, connector_id: &ConnectorId) -> Result<Arc<dyn Connector>> {
        self.connectors
            .read()
            .get(connector_id)
            .cloned()
            .ok_or_else(|| EngineError::not_found(format!("connector '{connector_id}' not found")))
    }

    pub fn list_connectors(&self) -> Vec<ConnectorId> {
        self.connectors.read().keys().cloned().collect()
    }
}

impl Default for ConnectorRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NoopFactory;
    impl ConnectorFactory for NoopFactory {
        fn name(&self) -> &str {
            "noop"
        }
        fn create(&self, connector_id: ConnectorId, _properties: HashMap<String, String>) -> Result<Arc<dyn Connector>> {
            Err(EngineError::not_supported(format!("noop factory cannot construct {connector_id}")))
        }
    }

    #[test]
    fn registering_duplicate_factory_name_fails() {
        let registry = ConnectorRegistry::new();
        registry.register_factory(Arc::new(NoopFactory)).unwrap();
        assert!(registry.register_factory(Arc::new(NoopFactory)).is_err());
    }

    #[test]
    fn creating_from_unknown_factory_fails_not_found() {
        let registry = ConnectorRegistry::new();
        let err = registry
            .create_connector("does-not-exist", ConnectorId("c1".into()), HashMap::new())
            .unwrap_err();
        assert_eq!(err.kind, crate::error::ErrorKind::NotFound);
    }

    #[test]
    fn foreign_handle_is_rejected_without_downcasting() {
        let handle = TableHandle::new(ConnectorId("hive".into()), Arc::new(42u32));
        let err = handle.require_owner(&ConnectorId("raptor".into())).unwrap_err();
        assert!(err.message.contains("hive"));
    }

    struct ViewOnlyConnector {
        id: ConnectorId,
        views: parking_lot::Mutex<HashMap<String, ViewDefinition>>,
    }

    #[async_trait]
    impl Connector for ViewOnlyConnector {
        fn id(&self) -> &ConnectorId {
            &self.id
        }
        async fn list_schemas(&self) -> Result<Vec<String>> {
            Ok(vec![])
        }
        async fn list_tables(&self, _schema: Option<&str>) -> Result<Vec<String>> {
            Ok(vec![])
        }
        async fn get_table_handle(&self, _schema: &str, _table: &str) -> Result<TableHandle> {
            Err(EngineError::not_found("no tables"))
        }
        async fn get_table_metadata(&self, _handle: &TableHandle) -> Result<Vec<ColumnMetadata>> {
            Ok(vec![])
        }
        async fn get_column_handles(&self, _handle: &TableHandle) -> Result<HashMap<String, ColumnHandle>> {
            Ok(HashMap::new())
        }
        async fn get_partitions(&self, _handle: &TableHandle, _predicate: &TupleDomain<String>) -> Result<(Vec<Partition>, TupleDomain<String>)> {
            Ok((vec![], TupleDomain::All))
        }
        async fn get_splits(&self, _handle: &TableHandle, _partitions: &[Partition]) -> Result<Box<dyn SplitSource>> {
            Ok(Box::new(super::super::split::FixedSplitSource::new(vec![])))
        }
        async fn get_record_set(&self, _split: &super::super::split::Split, _columns: &[ColumnHandle]) -> Result<Box<dyn super::super::cursor::RecordSet>> {
            Err(EngineError::not_supported("no data"))
        }
        async fn create_view(&self, _schema: &str, view: ViewDefinition) -> Result<()> {
            let mut views = self.views.lock();
            if views.contains_key(&view.name) {
                return Err(EngineError::already_exists(format!("view '{}' already exists", view.name)));
            }
            views.insert(view.name.clone(), view);
            Ok(())
        }
        async fn drop_view(&self, _schema: &str, name: &str) -> Result<()> {
            self.views.lock().remove(name).map(|_| ()).ok_or_else(|| EngineError::not_found(format!("view '{name}' not found")))
        }
    }

    #[tokio::test]
    async fn create_or_replace_view_overwrites_an_existing_view() {
        let connector = ViewOnlyConnector { id: ConnectorId("hive".into()), views: parking_lot::Mutex::new(HashMap::new()) };
        connector.create_or_replace_view("default", ViewDefinition { name: "v".into(), query: "select 1".into() }).await.unwrap();
        connector.create_or_replace_view("default", ViewDefinition { name: "v".into(), query: "select 2".into() }).await.unwrap();
        assert_eq!(connector.views.lock().get("v").unwrap().query, "select 2");
    }

    #[tokio::test]
    async fn racing_insert_after_the_replace_drop_surfaces_already_exists() {
        let connector = ViewOnlyConnector { id: ConnectorId("hive".into()), views: parking_lot::Mutex::new(HashMap::new()) };
        connector.create_view("default", ViewDefinition { name: "v".into(), query: "select 1".into() }).await.unwrap();

        // Simulate a second writer's create_view landing between this
        // replace's drop and its own create.
        connector.drop_view("default", "v").await.unwrap();
        connector.create_view("default", ViewDefinition { name: "v".into(), query: "racer".into() }).await.unwrap();
        let err = connector.create_view("default", ViewDefinition { name: "v".into(), query: "loser".into() }).await.unwrap_err();
        assert_eq!(err.kind, crate::error::ErrorKind::AlreadyExists);
    }
}
