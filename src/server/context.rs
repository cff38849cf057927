//! State shared by all connections of a storage node

use crate::config::{StoreConfig, TupleStoreConfiguration};
use crate::storage::{TupleStoreManager, TupleStoreManagerRegistry};
use crate::txn::LockManager;
use crate::types::TupleStoreName;
use crate::{Result, StorageError};
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use super::dispatch::DispatchTable;

pub struct ServerContext {
    registry: Arc<TupleStoreManagerRegistry>,
    locks: LockManager,
    /// Known tables (without region) and their configuration
    tables: DashMap<TupleStoreName, TupleStoreConfiguration>,
    dispatch: Arc<DispatchTable>,
    next_connection: AtomicU64,
}

impl ServerContext {
    /// Context over `registry`; tables of existing stores are known at once
    pub fn new(registry: Arc<TupleStoreManagerRegistry>) -> Arc<Self> {
        Self::with_dispatch(registry, DispatchTable::standard())
    }

    pub fn with_dispatch(registry: Arc<TupleStoreManagerRegistry>, dispatch: DispatchTable) -> Arc<Self> {
        let tables = DashMap::new();
        for store in registry.all_stores() {
            tables
                .entry(store.name().without_region())
                .or_insert_with(|| store.configuration().clone());
        }

        Arc::new(Self {
            registry,
            locks: LockManager::new(),
            tables,
            dispatch: Arc::new(dispatch),
            next_connection: AtomicU64::new(1),
        })
    }

    pub fn registry(&self) -> &Arc<TupleStoreManagerRegistry> {
        &self.registry
    }

    pub fn config(&self) -> &StoreConfig {
        self.registry.config()
    }

    pub fn locks(&self) -> &LockManager {
        &self.locks
    }

    pub fn dispatch(&self) -> &Arc<DispatchTable> {
        &self.dispatch
    }

    pub fn next_connection_id(&self) -> u64 {
        self.next_connection.fetch_add(1, Ordering::Relaxed)
    }

    pub fn create_table(&self, table: &TupleStoreName, configuration: TupleStoreConfiguration) -> Result<()> {
        let key = table.without_region();
        match self.tables.entry(key.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => Err(StorageError::TableExists(key.to_string())),
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                // stores are created by the first write
                slot.insert(configuration);
                tracing::info!(table = %key, "table created");
                Ok(())
            }
        }
    }

    /// Drop the table with all of its local region stores
    pub fn delete_table(&self, table: &TupleStoreName) -> Result<usize> {
        let key = table.without_region();
        self.tables.remove(&key);
        let deleted = self.registry.delete_table(key.group(), key.table())?;
        tracing::info!(table = %key, stores = deleted, "table deleted");
        Ok(deleted)
    }

    pub fn table_configuration(&self, table: &TupleStoreName) -> Result<TupleStoreConfiguration> {
        let key = table.without_region();
        self.tables
            .get(&key)
            .map(|c| c.value().clone())
            .ok_or_else(|| StorageError::TableNotFound(key.to_string()))
    }

    /// Store for writes to `table`, created on first use of a live region
    pub fn writable_store(&self, table: &TupleStoreName) -> Result<Arc<TupleStoreManager>> {
        let configuration = self.table_configuration(table)?;
        self.registry.get_or_create_writable_store(table, configuration)
    }

    /// Local stores serving reads of `table`
    ///
    /// A name with region addresses that region only, a name without region
    /// every local region of the table.
    pub fn readable_stores(&self, table: &TupleStoreName) -> Result<Vec<Arc<TupleStoreManager>>> {
        self.table_configuration(table)?;

        if table.region_id().is_some() {
            return Ok(self.registry.get_store(table).into_iter().collect());
        }

        Ok(self
            .registry
            .all_stores()
            .into_iter()
            .filter(|s| s.name().group() == table.group() && s.name().table() == table.table())
            .collect())
    }
}
