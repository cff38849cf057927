//! Registry of all local tuple stores
//!
//! Stores live below `{storage_dir}/data/{group}/{table}[_{region}]`. Each
//! store directory holds a `store.json` with the table configuration, so a
//! restart reopens every store with the right duplicate resolver. New
//! stores go to the storage directory holding the fewest stores.
//!
//! A region store deleted after a split or merge is retired: writes coming
//! from clients with stale routing must not bring it back. Only the
//! redistribution path (`create_store`) may create it again.

use crate::config::{StoreConfig, TupleStoreConfiguration};
use crate::storage::lsm::{
    CompactionEngine, CompactionWorker, RegionCoordinator, SimpleMergeStrategy, TupleStoreManager,
};
use crate::types::TupleStoreName;
use crate::{Result, StorageError};
use dashmap::DashSet;
use parking_lot::{Mutex, RwLock};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

const STORE_CONFIG_FILE: &str = "store.json";

struct StoreEntry {
    manager: Arc<TupleStoreManager>,
    storage_dir: PathBuf,
}

pub struct TupleStoreManagerRegistry {
    config: StoreConfig,
    stores: RwLock<BTreeMap<TupleStoreName, StoreEntry>>,
    coordinator: RwLock<Option<Arc<dyn RegionCoordinator>>>,
    engines: Mutex<Vec<CompactionEngine>>,

    /// Deleted region stores that client writes must not recreate
    retired: DashSet<TupleStoreName>,

    /// Serializes store creation and deletion
    admin_lock: Mutex<()>,
}

impl TupleStoreManagerRegistry {
    /// Open every store found in the configured storage directories
    pub fn open(config: StoreConfig) -> Result<Arc<Self>> {
        config.validate()?;

        let mut stores = BTreeMap::new();
        for storage_dir in &config.storage_directories {
            let data_dir = storage_dir.join("data");
            std::fs::create_dir_all(&data_dir)?;

            for (name, configuration) in Self::scan_directory(&data_dir)? {
                let manager = TupleStoreManager::open(storage_dir, name.clone(), configuration, &config)?;
                stores.insert(
                    name,
                    StoreEntry {
                        manager,
                        storage_dir: storage_dir.clone(),
                    },
                );
            }
        }

        tracing::info!(stores = stores.len(), directories = config.storage_directories.len(), "tuple store registry opened");

        Ok(Arc::new(Self {
            config,
            stores: RwLock::new(stores),
            coordinator: RwLock::new(None),
            engines: Mutex::new(Vec::new()),
            retired: DashSet::new(),
            admin_lock: Mutex::new(()),
        }))
    }

    fn scan_directory(data_dir: &Path) -> Result<Vec<(TupleStoreName, TupleStoreConfiguration)>> {
        let mut found = Vec::new();
        for group_entry in std::fs::read_dir(data_dir)? {
            let group_entry = group_entry?;
            if !group_entry.file_type()?.is_dir() {
                continue;
            }
            let group = group_entry.file_name().to_string_lossy().into_owned();

            for store_entry in std::fs::read_dir(group_entry.path())? {
                let store_entry = store_entry?;
                if !store_entry.file_type()?.is_dir() {
                    continue;
                }
                let store = store_entry.file_name().to_string_lossy().into_owned();

                let name = match TupleStoreName::parse(&format!("{}_{}", group, store)) {
                    Ok(name) => name,
                    Err(e) => {
                        tracing::warn!(directory = %store_entry.path().display(), error = %e, "ignoring unknown directory");
                        continue;
                    }
                };

                let config_file = store_entry.path().join(STORE_CONFIG_FILE);
                let configuration = if config_file.exists() {
                    serde_json::from_slice(&std::fs::read(&config_file)?)?
                } else {
                    TupleStoreConfiguration::default()
                };
                found.push((name, configuration));
            }
        }
        Ok(found)
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    /// Start one compaction thread per storage directory
    pub fn start_compaction(self: &Arc<Self>) -> Result<()> {
        let mut engines = self.engines.lock();
        if !engines.is_empty() {
            return Ok(());
        }

        let strategy = Arc::new(SimpleMergeStrategy::from_config(&self.config));
        for storage_dir in &self.config.storage_directories {
            let worker = Arc::new(CompactionWorker::new(
                storage_dir.clone(),
                Arc::downgrade(self),
                strategy.clone(),
                self.config.max_sstable_size,
            ));
            engines.push(CompactionEngine::start(worker)?);
        }
        Ok(())
    }

    pub fn stop_compaction(&self) {
        let engines: Vec<CompactionEngine> = self.engines.lock().drain(..).collect();
        for engine in &engines {
            engine.shutdown();
        }
    }

    /// Run one compaction cycle on every directory, in the caller's thread
    pub fn compact_now(self: &Arc<Self>) -> usize {
        let strategy = Arc::new(SimpleMergeStrategy::from_config(&self.config));
        self.config
            .storage_directories
            .iter()
            .map(|dir| {
                CompactionWorker::new(dir.clone(), Arc::downgrade(self), strategy.clone(), self.config.max_sstable_size)
                    .run_cycle()
                    .compactions
            })
            .sum()
    }

    pub fn region_coordinator(&self) -> Option<Arc<dyn RegionCoordinator>> {
        self.coordinator.read().clone()
    }

    pub fn set_region_coordinator(&self, coordinator: Option<Arc<dyn RegionCoordinator>>) {
        *self.coordinator.write() = coordinator;
    }

    fn least_used_directory(&self, stores: &BTreeMap<TupleStoreName, StoreEntry>) -> Result<PathBuf> {
        self.config
            .storage_directories
            .iter()
            .min_by_key(|dir| stores.values().filter(|e| &e.storage_dir == *dir).count())
            .cloned()
            .ok_or_else(|| StorageError::InvalidArgument("no storage directory configured".into()))
    }

    /// Create a new local store
    pub fn create_store(
        &self,
        name: &TupleStoreName,
        configuration: TupleStoreConfiguration,
    ) -> Result<Arc<TupleStoreManager>> {
        let _guard = self.admin_lock.lock();

        let storage_dir = {
            let stores = self.stores.read();
            if stores.contains_key(name) {
                return Err(StorageError::TableExists(name.to_string()));
            }
            self.least_used_directory(&stores)?
        };

        let manager = TupleStoreManager::open(&storage_dir, name.clone(), configuration.clone(), &self.config)?;
        let config_file = manager.directory().join(STORE_CONFIG_FILE);
        std::fs::write(&config_file, serde_json::to_vec_pretty(&configuration)?)?;

        tracing::info!(store = %name, directory = %storage_dir.display(), "created tuple store");
        self.retired.remove(name);
        self.stores.write().insert(
            name.clone(),
            StoreEntry {
                manager: manager.clone(),
                storage_dir,
            },
        );
        Ok(manager)
    }

    pub fn get_store(&self, name: &TupleStoreName) -> Result<Arc<TupleStoreManager>> {
        self.stores
            .read()
            .get(name)
            .map(|e| e.manager.clone())
            .ok_or_else(|| StorageError::TableNotFound(name.to_string()))
    }

    pub fn get_or_create_store(
        &self,
        name: &TupleStoreName,
        configuration: TupleStoreConfiguration,
    ) -> Result<Arc<TupleStoreManager>> {
        match self.get_store(name) {
            Ok(manager) => Ok(manager),
            Err(StorageError::TableNotFound(_)) => match self.create_store(name, configuration) {
                Err(StorageError::TableExists(_)) => self.get_store(name),
                other => other,
            },
            Err(e) => Err(e),
        }
    }

    /// Store for a client write
    ///
    /// Unlike `get_or_create_store`, a missing store is only created for a
    /// region that is neither retired nor inactive according to the region
    /// coordinator. Otherwise the write fails with `ReadOnly` so the client
    /// refreshes its routing.
    pub fn get_or_create_writable_store(
        &self,
        name: &TupleStoreName,
        configuration: TupleStoreConfiguration,
    ) -> Result<Arc<TupleStoreManager>> {
        if let Ok(manager) = self.get_store(name) {
            return Ok(manager);
        }

        if self.retired.contains(name) {
            tracing::debug!(store = %name, "write to retired region rejected");
            return Err(StorageError::ReadOnly(format!("region store {} was retired", name)));
        }
        if let Some(coordinator) = self.region_coordinator() {
            if !coordinator.is_region_active(name) {
                tracing::debug!(store = %name, "write to inactive region rejected");
                return Err(StorageError::ReadOnly(format!("region of {} is not active", name)));
            }
        }
        self.get_or_create_store(name, configuration)
    }

    pub fn is_retired(&self, name: &TupleStoreName) -> bool {
        self.retired.contains(name)
    }

    pub fn contains(&self, name: &TupleStoreName) -> bool {
        self.stores.read().contains_key(name)
    }

    /// Remove a store and all of its data
    pub fn delete_store(&self, name: &TupleStoreName) -> Result<()> {
        let _guard = self.admin_lock.lock();
        let entry = self
            .stores
            .write()
            .remove(name)
            .ok_or_else(|| StorageError::TableNotFound(name.to_string()))?;
        if name.region_id().is_some() {
            self.retired.insert(name.clone());
        }

        let config_file = entry.manager.directory().join(STORE_CONFIG_FILE);
        if let Err(e) = std::fs::remove_file(&config_file) {
            if e.kind() != std::io::ErrorKind::NotFound {
                return Err(e.into());
            }
        }
        entry.manager.delete_all()
    }

    /// Replace a store by a fresh read-write manager over the same files
    pub fn reopen_store(&self, name: &TupleStoreName) -> Result<Arc<TupleStoreManager>> {
        let _guard = self.admin_lock.lock();
        let (old, storage_dir) = {
            let stores = self.stores.read();
            let entry = stores
                .get(name)
                .ok_or_else(|| StorageError::TableNotFound(name.to_string()))?;
            (entry.manager.clone(), entry.storage_dir.clone())
        };

        // read-only stores skip the flush on shutdown
        old.shutdown()?;
        old.flush()?;
        let manager = TupleStoreManager::open(&storage_dir, name.clone(), old.configuration().clone(), &self.config)?;
        tracing::info!(store = %name, "reopened tuple store");

        self.stores.write().insert(
            name.clone(),
            StoreEntry {
                manager: manager.clone(),
                storage_dir,
            },
        );
        Ok(manager)
    }

    /// Remove every store (all regions) of a table
    pub fn delete_table(&self, group: &str, table: &str) -> Result<usize> {
        let names: Vec<TupleStoreName> = self
            .all_store_names()
            .into_iter()
            .filter(|n| n.group() == group && n.table() == table)
            .collect();
        for name in &names {
            self.delete_store(name)?;
        }
        // a dropped table starts over when it is created again
        self.retired.retain(|n| !(n.group() == group && n.table() == table));
        Ok(names.len())
    }

    pub fn all_store_names(&self) -> Vec<TupleStoreName> {
        self.stores.read().keys().cloned().collect()
    }

    pub fn all_stores(&self) -> Vec<Arc<TupleStoreManager>> {
        self.stores.read().values().map(|e| e.manager.clone()).collect()
    }

    pub fn stores_in_directory(&self, storage_dir: &Path) -> Vec<Arc<TupleStoreManager>> {
        self.stores
            .read()
            .values()
            .filter(|e| e.storage_dir == storage_dir)
            .map(|e| e.manager.clone())
            .collect()
    }

    /// Stores of every table of `group` that belong to `region_id`
    pub fn stores_for_region(&self, group: &str, region_id: u64) -> Vec<Arc<TupleStoreManager>> {
        self.stores
            .read()
            .iter()
            .filter(|(n, _)| n.group() == group && n.region_id() == Some(region_id))
            .map(|(_, e)| e.manager.clone())
            .collect()
    }

    /// Stop compaction and flush every writable store
    pub fn shutdown(&self) -> Result<()> {
        self.stop_compaction();

        let mut first_error = None;
        for manager in self.all_stores() {
            if let Err(e) = manager.shutdown() {
                tracing::error!(store = %manager.name(), error = %e, "store shutdown failed");
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }
}

impl Drop for TupleStoreManagerRegistry {
    fn drop(&mut self) {
        self.stop_compaction();
    }
}
