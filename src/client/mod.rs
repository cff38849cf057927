//! Client facade
//!
//! Turns logical table operations into one request per responsible
//! storage node. Routing goes through the region tree of the table's
//! distribution group: a write is sent to every replica of every region
//! its bounding box intersects, a query to one slot per replica and region.

use crate::config::TupleStoreConfiguration;
use crate::distribution::{
    CoordinationService, DistributionGroupConfigCache, DistributionRegion, NodeId, SpacePartitionerCache,
};
use crate::network::future::{NetworkOperationFuture, OperationFuture, QueryTarget, RetryPolicy, TupleListFuture};
use crate::network::{ClientConnection, Request};
use crate::types::{Hyperrectangle, Tuple, TupleStoreName};
use crate::{Result, StorageError};
use dashmap::DashMap;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

pub struct GeoStoreClient {
    service: Arc<dyn CoordinationService>,
    connections: DashMap<NodeId, Arc<dyn ClientConnection>>,
    configs: DistributionGroupConfigCache,
    partitioners: SpacePartitionerCache,
    /// Configurations of the tables created through this client
    tables: DashMap<TupleStoreName, TupleStoreConfiguration>,
    timeout: Duration,
}

impl GeoStoreClient {
    pub fn new(service: Arc<dyn CoordinationService>, timeout: Duration) -> Self {
        Self {
            configs: DistributionGroupConfigCache::new(service.clone()),
            partitioners: SpacePartitionerCache::new(service.clone()),
            service,
            connections: DashMap::new(),
            tables: DashMap::new(),
            timeout,
        }
    }

    pub fn add_connection(&self, node: NodeId, connection: Arc<dyn ClientConnection>) {
        tracing::debug!(node = %node, connection = connection.name(), "connection added");
        self.connections.insert(node, connection);
    }

    pub fn remove_connection(&self, node: &NodeId) -> Option<Arc<dyn ClientConnection>> {
        self.connections.remove(node).map(|(_, c)| c)
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Forget cached metadata of `group`, e.g. after it was recreated
    pub fn invalidate_group(&self, group: &str) {
        self.configs.invalidate(group);
        self.partitioners.invalidate(group);
    }

    /// Create `table` on every node of its group
    pub fn create_table(
        &self,
        table: &TupleStoreName,
        configuration: TupleStoreConfiguration,
    ) -> Result<OperationFuture> {
        // unknown groups fail here instead of on every node
        self.configs.get(table.group())?;
        let table = table.without_region();
        self.tables.insert(table.clone(), configuration.clone());

        let futures = self
            .group_nodes(table.group())?
            .into_iter()
            .map(|node| {
                let (table, configuration) = (table.clone(), configuration.clone());
                self.future_for(&node, move || Request::CreateTable {
                    table: table.clone(),
                    configuration: configuration.clone(),
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(self.run(futures))
    }

    pub fn delete_table(&self, table: &TupleStoreName) -> Result<OperationFuture> {
        let table = table.without_region();
        self.tables.remove(&table);

        let futures = self
            .group_nodes(table.group())?
            .into_iter()
            .map(|node| {
                let table = table.clone();
                self.future_for(&node, move || Request::DeleteTable { table: table.clone() })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(self.run(futures))
    }

    /// Write `tuple` to every replica of every region its box intersects
    pub fn insert_tuple(&self, table: &TupleStoreName, tuple: Tuple) -> Result<OperationFuture> {
        tuple.bounding_box().validate()?;
        let mut futures = Vec::new();
        for region in self.regions(table, tuple.bounding_box())? {
            for node in &region.systems {
                let (table, tuple) = (table.with_region(region.id), tuple.clone());
                futures.push(self.future_for(node, move || Request::InsertTuple {
                    table: table.clone(),
                    tuple: tuple.clone(),
                })?);
            }
        }
        Ok(self.run(futures))
    }

    /// Store a deletion marker for `key` in every region of the table
    pub fn delete_tuple(&self, table: &TupleStoreName, key: &str, version: i64) -> Result<OperationFuture> {
        let mut futures = Vec::new();
        for region in self.regions(table, &Hyperrectangle::full_space())? {
            for node in &region.systems {
                let (table, key) = (table.with_region(region.id), key.to_string());
                futures.push(self.future_for(node, move || Request::DeleteTuple {
                    table: table.clone(),
                    key: key.clone(),
                    version,
                })?);
            }
        }
        Ok(self.run(futures))
    }

    /// All versions of `key`, read from every replica
    pub fn query_key(&self, table: &TupleStoreName, key: &str) -> Result<TupleListFuture> {
        self.query(table, &Hyperrectangle::full_space(), |table, _| {
            let key = key.to_string();
            move || Request::QueryKey {
                table: table.clone(),
                key: key.clone(),
            }
        })
    }

    /// Tuples whose box intersects `bbox`; `paging` streams the result in pages
    pub fn query_bbox(&self, table: &TupleStoreName, bbox: &Hyperrectangle, paging: bool) -> Result<TupleListFuture> {
        bbox.validate()?;
        self.query(table, bbox, move |table, bbox| {
            move || Request::QueryBoundingBox {
                table: table.clone(),
                bbox: bbox.clone(),
                paging,
            }
        })
    }

    /// Lock `key` at `version` on every node holding the table
    ///
    /// Each node keeps its own lock table, so one request per node is sent.
    pub fn lock_tuple(&self, table: &TupleStoreName, key: &str, version: i64) -> Result<OperationFuture> {
        let nodes: BTreeSet<NodeId> = self
            .regions(table, &Hyperrectangle::full_space())?
            .into_iter()
            .flat_map(|r| r.systems)
            .collect();

        let table = table.without_region();
        let futures = nodes
            .iter()
            .map(|node| {
                let (table, key) = (table.clone(), key.to_string());
                self.future_for(node, move || Request::LockTuple {
                    table: table.clone(),
                    key: key.clone(),
                    version,
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(self.run(futures))
    }

    fn query<F, R>(&self, table: &TupleStoreName, bbox: &Hyperrectangle, request: F) -> Result<TupleListFuture>
    where
        F: Fn(TupleStoreName, Hyperrectangle) -> R,
        R: Fn() -> Request + Send + Sync + 'static,
    {
        let mut slots = Vec::new();
        for region in self.regions(table, bbox)? {
            for node in &region.systems {
                let target = QueryTarget {
                    table: table.with_region(region.id),
                    bbox: region.bbox.clone(),
                };
                let future = self.future_for(node, request(target.table.clone(), bbox.clone()))?;
                slots.push((future, target));
            }
        }

        let resolver = self
            .tables
            .get(&table.without_region())
            .map(|c| c.duplicate_resolver())
            .unwrap_or_else(|| TupleStoreConfiguration::default().duplicate_resolver());

        let future = TupleListFuture::new(slots, resolver, self.timeout);
        future.execute();
        Ok(future)
    }

    /// Active leaf regions of the table's group intersecting `bbox`
    fn regions(&self, table: &TupleStoreName, bbox: &Hyperrectangle) -> Result<Vec<DistributionRegion>> {
        let regions: Vec<DistributionRegion> = self
            .partitioners
            .get(table.group())?
            .regions_for_box(bbox)?
            .into_iter()
            .filter(|r| r.state.is_active() || !r.is_leaf())
            .collect();

        if regions.is_empty() {
            return Err(StorageError::Partitioner(format!(
                "no active region of {} covers {}",
                table, bbox
            )));
        }
        Ok(regions)
    }

    /// Every node holding a replica of any region of `group`
    fn group_nodes(&self, group: &str) -> Result<BTreeSet<NodeId>> {
        let regions = self.partitioners.get(group)?.regions_for_box(&Hyperrectangle::full_space())?;
        let mut nodes: BTreeSet<NodeId> = regions.into_iter().flat_map(|r| r.systems).collect();
        if nodes.is_empty() {
            nodes.extend(self.service.live_instances());
        }
        Ok(nodes)
    }

    fn future_for(
        &self,
        node: &NodeId,
        request: impl Fn() -> Request + Send + Sync + 'static,
    ) -> Result<Arc<NetworkOperationFuture>> {
        let connection = self
            .connections
            .get(node)
            .map(|c| c.value().clone())
            .ok_or_else(|| StorageError::IllegalState(format!("no connection to {}", node)))?;
        Ok(NetworkOperationFuture::new(connection, request))
    }

    fn run(&self, futures: Vec<Arc<NetworkOperationFuture>>) -> OperationFuture {
        let operation = OperationFuture::new(futures, RetryPolicy::AllFutures);
        operation.execute();
        operation
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StoreConfig;
    use crate::distribution::{DistributionGroupConfig, InMemoryCoordinator};
    use crate::network::LoopbackConnection;
    use crate::server::ServerContext;
    use crate::storage::TupleStoreManagerRegistry;
    use std::time::Instant;
    use tempfile::TempDir;

    struct Cluster {
        client: GeoStoreClient,
        contexts: Vec<Arc<ServerContext>>,
        _dirs: Vec<TempDir>,
    }

    fn cluster(nodes: usize, replication: usize) -> Cluster {
        let coordinator = Arc::new(InMemoryCoordinator::new());
        let mut dirs = Vec::new();
        let mut contexts = Vec::new();
        let client = GeoStoreClient::new(coordinator.clone(), Duration::from_secs(5));

        for i in 0..nodes {
            let dir = TempDir::new().unwrap();
            let registry = TupleStoreManagerRegistry::open(StoreConfig::for_testing(dir.path())).unwrap();
            let context = ServerContext::new(registry);
            let node = NodeId::new(format!("node{}", i));
            coordinator.register_instance(node.clone());
            client.add_connection(node, LoopbackConnection::connect(format!("node{}", i), context.clone()).unwrap());
            dirs.push(dir);
            contexts.push(context);
        }

        coordinator
            .create_group("grp", DistributionGroupConfig::new(1, replication))
            .unwrap();
        Cluster {
            client,
            contexts,
            _dirs: dirs,
        }
    }

    fn table() -> TupleStoreName {
        TupleStoreName::new("grp", "tbl").unwrap()
    }

    fn tuple(key: &str, x: f64, version: i64) -> Tuple {
        Tuple::with_version(key, Hyperrectangle::from_bounds(&[x, x]).unwrap(), b"v".to_vec(), version)
    }

    fn wait(operation: &OperationFuture) {
        operation.wait_for_all(Duration::from_secs(5)).unwrap();
        assert!(!operation.is_failed(), "{}", operation.get_all_messages());
    }

    #[test]
    fn test_insert_reaches_every_replica() {
        let cluster = cluster(2, 2);
        let client = &cluster.client;
        wait(&client.create_table(&table(), TupleStoreConfiguration::default()).unwrap());

        let insert = client.insert_tuple(&table(), tuple("a", 1.0, 1)).unwrap();
        assert_eq!(insert.len(), 2);
        wait(&insert);

        for context in &cluster.contexts {
            let stores = context.readable_stores(&table()).unwrap();
            let found: usize = stores.iter().map(|s| s.get("a").unwrap().len()).sum();
            assert_eq!(found, 1);
        }

        let query = client.query_bbox(&table(), &Hyperrectangle::from_bounds(&[0.0, 2.0]).unwrap(), false).unwrap();
        let keys: Vec<String> = query.simple_iterator().unwrap().map(|t| t.key().to_string()).collect();
        assert_eq!(keys, vec!["a".to_string()]);
    }

    #[test]
    fn test_query_repairs_missing_replica() {
        let cluster = cluster(2, 2);
        let client = &cluster.client;
        wait(&client.create_table(&table(), TupleStoreConfiguration::default()).unwrap());

        // write to one replica only
        let lagging = &cluster.contexts[1];
        cluster.contexts[0]
            .writable_store(&table().with_region(0))
            .unwrap()
            .put(tuple("a", 1.0, 3))
            .unwrap();

        let query = client.query_key(&table(), "a").unwrap();
        let result: Vec<Tuple> = query.simple_iterator().unwrap().collect();
        assert_eq!(result.len(), 1);

        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            let repaired = lagging
                .readable_stores(&table())
                .unwrap()
                .iter()
                .any(|s| !s.get("a").unwrap().is_empty());
            if repaired {
                break;
            }
            assert!(Instant::now() < deadline, "replica was not repaired");
            std::thread::sleep(Duration::from_millis(10));
        }
    }

    #[test]
    fn test_paged_query_streams_all_tuples() {
        let cluster = cluster(1, 1);
        let client = &cluster.client;
        wait(&client.create_table(&table(), TupleStoreConfiguration::default()).unwrap());
        for i in 0..35 {
            wait(&client.insert_tuple(&table(), tuple(&format!("k{:02}", i), i as f64, 1)).unwrap());
        }

        let query = client.query_bbox(&table(), &Hyperrectangle::full_space(), true).unwrap();
        let mut iterator = query.threaded_iterator().unwrap();
        let mut keys = Vec::new();
        while iterator.has_next() {
            keys.push(iterator.next_tuple().unwrap().key().to_string());
        }
        keys.sort();
        keys.dedup();
        assert_eq!(keys.len(), 35);
    }

    #[test]
    fn test_lock_tuple_reports_outdated_version() {
        let cluster = cluster(2, 2);
        let client = &cluster.client;
        wait(&client.create_table(&table(), TupleStoreConfiguration::default()).unwrap());
        wait(&client.insert_tuple(&table(), tuple("K", 0.0, 7)).unwrap());

        let outdated = client.lock_tuple(&table(), "K", 5).unwrap();
        outdated.wait_for_all(Duration::from_secs(5)).unwrap();
        assert!(outdated.is_failed());
        assert!(outdated.get_all_messages().contains("OutdatedVersion"));

        let lock = client.lock_tuple(&table(), "K", 7).unwrap();
        assert_eq!(lock.len(), 2);
        wait(&lock);
    }

    #[test]
    fn test_unknown_group_and_missing_connection() {
        let cluster = cluster(1, 1);
        let client = &cluster.client;
        let other = TupleStoreName::new("nogroup", "tbl").unwrap();
        assert!(client.create_table(&other, TupleStoreConfiguration::default()).is_err());

        client.remove_connection(&NodeId::new("node0"));
        assert!(matches!(
            client.insert_tuple(&table(), tuple("a", 1.0, 1)),
            Err(StorageError::IllegalState(_))
        ));
    }
}
