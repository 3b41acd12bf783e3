//! Integration tests for the service over a file-backed store.
//!
//! Verifies that probe results are correctly persisted and visible to a new
//! gateway over the same data directory, as across a process restart.

use std::sync::Arc;

use maestro::{Config, InstanceKey};
use maestro_topology::{
    HostnameResolver, InstanceStore, SimulatedTopology, StoreBackend, TopologyService,
};
use tempfile::TempDir;
use test_log::test;

fn create_file_service(temp_dir: &TempDir) -> (Arc<SimulatedTopology>, Arc<TopologyService>) {
    let topology = Arc::new(SimulatedTopology::new());
    let config = Arc::new(Config::default());
    let backend = StoreBackend::new_file(temp_dir.path())
        .create()
        .expect("file backend");
    let store = Arc::new(InstanceStore::new(backend, config.clone()));
    let resolver = Arc::new(HostnameResolver::new(store.clone()));
    let service = Arc::new(TopologyService::new(
        topology.clone(),
        store.clone(),
        resolver,
        config,
    ));
    (topology, service)
}

#[test(tokio::test)]
async fn test_probe_results_survive_restart() {
    let temp_dir = TempDir::new().unwrap();
    let key = InstanceKey::new("db1", 3306);

    {
        let (topology, service) = create_file_service(&temp_dir);
        let server = topology.add_server(key.clone());
        server.set_version("5.6.17-log");
        server.set_self_coordinates("mysql-bin.000002", 456);
        service.read_topology_instance(&key).await.unwrap();
    }

    // A fresh service over the same data directory sees the probed row.
    let (_, service) = create_file_service(&temp_dir);
    let instance = service
        .store()
        .read_instance(&key)
        .await
        .unwrap()
        .expect("row survives restart");
    assert_eq!(instance.version, "5.6.17-log");
    assert_eq!(instance.self_binlog_coordinates.log_file, "mysql-bin.000002");
    assert!(instance.is_last_check_valid);
}

#[test(tokio::test)]
async fn test_hostname_mapping_survives_restart() {
    let temp_dir = TempDir::new().unwrap();

    {
        let (topology, service) = create_file_service(&temp_dir);
        let server = topology.add_server(InstanceKey::new("db1", 3306));
        server.set_reported_hostname("db1a");
        service
            .read_topology_instance(&InstanceKey::new("db1", 3306))
            .await
            .unwrap();
    }

    let (_, service) = create_file_service(&temp_dir);
    service.resolver().load().await.unwrap();
    assert_eq!(service.resolver().resolve("db1"), "db1a");
}

#[test(tokio::test)]
async fn test_forget_survives_restart() {
    let temp_dir = TempDir::new().unwrap();
    let key = InstanceKey::new("db1", 3306);

    {
        let (topology, service) = create_file_service(&temp_dir);
        topology.add_server(key.clone());
        service.read_topology_instance(&key).await.unwrap();
        assert!(service.store().forget_instance(&key).await.unwrap());
    }

    let (_, service) = create_file_service(&temp_dir);
    assert!(service.store().read_instance(&key).await.unwrap().is_none());
}
