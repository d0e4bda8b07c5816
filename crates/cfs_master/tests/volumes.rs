//! Volume lifecycle integration tests: creation with initial partitions,
//! rollback on replica failures, capacity updates and reclamation.

mod common;

use std::collections::HashSet;
use std::time::Duration;

use cfs_master::partition::PartitionStatus;
use cfs_master::scheduler;
use cfs_master::volume::VolStatus;
use cfs_master::MasterError;
use common::{
    data_addrs, data_heartbeat, meta_addrs, meta_heartbeat, register_nodes, single_master,
    test_config, NodeCall,
};

#[tokio::test]
async fn create_volume_spreads_replicas_across_node_sets() {
    let mut config = test_config();
    config.node_set_capacity = 1;
    config.initial_data_partitions = 3;
    let (master, _nodes) = single_master(config).await;
    register_nodes(&master, &data_addrs(4), &meta_addrs(3)).await;

    master.create_volume("vol1", 3, 0, 100).await.expect("create vol1");

    let view = master.volume_view("vol1").expect("volume view");
    assert_eq!(view.status, VolStatus::Normal);
    assert_eq!(view.capacity_gb, 100);
    assert_eq!(view.data_partitions.len(), 3);
    assert_eq!(view.meta_partitions.len(), 1);
    let mp = &view.meta_partitions[0];
    assert_eq!((mp.start, mp.end), (0, u64::MAX));

    for dp in &view.data_partitions {
        assert_eq!(dp.replicas.len(), 3);
        let hosts: HashSet<_> = dp.replicas.iter().map(|r| r.addr.clone()).collect();
        assert_eq!(hosts.len(), 3, "replicas of {} share a node", dp.partition_id);
        let sets: HashSet<_> = dp
            .replicas
            .iter()
            .map(|r| master.data_node_view(&r.addr).unwrap().node_set_id)
            .collect();
        assert_eq!(sets.len(), 3, "replicas of {} share a node set", dp.partition_id);
        assert_eq!(dp.status, PartitionStatus::ReadWrite);
    }

    // Every node hosts some replica: placement balances load.
    let topology = master.topology_view();
    assert!(topology.data_nodes.iter().all(|n| !n.partitions.is_empty()));
}

#[tokio::test]
async fn volume_creation_is_validated() {
    let (master, _nodes) = single_master(test_config()).await;
    register_nodes(&master, &data_addrs(3), &meta_addrs(3)).await;

    let err = master.create_volume("v!", 3, 0, 10).await.unwrap_err();
    assert!(matches!(err, MasterError::Validation(_)));
    let err = master.create_volume("vol1", 1, 0, 10).await.unwrap_err();
    assert!(matches!(err, MasterError::Validation(_)));

    master.create_volume("vol1", 3, 0, 10).await.unwrap();
    let err = master.create_volume("vol1", 3, 0, 10).await.unwrap_err();
    assert!(matches!(err, MasterError::Validation(_)));

    let err = master.create_volume("vol2", 5, 0, 10).await.unwrap_err();
    assert!(matches!(
        err,
        MasterError::InsufficientReplicas { need: 5, .. }
    ));
    assert!(master.cluster().volume("vol2").is_none(), "failed volume is rolled back");
}

#[tokio::test]
async fn partial_replica_failure_rolls_back_created_replicas() {
    let (master, nodes) = single_master(test_config()).await;
    let data = data_addrs(3);
    register_nodes(&master, &data, &meta_addrs(3)).await;
    master.create_volume("vol1", 3, 0, 10).await.unwrap();
    let before = master.cluster().partitions.data_partitions().len();

    nodes.clear_calls();
    nodes.fail(&data[2]);
    let err = master.create_data_partitions("vol1", 1).await.unwrap_err();
    assert!(matches!(err, MasterError::Internal(_)), "got {err:?}");
    assert_eq!(master.cluster().partitions.data_partitions().len(), before);

    let calls = nodes.calls();
    let created: Vec<_> = calls
        .iter()
        .filter_map(|c| match c {
            NodeCall::CreateData { addr, id } => Some((addr.clone(), *id)),
            _ => None,
        })
        .collect();
    assert_eq!(created.len(), 2);
    for (addr, id) in created {
        assert!(
            calls.contains(&NodeCall::DeleteData { addr, id }),
            "created replica was not cleaned up"
        );
    }

    nodes.heal(&data[2]);
    let ids = master.create_data_partitions("vol1", 2).await.unwrap();
    assert_eq!(ids.len(), 2);
    assert!(ids[0] < ids[1]);
}

#[tokio::test]
async fn capacity_only_grows_and_stats_are_capped() {
    let (master, _nodes) = single_master(test_config()).await;
    register_nodes(&master, &data_addrs(3), &meta_addrs(3)).await;
    master.create_volume("vol1", 3, 0, 10).await.unwrap();

    master.update_volume("vol1", 20).await.unwrap();
    let err = master.update_volume("vol1", 5).await.unwrap_err();
    assert!(matches!(err, MasterError::Validation(_)));
    assert_eq!(master.cluster().volume("vol1").unwrap().capacity_gb(), 20);

    let stat = master.volume_stat("vol1").unwrap();
    assert_eq!(stat.total_bytes, 20 << 30);
    assert_eq!(stat.used_bytes, 0);

    let err = master.update_volume("missing", 5).await.unwrap_err();
    assert!(matches!(err, MasterError::NotFound(_)));
}

#[tokio::test]
async fn deleted_volumes_are_reclaimed() {
    let (master, nodes) = single_master(test_config()).await;
    register_nodes(&master, &data_addrs(3), &meta_addrs(3)).await;
    master.create_volume("vol1", 3, 0, 10).await.unwrap();
    let dp_ids = master.cluster().volume("vol1").unwrap().data_partition_ids();

    master.mark_delete_volume("vol1").await.unwrap();
    assert_eq!(
        master.cluster().volume("vol1").unwrap().status(),
        VolStatus::MarkDelete
    );
    let err = master.create_data_partitions("vol1", 1).await.unwrap_err();
    assert!(matches!(err, MasterError::Validation(_)));

    let removed = scheduler::reclaim_deleted_volumes(&master).await.unwrap();
    assert_eq!(removed, 1);
    assert!(master.cluster().volume("vol1").is_none());
    for id in dp_ids {
        assert!(master.cluster().partitions.data_partition(id).is_none());
        assert!(nodes
            .calls()
            .iter()
            .any(|c| matches!(c, NodeCall::DeleteData { id: got, .. } if *got == id)));
    }
    for node in master.topology_view().data_nodes {
        assert!(node.partitions.is_empty());
    }
}

#[tokio::test]
async fn load_reports_checksum_disagreement() {
    let (master, nodes) = single_master(test_config()).await;
    let data = data_addrs(3);
    register_nodes(&master, &data, &meta_addrs(3)).await;
    master.create_volume("vol1", 3, 0, 10).await.unwrap();
    let id = master.cluster().volume("vol1").unwrap().data_partition_ids()[0];

    let report = master.load_data_partition(id).await.unwrap();
    assert!(report.consistent);
    assert_eq!(report.replicas.len(), 3);

    nodes.set_checksum(&data[1], id, 9999);
    let report = master.load_data_partition(id).await.unwrap();
    assert!(!report.consistent);

    let err = master.load_data_partition(4242).await.unwrap_err();
    assert!(matches!(err, MasterError::NotFound(_)));
}

#[tokio::test]
async fn auto_allocation_tops_up_until_disabled() {
    let (master, _nodes) = single_master(test_config()).await;
    register_nodes(&master, &data_addrs(3), &meta_addrs(3)).await;
    master.create_volume("vol1", 3, 0, 10).await.unwrap();
    let vol = master.cluster().volume("vol1").unwrap();
    assert_eq!(vol.data_partition_ids().len(), 1);

    master.set_auto_allocate(false).await.unwrap();
    assert_eq!(scheduler::auto_allocate_once(&master).await.unwrap(), 0);
    assert_eq!(vol.data_partition_ids().len(), 1);

    master.set_auto_allocate(true).await.unwrap();
    assert_eq!(scheduler::auto_allocate_once(&master).await.unwrap(), 1);
    assert_eq!(vol.data_partition_ids().len(), 2);
}

#[tokio::test]
async fn views_are_withheld_while_too_few_nodes_are_live() {
    let mut config = test_config();
    config.node_liveness_timeout = Duration::from_millis(100);
    let (master, _nodes) = single_master(config).await;
    let data = data_addrs(3);
    let meta = meta_addrs(3);
    register_nodes(&master, &data, &meta).await;
    master.create_volume("vol1", 3, 0, 10).await.unwrap();
    assert!(!master.volume_view("vol1").unwrap().withheld);

    tokio::time::sleep(Duration::from_millis(250)).await;
    master
        .handle_data_node_task_response(data_heartbeat(&data[0], 1, Vec::new()))
        .unwrap();
    for addr in &meta {
        master
            .handle_meta_node_task_response(meta_heartbeat(addr, 1, 10, Vec::new()))
            .unwrap();
    }
    scheduler::check_heartbeats(&master);

    let view = master.volume_view("vol1").unwrap();
    assert!(view.withheld);
    assert!(view.data_partitions.is_empty());
    assert_eq!(view.meta_partitions.len(), 1);

    let id = master.cluster().volume("vol1").unwrap().data_partition_ids()[0];
    assert_eq!(
        master.data_partition_view(id).unwrap().status,
        PartitionStatus::Unavailable
    );

    for addr in &data {
        master
            .handle_data_node_task_response(data_heartbeat(addr, 2, Vec::new()))
            .unwrap();
    }
    let view = master.volume_view("vol1").unwrap();
    assert!(!view.withheld);
    assert_eq!(view.data_partitions.len(), 1);
}
