//! Replica migration off bad disks and retiring nodes.

mod common;

use std::time::Duration;

use cfs_master::scheduler;
use cfs_master::MasterError;
use common::{
    data_addrs, data_heartbeat, data_report, meta_addrs, register_nodes, single_master,
    test_config, NodeCall,
};

/// Three data nodes hosting ten partitions of `vol1`, plus an empty fourth
/// node to migrate onto. Returns the master, mock fleet and data addresses.
async fn cluster_with_spare_node() -> (
    std::sync::Arc<cfs_master::Master>,
    std::sync::Arc<common::MockNodeClient>,
    Vec<String>,
) {
    let mut config = test_config();
    config.initial_data_partitions = 10;
    let (master, nodes) = single_master(config).await;
    let data = data_addrs(4);
    register_nodes(&master, &data[..3], &meta_addrs(3)).await;
    master.create_volume("vol1", 3, 0, 100).await.unwrap();
    master.add_data_node(&data[3]).await.unwrap();
    (master, nodes, data)
}

fn disk_reports(ids: &[u64], bad: &[u64]) -> Vec<cfs_master::heartbeat::DataPartitionReport> {
    ids.iter()
        .map(|id| {
            let disk = if bad.contains(id) { "/data0" } else { "/data1" };
            data_report(*id, disk, false)
        })
        .collect()
}

#[tokio::test]
async fn bad_disk_partitions_move_to_spare_node() {
    let (master, nodes, data) = cluster_with_spare_node().await;
    let ids = master.cluster().volume("vol1").unwrap().data_partition_ids();
    assert_eq!(ids.len(), 10);
    master
        .handle_data_node_task_response(data_heartbeat(&data[1], 1, disk_reports(&ids, &[5, 9])))
        .unwrap();

    let moved = master.decommission_disk(&data[1], "/data0").await.unwrap();
    assert_eq!(moved, vec![5, 9]);

    let record = master.cluster().bad_partition_record(&data[1], "/data0").unwrap();
    assert_eq!(record.partition_ids, vec![5, 9]);
    assert!(record.pending.is_empty());

    for id in [5, 9] {
        let hosts = master.cluster().partitions.data_partition(id).unwrap().hosts();
        assert!(!hosts.contains(&data[1]));
        assert!(hosts.contains(&data[3]));
        assert_eq!(hosts.len(), 3);
        let calls = nodes.calls();
        assert!(calls.iter().any(|c| matches!(
            c,
            NodeCall::BuildData { addr, id: got, source } if addr == &data[3] && *got == id && source != &data[1]
        )));
        assert!(calls.contains(&NodeCall::DeleteData {
            addr: data[1].clone(),
            id
        }));
    }
    let node = master.cluster().topology.data_node(&data[1]).unwrap();
    assert!(node.disk_partitions("/data0").is_empty());
    assert!(!node.hosts_partition(5));
    assert!(master.cluster().topology.data_node(&data[3]).unwrap().hosts_partition(9));

    // A replica already gone is skipped.
    let again = master
        .decommission_data_partition(&data[1], 5, |_| {})
        .await
        .unwrap();
    assert_eq!(again, None);

    master.clear_bad_disk(&data[1], "/data0").await.unwrap();
    assert!(master.bad_partitions().is_empty());
    let err = master.clear_bad_disk(&data[1], "/data0").await.unwrap_err();
    assert!(matches!(err, MasterError::NotFound(_)));
}

#[tokio::test]
async fn failed_build_leaves_partition_untouched() {
    let (master, nodes, data) = cluster_with_spare_node().await;
    let ids = master.cluster().volume("vol1").unwrap().data_partition_ids();
    master
        .handle_data_node_task_response(data_heartbeat(&data[1], 1, disk_reports(&ids, &[5, 9])))
        .unwrap();
    nodes.fail(&data[3]);

    let before = master.cluster().partitions.data_partition(5).unwrap().hosts();
    let mut reported = false;
    let err = master
        .decommission_data_partition(&data[1], 5, |_| reported = true)
        .await
        .unwrap_err();
    assert!(matches!(err, MasterError::Internal(_)), "got {err:?}");
    assert!(reported);
    assert_eq!(master.cluster().partitions.data_partition(5).unwrap().hosts(), before);

    let err = master.decommission_disk(&data[1], "/data0").await.unwrap_err();
    match err {
        MasterError::DecommissionIncomplete { addr, remaining } => {
            assert_eq!(addr, data[1]);
            assert_eq!(remaining, vec![5, 9]);
        }
        other => panic!("unexpected error {other:?}"),
    }
    let record = master.cluster().bad_partition_record(&data[1], "/data0").unwrap();
    assert_eq!(record.pending, vec![5, 9]);

    // Retrying once the spare is reachable finishes the drain.
    nodes.heal(&data[3]);
    master.decommission_disk(&data[1], "/data0").await.unwrap();
    let record = master.cluster().bad_partition_record(&data[1], "/data0").unwrap();
    assert!(record.pending.is_empty());
}

#[tokio::test]
async fn no_spare_host_means_insufficient_replicas() {
    let (master, _nodes) = single_master(test_config()).await;
    let data = data_addrs(3);
    register_nodes(&master, &data, &meta_addrs(3)).await;
    master.create_volume("vol1", 3, 0, 10).await.unwrap();
    let id = master.cluster().volume("vol1").unwrap().data_partition_ids()[0];

    let err = master
        .decommission_data_partition(&data[0], id, |_| {})
        .await
        .unwrap_err();
    assert!(matches!(err, MasterError::InsufficientReplicas { need: 1, available: 0 }));
}

#[tokio::test]
async fn data_node_offline_drains_and_removes_node() {
    let (master, _nodes, data) = cluster_with_spare_node().await;

    master.data_node_offline(&data[0]).await.unwrap();

    let err = master.data_node_view(&data[0]).unwrap_err();
    assert!(matches!(err, MasterError::NotFound(_)));
    for dp in master.cluster().partitions.data_partitions() {
        let hosts = dp.hosts();
        assert!(!hosts.contains(&data[0]));
        assert!(hosts.contains(&data[3]));
    }
    assert_eq!(
        master.data_node_view(&data[3]).unwrap().partitions.len(),
        10
    );
    assert!(master
        .topology_view()
        .node_sets
        .iter()
        .all(|set| !set.data_nodes.contains(&data[0])));
}

#[tokio::test]
async fn meta_node_decommission_moves_meta_partitions() {
    let (master, nodes) = single_master(test_config()).await;
    let meta = meta_addrs(4);
    register_nodes(&master, &data_addrs(3), &meta[..3]).await;
    master.create_volume("vol1", 3, 0, 10).await.unwrap();
    master.add_meta_node(&meta[3]).await.unwrap();
    let mp_id = master.cluster().volume("vol1").unwrap().meta_partition_ids()[0];

    master.decommission_meta_node(&meta[0]).await.unwrap();

    assert!(master.meta_node_view(&meta[0]).is_err());
    let mp = master.meta_partition_view(mp_id).unwrap();
    let hosts: Vec<_> = mp.replicas.iter().map(|r| r.addr.clone()).collect();
    assert!(hosts.contains(&meta[3]));
    assert!(!hosts.contains(&meta[0]));
    assert_eq!((mp.start, mp.end), (0, u64::MAX));
    assert!(nodes.calls().iter().any(|c| matches!(
        c,
        NodeCall::BuildMeta { addr, id, .. } if addr == &meta[3] && *id == mp_id
    )));
}

#[tokio::test]
async fn overlapping_migrations_keep_the_recorded_replica() {
    let (master, nodes, data) = cluster_with_spare_node().await;
    let id = master.cluster().volume("vol1").unwrap().data_partition_ids()[0];
    nodes.slow_builds(Duration::from_millis(200));
    nodes.clear_calls();

    let (first, second) = tokio::join!(
        master.decommission_data_partition(&data[0], id, |_| {}),
        master.decommission_data_partition(&data[0], id, |_| {}),
    );
    let moved: Vec<String> = [first.unwrap(), second.unwrap()]
        .into_iter()
        .flatten()
        .collect();
    assert_eq!(moved, vec![data[3].clone()]);

    let hosts = master.cluster().partitions.data_partition(id).unwrap().hosts();
    assert!(hosts.contains(&data[3]));
    assert!(!hosts.contains(&data[0]));
    let calls = nodes.calls();
    for host in &hosts {
        assert!(
            !calls.contains(&NodeCall::DeleteData {
                addr: host.clone(),
                id
            }),
            "recorded replica on {host} was deleted"
        );
    }
    let builds = calls
        .iter()
        .filter(|c| matches!(c, NodeCall::BuildData { id: got, .. } if *got == id))
        .count();
    assert_eq!(builds, 1);
}

#[tokio::test]
async fn copy_source_skips_a_dead_leader() {
    let mut config = test_config();
    config.node_liveness_timeout = Duration::from_millis(100);
    config.live_ratio_threshold = 0.0;
    let (master, nodes) = single_master(config).await;
    let data = data_addrs(4);
    register_nodes(&master, &data[..3], &meta_addrs(3)).await;
    master.create_volume("vol1", 3, 0, 10).await.unwrap();
    master.add_data_node(&data[3]).await.unwrap();
    let id = master.cluster().volume("vol1").unwrap().data_partition_ids()[0];

    master
        .handle_data_node_task_response(data_heartbeat(&data[0], 1, vec![data_report(id, "/d", true)]))
        .unwrap();
    tokio::time::sleep(Duration::from_millis(250)).await;
    for addr in &data[1..] {
        master
            .handle_data_node_task_response(data_heartbeat(addr, 2, Vec::new()))
            .unwrap();
    }
    scheduler::check_heartbeats(&master);
    assert!(!master.data_node_view(&data[0]).unwrap().is_active);
    assert_eq!(
        master.data_partition_view(id).unwrap().leader_addr.as_deref(),
        Some(data[0].as_str())
    );

    let moved = master
        .decommission_data_partition(&data[1], id, |_| {})
        .await
        .unwrap();
    assert_eq!(moved.as_deref(), Some(data[3].as_str()));
    assert!(nodes.calls().contains(&NodeCall::BuildData {
        addr: data[3].clone(),
        id,
        source: data[2].clone(),
    }));
}
