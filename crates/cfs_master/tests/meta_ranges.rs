//! Inode range splits across a volume's meta partitions.

mod common;

use std::time::Duration;

use cfs_master::scheduler;
use cfs_master::{Master, MasterError};
use common::{
    data_addrs, meta_addrs, meta_heartbeat, meta_report, register_nodes, single_master,
    test_config, NodeCall,
};

fn ranges(master: &Master, volume: &str) -> Vec<(u64, u64)> {
    let vol = master.cluster().volume(volume).unwrap();
    master
        .cluster()
        .partitions
        .meta_partitions_by_id(&vol.meta_partition_ids())
        .iter()
        .map(|mp| mp.range())
        .collect()
}

#[tokio::test]
async fn split_caps_highest_partition_and_tiles_the_space() {
    let (master, nodes) = single_master(test_config()).await;
    let meta = meta_addrs(3);
    register_nodes(&master, &data_addrs(3), &meta).await;
    master.create_volume("vol1", 3, 0, 10).await.unwrap();
    let first = master.cluster().volume("vol1").unwrap().meta_partition_ids()[0];
    assert_eq!(ranges(&master, "vol1"), vec![(0, u64::MAX)]);

    let second = master.update_inode_id_range("vol1", 1000).await.unwrap();
    assert!(second > first);
    assert_eq!(ranges(&master, "vol1"), vec![(0, 999), (1000, u64::MAX)]);
    for addr in &meta {
        assert!(nodes.calls().contains(&NodeCall::UpdateMetaRange {
            addr: addr.clone(),
            id: first,
            end: 999,
        }));
    }
    assert!(nodes
        .calls()
        .iter()
        .any(|c| matches!(c, NodeCall::CreateMeta { id, start: 1000, .. } if *id == second)));

    let err = master.update_inode_id_range("vol1", 500).await.unwrap_err();
    assert!(matches!(err, MasterError::InvalidRange(_)));
    let err = master.update_inode_id_range("vol1", 1000).await.unwrap_err();
    assert!(matches!(err, MasterError::InvalidRange(_)));
    assert_eq!(ranges(&master, "vol1").len(), 2);
}

#[tokio::test]
async fn split_point_must_clear_allocated_inodes() {
    let (master, _nodes) = single_master(test_config()).await;
    let meta = meta_addrs(3);
    register_nodes(&master, &data_addrs(3), &meta).await;
    master.create_volume("vol1", 3, 0, 10).await.unwrap();
    let mp_id = master.cluster().volume("vol1").unwrap().meta_partition_ids()[0];

    master
        .handle_meta_node_task_response(meta_heartbeat(&meta[0], 1, 10, vec![meta_report(mp_id, 5000)]))
        .unwrap();
    let err = master.update_inode_id_range("vol1", 3000).await.unwrap_err();
    assert!(matches!(err, MasterError::InvalidRange(_)));
    master.update_inode_id_range("vol1", 5001).await.unwrap();
    assert_eq!(ranges(&master, "vol1"), vec![(0, 5000), (5001, u64::MAX)]);

    let err = master.update_inode_id_range("missing", 10).await.unwrap_err();
    assert!(matches!(err, MasterError::NotFound(_)));
}

#[tokio::test]
async fn range_check_opens_partition_after_a_step_of_inodes() {
    let mut config = test_config();
    config.meta_inode_step = 100;
    let (master, _nodes) = single_master(config).await;
    let meta = meta_addrs(3);
    register_nodes(&master, &data_addrs(3), &meta).await;
    master.create_volume("vol1", 3, 0, 10).await.unwrap();
    let mp_id = master.cluster().volume("vol1").unwrap().meta_partition_ids()[0];

    master
        .handle_meta_node_task_response(meta_heartbeat(&meta[1], 1, 10, vec![meta_report(mp_id, 80)]))
        .unwrap();
    assert_eq!(scheduler::check_meta_partition_ranges(&master).await.unwrap(), 0);

    master
        .handle_meta_node_task_response(meta_heartbeat(&meta[1], 2, 10, vec![meta_report(mp_id, 150)]))
        .unwrap();
    assert_eq!(scheduler::check_meta_partition_ranges(&master).await.unwrap(), 1);
    assert_eq!(ranges(&master, "vol1"), vec![(0, 249), (250, u64::MAX)]);

    // The new highest partition has handed out nothing yet.
    assert_eq!(scheduler::check_meta_partition_ranges(&master).await.unwrap(), 0);
}

#[tokio::test]
async fn deleted_volume_cannot_split() {
    let (master, _nodes) = single_master(test_config()).await;
    register_nodes(&master, &data_addrs(3), &meta_addrs(3)).await;
    master.create_volume("vol1", 3, 0, 10).await.unwrap();
    master.mark_delete_volume("vol1").await.unwrap();

    let err = master.update_inode_id_range("vol1", 1000).await.unwrap_err();
    assert!(matches!(err, MasterError::Validation(_)));
    assert_eq!(scheduler::check_meta_partition_ranges(&master).await.unwrap(), 0);
}

#[tokio::test]
async fn overlapping_splits_tell_nodes_about_the_partition_they_capped() {
    let (master, nodes) = single_master(test_config()).await;
    let meta = meta_addrs(3);
    register_nodes(&master, &data_addrs(3), &meta).await;
    master.create_volume("vol1", 3, 0, 10).await.unwrap();
    nodes.slow_builds(Duration::from_millis(200));
    nodes.clear_calls();

    let (low, high) = tokio::join!(
        master.update_inode_id_range("vol1", 1000),
        master.update_inode_id_range("vol1", 2000),
    );
    assert!(low.is_ok() || high.is_ok());

    let ranges = ranges(&master, "vol1");
    assert_eq!(ranges.first().map(|r| r.0), Some(0));
    assert_eq!(ranges.last().map(|r| r.1), Some(u64::MAX));
    for pair in ranges.windows(2) {
        assert_eq!(pair[0].1 + 1, pair[1].0, "gap or overlap in {ranges:?}");
    }

    let updates: Vec<(u64, u64)> = nodes
        .calls()
        .into_iter()
        .filter_map(|c| match c {
            NodeCall::UpdateMetaRange { id, end, .. } => Some((id, end)),
            _ => None,
        })
        .collect();
    assert!(!updates.is_empty());
    for (id, end) in updates {
        let recorded = master.cluster().partitions.meta_partition(id).unwrap().range().1;
        assert_eq!(recorded, end, "meta partition {id} told end {end}, recorded {recorded}");
    }
}
