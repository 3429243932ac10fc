// Copyright (c) Aptos
// SPDX-License-Identifier: Apache-2.0

//! End-to-end tests against an in-process cluster of real journal nodes:
//! RPC over TCP, segments on disk, recovery fetches over HTTP.

use journal_config::QuorumJournalConfig;
use journal_node::test_utils::MiniJournalCluster;
use journal_types::{JournalId, NamespaceInfo};
use quorum_journal::{QuorumError, QuorumJournalManager};
use std::fs;

const JID: &str = "edits";

fn test_namespace() -> NamespaceInfo {
    NamespaceInfo {
        namespace_id: 12345,
        cluster_id: "test-cluster".to_string(),
        block_pool_id: "BP-40-50".to_string(),
        creation_time: 0,
        layout_version: -64,
    }
}

fn manager_for(cluster: &MiniJournalCluster) -> QuorumJournalManager {
    let config = QuorumJournalConfig::with_peers(cluster.rpc_addrs());
    QuorumJournalManager::new(config, JournalId::new(JID), test_namespace())
}

/// Counts cluster nodes holding `file_name` with exactly `contents`.
fn nodes_with_file(cluster: &MiniJournalCluster, file_name: &str, contents: &[u8]) -> usize {
    (0..cluster.num_nodes())
        .filter(|index| {
            let path = cluster.journal_current_dir(*index, JID).join(file_name);
            fs::read(path).map(|bytes| bytes == contents).unwrap_or(false)
        })
        .count()
}

#[tokio::test]
async fn write_and_finalize_through_a_quorum() {
    let cluster = MiniJournalCluster::start(3).await;
    let mut manager = manager_for(&cluster);

    manager.format().await.unwrap();
    manager.establish_epoch(1).await.unwrap();
    assert_eq!(manager.recover_unfinalized_segments().await.unwrap(), None);

    let mut writer = manager.start_log_segment(1).await.unwrap();
    assert_eq!(writer.write(b"hello"), 1);
    assert_eq!(writer.write(b" world"), 2);
    writer.set_ready_to_flush();
    writer.flush().await.unwrap();
    drop(writer);

    manager.finalize_log_segment(1, 2).await.unwrap();

    // The flush needed a quorum; with all three nodes healthy everyone
    // converges, but only a strict majority is guaranteed.
    let name = "edits_0000000000000000001-0000000000000000002";
    assert!(nodes_with_file(&cluster, name, b"hello world") >= 2);
}

#[tokio::test]
async fn ops_keep_flowing_while_a_flush_is_in_flight() {
    let cluster = MiniJournalCluster::start(3).await;
    let mut manager = manager_for(&cluster);
    manager.format().await.unwrap();
    manager.establish_epoch(1).await.unwrap();

    let mut writer = manager.start_log_segment(1).await.unwrap();
    writer.write(b"aa");
    writer.set_ready_to_flush();
    // New ops land in `current` while `ready` awaits its quorum.
    writer.write(b"bb");
    writer.flush().await.unwrap();
    writer.set_ready_to_flush();
    writer.flush().await.unwrap();
    drop(writer);

    manager.finalize_log_segment(1, 2).await.unwrap();
    let name = "edits_0000000000000000001-0000000000000000002";
    assert!(nodes_with_file(&cluster, name, b"aabb") >= 2);
}

#[tokio::test]
async fn recovery_finalizes_the_tail_after_a_writer_crash() {
    let cluster = MiniJournalCluster::start(3).await;
    {
        let mut crashed = manager_for(&cluster);
        crashed.format().await.unwrap();
        crashed.establish_epoch(1).await.unwrap();
        let mut writer = crashed.start_log_segment(1).await.unwrap();
        writer.write(b"aa");
        writer.write(b"bb");
        writer.write(b"cc");
        writer.set_ready_to_flush();
        writer.flush().await.unwrap();
        // The writer dies without finalizing the segment.
    }

    let mut manager = manager_for(&cluster);
    let epoch = manager.establish_next_epoch().await.unwrap();
    assert_eq!(epoch, 2);
    let next_txid = manager.recover_unfinalized_segments().await.unwrap();
    assert_eq!(next_txid, Some(4));

    let name = "edits_0000000000000000001-0000000000000000003";
    assert!(nodes_with_file(&cluster, name, b"aabbcc") >= 2);

    // The new writer continues at the next txid.
    let writer_txid = next_txid.unwrap();
    let mut writer = manager.start_log_segment(writer_txid).await.unwrap();
    assert_eq!(writer.write(b"dd"), 4);
    writer.set_ready_to_flush();
    writer.flush().await.unwrap();
}

#[tokio::test]
async fn a_fenced_writer_cannot_flush() {
    let cluster = MiniJournalCluster::start(3).await;
    let mut old_writer = manager_for(&cluster);
    old_writer.format().await.unwrap();
    old_writer.establish_epoch(1).await.unwrap();
    let mut segment = old_writer.start_log_segment(1).await.unwrap();
    segment.write(b"aa");
    segment.set_ready_to_flush();
    segment.flush().await.unwrap();

    // A new leader takes over.
    let mut new_writer = manager_for(&cluster);
    new_writer.establish_epoch(2).await.unwrap();
    new_writer.recover_unfinalized_segments().await.unwrap();

    // Every peer now rejects the old epoch; the flush fails as a quorum
    // failure and the writer is broken for good.
    segment.write(b"bb");
    segment.set_ready_to_flush();
    let err = segment.flush().await.unwrap_err();
    assert!(matches!(err, QuorumError::QuorumFailed(_)));
    let err = segment.flush().await.unwrap_err();
    assert!(matches!(err, QuorumError::QuorumFailed(_)));
}

#[tokio::test]
async fn recovery_is_idempotent_when_the_tail_is_already_finalized() {
    let cluster = MiniJournalCluster::start(3).await;
    let mut manager = manager_for(&cluster);
    manager.format().await.unwrap();
    manager.establish_epoch(1).await.unwrap();
    let mut writer = manager.start_log_segment(1).await.unwrap();
    writer.write(b"aa");
    writer.set_ready_to_flush();
    writer.flush().await.unwrap();
    drop(writer);
    manager.finalize_log_segment(1, 1).await.unwrap();

    // A later epoch still sees the segment and re-finalizes it in place.
    let mut manager = manager_for(&cluster);
    manager.establish_epoch(2).await.unwrap();
    let next_txid = manager.recover_unfinalized_segments().await.unwrap();
    assert_eq!(next_txid, Some(2));

    let name = "edits_0000000000000000001-0000000000000000001";
    assert!(nodes_with_file(&cluster, name, b"aa") >= 2);
}
