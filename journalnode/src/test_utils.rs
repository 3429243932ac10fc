// Copyright (c) Aptos
// SPDX-License-Identifier: Apache-2.0

//! In-process cluster of journal nodes on ephemeral ports, for integration
//! tests of the quorum client.

use crate::node::{JournalNode, JournalNodeHandle};
use journal_config::JournalNodeConfig;
use std::{net::SocketAddr, path::PathBuf, sync::Arc};

pub struct MiniJournalCluster {
    nodes: Vec<MiniNode>,
}

struct MiniNode {
    node: Arc<JournalNode>,
    handle: JournalNodeHandle,
    dir: tempfile::TempDir,
}

impl MiniJournalCluster {
    pub async fn start(num_nodes: usize) -> MiniJournalCluster {
        let mut nodes = Vec::with_capacity(num_nodes);
        for _ in 0..num_nodes {
            let dir = tempfile::tempdir().expect("cannot create journal dir");
            let mut config = JournalNodeConfig::default();
            config.rpc_address.set_port(0);
            config.http_address.set_port(0);
            config.journal_dir = dir.path().to_path_buf();
            let node = Arc::new(JournalNode::new(config));
            let handle = node.start().await.expect("journal node failed to start");
            nodes.push(MiniNode { node, handle, dir });
        }
        MiniJournalCluster { nodes }
    }

    pub fn num_nodes(&self) -> usize {
        self.nodes.len()
    }

    pub fn rpc_addrs(&self) -> Vec<SocketAddr> {
        self.nodes.iter().map(|node| node.handle.rpc_addr).collect()
    }

    pub fn node(&self, index: usize) -> &Arc<JournalNode> {
        &self.nodes[index].node
    }

    pub fn http_addr(&self, index: usize) -> SocketAddr {
        self.nodes[index].handle.http_addr
    }

    /// `<journal_dir>/<jid>/current` of one node, for on-disk assertions.
    pub fn journal_current_dir(&self, index: usize, jid: &str) -> PathBuf {
        self.nodes[index]
            .dir
            .path()
            .join(jid)
            .join(crate::storage::CURRENT_DIR)
    }

    pub fn shutdown(&self) {
        for node in &self.nodes {
            node.handle.shutdown();
        }
    }
}

impl Drop for MiniJournalCluster {
    fn drop(&mut self) {
        self.shutdown();
    }
}
