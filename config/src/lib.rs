// Copyright (c) Aptos
// SPDX-License-Identifier: Apache-2.0

pub mod utils;

use serde::{Deserialize, Serialize};
use std::{
    net::{IpAddr, Ipv4Addr, SocketAddr},
    path::PathBuf,
};

/// Per-peer bound on bytes of edits queued but not yet acknowledged. Sends
/// beyond this fail fast instead of blocking the writer thread.
pub const DEFAULT_OUTPUT_BUFFER_CAPACITY_BYTES: usize = 10 << 20;

/// Default deadline for a single journal RPC.
pub const DEFAULT_RPC_TIMEOUT_MS: u64 = 20_000;

/// Default deadline for fetching segment bytes from a peer over HTTP.
pub const DEFAULT_HTTP_TIMEOUT_MS: u64 = 30_000;

#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct JournalNodeConfig {
    /// Address the RPC server binds. Port 0 binds an ephemeral port.
    pub rpc_address: SocketAddr,
    /// Address the segment file server binds.
    pub http_address: SocketAddr,
    /// Root directory; each journal lives under `<journal_dir>/<jid>/`.
    pub journal_dir: PathBuf,
    /// Deadline for pulling segment bytes from a peer during recovery.
    pub http_timeout_ms: u64,
}

impl Default for JournalNodeConfig {
    fn default() -> JournalNodeConfig {
        JournalNodeConfig {
            rpc_address: SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 8485),
            http_address: SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 8480),
            journal_dir: PathBuf::from("journal"),
            http_timeout_ms: DEFAULT_HTTP_TIMEOUT_MS,
        }
    }
}

impl JournalNodeConfig {
    pub fn randomize_ports(&mut self) {
        self.rpc_address.set_port(utils::get_available_port());
        self.http_address.set_port(utils::get_available_port());
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct QuorumJournalConfig {
    /// RPC addresses of the journal nodes. The set is fixed for the life of
    /// the client; a strict majority of it forms a quorum.
    pub peers: Vec<SocketAddr>,
    pub rpc_timeout_ms: u64,
    /// See [`DEFAULT_OUTPUT_BUFFER_CAPACITY_BYTES`].
    pub output_buffer_capacity_bytes: usize,
}

impl Default for QuorumJournalConfig {
    fn default() -> QuorumJournalConfig {
        QuorumJournalConfig {
            peers: vec![],
            rpc_timeout_ms: DEFAULT_RPC_TIMEOUT_MS,
            output_buffer_capacity_bytes: DEFAULT_OUTPUT_BUFFER_CAPACITY_BYTES,
        }
    }
}

impl QuorumJournalConfig {
    pub fn with_peers(peers: Vec<SocketAddr>) -> QuorumJournalConfig {
        QuorumJournalConfig {
            peers,
            ..Default::default()
        }
    }

    /// Size of a strict majority of the peer set.
    pub fn quorum_size(&self) -> usize {
        self.peers.len() / 2 + 1
    }
}
