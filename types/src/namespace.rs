// Copyright (c) Aptos
// SPDX-License-Identifier: Apache-2.0

use serde::{Deserialize, Serialize};
use std::fmt;

/// Identity of the namespace a journal belongs to. Written once at format
/// time and immutable afterwards; every request carrying a `NamespaceInfo`
/// must match the persisted one exactly or be rejected.
#[derive(Clone, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
pub struct NamespaceInfo {
    pub namespace_id: u64,
    pub cluster_id: String,
    pub block_pool_id: String,
    pub creation_time: u64,
    pub layout_version: i32,
}

impl fmt::Display for NamespaceInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "ns:{};cid:{};bpid:{};lv:{}",
            self.namespace_id, self.cluster_id, self.block_pool_id, self.layout_version
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_carries_identity_fields() {
        let ns = NamespaceInfo {
            namespace_id: 12345,
            cluster_id: "test-cluster".to_string(),
            block_pool_id: "BP-1".to_string(),
            creation_time: 0,
            layout_version: -64,
        };
        let rendered = ns.to_string();
        assert!(rendered.contains("12345"));
        assert!(rendered.contains("test-cluster"));
        assert!(rendered.contains("BP-1"));
    }
}
