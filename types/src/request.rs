// Copyright (c) Aptos
// SPDX-License-Identifier: Apache-2.0

use crate::{journal_id::JournalId, namespace::NamespaceInfo, Epoch};
use serde::{Deserialize, Serialize};

/// Common header stamped on every mutating RPC. The epoch fences stale
/// writers; the serial number orders requests within an epoch.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct RequestInfo {
    pub journal_id: JournalId,
    pub namespace: NamespaceInfo,
    pub epoch: Epoch,
    pub ipc_serial: u64,
}
