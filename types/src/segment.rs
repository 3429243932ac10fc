// Copyright (c) Aptos
// SPDX-License-Identifier: Apache-2.0

use crate::TxId;
use serde::{Deserialize, Serialize};
use std::fmt;

const IN_PROGRESS_PREFIX: &str = "edits_inprogress_";
const FINALIZED_PREFIX: &str = "edits_";

/// Description of one segment as reported across the wire. `end_txid` is the
/// highest transaction the segment holds; for an in-progress segment that is
/// the highest durably written so far. `len_bytes` is the exact byte length
/// of the segment file, carried so that a recovery fetch can be verified
/// against the agreed value.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct SegmentInfo {
    pub start_txid: TxId,
    pub end_txid: TxId,
    pub len_bytes: u64,
    pub is_in_progress: bool,
}

impl SegmentInfo {
    /// Name of the file backing this segment on the node that reported it.
    pub fn file_name(&self) -> String {
        if self.is_in_progress {
            in_progress_name(self.start_txid)
        } else {
            finalized_name(self.start_txid, self.end_txid)
        }
    }

    pub fn num_txns(&self) -> u64 {
        self.end_txid - self.start_txid + 1
    }
}

impl fmt::Display for SegmentInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}-{}{}, {} bytes]",
            self.start_txid,
            self.end_txid,
            if self.is_in_progress { " (in-progress)" } else { "" },
            self.len_bytes
        )
    }
}

/// `edits_inprogress_<startTxId>`, unpadded.
pub fn in_progress_name(start_txid: TxId) -> String {
    format!("{}{}", IN_PROGRESS_PREFIX, start_txid)
}

/// `edits_<start>-<end>`, both txids zero-padded to 19 digits. These names
/// are canonical and appear verbatim in HTTP `filename` parameters.
pub fn finalized_name(start_txid: TxId, end_txid: TxId) -> String {
    format!("{}{:019}-{:019}", FINALIZED_PREFIX, start_txid, end_txid)
}

/// Parses a segment file name back into `(start, Some(end))` for finalized
/// files or `(start, None)` for in-progress files. Anything else is `None`.
pub fn parse_segment_file_name(name: &str) -> Option<(TxId, Option<TxId>)> {
    if let Some(rest) = name.strip_prefix(IN_PROGRESS_PREFIX) {
        return rest.parse::<TxId>().ok().map(|start| (start, None));
    }
    let rest = name.strip_prefix(FINALIZED_PREFIX)?;
    let mut parts = rest.splitn(2, '-');
    let start = parts.next()?.parse::<TxId>().ok()?;
    let end = parts.next()?.parse::<TxId>().ok()?;
    Some((start, Some(end)))
}
