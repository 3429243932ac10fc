// Copyright (c) Aptos
// SPDX-License-Identifier: Apache-2.0

//! Writer-side buffering for one open segment. Two buffers: `current`
//! accepts new ops while `ready` holds a frozen batch awaiting its quorum
//! flush, so ops keep flowing during a flush without gaps or reordering.

use crate::{error::QuorumError, manager::QuorumJournalManager};
use journal_types::TxId;
use tracing::debug;

#[derive(Default)]
struct TxnBuffer {
    first_txid: Option<TxId>,
    num_txns: u32,
    data: Vec<u8>,
}

impl TxnBuffer {
    fn is_empty(&self) -> bool {
        self.num_txns == 0
    }

    fn write(&mut self, txid: TxId, op: &[u8]) {
        if self.first_txid.is_none() {
            self.first_txid = Some(txid);
        }
        self.num_txns += 1;
        self.data.extend_from_slice(op);
    }
}

pub struct SegmentWriter<'a> {
    manager: &'a QuorumJournalManager,
    start_txid: TxId,
    next_txid: TxId,
    current: TxnBuffer,
    ready: TxnBuffer,
    broken: bool,
}

impl<'a> SegmentWriter<'a> {
    pub(crate) fn new(manager: &'a QuorumJournalManager, start_txid: TxId) -> SegmentWriter<'a> {
        SegmentWriter {
            manager,
            start_txid,
            next_txid: start_txid,
            current: TxnBuffer::default(),
            ready: TxnBuffer::default(),
            broken: false,
        }
    }

    pub fn start_txid(&self) -> TxId {
        self.start_txid
    }

    /// Txid the next `write` will be assigned.
    pub fn next_txid(&self) -> TxId {
        self.next_txid
    }

    /// Appends one opaque op to the local buffer and returns its txid.
    /// Never touches the network.
    pub fn write(&mut self, op: &[u8]) -> TxId {
        assert!(!self.broken, "segment writer is broken");
        let txid = self.next_txid;
        self.next_txid += 1;
        self.current.write(txid, op);
        txid
    }

    /// Freezes `current` for the next flush. The previous batch must have
    /// been flushed already.
    pub fn set_ready_to_flush(&mut self) {
        assert!(
            self.ready.is_empty(),
            "cannot freeze a new batch while one is awaiting flush"
        );
        std::mem::swap(&mut self.current, &mut self.ready);
    }

    /// Sends the frozen batch to every peer and waits for a quorum of acks.
    /// A quorum failure breaks the writer for good: the segment can only be
    /// repaired by a new epoch running recovery.
    pub async fn flush(&mut self) -> Result<(), QuorumError> {
        if self.broken {
            return Err(QuorumError::QuorumFailed(
                "segment writer already failed; the epoch must be abandoned".to_string(),
            ));
        }
        let first_txid = match self.ready.first_txid {
            Some(first_txid) => first_txid,
            None => return Ok(()),
        };
        debug!(
            first_txid,
            num_txns = self.ready.num_txns,
            bytes = self.ready.data.len(),
            "flushing batch"
        );
        match self
            .manager
            .send_edits(first_txid, self.ready.num_txns, &self.ready.data)
            .await
        {
            Ok(()) => {
                self.ready = TxnBuffer::default();
                Ok(())
            }
            Err(err) => {
                self.broken = true;
                Err(err)
            }
        }
    }
}
