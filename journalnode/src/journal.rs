// Copyright (c) Aptos
// SPDX-License-Identifier: Apache-2.0

//! One journal: an epoch-fenced, fsync-disciplined edit log plus the paxos
//! acceptor role used to recover its unfinalized tail after a writer change.
//!
//! All operations run under the owning node's per-journal lock. Any state
//! transition another process can observe is durable before the method
//! returns.

use crate::storage::{
    JournalStorage, LastWritten, LAST_PROMISED_EPOCH_FILE, LAST_WRITER_EPOCH_FILE,
};
use journal_types::{
    protocol::{
        AcceptedRecovery, GetJournalStateResponse, NewEpochResponse, PrepareRecoveryResponse,
    },
    Epoch, JournalError, JournalId, NamespaceInfo, RequestInfo, SegmentInfo, TxId,
};
use std::{
    fs::{self, OpenOptions},
    io::Write,
    path::PathBuf,
};
use tracing::{debug, info, warn};

struct OpenSegment {
    start_txid: TxId,
    file: fs::File,
}

pub struct Journal {
    journal_id: JournalId,
    storage: JournalStorage,
    namespace: Option<NamespaceInfo>,
    last_promised_epoch: Epoch,
    last_writer_epoch: Epoch,
    last_written: LastWritten,
    cur_segment: Option<OpenSegment>,
    /// Next txid expected by `journal()`. Meaningful only while a segment
    /// is open.
    next_txid: TxId,
    http_port: u16,
    /// Set when an accepted recovery record disagrees with the on-disk
    /// segment (crash between persisting the record and installing the
    /// file). The owner re-fetches from the recorded source; until then the
    /// record stays authoritative for prepareRecovery.
    needs_sync: Option<AcceptedRecovery>,
}

impl Journal {
    pub fn open<P: Into<PathBuf>>(
        journal_id: JournalId,
        root: P,
        http_port: u16,
    ) -> Result<Journal, JournalError> {
        let storage = JournalStorage::new(root);
        let mut journal = Journal {
            journal_id,
            storage,
            namespace: None,
            last_promised_epoch: 0,
            last_writer_epoch: 0,
            last_written: LastWritten::default(),
            cur_segment: None,
            next_txid: 0,
            http_port,
            needs_sync: None,
        };
        if journal.storage.is_formatted() {
            journal.namespace = Some(journal.storage.read_namespace()?);
            journal.last_promised_epoch = journal.storage.read_u64(LAST_PROMISED_EPOCH_FILE)?;
            journal.last_writer_epoch = journal.storage.read_u64(LAST_WRITER_EPOCH_FILE)?;
            journal.last_written = journal.storage.read_last_written()?;
            journal.recover_after_restart()?;
            info!(
                journal = %journal.journal_id,
                last_promised_epoch = journal.last_promised_epoch,
                last_writer_epoch = journal.last_writer_epoch,
                highest_written_txid = journal.last_written.highest_txid,
                "opened journal"
            );
        }
        Ok(journal)
    }

    /// Restart housekeeping: drop torn in-progress tails that were never
    /// acknowledged, and flag accepted recovery records whose segment bytes
    /// did not make it to disk.
    fn recover_after_restart(&mut self) -> Result<(), JournalError> {
        if let Some(segment) = self
            .storage
            .scan_segments()?
            .into_iter()
            .filter(|segment| segment.end_txid.is_none())
            .last()
        {
            self.scrub_in_progress(segment.start_txid)?;
        }

        for segment_txid in self.storage.scan_paxos_records()? {
            let record = match self.storage.read_paxos_record(segment_txid)? {
                Some(record) => record,
                None => continue,
            };
            let on_disk = self.storage.find_segment(segment_txid)?;
            let matches = match &on_disk {
                Some(found) if found.end_txid.is_some() => true,
                Some(found) => found.len_bytes == record.segment.len_bytes,
                None => false,
            };
            if !matches {
                warn!(
                    journal = %self.journal_id,
                    segment_txid,
                    accepted_in_epoch = record.accepted_in_epoch,
                    "accepted recovery record does not match disk; will re-sync from {}",
                    record.from_url
                );
                self.needs_sync = Some(record);
            }
        }
        Ok(())
    }

    /// Truncates the in-progress segment back to its last acknowledged
    /// length. Bytes past that point belong to writes that never completed.
    fn scrub_in_progress(&mut self, start_txid: TxId) -> Result<(), JournalError> {
        let path = self.storage.in_progress_path(start_txid);
        if !path.exists() {
            return Ok(());
        }
        let len = fs::metadata(&path)?.len();
        let durable = self.last_written.cur_segment_len;
        if len > durable {
            warn!(
                journal = %self.journal_id,
                segment_txid = start_txid,
                file_len = len,
                durable_len = durable,
                "truncating unacknowledged segment tail"
            );
            let file = OpenOptions::new().write(true).open(&path)?;
            file.set_len(durable)?;
            file.sync_all()?;
        }
        Ok(())
    }

    pub fn is_formatted(&self) -> bool {
        self.namespace.is_some()
    }

    pub fn namespace(&self) -> Option<&NamespaceInfo> {
        self.namespace.as_ref()
    }

    pub fn last_promised_epoch(&self) -> Epoch {
        self.last_promised_epoch
    }

    pub fn needs_sync(&self) -> Option<&AcceptedRecovery> {
        self.needs_sync.as_ref()
    }

    pub fn format(&mut self, namespace: NamespaceInfo) -> Result<(), JournalError> {
        self.storage.format(&namespace)?;
        self.namespace = Some(namespace);
        self.last_promised_epoch = 0;
        self.last_writer_epoch = 0;
        self.last_written = LastWritten::default();
        self.cur_segment = None;
        self.needs_sync = None;
        Ok(())
    }

    pub fn get_journal_state(&self) -> Result<GetJournalStateResponse, JournalError> {
        self.check_formatted()?;
        Ok(GetJournalStateResponse {
            last_promised_epoch: self.last_promised_epoch,
            http_port: self.http_port,
        })
    }

    pub fn new_epoch(
        &mut self,
        namespace: &NamespaceInfo,
        proposed_epoch: Epoch,
    ) -> Result<NewEpochResponse, JournalError> {
        self.check_formatted()?;
        self.check_namespace(namespace)?;
        if proposed_epoch <= self.last_promised_epoch {
            return Err(JournalError::EpochTooLow {
                requested: proposed_epoch,
                promised: self.last_promised_epoch,
            });
        }
        self.update_promise(proposed_epoch)?;
        self.abort_cur_segment();
        let last_segment_txid = self.storage.latest_segment_start()?;
        info!(
            journal = %self.journal_id,
            epoch = proposed_epoch,
            ?last_segment_txid,
            "promised new epoch"
        );
        Ok(NewEpochResponse { last_segment_txid })
    }

    pub fn start_log_segment(&mut self, req: &RequestInfo, txid: TxId) -> Result<(), JournalError> {
        self.check_request(req)?;
        if txid == 0 {
            return Err(JournalError::SegmentState(
                "segment start txid must be positive".to_string(),
            ));
        }
        if let Some(cur) = &self.cur_segment {
            if cur.start_txid == txid && self.last_writer_epoch == req.epoch {
                info!(
                    journal = %self.journal_id,
                    segment_txid = txid,
                    "segment already open, treating startLogSegment as a retry"
                );
                return Ok(());
            }
            return Err(JournalError::SegmentState(format!(
                "segment {} is already open; cannot start segment {}",
                cur.start_txid, txid
            )));
        }
        if let Some(found) = self.storage.find_segment(txid)? {
            match found.end_txid {
                Some(end) => {
                    return Err(JournalError::SegmentState(format!(
                        "segment starting at txid {} is already finalized up to {}",
                        txid, end
                    )));
                }
                None => warn!(
                    journal = %self.journal_id,
                    segment_txid = txid,
                    len_bytes = found.len_bytes,
                    "overwriting stale in-progress segment from a previous writer"
                ),
            }
        }

        let path = self.storage.in_progress_path(txid);
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)?;
        file.sync_all()?;
        self.storage.sync_current_dir()?;
        if self.last_writer_epoch != req.epoch {
            self.storage.write_u64(LAST_WRITER_EPOCH_FILE, req.epoch)?;
            self.last_writer_epoch = req.epoch;
        }
        self.last_written.cur_segment_len = 0;
        self.storage.write_last_written(self.last_written)?;
        self.cur_segment = Some(OpenSegment {
            start_txid: txid,
            file,
        });
        self.next_txid = txid;
        info!(
            journal = %self.journal_id,
            segment_txid = txid,
            epoch = req.epoch,
            "started log segment"
        );
        Ok(())
    }

    pub fn journal(
        &mut self,
        req: &RequestInfo,
        first_txid: TxId,
        num_txns: u32,
        payload: &[u8],
    ) -> Result<(), JournalError> {
        self.check_write_request(req)?;
        if num_txns == 0 {
            return Err(JournalError::SegmentState(
                "batch contains no transactions".to_string(),
            ));
        }
        let next_txid = self.next_txid;
        let cur = self.cur_segment.as_mut().ok_or_else(|| {
            JournalError::SegmentState("can't write, no segment open".to_string())
        })?;
        if first_txid != next_txid {
            return Err(JournalError::OutOfSync {
                expected: next_txid,
                actual: first_txid,
            });
        }

        cur.file.write_all(payload)?;
        cur.file.sync_data()?;
        let highest = first_txid + num_txns as u64 - 1;
        let marker = LastWritten {
            highest_txid: highest,
            cur_segment_len: self.last_written.cur_segment_len + payload.len() as u64,
        };
        self.storage.write_last_written(marker)?;
        self.last_written = marker;
        self.next_txid = highest + 1;
        debug!(
            journal = %self.journal_id,
            first_txid,
            num_txns,
            bytes = payload.len(),
            "journaled batch"
        );
        Ok(())
    }

    pub fn finalize_log_segment(
        &mut self,
        req: &RequestInfo,
        start_txid: TxId,
        end_txid: TxId,
    ) -> Result<(), JournalError> {
        self.check_write_request(req)?;
        if end_txid < start_txid {
            return Err(JournalError::SegmentState(format!(
                "cannot finalize segment {} with end txid {} before its start",
                start_txid, end_txid
            )));
        }
        if let Some(found) = self.storage.find_segment(start_txid)? {
            if let Some(found_end) = found.end_txid {
                if found_end == end_txid {
                    // Retry of a finalize that already completed. A stale
                    // in-progress twin (e.g. re-installed by a recovery
                    // accept) is swept out.
                    let cur_is_this = self
                        .cur_segment
                        .as_ref()
                        .map(|cur| cur.start_txid == start_txid)
                        .unwrap_or(false);
                    let stale = self.storage.in_progress_path(start_txid);
                    if !cur_is_this && stale.exists() {
                        fs::remove_file(&stale)?;
                        self.storage.sync_current_dir()?;
                    }
                    return Ok(());
                }
                return Err(JournalError::SegmentState(format!(
                    "segment {} is already finalized up to {}, refusing end txid {}",
                    start_txid, found_end, end_txid
                )));
            }
        } else {
            return Err(JournalError::SegmentState(format!(
                "no segment starting at txid {}",
                start_txid
            )));
        }

        match self.cur_segment.as_ref().map(|cur| cur.start_txid) {
            Some(open_start) if open_start == start_txid => {
                if let Some(open) = self.cur_segment.take() {
                    open.file.sync_all()?;
                }
            }
            Some(open_start) => {
                return Err(JournalError::SegmentState(format!(
                    "cannot finalize segment {} while segment {} is open",
                    start_txid, open_start
                )));
            }
            None => {}
        }

        let highest = self.last_written.highest_txid;
        if highest != end_txid {
            return Err(JournalError::SegmentState(format!(
                "trying to finalize segment {}-{} but only written up to txid {}",
                start_txid, end_txid, highest
            )));
        }

        fs::rename(
            self.storage.in_progress_path(start_txid),
            self.storage.finalized_path(start_txid, end_txid),
        )?;
        self.storage.sync_current_dir()?;
        // The paxos decision for this segment, if any, is complete.
        self.storage.remove_paxos_record(start_txid)?;
        info!(
            journal = %self.journal_id,
            start_txid,
            end_txid,
            "finalized log segment"
        );
        Ok(())
    }

    pub fn prepare_recovery(
        &mut self,
        req: &RequestInfo,
        segment_txid: TxId,
    ) -> Result<PrepareRecoveryResponse, JournalError> {
        self.check_paxos_request(req)?;
        self.abort_cur_segment();
        self.scrub_in_progress(segment_txid)?;
        let accepted = self.storage.read_paxos_record(segment_txid)?;
        let segment = self.scan_segment_info(segment_txid)?;
        let response = PrepareRecoveryResponse {
            segment,
            accepted,
            last_writer_epoch: self.last_writer_epoch,
        };
        info!(
            journal = %self.journal_id,
            segment_txid,
            epoch = req.epoch,
            segment = ?response.segment,
            accepted_in_epoch = ?response.accepted.as_ref().map(|a| a.accepted_in_epoch),
            "prepared recovery"
        );
        Ok(response)
    }

    /// Paxos accept: install the fetched bytes as the definitive in-progress
    /// segment. `bytes` were already pulled from `from_url` by the caller;
    /// write order here is temp file, paxos record, rename, directory fsync.
    pub fn accept_recovery(
        &mut self,
        req: &RequestInfo,
        segment: &SegmentInfo,
        from_url: &str,
        bytes: &[u8],
    ) -> Result<(), JournalError> {
        self.check_paxos_request(req)?;
        if segment.end_txid < segment.start_txid {
            return Err(JournalError::SegmentState(format!(
                "recovery value {} is not a valid segment",
                segment
            )));
        }
        if let Some(previous) = self.storage.read_paxos_record(segment.start_txid)? {
            if previous.accepted_in_epoch > req.epoch {
                return Err(JournalError::SegmentState(format!(
                    "segment {} was already accepted in epoch {}",
                    segment.start_txid, previous.accepted_in_epoch
                )));
            }
        }
        self.abort_cur_segment();

        let record = AcceptedRecovery {
            accepted_in_epoch: req.epoch,
            segment: segment.clone(),
            from_url: from_url.to_string(),
        };
        self.install_segment_bytes(&record, bytes)?;

        if self.last_writer_epoch != req.epoch {
            self.storage.write_u64(LAST_WRITER_EPOCH_FILE, req.epoch)?;
            self.last_writer_epoch = req.epoch;
        }
        info!(
            journal = %self.journal_id,
            segment = %segment,
            epoch = req.epoch,
            from_url,
            "accepted recovery value"
        );
        Ok(())
    }

    /// Completes a re-sync that was flagged at open time.
    pub fn resync_accepted_segment(&mut self, bytes: &[u8]) -> Result<(), JournalError> {
        let record = self.needs_sync.take().ok_or_else(|| {
            JournalError::SegmentState("no accepted segment awaiting re-sync".to_string())
        })?;
        self.install_segment_bytes(&record, bytes)?;
        info!(
            journal = %self.journal_id,
            segment = %record.segment,
            "re-synced accepted segment from {}",
            record.from_url
        );
        Ok(())
    }

    fn install_segment_bytes(
        &mut self,
        record: &AcceptedRecovery,
        bytes: &[u8],
    ) -> Result<(), JournalError> {
        let segment = &record.segment;
        if bytes.len() as u64 != segment.len_bytes {
            return Err(JournalError::Io(format!(
                "fetched {} bytes for recovery value {} from {}",
                bytes.len(),
                segment,
                record.from_url
            )));
        }

        let tmp = self.storage.temp_sync_path(segment.start_txid);
        {
            let mut file = fs::File::create(&tmp)?;
            file.write_all(bytes)?;
            file.sync_all()?;
        }
        self.storage
            .write_paxos_record(segment.start_txid, record)?;
        fs::rename(&tmp, self.storage.in_progress_path(segment.start_txid))?;
        self.storage.sync_current_dir()?;

        let marker = LastWritten {
            highest_txid: segment.end_txid,
            cur_segment_len: segment.len_bytes,
        };
        self.storage.write_last_written(marker)?;
        self.last_written = marker;
        self.needs_sync = None;
        Ok(())
    }

    fn scan_segment_info(&self, start_txid: TxId) -> Result<Option<SegmentInfo>, JournalError> {
        let found = match self.storage.find_segment(start_txid)? {
            Some(found) => found,
            None => return Ok(None),
        };
        match found.end_txid {
            Some(end_txid) => Ok(Some(SegmentInfo {
                start_txid,
                end_txid,
                len_bytes: found.len_bytes,
                is_in_progress: false,
            })),
            None => {
                let end_txid = self.last_written.highest_txid;
                if end_txid < start_txid || found.len_bytes == 0 {
                    // An allocated segment nothing was written to carries no
                    // recoverable state.
                    Ok(None)
                } else {
                    Ok(Some(SegmentInfo {
                        start_txid,
                        end_txid,
                        len_bytes: found.len_bytes,
                        is_in_progress: true,
                    }))
                }
            }
        }
    }

    fn abort_cur_segment(&mut self) {
        if let Some(cur) = self.cur_segment.take() {
            warn!(
                journal = %self.journal_id,
                segment_txid = cur.start_txid,
                "aborting open segment"
            );
        }
    }

    fn update_promise(&mut self, epoch: Epoch) -> Result<(), JournalError> {
        self.storage.write_u64(LAST_PROMISED_EPOCH_FILE, epoch)?;
        self.last_promised_epoch = epoch;
        Ok(())
    }

    fn check_formatted(&self) -> Result<(), JournalError> {
        if self.namespace.is_none() {
            return Err(JournalError::NotFormatted);
        }
        Ok(())
    }

    fn check_namespace(&self, request_ns: &NamespaceInfo) -> Result<(), JournalError> {
        let local = self.namespace.as_ref().ok_or(JournalError::NotFormatted)?;
        if request_ns != local {
            return Err(JournalError::NamespaceMismatch {
                request: request_ns.clone(),
                local: local.clone(),
            });
        }
        Ok(())
    }

    /// Epoch gate for non-paxos mutations. A request from a newer epoch is
    /// an implicit fence: the higher promise is persisted before the request
    /// proceeds.
    fn check_request(&mut self, req: &RequestInfo) -> Result<(), JournalError> {
        self.check_formatted()?;
        self.check_namespace(&req.namespace)?;
        if req.epoch < self.last_promised_epoch {
            return Err(JournalError::EpochTooLow {
                requested: req.epoch,
                promised: self.last_promised_epoch,
            });
        }
        if req.epoch > self.last_promised_epoch {
            info!(
                journal = %self.journal_id,
                epoch = req.epoch,
                previous = self.last_promised_epoch,
                "updating promise from request with newer epoch"
            );
            self.update_promise(req.epoch)?;
        }
        Ok(())
    }

    fn check_write_request(&mut self, req: &RequestInfo) -> Result<(), JournalError> {
        self.check_request(req)?;
        if req.epoch != self.last_writer_epoch {
            return Err(JournalError::EpochMismatch {
                requested: req.epoch,
                writer: self.last_writer_epoch,
            });
        }
        Ok(())
    }

    /// Paxos requests must carry exactly the promised epoch: a proposer that
    /// never ran `newEpoch` holds no promise here.
    fn check_paxos_request(&self, req: &RequestInfo) -> Result<(), JournalError> {
        self.check_formatted()?;
        self.check_namespace(&req.namespace)?;
        if req.epoch != self.last_promised_epoch {
            return Err(JournalError::BadEpoch {
                requested: req.epoch,
                promised: self.last_promised_epoch,
            });
        }
        Ok(())
    }
}
