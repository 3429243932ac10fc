// Copyright (c) Aptos
// SPDX-License-Identifier: Apache-2.0

//! On-disk layout of one journal:
//!
//! ```text
//! <root>/current/VERSION                  namespace identity, key=value text
//! <root>/current/last-promised-epoch     8 bytes, big-endian
//! <root>/current/last-writer-epoch       8 bytes, big-endian
//! <root>/current/last-written-txid       16 bytes: highest txid + segment length
//! <root>/current/paxos/<segmentTxId>     accepted recovery record, json
//! <root>/current/edits_inprogress_<s>    the open segment
//! <root>/current/edits_<s>-<e>           finalized segments, immutable
//! ```
//!
//! Every write that another process may observe goes through a temp file,
//! an fsync, a rename and an fsync of the parent directory.

use byteorder::{BigEndian, ByteOrder};
use journal_types::{
    protocol::AcceptedRecovery,
    segment::{self, parse_segment_file_name},
    JournalError, NamespaceInfo, TxId,
};
use std::{
    fs::{self, File},
    io::Write,
    path::{Path, PathBuf},
};
use tracing::{info, warn};

pub const CURRENT_DIR: &str = "current";
pub const PAXOS_DIR: &str = "paxos";
pub const VERSION_FILE: &str = "VERSION";
pub const LAST_PROMISED_EPOCH_FILE: &str = "last-promised-epoch";
pub const LAST_WRITER_EPOCH_FILE: &str = "last-writer-epoch";
pub const LAST_WRITTEN_FILE: &str = "last-written-txid";

const TMP_SUFFIX: &str = ".tmp";

/// Durable marker of how far the journal has written: the highest txid ever
/// acknowledged, and the byte length of the current in-progress segment at
/// that point. The length lets a restart discard a torn tail that was never
/// acknowledged.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct LastWritten {
    pub highest_txid: TxId,
    pub cur_segment_len: u64,
}

/// One segment found on disk.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ScannedSegment {
    pub start_txid: TxId,
    /// `None` for an in-progress segment.
    pub end_txid: Option<TxId>,
    pub len_bytes: u64,
    pub file_name: String,
}

pub struct JournalStorage {
    root: PathBuf,
}

impl JournalStorage {
    pub fn new<P: Into<PathBuf>>(root: P) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn current_dir(&self) -> PathBuf {
        self.root.join(CURRENT_DIR)
    }

    fn paxos_dir(&self) -> PathBuf {
        self.current_dir().join(PAXOS_DIR)
    }

    pub fn in_progress_path(&self, start_txid: TxId) -> PathBuf {
        self.current_dir().join(segment::in_progress_name(start_txid))
    }

    pub fn finalized_path(&self, start_txid: TxId, end_txid: TxId) -> PathBuf {
        self.current_dir()
            .join(segment::finalized_name(start_txid, end_txid))
    }

    /// Scratch name used while installing fetched segment bytes. Never
    /// parses as a segment, so scans ignore leftovers.
    pub fn temp_sync_path(&self, start_txid: TxId) -> PathBuf {
        self.current_dir()
            .join(format!("{}{}", segment::in_progress_name(start_txid), TMP_SUFFIX))
    }

    pub fn is_formatted(&self) -> bool {
        self.current_dir().join(VERSION_FILE).exists()
    }

    /// Creates the directory layout from scratch. An existing journal is
    /// wiped first; format is an explicit operator action.
    pub fn format(&self, namespace: &NamespaceInfo) -> Result<(), JournalError> {
        let current = self.current_dir();
        if current.exists() {
            warn!(dir = %current.display(), "reformatting existing journal directory");
            fs::remove_dir_all(&current)?;
        }
        fs::create_dir_all(self.paxos_dir())?;
        self.write_u64(LAST_PROMISED_EPOCH_FILE, 0)?;
        self.write_u64(LAST_WRITER_EPOCH_FILE, 0)?;
        self.write_last_written(LastWritten::default())?;
        self.write_version(namespace)?;
        sync_dir(&current)?;
        sync_dir(&self.paxos_dir())?;
        info!(dir = %current.display(), namespace = %namespace, "formatted journal");
        Ok(())
    }

    fn write_version(&self, namespace: &NamespaceInfo) -> Result<(), JournalError> {
        let contents = format!(
            "namespaceID={}\nclusterID={}\nblockpoolID={}\ncTime={}\nlayoutVersion={}\n",
            namespace.namespace_id,
            namespace.cluster_id,
            namespace.block_pool_id,
            namespace.creation_time,
            namespace.layout_version,
        );
        self.atomic_write(&self.current_dir().join(VERSION_FILE), contents.as_bytes())
    }

    pub fn read_namespace(&self) -> Result<NamespaceInfo, JournalError> {
        let text = fs::read_to_string(self.current_dir().join(VERSION_FILE))?;
        let field = |key: &str| -> Result<String, JournalError> {
            text.lines()
                .find_map(|line| line.strip_prefix(&format!("{}=", key)))
                .map(str::to_string)
                .ok_or_else(|| {
                    JournalError::Io(format!("VERSION file is missing the {} field", key))
                })
        };
        let parse_err =
            |key: &str| JournalError::Io(format!("VERSION file has a malformed {} field", key));
        Ok(NamespaceInfo {
            namespace_id: field("namespaceID")?
                .parse()
                .map_err(|_| parse_err("namespaceID"))?,
            cluster_id: field("clusterID")?,
            block_pool_id: field("blockpoolID")?,
            creation_time: field("cTime")?.parse().map_err(|_| parse_err("cTime"))?,
            layout_version: field("layoutVersion")?
                .parse()
                .map_err(|_| parse_err("layoutVersion"))?,
        })
    }

    /// Reads one of the 8-byte state files. Absent reads as 0 so that a
    /// freshly formatted journal needs no special casing.
    pub fn read_u64(&self, file_name: &str) -> Result<u64, JournalError> {
        let path = self.current_dir().join(file_name);
        if !path.exists() {
            return Ok(0);
        }
        let bytes = fs::read(&path)?;
        if bytes.len() != 8 {
            return Err(JournalError::Io(format!(
                "{} holds {} bytes, expected 8",
                file_name,
                bytes.len()
            )));
        }
        Ok(BigEndian::read_u64(&bytes))
    }

    pub fn write_u64(&self, file_name: &str, value: u64) -> Result<(), JournalError> {
        let mut bytes = [0u8; 8];
        BigEndian::write_u64(&mut bytes, value);
        self.atomic_write(&self.current_dir().join(file_name), &bytes)
    }

    pub fn read_last_written(&self) -> Result<LastWritten, JournalError> {
        let path = self.current_dir().join(LAST_WRITTEN_FILE);
        if !path.exists() {
            return Ok(LastWritten::default());
        }
        let bytes = fs::read(&path)?;
        if bytes.len() != 16 {
            return Err(JournalError::Io(format!(
                "{} holds {} bytes, expected 16",
                LAST_WRITTEN_FILE,
                bytes.len()
            )));
        }
        Ok(LastWritten {
            highest_txid: BigEndian::read_u64(&bytes[..8]),
            cur_segment_len: BigEndian::read_u64(&bytes[8..]),
        })
    }

    pub fn write_last_written(&self, marker: LastWritten) -> Result<(), JournalError> {
        let mut bytes = [0u8; 16];
        BigEndian::write_u64(&mut bytes[..8], marker.highest_txid);
        BigEndian::write_u64(&mut bytes[8..], marker.cur_segment_len);
        self.atomic_write(&self.current_dir().join(LAST_WRITTEN_FILE), &bytes)
    }

    pub fn read_paxos_record(
        &self,
        segment_txid: TxId,
    ) -> Result<Option<AcceptedRecovery>, JournalError> {
        let path = self.paxos_dir().join(segment_txid.to_string());
        if !path.exists() {
            return Ok(None);
        }
        let bytes = fs::read(&path)?;
        let record = serde_json::from_slice(&bytes)
            .map_err(|err| JournalError::Io(format!("corrupt paxos record: {}", err)))?;
        Ok(Some(record))
    }

    pub fn write_paxos_record(
        &self,
        segment_txid: TxId,
        record: &AcceptedRecovery,
    ) -> Result<(), JournalError> {
        let bytes = serde_json::to_vec(record)
            .map_err(|err| JournalError::Io(format!("cannot encode paxos record: {}", err)))?;
        self.atomic_write(&self.paxos_dir().join(segment_txid.to_string()), &bytes)
    }

    pub fn remove_paxos_record(&self, segment_txid: TxId) -> Result<(), JournalError> {
        let path = self.paxos_dir().join(segment_txid.to_string());
        if path.exists() {
            fs::remove_file(&path)?;
            sync_dir(&self.paxos_dir())?;
        }
        Ok(())
    }

    /// All paxos records on disk, by segment txid.
    pub fn scan_paxos_records(&self) -> Result<Vec<TxId>, JournalError> {
        let mut txids = vec![];
        for entry in fs::read_dir(self.paxos_dir())? {
            let entry = entry?;
            if let Some(txid) = entry
                .file_name()
                .to_str()
                .and_then(|name| name.parse::<TxId>().ok())
            {
                txids.push(txid);
            }
        }
        txids.sort_unstable();
        Ok(txids)
    }

    /// All segment files on disk, sorted by start txid.
    pub fn scan_segments(&self) -> Result<Vec<ScannedSegment>, JournalError> {
        let mut segments = vec![];
        for entry in fs::read_dir(self.current_dir())? {
            let entry = entry?;
            let file_name = match entry.file_name().into_string() {
                Ok(name) => name,
                Err(_) => continue,
            };
            if let Some((start_txid, end_txid)) = parse_segment_file_name(&file_name) {
                segments.push(ScannedSegment {
                    start_txid,
                    end_txid,
                    len_bytes: entry.metadata()?.len(),
                    file_name,
                });
            }
        }
        segments.sort_by_key(|segment| segment.start_txid);
        Ok(segments)
    }

    pub fn latest_segment_start(&self) -> Result<Option<TxId>, JournalError> {
        Ok(self
            .scan_segments()?
            .last()
            .map(|segment| segment.start_txid))
    }

    /// The segment starting exactly at `start_txid`, preferring the
    /// finalized form if both somehow exist.
    pub fn find_segment(&self, start_txid: TxId) -> Result<Option<ScannedSegment>, JournalError> {
        let mut found: Option<ScannedSegment> = None;
        for segment in self.scan_segments()? {
            if segment.start_txid != start_txid {
                continue;
            }
            let prefer = match &found {
                None => true,
                Some(existing) => existing.end_txid.is_none() && segment.end_txid.is_some(),
            };
            if prefer {
                found = Some(segment);
            }
        }
        Ok(found)
    }

    pub fn sync_current_dir(&self) -> Result<(), JournalError> {
        sync_dir(&self.current_dir())?;
        Ok(())
    }

    /// Temp file, fsync, rename, fsync the directory.
    fn atomic_write(&self, path: &Path, bytes: &[u8]) -> Result<(), JournalError> {
        let tmp = path.with_extension("tmp");
        {
            let mut file = File::create(&tmp)?;
            file.write_all(bytes)?;
            file.sync_all()?;
        }
        fs::rename(&tmp, path)?;
        let parent = path
            .parent()
            .ok_or_else(|| JournalError::Io(format!("{} has no parent", path.display())))?;
        sync_dir(parent)?;
        Ok(())
    }
}

pub fn sync_dir(path: &Path) -> std::io::Result<()> {
    File::open(path)?.sync_all()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_namespace() -> NamespaceInfo {
        NamespaceInfo {
            namespace_id: 6771,
            cluster_id: "cluster-x".to_string(),
            block_pool_id: "BP-6771".to_string(),
            creation_time: 1_234,
            layout_version: -64,
        }
    }

    fn formatted_storage(dir: &tempfile::TempDir) -> JournalStorage {
        let storage = JournalStorage::new(dir.path().join("jid"));
        storage.format(&test_namespace()).unwrap();
        storage
    }

    #[test]
    fn format_then_read_namespace() {
        let dir = tempfile::tempdir().unwrap();
        let storage = JournalStorage::new(dir.path().join("jid"));
        assert!(!storage.is_formatted());
        storage.format(&test_namespace()).unwrap();
        assert!(storage.is_formatted());
        assert_eq!(storage.read_namespace().unwrap(), test_namespace());
    }

    #[test]
    fn u64_files_round_trip_and_default_to_zero() {
        let dir = tempfile::tempdir().unwrap();
        let storage = formatted_storage(&dir);
        assert_eq!(storage.read_u64(LAST_PROMISED_EPOCH_FILE).unwrap(), 0);
        storage.write_u64(LAST_PROMISED_EPOCH_FILE, 42).unwrap();
        assert_eq!(storage.read_u64(LAST_PROMISED_EPOCH_FILE).unwrap(), 42);
        assert_eq!(storage.read_u64("never-written").unwrap(), 0);
    }

    #[test]
    fn last_written_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let storage = formatted_storage(&dir);
        let marker = LastWritten {
            highest_txid: 17,
            cur_segment_len: 4_096,
        };
        storage.write_last_written(marker).unwrap();
        assert_eq!(storage.read_last_written().unwrap(), marker);
    }

    #[test]
    fn paxos_records_round_trip() {
        use journal_types::SegmentInfo;

        let dir = tempfile::tempdir().unwrap();
        let storage = formatted_storage(&dir);
        assert_eq!(storage.read_paxos_record(1).unwrap(), None);
        let record = AcceptedRecovery {
            accepted_in_epoch: 3,
            segment: SegmentInfo {
                start_txid: 1,
                end_txid: 9,
                len_bytes: 100,
                is_in_progress: false,
            },
            from_url: "http://127.0.0.1:8480/getimage?filename=x&jid=j".to_string(),
        };
        storage.write_paxos_record(1, &record).unwrap();
        assert_eq!(storage.read_paxos_record(1).unwrap(), Some(record));
        assert_eq!(storage.scan_paxos_records().unwrap(), vec![1]);
        storage.remove_paxos_record(1).unwrap();
        assert_eq!(storage.read_paxos_record(1).unwrap(), None);
    }

    #[test]
    fn scan_segments_sees_both_forms_and_skips_temp_files() {
        let dir = tempfile::tempdir().unwrap();
        let storage = formatted_storage(&dir);
        fs::write(storage.in_progress_path(7), b"xyz").unwrap();
        fs::write(storage.finalized_path(1, 6), b"abcdef").unwrap();
        fs::write(storage.temp_sync_path(7), b"junk").unwrap();

        let segments = storage.scan_segments().unwrap();
        assert_eq!(segments.len(), 2);
        assert_eq!(segments[0].start_txid, 1);
        assert_eq!(segments[0].end_txid, Some(6));
        assert_eq!(segments[0].len_bytes, 6);
        assert_eq!(segments[1].start_txid, 7);
        assert_eq!(segments[1].end_txid, None);
        assert_eq!(storage.latest_segment_start().unwrap(), Some(7));

        let found = storage.find_segment(7).unwrap().unwrap();
        assert_eq!(found.end_txid, None);
        assert_eq!(storage.find_segment(2).unwrap(), None);
    }
}
