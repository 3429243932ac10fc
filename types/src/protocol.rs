// Copyright (c) Aptos
// SPDX-License-Identifier: Apache-2.0

//! RPC wire messages. Requests and responses are bcs-encoded on both sides
//! of the simple length-prefixed substrate in `journal-net`.

use crate::{
    error::JournalError, journal_id::JournalId, namespace::NamespaceInfo, request::RequestInfo,
    segment::SegmentInfo, Epoch, TxId,
};
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, Deserialize, Serialize)]
pub enum JournalRequest {
    GetJournalState {
        journal_id: JournalId,
    },
    Format {
        journal_id: JournalId,
        namespace: NamespaceInfo,
    },
    IsFormatted {
        journal_id: JournalId,
    },
    NewEpoch {
        journal_id: JournalId,
        namespace: NamespaceInfo,
        epoch: Epoch,
    },
    StartLogSegment {
        req: RequestInfo,
        txid: TxId,
    },
    Journal {
        req: RequestInfo,
        first_txid: TxId,
        num_txns: u32,
        payload: Vec<u8>,
    },
    FinalizeLogSegment {
        req: RequestInfo,
        start_txid: TxId,
        end_txid: TxId,
    },
    PrepareRecovery {
        req: RequestInfo,
        segment_txid: TxId,
    },
    AcceptRecovery {
        req: RequestInfo,
        segment: SegmentInfo,
        from_url: String,
    },
}

impl JournalRequest {
    /// Short name for logging.
    pub fn method(&self) -> &'static str {
        match self {
            JournalRequest::GetJournalState { .. } => "getJournalState",
            JournalRequest::Format { .. } => "format",
            JournalRequest::IsFormatted { .. } => "isFormatted",
            JournalRequest::NewEpoch { .. } => "newEpoch",
            JournalRequest::StartLogSegment { .. } => "startLogSegment",
            JournalRequest::Journal { .. } => "journal",
            JournalRequest::FinalizeLogSegment { .. } => "finalizeLogSegment",
            JournalRequest::PrepareRecovery { .. } => "prepareRecovery",
            JournalRequest::AcceptRecovery { .. } => "acceptRecovery",
        }
    }

    pub fn journal_id(&self) -> &JournalId {
        match self {
            JournalRequest::GetJournalState { journal_id }
            | JournalRequest::Format { journal_id, .. }
            | JournalRequest::IsFormatted { journal_id }
            | JournalRequest::NewEpoch { journal_id, .. } => journal_id,
            JournalRequest::StartLogSegment { req, .. }
            | JournalRequest::Journal { req, .. }
            | JournalRequest::FinalizeLogSegment { req, .. }
            | JournalRequest::PrepareRecovery { req, .. }
            | JournalRequest::AcceptRecovery { req, .. } => &req.journal_id,
        }
    }
}

#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct GetJournalStateResponse {
    pub last_promised_epoch: Epoch,
    pub http_port: u16,
}

#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct NewEpochResponse {
    /// Start txid of the newest on-disk segment, finalized or in-progress,
    /// or `None` if the journal holds no segment at all.
    pub last_segment_txid: Option<TxId>,
}

/// A recovery value some proposer already got accepted, replayed verbatim on
/// later prepares. Doubles as the durable per-segment paxos record.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct AcceptedRecovery {
    pub accepted_in_epoch: Epoch,
    pub segment: SegmentInfo,
    pub from_url: String,
}

#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct PrepareRecoveryResponse {
    /// The on-disk segment with the requested start txid, if any.
    pub segment: Option<SegmentInfo>,
    /// A previously accepted recovery value for that segment, if any.
    pub accepted: Option<AcceptedRecovery>,
    pub last_writer_epoch: Epoch,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub enum JournalResponse {
    /// Acknowledgement for operations with no payload.
    Ack,
    JournalState(GetJournalStateResponse),
    IsFormatted(bool),
    NewEpoch(NewEpochResponse),
    PrepareRecovery(PrepareRecoveryResponse),
}

/// Envelope around every reply. `last_promised_epoch` is the server's promise
/// after the operation ran; a client seeing a value above its own epoch has
/// been fenced and must abort.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct JournalRpcReply {
    pub last_promised_epoch: Epoch,
    pub result: Result<JournalResponse, JournalError>,
}
