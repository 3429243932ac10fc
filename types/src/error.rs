// Copyright (c) Aptos
// SPDX-License-Identifier: Apache-2.0

use crate::{namespace::NamespaceInfo, Epoch, TxId};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors produced by a journal node. The enum is serialized verbatim into
/// RPC replies, so io errors are folded into their message form.
#[derive(Clone, Debug, Deserialize, Eq, Error, PartialEq, Serialize)]
pub enum JournalError {
    #[error("journal is not formatted")]
    NotFormatted,

    #[error("namespace mismatch: request has {request}, local is {local}")]
    NamespaceMismatch {
        request: NamespaceInfo,
        local: NamespaceInfo,
    },

    #[error("epoch {requested} is less than the last promised epoch {promised}")]
    EpochTooLow { requested: Epoch, promised: Epoch },

    /// Paxos requests are only valid for the exact epoch that was
    /// established through `newEpoch`.
    #[error("bad epoch {requested}: the last promised epoch is {promised}")]
    BadEpoch { requested: Epoch, promised: Epoch },

    #[error("epoch {requested} is not the current writer epoch {writer}")]
    EpochMismatch { requested: Epoch, writer: Epoch },

    #[error("out of sync: expected next transaction {expected} but received {actual}")]
    OutOfSync { expected: TxId, actual: TxId },

    #[error("segment state: {0}")]
    SegmentState(String),

    #[error("I/O error: {0}")]
    Io(String),
}

impl From<std::io::Error> for JournalError {
    fn from(err: std::io::Error) -> Self {
        JournalError::Io(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn epoch_too_low_message() {
        let err = JournalError::EpochTooLow {
            requested: 1,
            promised: 2,
        };
        assert_eq!(
            err.to_string(),
            "epoch 1 is less than the last promised epoch 2"
        );
    }

    #[test]
    fn bad_epoch_message() {
        let err = JournalError::BadEpoch {
            requested: 1,
            promised: 0,
        };
        assert!(err.to_string().contains("bad epoch"));
    }
}
