// Copyright (c) Aptos
// SPDX-License-Identifier: Apache-2.0

use journal_types::JournalError;
use std::{net::SocketAddr, time::Duration};
use thiserror::Error;

#[derive(Debug, Error, Eq, PartialEq)]
pub enum QuorumError {
    #[error("rpc timed out after {0:?}")]
    Timeout(Duration),

    /// Per-peer backpressure: the outstanding sendEdits bytes for this peer
    /// exceed the configured bound.
    #[error("too many edits queued to journal node {0} ({1} bytes outstanding)")]
    TooManyQueued(SocketAddr, usize),

    /// A previous sendEdits to this peer failed; further sends fail fast
    /// until the next segment starts.
    #[error("journal node {0} is out of sync with the writer")]
    LoggerOutOfSync(SocketAddr),

    #[error(transparent)]
    Journal(#[from] JournalError),

    #[error("rpc to {0} failed: {1}")]
    Rpc(SocketAddr, String),

    #[error("call was cancelled")]
    Cancelled,

    /// Raised by `QuorumCall` when a majority is impossible; the message
    /// lists every peer's outcome.
    #[error("quorum call failed: {0}")]
    QuorumFailed(String),
}
