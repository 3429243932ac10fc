// Copyright (c) Aptos
// SPDX-License-Identifier: Apache-2.0

//! Writer-side client of the quorum journal. One [`AsyncLogger`] per journal
//! node imposes a per-peer FIFO on mutating calls; [`QuorumCall`] joins the
//! per-peer deferreds into majority results; [`QuorumJournalManager`] drives
//! epochs, paxos tail recovery and the segment write pipeline on top.

pub mod async_logger;
pub mod error;
pub mod manager;
pub mod quorum_call;
pub mod segment_writer;

mod recovery;

pub use async_logger::AsyncLogger;
pub use error::QuorumError;
pub use manager::QuorumJournalManager;
pub use quorum_call::QuorumCall;
pub use segment_writer::SegmentWriter;
