// Copyright (c) Aptos
// SPDX-License-Identifier: Apache-2.0

//! The writer's façade over the journal node set: epoch establishment,
//! paxos recovery of the unfinalized tail, and the segment write path.

use crate::{
    async_logger::AsyncLogger,
    error::QuorumError,
    quorum_call::QuorumCall,
    recovery::{choose_recovery_value, ChosenRecovery},
    segment_writer::SegmentWriter,
};
use journal_config::QuorumJournalConfig;
use journal_types::{
    protocol::{
        GetJournalStateResponse, JournalResponse, NewEpochResponse, PrepareRecoveryResponse,
    },
    Epoch, JournalId, NamespaceInfo, TxId,
};
use std::{collections::HashMap, net::SocketAddr, time::Duration};
use tracing::{info, warn};

pub struct QuorumJournalManager {
    config: QuorumJournalConfig,
    journal_id: JournalId,
    loggers: Vec<AsyncLogger>,
    epoch: Epoch,
    /// `newEpoch` responses from the quorum that established the current
    /// epoch; recovery reads the reported segment tails from here.
    new_epoch_responses: HashMap<SocketAddr, NewEpochResponse>,
}

impl QuorumJournalManager {
    pub fn new(
        config: QuorumJournalConfig,
        journal_id: JournalId,
        namespace: NamespaceInfo,
    ) -> QuorumJournalManager {
        assert!(
            !config.peers.is_empty(),
            "a quorum journal needs at least one peer"
        );
        let rpc_timeout = Duration::from_millis(config.rpc_timeout_ms);
        let loggers = config
            .peers
            .iter()
            .map(|addr| {
                AsyncLogger::new(
                    *addr,
                    journal_id.clone(),
                    namespace.clone(),
                    rpc_timeout,
                    config.output_buffer_capacity_bytes,
                )
            })
            .collect();
        QuorumJournalManager {
            config,
            journal_id,
            loggers,
            epoch: 0,
            new_epoch_responses: HashMap::new(),
        }
    }

    pub fn epoch(&self) -> Epoch {
        self.epoch
    }

    fn quorum_size(&self) -> usize {
        self.config.quorum_size()
    }

    fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.config.rpc_timeout_ms)
    }

    fn logger(&self, addr: SocketAddr) -> Option<&AsyncLogger> {
        self.loggers.iter().find(|logger| logger.addr() == addr)
    }

    /// Formats every journal node. Unlike the write path this requires all
    /// peers: losing a formatted node on day one is an operator mistake.
    pub async fn format(&self) -> Result<(), QuorumError> {
        let calls = self
            .loggers
            .iter()
            .map(|logger| (logger.addr(), logger.format()))
            .collect();
        QuorumCall::new(calls)
            .await_quorum(self.loggers.len(), self.call_timeout())
            .await?;
        info!(journal = %self.journal_id, "formatted all journal nodes");
        Ok(())
    }

    /// Establishes `epoch` on a quorum: discovers HTTP ports, fans out
    /// `newEpoch`, and stamps the loggers. The epoch number comes from the
    /// external election authority.
    pub async fn establish_epoch(&mut self, epoch: Epoch) -> Result<(), QuorumError> {
        assert!(epoch > 0, "epochs start at 1");
        let states = self.get_journal_states().await?;
        for (addr, state) in &states {
            if let Some(logger) = self.logger(*addr) {
                logger.set_http_port(state.http_port);
            }
        }

        let calls = self
            .loggers
            .iter()
            .map(|logger| (logger.addr(), logger.new_epoch(epoch)))
            .collect();
        let responses = QuorumCall::new(calls)
            .await_quorum(self.quorum_size(), self.call_timeout())
            .await?;

        self.new_epoch_responses = responses
            .into_iter()
            .filter_map(|(addr, response)| match response {
                JournalResponse::NewEpoch(response) => Some((addr, response)),
                other => {
                    warn!(peer = %addr, ?other, "unexpected newEpoch response");
                    None
                }
            })
            .collect();
        for logger in &self.loggers {
            logger.set_epoch(epoch);
        }
        self.epoch = epoch;
        info!(journal = %self.journal_id, epoch, "established epoch on a quorum");
        Ok(())
    }

    /// Convenience for deployments where the election authority delegates
    /// epoch numbering: one above the highest promise in the quorum.
    pub async fn establish_next_epoch(&mut self) -> Result<Epoch, QuorumError> {
        let states = self.get_journal_states().await?;
        let highest = states
            .values()
            .map(|state| state.last_promised_epoch)
            .max()
            .unwrap_or(0);
        let epoch = highest + 1;
        self.establish_epoch(epoch).await?;
        Ok(epoch)
    }

    async fn get_journal_states(
        &self,
    ) -> Result<HashMap<SocketAddr, GetJournalStateResponse>, QuorumError> {
        let calls = self
            .loggers
            .iter()
            .map(|logger| (logger.addr(), logger.get_journal_state()))
            .collect();
        let responses = QuorumCall::new(calls)
            .await_quorum(self.quorum_size(), self.call_timeout())
            .await?;
        Ok(responses
            .into_iter()
            .filter_map(|(addr, response)| match response {
                JournalResponse::JournalState(state) => Some((addr, state)),
                other => {
                    warn!(peer = %addr, ?other, "unexpected getJournalState response");
                    None
                }
            })
            .collect())
    }

    /// Paxos recovery of the unfinalized tail, run once right after
    /// `establish_epoch`. Returns the txid the next segment must start at,
    /// or `None` when no peer reported any segment.
    pub async fn recover_unfinalized_segments(&mut self) -> Result<Option<TxId>, QuorumError> {
        assert!(self.epoch > 0, "establish an epoch before recovering");

        let segment_txid = self
            .new_epoch_responses
            .values()
            .filter_map(|response| response.last_segment_txid)
            .max();
        let segment_txid = match segment_txid {
            Some(segment_txid) => segment_txid,
            None => {
                info!(journal = %self.journal_id, "no segments reported; nothing to recover");
                return Ok(None);
            }
        };

        let calls = self
            .loggers
            .iter()
            .map(|logger| (logger.addr(), logger.prepare_recovery(segment_txid)))
            .collect();
        let responses = QuorumCall::new(calls)
            .await_quorum(self.quorum_size(), self.call_timeout())
            .await?;
        let prepares: HashMap<SocketAddr, PrepareRecoveryResponse> = responses
            .into_iter()
            .filter_map(|(addr, response)| match response {
                JournalResponse::PrepareRecovery(response) => Some((addr, response)),
                other => {
                    warn!(peer = %addr, ?other, "unexpected prepareRecovery response");
                    None
                }
            })
            .collect();

        let chosen = match choose_recovery_value(&prepares) {
            Some(chosen) => chosen,
            None => {
                warn!(
                    journal = %self.journal_id,
                    segment_txid,
                    "no peer in the quorum holds recoverable state for the segment"
                );
                return Ok(None);
            }
        };
        let ChosenRecovery {
            peer,
            value,
            source_name,
        } = chosen;
        // The winner may not have been part of the getJournalState quorum,
        // in which case its HTTP port is still unknown.
        if let Some(logger) = self.logger(peer) {
            if logger.http_port() == 0 {
                match logger.get_journal_state().await {
                    Ok(Ok(JournalResponse::JournalState(state))) => {
                        logger.set_http_port(state.http_port)
                    }
                    _ => warn!(peer = %peer, "could not discover the winner's http port"),
                }
            }
        }
        let from_url = self
            .logger(peer)
            .map(|logger| logger.http_url(&source_name))
            .unwrap_or_default();
        info!(
            journal = %self.journal_id,
            winner = %peer,
            value = %value,
            from_url = %from_url,
            "replicating recovery value"
        );

        // Accept on every peer, not only the prepare quorum.
        let calls = self
            .loggers
            .iter()
            .map(|logger| {
                (
                    logger.addr(),
                    logger.accept_recovery(value.clone(), from_url.clone()),
                )
            })
            .collect();
        QuorumCall::<JournalResponse>::new(calls)
            .await_quorum(self.quorum_size(), self.call_timeout())
            .await?;

        self.finalize_log_segment(value.start_txid, value.end_txid)
            .await?;
        info!(
            journal = %self.journal_id,
            start_txid = value.start_txid,
            end_txid = value.end_txid,
            "recovered and finalized segment"
        );
        Ok(Some(value.end_txid + 1))
    }

    /// Opens a segment at `txid` on a quorum and returns the local writer
    /// for it.
    pub async fn start_log_segment(&self, txid: TxId) -> Result<SegmentWriter<'_>, QuorumError> {
        assert!(self.epoch > 0, "establish an epoch before writing");
        let calls = self
            .loggers
            .iter()
            .map(|logger| (logger.addr(), logger.start_log_segment(txid)))
            .collect();
        QuorumCall::<JournalResponse>::new(calls)
            .await_quorum(self.quorum_size(), self.call_timeout())
            .await?;
        info!(journal = %self.journal_id, txid, "started log segment");
        Ok(SegmentWriter::new(self, txid))
    }

    pub async fn finalize_log_segment(
        &self,
        start_txid: TxId,
        end_txid: TxId,
    ) -> Result<(), QuorumError> {
        let calls = self
            .loggers
            .iter()
            .map(|logger| {
                (
                    logger.addr(),
                    logger.finalize_log_segment(start_txid, end_txid),
                )
            })
            .collect();
        QuorumCall::<JournalResponse>::new(calls)
            .await_quorum(self.quorum_size(), self.call_timeout())
            .await?;
        Ok(())
    }

    /// One batch to every peer; durable once a strict majority acks.
    pub(crate) async fn send_edits(
        &self,
        first_txid: TxId,
        num_txns: u32,
        payload: &[u8],
    ) -> Result<(), QuorumError> {
        let calls = self
            .loggers
            .iter()
            .map(|logger| {
                (
                    logger.addr(),
                    logger.send_edits(first_txid, num_txns, payload.to_vec()),
                )
            })
            .collect();
        QuorumCall::<JournalResponse>::new(calls)
            .await_quorum(self.quorum_size(), self.call_timeout())
            .await?;
        Ok(())
    }
}
