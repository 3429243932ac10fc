// Copyright (c) Aptos
// SPDX-License-Identifier: Apache-2.0

//! One logical channel to one journal node. Mutating calls flow through a
//! spawned worker that owns the peer connection and drains a FIFO queue, so
//! the writer never has two overlapping mutations in flight to the same
//! peer. Read-only and epoch-setup calls use one-off connections and never
//! block the write queue.

use crate::error::QuorumError;
use futures::{
    channel::{mpsc, oneshot},
    StreamExt,
};
use journal_net::NetworkClient;
use journal_types::{
    protocol::{JournalRequest, JournalResponse, JournalRpcReply},
    Epoch, JournalError, JournalId, NamespaceInfo, RequestInfo, SegmentInfo, TxId,
};
use std::{
    net::SocketAddr,
    sync::{
        atomic::{AtomicBool, AtomicU16, AtomicU64, AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};
use tracing::{debug, warn};
use url::Url;

/// Completion handle for one call: success value, typed failure, or
/// cancellation (the worker went away before answering).
pub type Deferred = oneshot::Receiver<Result<JournalResponse, QuorumError>>;

struct QueuedCall {
    request: JournalRequest,
    reserved_bytes: usize,
    is_send_edits: bool,
    resp_tx: oneshot::Sender<Result<JournalResponse, QuorumError>>,
}

pub struct AsyncLogger {
    addr: SocketAddr,
    journal_id: JournalId,
    namespace: NamespaceInfo,
    epoch: Arc<AtomicU64>,
    ipc_serial: AtomicU64,
    http_port: AtomicU16,
    queued_bytes: Arc<AtomicUsize>,
    capacity_bytes: usize,
    out_of_sync: Arc<AtomicBool>,
    rpc_timeout: Duration,
    queue_tx: mpsc::UnboundedSender<QueuedCall>,
}

impl AsyncLogger {
    pub fn new(
        addr: SocketAddr,
        journal_id: JournalId,
        namespace: NamespaceInfo,
        rpc_timeout: Duration,
        capacity_bytes: usize,
    ) -> AsyncLogger {
        let (queue_tx, queue_rx) = mpsc::unbounded();
        let epoch = Arc::new(AtomicU64::new(0));
        let queued_bytes = Arc::new(AtomicUsize::new(0));
        let out_of_sync = Arc::new(AtomicBool::new(false));
        let worker = LoggerWorker {
            addr,
            client: NetworkClient::new(addr),
            queue_rx,
            epoch: Arc::clone(&epoch),
            queued_bytes: Arc::clone(&queued_bytes),
            out_of_sync: Arc::clone(&out_of_sync),
            rpc_timeout,
        };
        tokio::spawn(worker.run());
        AsyncLogger {
            addr,
            journal_id,
            namespace,
            epoch,
            ipc_serial: AtomicU64::new(0),
            http_port: AtomicU16::new(0),
            queued_bytes,
            capacity_bytes,
            out_of_sync,
            rpc_timeout,
            queue_tx,
        }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Stamped on every subsequent mutating request. Set once per writer
    /// generation, after `newEpoch` succeeded on a quorum.
    pub fn set_epoch(&self, epoch: Epoch) {
        self.epoch.store(epoch, Ordering::SeqCst);
    }

    pub fn set_http_port(&self, port: u16) {
        self.http_port.store(port, Ordering::SeqCst);
    }

    /// 0 until discovered through `getJournalState`.
    pub fn http_port(&self) -> u16 {
        self.http_port.load(Ordering::SeqCst)
    }

    /// URL under which this peer serves the given segment file.
    pub fn http_url(&self, file_name: &str) -> String {
        let base = format!(
            "http://{}:{}/getimage",
            self.addr.ip(),
            self.http_port.load(Ordering::SeqCst)
        );
        let mut url = Url::parse(&base).expect("peer address forms a valid url");
        url.query_pairs_mut()
            .append_pair("filename", file_name)
            .append_pair("jid", self.journal_id.as_str());
        url.to_string()
    }

    fn request_info(&self) -> RequestInfo {
        RequestInfo {
            journal_id: self.journal_id.clone(),
            namespace: self.namespace.clone(),
            epoch: self.epoch.load(Ordering::SeqCst),
            ipc_serial: self.ipc_serial.fetch_add(1, Ordering::SeqCst),
        }
    }

    // ---- serialized, per-peer FIFO calls ----

    pub fn send_edits(&self, first_txid: TxId, num_txns: u32, payload: Vec<u8>) -> Deferred {
        let len = payload.len();
        let queued = self.queued_bytes.load(Ordering::SeqCst);
        if queued + len > self.capacity_bytes {
            let (resp_tx, resp_rx) = oneshot::channel();
            let _ = resp_tx.send(Err(QuorumError::TooManyQueued(self.addr, queued)));
            return resp_rx;
        }
        self.queued_bytes.fetch_add(len, Ordering::SeqCst);
        self.enqueue(
            JournalRequest::Journal {
                req: self.request_info(),
                first_txid,
                num_txns,
                payload,
            },
            len,
            true,
        )
    }

    pub fn start_log_segment(&self, txid: TxId) -> Deferred {
        // A fresh segment resets the fail-fast latch from any earlier
        // sendEdits failure.
        self.out_of_sync.store(false, Ordering::SeqCst);
        self.enqueue(
            JournalRequest::StartLogSegment {
                req: self.request_info(),
                txid,
            },
            0,
            false,
        )
    }

    pub fn finalize_log_segment(&self, start_txid: TxId, end_txid: TxId) -> Deferred {
        self.enqueue(
            JournalRequest::FinalizeLogSegment {
                req: self.request_info(),
                start_txid,
                end_txid,
            },
            0,
            false,
        )
    }

    pub fn accept_recovery(&self, segment: SegmentInfo, from_url: String) -> Deferred {
        self.enqueue(
            JournalRequest::AcceptRecovery {
                req: self.request_info(),
                segment,
                from_url,
            },
            0,
            false,
        )
    }

    fn enqueue(
        &self,
        request: JournalRequest,
        reserved_bytes: usize,
        is_send_edits: bool,
    ) -> Deferred {
        let (resp_tx, resp_rx) = oneshot::channel();
        let call = QueuedCall {
            request,
            reserved_bytes,
            is_send_edits,
            resp_tx,
        };
        if self.queue_tx.unbounded_send(call).is_err() {
            // The worker is gone; the dropped sender surfaces as Cancelled.
            warn!(peer = %self.addr, "logger worker is gone");
            if reserved_bytes > 0 {
                self.queued_bytes.fetch_sub(reserved_bytes, Ordering::SeqCst);
            }
        }
        resp_rx
    }

    // ---- out-of-band calls, own connection each ----

    pub fn get_journal_state(&self) -> Deferred {
        self.one_shot(JournalRequest::GetJournalState {
            journal_id: self.journal_id.clone(),
        })
    }

    pub fn format(&self) -> Deferred {
        self.one_shot(JournalRequest::Format {
            journal_id: self.journal_id.clone(),
            namespace: self.namespace.clone(),
        })
    }

    pub fn is_formatted(&self) -> Deferred {
        self.one_shot(JournalRequest::IsFormatted {
            journal_id: self.journal_id.clone(),
        })
    }

    pub fn new_epoch(&self, epoch: Epoch) -> Deferred {
        self.one_shot(JournalRequest::NewEpoch {
            journal_id: self.journal_id.clone(),
            namespace: self.namespace.clone(),
            epoch,
        })
    }

    pub fn prepare_recovery(&self, segment_txid: TxId) -> Deferred {
        self.one_shot(JournalRequest::PrepareRecovery {
            req: self.request_info(),
            segment_txid,
        })
    }

    fn one_shot(&self, request: JournalRequest) -> Deferred {
        let (resp_tx, resp_rx) = oneshot::channel();
        let addr = self.addr;
        let rpc_timeout = self.rpc_timeout;
        let epoch = self.epoch.load(Ordering::SeqCst);
        tokio::spawn(async move {
            let mut client = NetworkClient::new(addr);
            let result = dispatch(&mut client, &request, rpc_timeout, epoch, addr).await;
            let _ = resp_tx.send(result);
        });
        resp_rx
    }
}

struct LoggerWorker {
    addr: SocketAddr,
    client: NetworkClient,
    queue_rx: mpsc::UnboundedReceiver<QueuedCall>,
    epoch: Arc<AtomicU64>,
    queued_bytes: Arc<AtomicUsize>,
    out_of_sync: Arc<AtomicBool>,
    rpc_timeout: Duration,
}

impl LoggerWorker {
    async fn run(mut self) {
        debug!(peer = %self.addr, "logger worker started");
        while let Some(call) = self.queue_rx.next().await {
            let QueuedCall {
                request,
                reserved_bytes,
                is_send_edits,
                resp_tx,
            } = call;

            let result = if is_send_edits && self.out_of_sync.load(Ordering::SeqCst) {
                Err(QuorumError::LoggerOutOfSync(self.addr))
            } else {
                let epoch = self.epoch.load(Ordering::SeqCst);
                dispatch(&mut self.client, &request, self.rpc_timeout, epoch, self.addr).await
            };

            if reserved_bytes > 0 {
                self.queued_bytes.fetch_sub(reserved_bytes, Ordering::SeqCst);
            }
            if is_send_edits && result.is_err() {
                warn!(peer = %self.addr, "sendEdits failed; marking logger out of sync");
                self.out_of_sync.store(true, Ordering::SeqCst);
            }
            // The caller may have stopped listening; that is its business.
            let _ = resp_tx.send(result);
        }
        debug!(peer = %self.addr, "logger worker stopped");
    }
}

/// Encode, send with a deadline, decode, and apply the epoch fence on the
/// reply envelope.
async fn dispatch(
    client: &mut NetworkClient,
    request: &JournalRequest,
    rpc_timeout: Duration,
    epoch: Epoch,
    addr: SocketAddr,
) -> Result<JournalResponse, QuorumError> {
    let bytes = bcs::to_bytes(request)
        .map_err(|err| QuorumError::Rpc(addr, format!("cannot encode request: {}", err)))?;
    let reply_bytes = match tokio::time::timeout(rpc_timeout, client.call(&bytes)).await {
        Ok(Ok(bytes)) => bytes,
        Ok(Err(err)) => return Err(QuorumError::Rpc(addr, err.to_string())),
        Err(_) => return Err(QuorumError::Timeout(rpc_timeout)),
    };
    let reply: JournalRpcReply = bcs::from_bytes(&reply_bytes)
        .map_err(|err| QuorumError::Rpc(addr, format!("cannot decode reply: {}", err)))?;
    if epoch > 0 && reply.last_promised_epoch > epoch {
        // Someone holds a newer promise; this writer is done.
        return Err(QuorumError::Journal(JournalError::EpochTooLow {
            requested: epoch,
            promised: reply.last_promised_epoch,
        }));
    }
    reply.result.map_err(QuorumError::Journal)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};

    fn test_namespace() -> NamespaceInfo {
        NamespaceInfo {
            namespace_id: 1,
            cluster_id: "c".to_string(),
            block_pool_id: "bp".to_string(),
            creation_time: 0,
            layout_version: -64,
        }
    }

    fn dead_peer_logger(capacity_bytes: usize) -> AsyncLogger {
        // Nothing listens on the address; calls sit in the queue until the
        // rpc timeout fires.
        let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 1);
        AsyncLogger::new(
            addr,
            JournalId::new("j"),
            test_namespace(),
            Duration::from_secs(60),
            capacity_bytes,
        )
    }

    #[tokio::test]
    async fn backpressure_fails_fast() {
        let logger = dead_peer_logger(10);
        // First send fits the budget and gets queued.
        let _first = logger.send_edits(1, 1, vec![0u8; 8]);
        // Second send exceeds it and fails immediately, without waiting for
        // any network progress.
        let second = logger.send_edits(2, 1, vec![0u8; 8]);
        match second.await.unwrap() {
            Err(QuorumError::TooManyQueued(_, outstanding)) => assert_eq!(outstanding, 8),
            other => panic!("expected TooManyQueued, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn http_url_uses_discovered_port() {
        let logger = dead_peer_logger(1024);
        logger.set_http_port(8480);
        assert_eq!(
            logger.http_url("edits_inprogress_1"),
            "http://127.0.0.1:8480/getimage?filename=edits_inprogress_1&jid=j"
        );
    }
}
