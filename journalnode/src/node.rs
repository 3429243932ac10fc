// Copyright (c) Aptos
// SPDX-License-Identifier: Apache-2.0

//! One journal node process: a map of lazily opened journals, the RPC
//! dispatch over the `journal-net` substrate, and the HTTP segment server.

use crate::{http, infallible::Mutex, journal::Journal, storage};
use journal_config::JournalNodeConfig;
use journal_net::NetworkServer;
use journal_types::{
    protocol::{JournalRequest, JournalResponse, JournalRpcReply},
    JournalError, JournalId,
};
use once_cell::sync::OnceCell;
use std::{collections::HashMap, net::SocketAddr, path::PathBuf, sync::Arc, time::Duration};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

pub struct JournalNode {
    config: JournalNodeConfig,
    journals: Mutex<HashMap<JournalId, Arc<Mutex<Journal>>>>,
    /// Actual HTTP port, known once the server is bound. Journals report it
    /// through `getJournalState`.
    http_port: OnceCell<u16>,
}

/// Returned by [`JournalNode::start`]; owns the serving tasks.
pub struct JournalNodeHandle {
    pub rpc_addr: SocketAddr,
    pub http_addr: SocketAddr,
    tasks: Vec<JoinHandle<()>>,
}

impl JournalNodeHandle {
    pub fn shutdown(&self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

impl JournalNode {
    pub fn new(config: JournalNodeConfig) -> Self {
        Self {
            config,
            journals: Mutex::new(HashMap::new()),
            http_port: OnceCell::new(),
        }
    }

    pub fn config(&self) -> &JournalNodeConfig {
        &self.config
    }

    fn http_port(&self) -> u16 {
        self.http_port.get().copied().unwrap_or(0)
    }

    fn http_timeout(&self) -> Duration {
        Duration::from_millis(self.config.http_timeout_ms)
    }

    pub(crate) fn journal_current_dir(&self, journal_id: &JournalId) -> PathBuf {
        self.config
            .journal_dir
            .join(journal_id.as_str())
            .join(storage::CURRENT_DIR)
    }

    /// Opens (or returns the already open) journal. Does not attempt any
    /// network activity; the HTTP serving path relies on that.
    pub(crate) fn open_journal(
        &self,
        journal_id: &JournalId,
    ) -> Result<Arc<Mutex<Journal>>, JournalError> {
        let mut journals = self.journals.lock();
        if let Some(journal) = journals.get(journal_id) {
            return Ok(Arc::clone(journal));
        }
        let root = self.config.journal_dir.join(journal_id.as_str());
        let journal = Arc::new(Mutex::new(Journal::open(
            journal_id.clone(),
            root,
            self.http_port(),
        )?));
        journals.insert(journal_id.clone(), Arc::clone(&journal));
        Ok(journal)
    }

    /// Opens the journal and, if a previously accepted recovery value never
    /// made it to disk, re-fetches it from the recorded source first.
    async fn journal(&self, journal_id: &JournalId) -> Result<Arc<Mutex<Journal>>, JournalError> {
        let journal = self.open_journal(journal_id)?;
        let pending = {
            let guard = journal.lock();
            guard
                .needs_sync()
                .cloned()
                .zip(guard.namespace().map(|ns| ns.layout_version))
        };
        if let Some((record, layout_version)) = pending {
            match http::fetch_segment(&record.from_url, layout_version, self.http_timeout()).await {
                Ok(bytes) => {
                    if let Err(err) = journal.lock().resync_accepted_segment(&bytes) {
                        warn!(journal = %journal_id, error = %err, "segment re-sync failed");
                    }
                }
                Err(err) => warn!(
                    journal = %journal_id,
                    error = %err,
                    "segment re-sync fetch failed; accepted record stays authoritative"
                ),
            }
        }
        Ok(journal)
    }

    /// Decodes, dispatches and encodes one RPC frame.
    pub async fn handle_rpc(&self, bytes: Vec<u8>) -> Vec<u8> {
        let reply = match bcs::from_bytes::<JournalRequest>(&bytes) {
            Ok(request) => self.handle_request(request).await,
            Err(err) => {
                warn!(error = %err, "malformed rpc request");
                JournalRpcReply {
                    last_promised_epoch: 0,
                    result: Err(JournalError::Io(format!("malformed request: {}", err))),
                }
            }
        };
        match bcs::to_bytes(&reply) {
            Ok(bytes) => bytes,
            Err(err) => {
                error!(error = %err, "failed to encode rpc reply");
                vec![]
            }
        }
    }

    pub async fn handle_request(&self, request: JournalRequest) -> JournalRpcReply {
        let journal_id = request.journal_id().clone();
        let method = request.method();
        let journal = match self.journal(&journal_id).await {
            Ok(journal) => journal,
            Err(err) => {
                return JournalRpcReply {
                    last_promised_epoch: 0,
                    result: Err(err),
                }
            }
        };

        // acceptRecovery pulls the value's bytes before taking the journal
        // lock; the fetch must not hold up unrelated requests.
        let prefetched = if let JournalRequest::AcceptRecovery { from_url, .. } = &request {
            let layout_version = journal.lock().namespace().map(|ns| ns.layout_version);
            let layout_version = match layout_version {
                Some(layout_version) => layout_version,
                None => return reply_of(&journal, Err(JournalError::NotFormatted)),
            };
            match http::fetch_segment(from_url, layout_version, self.http_timeout()).await {
                Ok(bytes) => Some(bytes),
                Err(err) => return reply_of(&journal, Err(err)),
            }
        } else {
            None
        };

        let mut guard = journal.lock();
        let result = match request {
            JournalRequest::GetJournalState { .. } => guard
                .get_journal_state()
                .map(JournalResponse::JournalState),
            JournalRequest::Format { namespace, .. } => {
                guard.format(namespace).map(|_| JournalResponse::Ack)
            }
            JournalRequest::IsFormatted { .. } => {
                Ok(JournalResponse::IsFormatted(guard.is_formatted()))
            }
            JournalRequest::NewEpoch {
                namespace, epoch, ..
            } => guard
                .new_epoch(&namespace, epoch)
                .map(JournalResponse::NewEpoch),
            JournalRequest::StartLogSegment { req, txid } => guard
                .start_log_segment(&req, txid)
                .map(|_| JournalResponse::Ack),
            JournalRequest::Journal {
                req,
                first_txid,
                num_txns,
                payload,
            } => guard
                .journal(&req, first_txid, num_txns, &payload)
                .map(|_| JournalResponse::Ack),
            JournalRequest::FinalizeLogSegment {
                req,
                start_txid,
                end_txid,
            } => guard
                .finalize_log_segment(&req, start_txid, end_txid)
                .map(|_| JournalResponse::Ack),
            JournalRequest::PrepareRecovery { req, segment_txid } => guard
                .prepare_recovery(&req, segment_txid)
                .map(JournalResponse::PrepareRecovery),
            JournalRequest::AcceptRecovery {
                req,
                segment,
                from_url,
            } => {
                let bytes = prefetched.unwrap_or_default();
                guard
                    .accept_recovery(&req, &segment, &from_url, &bytes)
                    .map(|_| JournalResponse::Ack)
            }
        };
        if let Err(err) = &result {
            warn!(journal = %journal_id, method, error = %err, "rpc failed");
        }
        JournalRpcReply {
            last_promised_epoch: guard.last_promised_epoch(),
            result,
        }
    }

    /// Binds and serves both the RPC and the HTTP endpoints.
    pub async fn start(self: &Arc<Self>) -> anyhow::Result<JournalNodeHandle> {
        let rpc_server = NetworkServer::bind(self.config.rpc_address)
            .await
            .map_err(|err| anyhow::anyhow!("failed to bind rpc server: {}", err))?;
        let rpc_addr = rpc_server.local_addr();

        let (http_addr, http_server) =
            warp::serve(http::routes(Arc::clone(self))).try_bind_ephemeral(self.config.http_address)?;
        self.http_port
            .set(http_addr.port())
            .map_err(|_| anyhow::anyhow!("journal node already started"))?;

        let node = Arc::clone(self);
        let rpc_task = tokio::spawn(async move {
            rpc_server
                .serve(move |bytes| {
                    let node = Arc::clone(&node);
                    async move { node.handle_rpc(bytes).await }
                })
                .await
        });
        let http_task = tokio::spawn(http_server);
        info!(rpc = %rpc_addr, http = %http_addr, "journal node serving");
        Ok(JournalNodeHandle {
            rpc_addr,
            http_addr,
            tasks: vec![rpc_task, http_task],
        })
    }
}

fn reply_of(
    journal: &Arc<Mutex<Journal>>,
    result: Result<JournalResponse, JournalError>,
) -> JournalRpcReply {
    JournalRpcReply {
        last_promised_epoch: journal.lock().last_promised_epoch(),
        result,
    }
}
