// Copyright (c) Aptos
// SPDX-License-Identifier: Apache-2.0

//! Fan-out/await-majority primitive. A `QuorumCall` is single use: it takes
//! one deferred per peer and resolves as soon as a strict majority has
//! succeeded, or fails as soon as a majority is impossible or the deadline
//! passes. It never retries and never reorders; that is the caller's call.

use crate::error::QuorumError;
use futures::{
    channel::oneshot,
    stream::{FuturesUnordered, StreamExt},
};
use std::{collections::HashMap, net::SocketAddr, time::Duration};
use tracing::warn;

pub struct QuorumCall<T> {
    calls: Vec<(SocketAddr, oneshot::Receiver<Result<T, QuorumError>>)>,
}

impl<T> QuorumCall<T> {
    pub fn new(calls: Vec<(SocketAddr, oneshot::Receiver<Result<T, QuorumError>>)>) -> Self {
        Self { calls }
    }

    /// Waits until `quorum` peers have succeeded and returns their results.
    /// Dropping the remaining deferreds is the cancellation hint for any
    /// still-pending calls.
    pub async fn await_quorum(
        self,
        quorum: usize,
        timeout: Duration,
    ) -> Result<HashMap<SocketAddr, T>, QuorumError> {
        let total = self.calls.len();
        let deadline = tokio::time::Instant::now() + timeout;
        let mut pending: FuturesUnordered<_> = self
            .calls
            .into_iter()
            .map(|(addr, deferred)| async move {
                let result = match deferred.await {
                    Ok(result) => result,
                    Err(oneshot::Canceled) => Err(QuorumError::Cancelled),
                };
                (addr, result)
            })
            .collect();

        let mut successes = HashMap::new();
        let mut failures: Vec<(SocketAddr, QuorumError)> = vec![];
        while successes.len() < quorum {
            if total - failures.len() < quorum {
                return Err(QuorumError::QuorumFailed(describe(
                    total, &successes, &failures,
                )));
            }
            match tokio::time::timeout_at(deadline, pending.next()).await {
                Err(_) => return Err(QuorumError::Timeout(timeout)),
                Ok(None) => {
                    // Exhausted without reaching quorum; the guard above
                    // makes this unreachable unless quorum > total.
                    return Err(QuorumError::QuorumFailed(describe(
                        total, &successes, &failures,
                    )));
                }
                Ok(Some((addr, Ok(value)))) => {
                    successes.insert(addr, value);
                }
                Ok(Some((addr, Err(err)))) => {
                    warn!(peer = %addr, error = %err, "peer failed during quorum call");
                    failures.push((addr, err));
                }
            }
        }
        Ok(successes)
    }
}

fn describe<T>(
    total: usize,
    successes: &HashMap<SocketAddr, T>,
    failures: &[(SocketAddr, QuorumError)],
) -> String {
    let mut parts: Vec<String> = successes
        .keys()
        .map(|addr| format!("{}: success", addr))
        .collect();
    parts.extend(
        failures
            .iter()
            .map(|(addr, err)| format!("{}: {}", addr, err)),
    );
    parts.sort();
    format!("{}/{} succeeded: {}", successes.len(), total, parts.join("; "))
}

#[cfg(test)]
mod tests {
    use super::*;
    use journal_types::JournalError;
    use std::net::{IpAddr, Ipv4Addr};

    type Peer = (
        SocketAddr,
        oneshot::Sender<Result<u64, QuorumError>>,
    );

    fn three_peers() -> (Vec<Peer>, QuorumCall<u64>) {
        let mut senders = vec![];
        let mut calls = vec![];
        for port in 1..=3 {
            let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port);
            let (tx, rx) = oneshot::channel();
            senders.push((addr, tx));
            calls.push((addr, rx));
        }
        (senders, QuorumCall::new(calls))
    }

    // A 3-peer call completes as soon as two peers answer; the third never
    // does.
    #[tokio::test]
    async fn completes_on_majority_with_one_silent_peer() {
        let (mut senders, call) = three_peers();
        let (addr_0, tx_0) = senders.remove(0);
        let (addr_1, tx_1) = senders.remove(0);
        tx_0.send(Ok(10)).unwrap();
        tx_1.send(Ok(20)).unwrap();

        let results = call.await_quorum(2, Duration::from_secs(5)).await.unwrap();
        assert_eq!(results.len(), 2);
        assert_eq!(results[&addr_0], 10);
        assert_eq!(results[&addr_1], 20);
    }

    // Two failing peers out of three make the majority impossible; the
    // aggregate error carries both peers' messages.
    #[tokio::test]
    async fn fails_when_majority_is_impossible() {
        let (mut senders, call) = three_peers();
        let (_, tx_0) = senders.remove(0);
        let (_, tx_1) = senders.remove(0);
        tx_0.send(Err(QuorumError::Journal(JournalError::Io(
            "no space left on device".to_string(),
        ))))
        .unwrap();
        tx_1.send(Err(QuorumError::Journal(JournalError::Io(
            "read-only file system".to_string(),
        ))))
        .unwrap();

        let err = call
            .await_quorum(2, Duration::from_secs(5))
            .await
            .unwrap_err();
        match err {
            QuorumError::QuorumFailed(message) => {
                assert!(message.contains("no space left on device"));
                assert!(message.contains("read-only file system"));
            }
            other => panic!("expected QuorumFailed, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn times_out_when_no_progress() {
        let (_senders, call) = three_peers();
        let err = call
            .await_quorum(2, Duration::from_millis(50))
            .await
            .unwrap_err();
        assert_eq!(err, QuorumError::Timeout(Duration::from_millis(50)));
    }

    // A dropped sender counts as a peer failure, not a hang.
    #[tokio::test]
    async fn dropped_deferred_is_a_failure() {
        let (mut senders, call) = three_peers();
        let (_, tx_0) = senders.remove(0);
        let (_, tx_1) = senders.remove(0);
        drop(senders);
        tx_0.send(Ok(1)).unwrap();
        tx_1.send(Ok(2)).unwrap();

        let results = call.await_quorum(2, Duration::from_secs(5)).await.unwrap();
        assert_eq!(results.len(), 2);
    }
}
