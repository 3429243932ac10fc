// Copyright (c) Aptos
// SPDX-License-Identifier: Apache-2.0

//! Segment bytes over HTTP. The server half hands finalized (and, during
//! recovery, in-progress) segment files to peers; the client half is used by
//! `acceptRecovery` to pull the agreed segment from the winning peer.
//!
//! The stream format is fixed: a 4-byte big-endian layout version, then the
//! raw segment file bytes.

use crate::node::JournalNode;
use journal_types::{segment::parse_segment_file_name, JournalError, JournalId};
use serde::Deserialize;
use std::{sync::Arc, time::Duration};
use tracing::{debug, warn};
use warp::{
    http::{Response, StatusCode},
    Filter,
};

#[derive(Deserialize)]
struct GetImageParams {
    filename: String,
    jid: String,
}

/// `GET /getimage?filename=<segment file name>&jid=<journal id>`
pub fn routes(
    node: Arc<JournalNode>,
) -> impl Filter<Extract = (Response<Vec<u8>>,), Error = warp::Rejection> + Clone {
    warp::path("getimage")
        .and(warp::get())
        .and(warp::query::<GetImageParams>())
        .and(warp::any().map(move || Arc::clone(&node)))
        .and_then(serve_segment)
}

async fn serve_segment(
    params: GetImageParams,
    node: Arc<JournalNode>,
) -> Result<Response<Vec<u8>>, warp::Rejection> {
    match load_segment(&params, &node).await {
        Ok(body) => {
            debug!(
                filename = %params.filename,
                jid = %params.jid,
                bytes = body.len(),
                "serving segment"
            );
            Ok(bytes_reply(StatusCode::OK, body))
        }
        Err(err) => {
            warn!(
                filename = %params.filename,
                jid = %params.jid,
                error = %err,
                "segment request failed"
            );
            Ok(bytes_reply(
                StatusCode::INTERNAL_SERVER_ERROR,
                err.to_string().into_bytes(),
            ))
        }
    }
}

fn bytes_reply(status: StatusCode, body: Vec<u8>) -> Response<Vec<u8>> {
    let mut response = Response::new(body);
    *response.status_mut() = status;
    response
}

async fn load_segment(
    params: &GetImageParams,
    node: &Arc<JournalNode>,
) -> Result<Vec<u8>, JournalError> {
    // Canonical segment names only; everything else (including anything
    // with path separators) is refused outright.
    parse_segment_file_name(&params.filename).ok_or_else(|| {
        JournalError::SegmentState(format!("{} is not a segment file name", params.filename))
    })?;
    let journal_id = JournalId::new(params.jid.as_str());
    let journal = node.open_journal(&journal_id)?;
    let layout_version = journal
        .lock()
        .namespace()
        .ok_or(JournalError::NotFormatted)?
        .layout_version;
    let path = node.journal_current_dir(&journal_id).join(&params.filename);
    let bytes = tokio::fs::read(&path).await?;

    let mut body = Vec::with_capacity(4 + bytes.len());
    body.extend_from_slice(&layout_version.to_be_bytes());
    body.extend_from_slice(&bytes);
    Ok(body)
}

/// Fetches segment bytes from a peer, strips and verifies the layout-version
/// prefix, and returns the raw segment bytes.
pub async fn fetch_segment(
    url: &str,
    layout_version: i32,
    timeout: Duration,
) -> Result<Vec<u8>, JournalError> {
    let client = reqwest::Client::builder()
        .timeout(timeout)
        .build()
        .map_err(|err| JournalError::Io(err.to_string()))?;
    let response = client
        .get(url)
        .send()
        .await
        .map_err(|err| JournalError::Io(format!("segment fetch from {} failed: {}", url, err)))?;
    if !response.status().is_success() {
        return Err(JournalError::Io(format!(
            "segment fetch from {} failed: HTTP {}",
            url,
            response.status()
        )));
    }
    let body = response
        .bytes()
        .await
        .map_err(|err| JournalError::Io(format!("segment fetch from {} failed: {}", url, err)))?;
    if body.len() < 4 {
        return Err(JournalError::Io(format!(
            "segment stream from {} is truncated",
            url
        )));
    }
    let mut prefix = [0u8; 4];
    prefix.copy_from_slice(&body[..4]);
    let version = i32::from_be_bytes(prefix);
    if version != layout_version {
        return Err(JournalError::Io(format!(
            "segment stream from {} has layout version {}, expected {}",
            url, version, layout_version
        )));
    }
    Ok(body[4..].to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;
    use journal_config::JournalNodeConfig;
    use journal_types::{
        protocol::{JournalRequest, JournalResponse},
        segment, Epoch, NamespaceInfo, RequestInfo,
    };

    const TEST_JID: &str = "test-journal";

    fn test_namespace() -> NamespaceInfo {
        NamespaceInfo {
            namespace_id: 12345,
            cluster_id: "test-cluster".to_string(),
            block_pool_id: "BP-40-50".to_string(),
            creation_time: 0,
            layout_version: -64,
        }
    }

    fn req(epoch: Epoch) -> RequestInfo {
        RequestInfo {
            journal_id: JournalId::new(TEST_JID),
            namespace: test_namespace(),
            epoch,
            ipc_serial: 0,
        }
    }

    async fn run(node: &Arc<JournalNode>, request: JournalRequest) -> JournalResponse {
        let reply = node.handle_request(request).await;
        reply.result.expect("rpc failed")
    }

    async fn node_with_finalized_segment() -> (Arc<JournalNode>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let mut config = JournalNodeConfig::default();
        config.rpc_address.set_port(0);
        config.http_address.set_port(0);
        config.journal_dir = dir.path().to_path_buf();
        let node = Arc::new(JournalNode::new(config));
        let journal_id = JournalId::new(TEST_JID);
        run(
            &node,
            JournalRequest::Format {
                journal_id: journal_id.clone(),
                namespace: test_namespace(),
            },
        )
        .await;
        run(
            &node,
            JournalRequest::NewEpoch {
                journal_id,
                namespace: test_namespace(),
                epoch: 1,
            },
        )
        .await;
        run(
            &node,
            JournalRequest::StartLogSegment {
                req: req(1),
                txid: 1,
            },
        )
        .await;
        run(
            &node,
            JournalRequest::Journal {
                req: req(1),
                first_txid: 1,
                num_txns: 3,
                payload: b"abcdef".to_vec(),
            },
        )
        .await;
        run(
            &node,
            JournalRequest::FinalizeLogSegment {
                req: req(1),
                start_txid: 1,
                end_txid: 3,
            },
        )
        .await;
        (node, dir)
    }

    #[tokio::test]
    async fn serves_finalized_segment_with_layout_prefix() {
        let (node, _dir) = node_with_finalized_segment().await;
        let filter = routes(Arc::clone(&node));

        let name = segment::finalized_name(1, 3);
        assert_eq!(name, "edits_0000000000000000001-0000000000000000003");
        let response = warp::test::request()
            .path(&format!("/getimage?filename={}&jid={}", name, TEST_JID))
            .reply(&filter)
            .await;
        assert_eq!(response.status(), StatusCode::OK);

        let mut expected = (-64i32).to_be_bytes().to_vec();
        expected.extend_from_slice(b"abcdef");
        assert_eq!(response.body().as_ref(), expected.as_slice());
    }

    #[tokio::test]
    async fn missing_segment_is_a_500() {
        let (node, _dir) = node_with_finalized_segment().await;
        let filter = routes(Arc::clone(&node));

        let name = segment::finalized_name(4, 9);
        let response = warp::test::request()
            .path(&format!("/getimage?filename={}&jid={}", name, TEST_JID))
            .reply(&filter)
            .await;
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[tokio::test]
    async fn non_segment_names_are_refused() {
        let (node, _dir) = node_with_finalized_segment().await;
        let filter = routes(Arc::clone(&node));

        for filename in ["VERSION", "last-promised-epoch", "..%2FVERSION"].iter() {
            let response = warp::test::request()
                .path(&format!("/getimage?filename={}&jid={}", filename, TEST_JID))
                .reply(&filter)
                .await;
            assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        }
    }

    #[tokio::test]
    async fn fetch_round_trips_through_a_live_server() {
        let (node, _dir) = node_with_finalized_segment().await;
        let handle = node.start().await.unwrap();

        let url = format!(
            "http://{}/getimage?filename={}&jid={}",
            handle.http_addr,
            segment::finalized_name(1, 3),
            TEST_JID
        );
        let bytes = fetch_segment(&url, -64, Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(bytes, b"abcdef");

        // A layout version disagreement is an error even when the bytes are fine.
        let err = fetch_segment(&url, -63, Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("layout version"));
        handle.shutdown();
    }
}
