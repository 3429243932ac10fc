// Copyright (c) Aptos
// SPDX-License-Identifier: Apache-2.0

use anyhow::Result;
use journal_config::JournalNodeConfig;
use journal_node::JournalNode;
use std::{env, fs, sync::Arc};
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let config: JournalNodeConfig = match env::args().nth(1) {
        Some(path) => serde_json::from_slice(&fs::read(&path)?)?,
        None => JournalNodeConfig::default(),
    };

    let node = Arc::new(JournalNode::new(config));
    let handle = node.start().await?;
    info!(rpc = %handle.rpc_addr, http = %handle.http_addr, "journal node started");

    futures::future::pending::<()>().await;
    Ok(())
}
