// Copyright (c) Aptos
// SPDX-License-Identifier: Apache-2.0

//! A deliberately simple request/response substrate: one TCP connection, one
//! `u32` big-endian length prefix per message, no multiplexing. The client
//! keeps a single connection and reconnects on the call after a failure; the
//! server answers frames in order per connection. Anything smarter (retries,
//! deadlines, fan-out) belongs to the layers above.

use std::{future::Future, net::SocketAddr};

use thiserror::Error;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{
        tcp::{OwnedReadHalf, OwnedWriteHalf},
        TcpListener, TcpStream,
    },
};
use tracing::{debug, info, warn};

/// Upper bound on a single frame. A journal flush is a few megabytes at
/// most; anything larger is a corrupt or hostile peer.
pub const MAX_FRAME_BYTES: usize = 64 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum Error {
    #[error("networking error: {0}")]
    NetworkError(String),
    #[error("remote stream closed")]
    RemoteStreamClosed,
    #[error("frame of {0} bytes exceeds the {1} byte limit")]
    FrameTooLarge(usize, usize),
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::NetworkError(err.to_string())
    }
}

async fn write_frame<W: AsyncWriteExt + Unpin>(stream: &mut W, payload: &[u8]) -> Result<(), Error> {
    if payload.len() > MAX_FRAME_BYTES {
        return Err(Error::FrameTooLarge(payload.len(), MAX_FRAME_BYTES));
    }
    stream.write_all(&(payload.len() as u32).to_be_bytes()).await?;
    stream.write_all(payload).await?;
    stream.flush().await?;
    Ok(())
}

async fn read_frame<R: AsyncReadExt + Unpin>(stream: &mut R) -> Result<Vec<u8>, Error> {
    let mut header = [0u8; 4];
    match stream.read_exact(&mut header).await {
        Ok(_) => {}
        Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => {
            return Err(Error::RemoteStreamClosed);
        }
        Err(err) => return Err(err.into()),
    }
    let len = u32::from_be_bytes(header) as usize;
    if len > MAX_FRAME_BYTES {
        return Err(Error::FrameTooLarge(len, MAX_FRAME_BYTES));
    }
    let mut payload = vec![0u8; len];
    stream.read_exact(&mut payload).await?;
    Ok(payload)
}

/// Client end of the substrate. Owns at most one connection to a fixed
/// server address. Not a connection pool: callers that need independent
/// streams create independent clients.
pub struct NetworkClient {
    server_address: SocketAddr,
    stream: Option<TcpStream>,
}

impl NetworkClient {
    pub fn new(server_address: SocketAddr) -> Self {
        Self {
            server_address,
            stream: None,
        }
    }

    pub fn server_address(&self) -> SocketAddr {
        self.server_address
    }

    /// Sends one request frame and awaits the reply frame. On any error the
    /// connection is torn down so the next call starts fresh.
    pub async fn call(&mut self, request: &[u8]) -> Result<Vec<u8>, Error> {
        let result = self.call_inner(request).await;
        if result.is_err() {
            self.stream = None;
        }
        result
    }

    async fn call_inner(&mut self, request: &[u8]) -> Result<Vec<u8>, Error> {
        if request.len() > MAX_FRAME_BYTES {
            return Err(Error::FrameTooLarge(request.len(), MAX_FRAME_BYTES));
        }
        if self.stream.is_none() {
            debug!(server = %self.server_address, "connecting");
            self.stream = Some(TcpStream::connect(self.server_address).await?);
        }
        let stream = self.stream.as_mut().expect("stream was just set");
        write_frame(stream, request).await?;
        read_frame(stream).await
    }
}

/// Server end of the substrate. Each accepted connection gets its own task;
/// frames within a connection are answered strictly in order, which is what
/// gives per-peer mutating calls their FIFO guarantee.
pub struct NetworkServer {
    listener: TcpListener,
    local_addr: SocketAddr,
}

impl NetworkServer {
    pub async fn bind(addr: SocketAddr) -> Result<Self, Error> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        Ok(Self {
            listener,
            local_addr,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Runs the accept loop forever, dispatching every frame to `handler`.
    pub async fn serve<H, F>(self, handler: H)
    where
        H: Fn(Vec<u8>) -> F + Clone + Send + Sync + 'static,
        F: Future<Output = Vec<u8>> + Send + 'static,
    {
        info!(address = %self.local_addr, "rpc server listening");
        loop {
            match self.listener.accept().await {
                Ok((stream, peer)) => {
                    debug!(peer = %peer, "accepted connection");
                    let handler = handler.clone();
                    tokio::spawn(async move {
                        let (mut read_half, mut write_half) = stream.into_split();
                        if let Err(err) =
                            handle_connection(&mut read_half, &mut write_half, handler).await
                        {
                            match err {
                                Error::RemoteStreamClosed => {
                                    debug!(peer = %peer, "connection closed")
                                }
                                err => warn!(peer = %peer, error = %err, "connection failed"),
                            }
                        }
                    });
                }
                Err(err) => {
                    warn!(error = %err, "accept failed");
                }
            }
        }
    }
}

async fn handle_connection<H, F>(
    read_half: &mut OwnedReadHalf,
    write_half: &mut OwnedWriteHalf,
    handler: H,
) -> Result<(), Error>
where
    H: Fn(Vec<u8>) -> F,
    F: Future<Output = Vec<u8>>,
{
    loop {
        let request = read_frame(read_half).await?;
        let response = handler(request).await;
        write_frame(write_half, &response).await?;
    }
}
