//! Action Protocol Server
//!
//! Serves the most recently published action script for a device. Always
//! answers from whatever is currently published; never blocks waiting for a
//! result to appear.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::header::read_header_block;
use crate::config::defaults::{ACTIONS_HEADER_LIMIT, HEADER_READ_TIMEOUT_SECS};
use crate::fsio::sanitize_token;

/// TCP server for the action-retrieval protocol.
pub struct ActionsServer {
    addr: SocketAddr,
    out_root: PathBuf,
}

impl ActionsServer {
    pub fn new(addr: SocketAddr, out_root: PathBuf) -> Self {
        Self { addr, out_root }
    }

    /// Bind and run the accept loop until cancellation.
    pub async fn run(self, cancel: CancellationToken) -> Result<()> {
        let listener = super::bind_listener(self.addr)?;
        self.serve(listener, cancel).await
    }

    /// Accept loop over a pre-bound listener; one task per connection.
    pub async fn serve(
        self,
        listener: tokio::net::TcpListener,
        cancel: CancellationToken,
    ) -> Result<()> {
        std::fs::create_dir_all(&self.out_root)?;
        info!(addr = %self.addr, out = %self.out_root.display(), "actions server listening");

        loop {
            let (stream, peer) = tokio::select! {
                _ = cancel.cancelled() => {
                    info!("actions server shutting down");
                    return Ok(());
                }
                accepted = listener.accept() => accepted?,
            };
            super::configure_stream(&stream);

            let out_root = self.out_root.clone();
            tokio::spawn(async move {
                if let Err(e) = handle_request(stream, peer, out_root).await {
                    debug!(peer = %peer, error = %e, "actions connection ended with error");
                }
            });
        }
    }
}

const EMPTY_REPLY: &[u8] = b"RUN=\nLEN=0\n\n";

async fn handle_request(
    mut stream: TcpStream,
    peer: SocketAddr,
    out_root: PathBuf,
) -> Result<()> {
    let header = tokio::time::timeout(
        Duration::from_secs(HEADER_READ_TIMEOUT_SECS),
        read_header_block(&mut stream, ACTIONS_HEADER_LIMIT),
    )
    .await;

    let device_id = match header {
        Ok(Ok(block)) => block.get("DEVICE").map(sanitize_token),
        _ => None,
    };

    let Some(device_id) = device_id else {
        let _ = stream.write_all(EMPTY_REPLY).await;
        let _ = stream.shutdown().await;
        return Ok(());
    };

    let device_dir = out_root.join(&device_id);
    let run_id = std::fs::read_to_string(device_dir.join("latest_run_id.txt"))
        .map(|s| s.trim().to_string())
        .unwrap_or_default();
    let body = std::fs::read(device_dir.join("latest_actions_device.txt")).unwrap_or_default();

    let reply_header = format!("RUN={run_id}\nLEN={}\n\n", body.len());
    stream.write_all(reply_header.as_bytes()).await?;
    if !body.is_empty() {
        stream.write_all(&body).await?;
    }
    let _ = stream.shutdown().await;

    debug!(peer = %peer, device = %device_id, run_id = %run_id, bytes = body.len(), "served actions");
    Ok(())
}
