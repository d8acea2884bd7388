//! Upload Protocol Server
//!
//! Accepts bundle / action-result uploads and persists each payload
//! atomically into the per-device inbox. Any validation failure or short
//! read answers `ERR` and persists nothing.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::header::{read_exact_payload, read_header_block, ProtocolError};
use crate::config::defaults::{HEADER_READ_TIMEOUT_SECS, MAX_PAYLOAD_BYTES, UPLOAD_HEADER_LIMIT};
use crate::fsio::{atomic_write, sanitize_token, with_suffix};

/// TCP server for the upload protocol.
pub struct UploadServer {
    addr: SocketAddr,
    inbox_root: PathBuf,
}

impl UploadServer {
    pub fn new(addr: SocketAddr, inbox_root: PathBuf) -> Self {
        Self { addr, inbox_root }
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
        std::fs::create_dir_all(&self.inbox_root)?;
        info!(addr = %self.addr, inbox = %self.inbox_root.display(), "upload server listening");

        loop {
            let (stream, peer) = tokio::select! {
                _ = cancel.cancelled() => {
                    info!("upload server shutting down");
                    return Ok(());
                }
                accepted = listener.accept() => accepted?,
            };
            super::configure_stream(&stream);

            let inbox_root = self.inbox_root.clone();
            tokio::spawn(async move {
                if let Err(e) = handle_upload(stream, peer, inbox_root).await {
                    debug!(peer = %peer, error = %e, "upload connection ended with error");
                }
            });
        }
    }
}

/// Artifact kind encoded in the upload `TYPE` field.
fn extension_for_kind(kind: &str) -> &'static str {
    match kind {
        "bundle" | "action_result" => ".tar.gz",
        _ => ".bin",
    }
}

async fn handle_upload(
    mut stream: TcpStream,
    peer: SocketAddr,
    inbox_root: PathBuf,
) -> Result<(), ProtocolError> {
    let result = process_upload(&mut stream, peer, &inbox_root).await;
    match &result {
        Ok(()) => {
            let _ = stream.write_all(b"OK\n").await;
        }
        Err(e) => {
            warn!(peer = %peer, error = %e, "upload rejected");
            let _ = stream.write_all(b"ERR\n").await;
        }
    }
    let _ = stream.shutdown().await;
    result
}

async fn process_upload(
    stream: &mut TcpStream,
    peer: SocketAddr,
    inbox_root: &std::path::Path,
) -> Result<(), ProtocolError> {
    let header = tokio::time::timeout(
        Duration::from_secs(HEADER_READ_TIMEOUT_SECS),
        read_header_block(stream, UPLOAD_HEADER_LIMIT),
    )
    .await
    .map_err(|_| ProtocolError::Timeout)??;

    let kind = sanitize_token(header.require("TYPE")?);
    let device_id = sanitize_token(header.require("DEVICE")?);
    let run_id = sanitize_token(header.require("RUN")?);
    let len_raw = header.require("LEN")?;
    let length: u64 = len_raw
        .parse()
        .map_err(|_| ProtocolError::BadLength(len_raw.to_string()))?;
    if length > MAX_PAYLOAD_BYTES {
        return Err(ProtocolError::BadLength(len_raw.to_string()));
    }

    let rest = header.rest;
    let payload = read_exact_payload(stream, length, &rest).await?;

    let name = format!("{run_id}__{kind}{}", extension_for_kind(&kind));
    let dest = inbox_root.join(&device_id).join(&name);
    atomic_write(&dest, &payload).map_err(|e| {
        ProtocolError::Io(std::io::Error::other(format!(
            "persist {}: {e}",
            dest.display()
        )))
    })?;
    // readiness marker: the watcher only considers items with a .done of "ok"
    atomic_write(&with_suffix(&dest, ".done"), b"ok\n").map_err(|e| {
        ProtocolError::Io(std::io::Error::other(format!("persist done marker: {e}")))
    })?;

    info!(
        peer = %peer,
        device = %device_id,
        run_id = %run_id,
        kind = %kind,
        bytes = payload.len(),
        "upload stored"
    );
    Ok(())
}
