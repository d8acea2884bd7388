//! Device-facing TCP protocols.
//!
//! Two line-framed protocols share the same header convention: `KEY=VALUE`
//! lines with case-insensitive keys, terminated by a blank line in either
//! line-ending convention.
//!
//! - **Upload** (`<run>__<kind>` bundles into the inbox): header
//!   `TYPE/DEVICE/RUN/LEN` + raw payload, reply `OK` or `ERR`
//! - **Actions** (latest action script per device): header `DEVICE`,
//!   reply `RUN=<id>\nLEN=<n>\n\n` + raw script bytes
//!
//! One task per accepted connection; the only shared state is the
//! filesystem, synchronized via atomic rename.

mod header;
mod upload;
mod actions;

pub use actions::ActionsServer;
pub use header::{read_header_block, HeaderBlock, ProtocolError};
pub use upload::UploadServer;

use std::net::SocketAddr;

use anyhow::{Context, Result};
use tokio::net::TcpListener;

use crate::config::defaults::ACCEPT_BACKLOG;

/// Bind a listener with the protocol's fixed accept backlog.
pub fn bind_listener(addr: SocketAddr) -> Result<TcpListener> {
    let domain = if addr.is_ipv6() {
        socket2::Domain::IPV6
    } else {
        socket2::Domain::IPV4
    };
    let socket = socket2::Socket::new(domain, socket2::Type::STREAM, Some(socket2::Protocol::TCP))
        .context("create listener socket")?;
    socket.set_reuse_address(true).context("set SO_REUSEADDR")?;
    socket.set_nonblocking(true).context("set nonblocking")?;
    socket
        .bind(&addr.into())
        .with_context(|| format!("bind {addr}"))?;
    socket.listen(ACCEPT_BACKLOG).context("listen")?;
    TcpListener::from_std(socket.into()).context("register listener with runtime")
}

/// Enable TCP keepalive on an accepted connection so dead devices release
/// their task instead of pinning it forever. Best-effort.
pub(crate) fn configure_stream(stream: &tokio::net::TcpStream) {
    let sock_ref = socket2::SockRef::from(stream);
    let keepalive = socket2::TcpKeepalive::new()
        .with_time(std::time::Duration::from_secs(30))
        .with_interval(std::time::Duration::from_secs(10));
    let _ = sock_ref.set_tcp_keepalive(&keepalive);
}
