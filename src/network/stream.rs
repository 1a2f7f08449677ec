//! Adapts a connected UDP socket to [`tokio::io::AsyncRead`] /
//! [`tokio::io::AsyncWrite`] so a [`crate::proto::Transport`] can be built
//! on it like any other stream. Grounded in the original's
//! `pkg/network/raw.go`, which redials the winning hole-punch socket as a
//! connected `net.Conn`.

use std::net::SocketAddr;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::UdpSocket;

use crate::error::Result;

/// Closes `socket` and rebinds a new socket on the same local port,
/// connected to `remote` — the original re-dials rather than calling
/// `connect` in place because the winning socket came from a bare
/// `ListenUDP`.
pub async fn reconnect(socket: UdpSocket, remote: SocketAddr) -> Result<UdpSocket> {
    let local = socket.local_addr()?;
    drop(socket);
    let fresh = UdpSocket::bind(local).await?;
    fresh.connect(remote).await?;
    Ok(fresh)
}

/// One UDP datagram per `poll_read`/`poll_write` call — adequate since our
/// framing never splits a frame across datagrams.
pub struct RawConn {
    socket: UdpSocket,
}

impl RawConn {
    pub fn new(socket: UdpSocket) -> Self {
        Self { socket }
    }
}

impl AsyncRead for RawConn {
    fn poll_read(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<std::io::Result<()>> {
        self.get_mut().socket.poll_recv(cx, buf)
    }
}

impl AsyncWrite for RawConn {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<std::io::Result<usize>> {
        self.get_mut().socket.poll_send(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}
