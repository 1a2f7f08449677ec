//! Momentarily lowering a socket's TTL/hop-limit to "prime" a NAT's session
//! table without the packet reaching the peer. Grounded in the original's
//! `pkg/network/tools.go` `ModifyTTL`.

use std::io;
use std::net::SocketAddr;

use socket2::SockRef;
use tokio::net::UdpSocket;

/// Sends `body` to `remote` with the socket's TTL (IPv4) or hop limit
/// (IPv6) temporarily lowered by `minus`, then restores the original value
/// regardless of whether the send succeeded.
pub async fn send_with_lowered_ttl(
    socket: &UdpSocket,
    remote: SocketAddr,
    body: &[u8],
    minus: u32,
) -> io::Result<usize> {
    let sock_ref = SockRef::from(socket);
    let is_v4 = socket.local_addr()?.is_ipv4();

    let original = if is_v4 { sock_ref.ttl()? } else { sock_ref.unicast_hops_v6()? };
    let lowered = original.saturating_sub(minus);

    if is_v4 {
        sock_ref.set_ttl(lowered)?;
    } else {
        sock_ref.set_unicast_hops_v6(lowered)?;
    }

    let result = socket.send_to(body, remote).await;

    if is_v4 {
        let _ = sock_ref.set_ttl(original);
    } else {
        let _ = sock_ref.set_unicast_hops_v6(original);
    }

    result
}
