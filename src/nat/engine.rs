//! Turns an [`AnalyzeResult`] pair into a connected UDP socket by racing
//! sends/receives across a pool of local sockets and guessed remote ports.
//! Grounded in the original's `pkg/nat/nat.go`.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures::stream::FuturesUnordered;
use futures::StreamExt;
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::error::{PtunError, Result};
use crate::nat::analyze::{Action, AnalyzeResult, Resource, Role};
use crate::nat::tools::{no_repeat_rand_ints, random_one};
use crate::network;

const MAX_REPEAT_TIMES: usize = 5;
const WAIT_MAKE_HOLE_TIMEOUT: Duration = Duration::from_secs(5);
const PING_BODY: &[u8] = b"a";

#[derive(Debug, Clone)]
pub struct Nat {
    pub local_addrs: Vec<SocketAddr>,
    pub remote_mapped_addrs: Vec<SocketAddr>,
    pub role: Role,
    pub resource: Resource,
    pub actions: Vec<Action>,
}

/// Resolves the string addresses in a plan into the socket addresses
/// [`make_hole`] works with — the hub hands each side only its own plan,
/// so this converts one [`AnalyzeResult`] at a time.
pub fn nat_from_analyze(plan: &AnalyzeResult) -> Result<Nat> {
    Ok(Nat {
        local_addrs: resolve_all(&plan.local_addrs)?,
        remote_mapped_addrs: resolve_all(&plan.remote_mapped_addrs)?,
        role: plan.role,
        resource: plan.resource,
        actions: plan.actions.clone(),
    })
}

fn resolve_all(addrs: &[String]) -> Result<Vec<SocketAddr>> {
    addrs
        .iter()
        .map(|a| a.parse().map_err(|e| PtunError::InvalidAddress(format!("{a}: {e}"))))
        .collect()
}

/// Executes `nat.actions` in order, trying each one's send/wait cycle until
/// a reply arrives or every action is exhausted.
pub async fn make_hole(nat: &Nat) -> Result<(UdpSocket, SocketAddr)> {
    let (mut local_conns, remote_addrs) = gen_endpoints(nat).await?;

    for action in &nat.actions {
        if !action.wait.is_zero() {
            tokio::time::sleep(action.wait).await;
        }
        if action.try_remote {
            send(action.low_ttl, &local_conns, &remote_addrs).await;
        }

        let repeat_times = if action.repeat { MAX_REPEAT_TIMES } else { 1 };
        for _ in 0..repeat_times {
            send(action.low_ttl, &local_conns, &remote_addrs).await;
            match wait(&local_conns, WAIT_MAKE_HOLE_TIMEOUT).await {
                Ok((idx, raddr)) => {
                    debug!("wait for reply success");
                    let socket_arc = local_conns.remove(idx);
                    let socket = Arc::try_unwrap(socket_arc).map_err(|_| PtunError::PunchFailed)?;
                    if action.try_remote {
                        let _ = socket.send_to(PING_BODY, raddr).await;
                    }
                    return Ok((socket, raddr));
                }
                Err(e) => debug!("wait for reply err, {e}"),
            }
        }
    }
    Err(PtunError::PunchFailed)
}

async fn gen_endpoints(nat: &Nat) -> Result<(Vec<Arc<UdpSocket>>, Vec<SocketAddr>)> {
    let mut local_conns = Vec::new();
    for addr in &nat.local_addrs {
        match UdpSocket::bind(addr).await {
            Ok(c) => local_conns.push(Arc::new(c)),
            Err(e) => debug!("listen {addr} failed, {e}"),
        }
    }
    for _ in 1..nat.resource.local_port_count.max(1) {
        match UdpSocket::bind("0.0.0.0:0").await {
            Ok(c) => local_conns.push(Arc::new(c)),
            Err(e) => debug!("listen new port failed, {e}"),
        }
    }

    let mut remote_addrs = nat.remote_mapped_addrs.clone();
    if nat.resource.remote_port_count > 1 {
        let extra_ports = no_repeat_rand_ints(
            nat.resource.remote_port_start,
            nat.resource.remote_port_end,
            nat.resource.remote_port_count as usize,
        );
        let ips: Vec<_> = nat.remote_mapped_addrs.iter().map(|a| a.ip()).collect();
        if !ips.is_empty() {
            for port in extra_ports {
                let ip = random_one(&ips);
                remote_addrs.push(SocketAddr::new(ip, port as u16));
            }
        }
    }

    Ok((local_conns, remote_addrs))
}

async fn send(low_ttl: bool, local_conns: &[Arc<UdpSocket>], remote_addrs: &[SocketAddr]) {
    debug!("send len({}) -> len({})", local_conns.len(), remote_addrs.len());
    for local in local_conns {
        for remote in remote_addrs {
            let result = if low_ttl {
                network::send_with_lowered_ttl(local, *remote, PING_BODY, 8).await
            } else {
                local.send_to(PING_BODY, *remote).await
            };
            if let Err(e) = result {
                debug!("send udp error, {e}");
            }
        }
    }
}

/// Races a receive across every local socket; the first to see a reply
/// wins. Returns the winning socket's index into `local_conns` and the
/// address that replied; remaining recv attempts are aborted.
async fn wait(local_conns: &[Arc<UdpSocket>], timeout: Duration) -> Result<(usize, SocketAddr)> {
    let mut tasks: FuturesUnordered<JoinHandle<(usize, Result<SocketAddr>)>> = local_conns
        .iter()
        .enumerate()
        .map(|(idx, conn)| {
            let conn = conn.clone();
            tokio::spawn(async move {
                let mut buf = [0u8; 4];
                let result = tokio::time::timeout(timeout, conn.recv_from(&mut buf))
                    .await
                    .map_err(|_| PtunError::PunchFailed)
                    .and_then(|r| r.map(|(_, addr)| addr).map_err(PtunError::from));
                (idx, result)
            })
        })
        .collect();

    let mut winner = None;
    while let Some(joined) = tasks.next().await {
        if let Ok((idx, Ok(addr))) = joined {
            winner = Some((idx, addr));
            break;
        }
    }
    for handle in tasks.iter() {
        handle.abort();
    }
    winner.ok_or(PtunError::PunchFailed)
}
