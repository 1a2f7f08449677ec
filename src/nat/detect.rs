//! The "simple" NAT echo protocol: ask a well-known pair of UDP ports what
//! address they saw us from. Grounded in the original's
//! `pkg/nat/service_simple.go`.

use std::net::SocketAddr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::net::UdpSocket;
use tokio::time::timeout;
use tracing::{error, info};

use crate::error::{PtunError, Result};

#[derive(Serialize, Deserialize)]
struct MappedInfo {
    #[serde(rename = "MappedAddr")]
    mapped_addr: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct DetectResult {
    pub local_addr: String,
    pub primary_mapped_addr: String,
    pub secondary_mapped_addr: String,
}

/// Resolves `host` and asks its `primary_port`/`secondary_port` UDP
/// listeners what address they saw this socket from.
pub async fn detect(host: &str, primary_port: u16, secondary_port: u16) -> Result<DetectResult> {
    let ip = resolve_host(host).await?;
    let socket = UdpSocket::bind("0.0.0.0:0").await?;

    let s1 = udp_detect(&socket, SocketAddr::new(ip, primary_port)).await?;
    let s2 = udp_detect(&socket, SocketAddr::new(ip, secondary_port)).await?;

    Ok(DetectResult {
        local_addr: socket.local_addr()?.to_string(),
        primary_mapped_addr: s1.mapped_addr,
        secondary_mapped_addr: s2.mapped_addr,
    })
}

async fn resolve_host(host: &str) -> Result<std::net::IpAddr> {
    if let Ok(ip) = host.parse() {
        return Ok(ip);
    }
    tokio::net::lookup_host((host, 0))
        .await?
        .next()
        .map(|a| a.ip())
        .ok_or_else(|| PtunError::InvalidAddress(format!("could not resolve {host}")))
}

async fn udp_detect(socket: &UdpSocket, remote: SocketAddr) -> Result<MappedInfo> {
    socket.send_to(&[0u8], remote).await?;
    let mut buf = [0u8; 1024];
    let (n, _) = timeout(Duration::from_secs(5), socket.recv_from(&mut buf))
        .await
        .map_err(|_| PtunError::DetectTimeout)??;
    Ok(serde_json::from_slice(&buf[..n])?)
}

/// A probe server that reports each caller's observed address, run as a
/// pair of independent UDP listeners so a client can detect port-mapping
/// behavior by comparing the two answers.
pub struct Server {
    primary_port: u16,
    secondary_port: u16,
    tasks: tokio::sync::Mutex<Vec<tokio::task::JoinHandle<()>>>,
}

impl Server {
    pub fn new(primary_port: u16, secondary_port: u16) -> Self {
        Self {
            primary_port,
            secondary_port,
            tasks: tokio::sync::Mutex::new(Vec::new()),
        }
    }

    pub async fn start(&self) -> Result<()> {
        info!("simple nat server start");
        let primary = UdpSocket::bind(("0.0.0.0", self.primary_port)).await?;
        let secondary = UdpSocket::bind(("0.0.0.0", self.secondary_port)).await?;
        let mut tasks = self.tasks.lock().await;
        tasks.push(tokio::spawn(serve(primary)));
        tasks.push(tokio::spawn(serve(secondary)));
        Ok(())
    }

    pub async fn stop(&self) {
        for task in self.tasks.lock().await.drain(..) {
            task.abort();
        }
    }
}

async fn serve(socket: UdpSocket) {
    let mut buf = [0u8; 1024];
    loop {
        let (_, addr) = match socket.recv_from(&mut buf).await {
            Ok(v) => v,
            Err(e) => {
                error!("simple nat server recv error: {e}");
                continue;
            }
        };
        let reply = MappedInfo {
            mapped_addr: addr.to_string(),
        };
        let body = match serde_json::to_vec(&reply) {
            Ok(b) => b,
            Err(e) => {
                error!("simple nat server encode error: {e}");
                continue;
            }
        };
        if let Err(e) = socket.send_to(&body, addr).await {
            error!("simple nat server send error: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn detect_round_trips_against_a_local_server() {
        let server = Server::new(18541, 18542);
        server.start().await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        let result = detect("127.0.0.1", 18541, 18542).await.unwrap();
        assert!(result.primary_mapped_addr.starts_with("127.0.0.1:"));
        assert_eq!(result.primary_mapped_addr, result.secondary_mapped_addr);
    }
}
