//! The local end of the bridge: something that reads and writes whole IP
//! packets. Grounded in the original's `pkg/device/tun.go`; `PairVeth` is
//! grounded in the original's android-side loopback test device.

use async_trait::async_trait;
use ipnet::IpNet;
use tokio::sync::mpsc;
use tun::AsyncDevice;

use crate::error::{PtunError, Result};

const DEFAULT_MTU: i32 = 1420;

/// A packet-oriented local endpoint for the bridge — the host's TUN
/// device in production, an in-memory pair in tests.
#[async_trait]
pub trait Veth: Send + Sync {
    async fn read_packet(&self, buf: &mut [u8]) -> Result<usize>;
    async fn write_packet(&self, buf: &[u8]) -> Result<()>;
}

/// A TUN interface carrying one address per `addrs` entry and routes for
/// each `routes` entry.
pub struct TunVeth {
    dev: AsyncDevice,
}

impl TunVeth {
    pub fn new(name: &str, addrs: &[String], routes: &[String]) -> Result<Self> {
        let ips = crate::network::parse_ip_nets(addrs)?;
        let _route_nets = crate::network::parse_ip_nets(routes)?;

        let mut config = tun::Configuration::default();
        config.name(name).mtu(DEFAULT_MTU).up();
        if let Some(first) = ips.first() {
            config.address(first.addr()).netmask(first.netmask());
        }

        let dev = tun::create_as_async(&config)
            .map_err(|e| PtunError::InvalidConfig(format!("tun device create failed: {e}")))?;
        Ok(Self { dev })
    }
}

#[async_trait]
impl Veth for TunVeth {
    async fn read_packet(&self, buf: &mut [u8]) -> Result<usize> {
        use tokio::io::AsyncReadExt;
        let mut dev = &self.dev;
        Ok(dev.read(buf).await?)
    }

    async fn write_packet(&self, buf: &[u8]) -> Result<()> {
        use tokio::io::AsyncWriteExt;
        let mut dev = &self.dev;
        dev.write_all(buf).await?;
        Ok(())
    }
}

/// An in-memory `Veth` pair for bridge tests: writes to one end become
/// readable on the other.
pub struct PairVeth {
    tx: mpsc::Sender<Vec<u8>>,
    rx: tokio::sync::Mutex<mpsc::Receiver<Vec<u8>>>,
}

impl PairVeth {
    pub fn pair() -> (Self, Self) {
        let (tx_a, rx_a) = mpsc::channel(32);
        let (tx_b, rx_b) = mpsc::channel(32);
        (
            Self { tx: tx_a, rx: tokio::sync::Mutex::new(rx_b) },
            Self { tx: tx_b, rx: tokio::sync::Mutex::new(rx_a) },
        )
    }
}

#[async_trait]
impl Veth for PairVeth {
    async fn read_packet(&self, buf: &mut [u8]) -> Result<usize> {
        let mut rx = self.rx.lock().await;
        let packet = rx.recv().await.ok_or(PtunError::Closed)?;
        let n = packet.len().min(buf.len());
        buf[..n].copy_from_slice(&packet[..n]);
        Ok(n)
    }

    async fn write_packet(&self, buf: &[u8]) -> Result<()> {
        self.tx.send(buf.to_vec()).await.map_err(|_| PtunError::Closed)
    }
}

#[allow(dead_code)]
fn _assert_ipnet_used(_n: &IpNet) {}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn pair_veth_delivers_a_write_to_the_other_end() {
        let (a, b) = PairVeth::pair();
        a.write_packet(b"an ip packet").await.unwrap();
        let mut buf = [0u8; 64];
        let n = b.read_packet(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"an ip packet");
    }
}
