//! Routes IP packets between the local [`crate::device::Veth`] and whichever
//! connected [`Peer`] owns the destination address. Grounded in the
//! original's `pkg/bridge/bridge.go`. The original's `Relay` type
//! (`pkg/bridge/relay.go`) has no methods and no callers anywhere in the
//! source tree; it is not ported.

pub mod peer;

pub use peer::Peer;

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tracing::{debug, trace};

use crate::device::Veth;
use crate::network::parse_packet;

const PEER_KEEPALIVE: Duration = Duration::from_secs(10);

/// Owns the veth read loop and the peer table; `connect_peer`/`disconnect_peer`
/// are the only mutation points once [`Bridge::new`] has started routing.
pub struct Bridge {
    peers: DashMap<String, Arc<Peer>>,
    veth: Arc<dyn Veth>,
}

impl Bridge {
    pub fn new(veth: Arc<dyn Veth>) -> Arc<Self> {
        let bridge = Arc::new(Self { peers: DashMap::new(), veth });
        bridge.clone().spawn_veth_loop();
        bridge
    }

    /// Replaces any existing peer under the same name and starts routing
    /// its traffic.
    pub fn connect_peer(self: &Arc<Self>, peer: Arc<Peer>) {
        if let Some((_, old)) = self.peers.remove(&peer.name) {
            let old = old.clone();
            tokio::spawn(async move { old.close().await });
        }
        self.peers.insert(peer.name.clone(), peer.clone());
        self.clone().spawn_peer_loop(peer);
    }

    pub async fn disconnect_peer(&self, name: &str) {
        if let Some((_, peer)) = self.peers.remove(name) {
            peer.close().await;
        }
    }

    pub fn peers(&self) -> Vec<Arc<Peer>> {
        self.peers.iter().map(|entry| entry.value().clone()).collect()
    }

    pub fn has_peer(&self, name: &str) -> bool {
        self.peers.contains_key(name)
    }

    fn spawn_peer_loop(self: Arc<Self>, peer: Arc<Peer>) {
        peer.set_keepalive(PEER_KEEPALIVE);
        tokio::spawn(async move {
            loop {
                let data = match peer.read_raw().await {
                    Ok(data) => data,
                    Err(e) => {
                        debug!(peer = %peer.name, "handle peer err, {e}");
                        self.disconnect_peer(&peer.name).await;
                        return;
                    }
                };
                let (_, src, dst) = parse_packet(&data);
                trace!(?src, ?dst, "peer -> veth");
                if let Err(e) = self.veth.write_packet(&data).await {
                    debug!("write veth err, {e}");
                }
            }
        });
    }

    fn spawn_veth_loop(self: Arc<Self>) {
        tokio::spawn(async move {
            let mut buf = vec![0u8; 8192];
            loop {
                let n = match self.veth.read_packet(&mut buf).await {
                    Ok(n) => n,
                    Err(e) => {
                        debug!("read veth err, {e}");
                        continue;
                    }
                };
                let data = &buf[..n];
                let (_, src, dst) = parse_packet(data);
                let Some(dst) = dst else { continue };

                if crate::network::is_broadcast(dst) {
                    for entry in self.peers.iter() {
                        trace!(?src, ?dst, "veth -> all peers");
                        let _ = entry.value().write_raw(data).await;
                    }
                } else {
                    for entry in self.peers.iter() {
                        if entry.value().has_ip(dst) {
                            trace!(?src, ?dst, "veth -> peer");
                            let _ = entry.value().write_raw(data).await;
                            break;
                        }
                    }
                }
            }
        });
    }
}
