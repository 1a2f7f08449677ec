//! Wires a [`Veth`], a [`RuleManager`] and a [`Bridge`] into the single
//! object a node service drives: create once, then hand it resolved punch
//! plans as peers come in. Grounded in the original's `app/network.go`.

use std::net::IpAddr;
use std::sync::Arc;

use ipnet::IpNet;
use tokio::sync::Mutex as AsyncMutex;
use tracing::info;

use crate::bridge::{Bridge, Peer};
use crate::config::RouterConfig;
use crate::device::{RuleManager, TunVeth, Veth};
use crate::error::{PtunError, Result};
use crate::nat::{make_hole, Nat};
use crate::network::stream::reconnect;
use crate::network::RawConn;
use crate::proto::Transport;

struct Route {
    next: IpAddr,
    network: IpNet,
}

pub struct P2pNetworkConfig {
    pub tun: String,
    pub ip: String,
    pub allow_nets: Vec<String>,
    pub routers: Vec<RouterConfig>,
}

/// One node's local network: the veth/bridge pair, the iptables rules
/// masquerading traffic for `allow_nets`, and the routed-subnet table a
/// newly connected peer's CIDR advertisement is checked against.
pub struct P2pNetwork {
    bridge: Arc<Bridge>,
    rules: Arc<RuleManager>,
    routes: Vec<Route>,
    connect_lock: AsyncMutex<()>,
}

impl P2pNetwork {
    pub async fn create(cfg: &P2pNetworkConfig) -> Result<Self> {
        let local_net: IpNet = cfg.ip.parse().map_err(|e| PtunError::InvalidConfig(format!("create p2p network err, {e}")))?;

        let mut routes = Vec::new();
        let mut veth_routes = Vec::new();
        for router in &cfg.routers {
            let next: IpAddr = router
                .next
                .parse()
                .map_err(|e| PtunError::InvalidConfig(format!("create p2p network err, {e}")))?;
            for network in &router.networks {
                let net: IpNet = network
                    .parse()
                    .map_err(|e| PtunError::InvalidConfig(format!("create p2p network err, {e}")))?;
                routes.push(Route { next, network: net });
            }
            veth_routes.extend(router.networks.iter().cloned());
        }

        let veth: Arc<dyn Veth> = Arc::new(TunVeth::new(&cfg.tun, &[cfg.ip.clone()], &veth_routes)?);
        let bridge = Bridge::new(veth);

        let rules = Arc::new(RuleManager::new());
        let allow_nets = crate::network::parse_ip_nets(&cfg.allow_nets)?;
        rules.update_iptables(&local_net.to_string(), &allow_nets).await?;

        Ok(Self { bridge, rules, routes, connect_lock: AsyncMutex::new(()) })
    }

    pub fn has_peer(&self, name: &str) -> bool {
        self.bridge.has_peer(name)
    }

    /// Punches a hole to `remote_ip`'s advertised CIDR and connects the
    /// resulting peer to the bridge under `name`, routing whatever subnets
    /// `remote_ip` is the configured next-hop for.
    pub async fn new_nat_peer(&self, name: &str, remote_ip: &str, nat: &Nat) -> Result<()> {
        let _guard = self.connect_lock.lock().await;

        let remote_net: IpNet = remote_ip
            .parse()
            .map_err(|e| PtunError::InvalidConfig(format!("parse ip err, {e}")))?;

        let (socket, remote_addr) = make_hole(nat).await?;
        let connected = reconnect(socket, remote_addr).await?;
        info!(local = %connected.local_addr().ok().map(|a| a.to_string()).unwrap_or_default(), remote = %remote_addr, "make hole success, wait connect");

        let transport = Transport::new(Box::new(RawConn::new(connected)));

        let peer_routes: Vec<IpNet> = self
            .routes
            .iter()
            .filter(|r| r.next == remote_net.addr())
            .map(|r| r.network)
            .collect();

        let peer = Arc::new(Peer::new(name.to_string(), vec![remote_net], peer_routes, transport));
        self.bridge.connect_peer(peer);
        Ok(())
    }

    pub async fn on_shutdown(&self) {
        self.rules.clear_all_rules().await;
    }
}
