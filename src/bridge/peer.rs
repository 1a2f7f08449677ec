//! One connected peer, addressable by the IP ranges it owns or routes.
//! Grounded in the original's `pkg/bridge/peer.go`.

use std::net::IpAddr;
use std::ops::Deref;

use ipnet::IpNet;

use crate::proto::Transport;

pub struct Peer {
    pub transport: Transport,
    pub name: String,
    ips: Vec<IpNet>,
    routes: Vec<IpNet>,
}

impl Peer {
    pub fn new(name: String, ips: Vec<IpNet>, routes: Vec<IpNet>, transport: Transport) -> Self {
        Self { transport, name, ips, routes }
    }

    /// True if `ip` falls inside one of this peer's own addresses or one
    /// of the subnets it routes for.
    pub fn has_ip(&self, ip: IpAddr) -> bool {
        self.ips.iter().any(|net| net.contains(&ip)) || self.routes.iter().any(|net| net.contains(&ip))
    }
}

impl Deref for Peer {
    type Target = Transport;
    fn deref(&self) -> &Transport {
        &self.transport
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn net(s: &str) -> IpNet {
        s.parse().unwrap()
    }

    #[tokio::test]
    async fn has_ip_matches_owned_addresses_and_routes() {
        let (a, _b) = tokio::io::duplex(64);
        let peer = Peer::new(
            "peer-a".into(),
            vec![net("10.10.0.2/32")],
            vec![net("192.168.1.0/24")],
            Transport::new(Box::new(a)),
        );
        assert!(peer.has_ip("10.10.0.2".parse().unwrap()));
        assert!(peer.has_ip("192.168.1.55".parse().unwrap()));
        assert!(!peer.has_ip("172.16.0.1".parse().unwrap()));
    }
}
