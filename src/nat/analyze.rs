//! Turns two peers' [`DetectResult`]s into a hole-punch plan for each side.
//! Grounded in the original's `pkg/nat/analyze.go`.

use std::net::SocketAddr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::Result;
use crate::nat::detect::DetectResult;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Role {
    #[serde(rename = "server")]
    Server,
    #[serde(rename = "client")]
    Client,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "PascalCase")]
pub struct Action {
    #[serde(with = "duration_millis", default)]
    pub wait: Duration,
    #[serde(default)]
    pub try_remote: bool,
    #[serde(default)]
    pub low_ttl: bool,
    #[serde(default)]
    pub repeat: bool,
}

mod duration_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_i64(d.as_millis() as i64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let millis = i64::deserialize(d)?;
        Ok(Duration::from_millis(millis.max(0) as u64))
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default)]
#[serde(rename_all = "PascalCase")]
pub struct Resource {
    pub remote_port_start: i32,
    pub remote_port_end: i32,
    pub remote_port_count: i32,
    pub local_port_count: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct AnalyzeResult {
    pub local_addrs: Vec<String>,
    #[serde(default)]
    pub remote_local_addrs: Vec<String>,
    pub remote_mapped_addrs: Vec<String>,
    pub role: Role,
    pub resource: Resource,
    pub actions: Vec<Action>,
}

const MAX_PORT_DISTANCE: i32 = 256;

/// Classifies both peers and builds a plan pair. Neither side needs to know
/// which branch produced its own plan.
pub fn analyze(local: &DetectResult, remote: &DetectResult) -> Result<(AnalyzeResult, AnalyzeResult)> {
    let hard_local = is_random_port(local) || is_multi_extern_ip(local);
    let hard_remote = is_random_port(remote) || is_multi_extern_ip(remote);

    let (lresult, rresult) = match (hard_local, hard_remote) {
        (false, false) => analyze_double_easy(local, remote),
        (true, false) => analyze_has_easy(local, remote)?,
        (false, true) => {
            let (r, l) = analyze_has_easy(remote, local)?;
            (l, r)
        }
        (true, true) => analyze_double_hard(local, remote),
    };

    debug!(
        "analyze result left = {:?}, right = {:?}",
        lresult, rresult
    );
    Ok((lresult, rresult))
}

fn filter(addrs: &[&str]) -> Vec<String> {
    let mut set: std::collections::HashSet<&str> = std::collections::HashSet::new();
    for a in addrs {
        if !a.is_empty() {
            set.insert(a);
        }
    }
    set.into_iter().map(String::from).collect()
}

fn is_multi_extern_ip(r: &DetectResult) -> bool {
    let (p, s) = (parse_addr(&r.primary_mapped_addr), parse_addr(&r.secondary_mapped_addr));
    match (p, s) {
        (Some(p), Some(s)) => p.ip() != s.ip(),
        _ => false,
    }
}

fn is_random_port(r: &DetectResult) -> bool {
    let (p, s) = (parse_addr(&r.primary_mapped_addr), parse_addr(&r.secondary_mapped_addr));
    match (p, s) {
        (Some(p), Some(s)) => p.port() != s.port(),
        _ => false,
    }
}

fn parse_addr(s: &str) -> Option<SocketAddr> {
    s.parse().ok()
}

/// Returns `(start, end, distance)`, always ordered so `start <= end`.
fn ports_distance(r: &DetectResult) -> (i32, i32, i32) {
    let p = parse_addr(&r.primary_mapped_addr).map(|a| a.port() as i32).unwrap_or(0);
    let s = parse_addr(&r.secondary_mapped_addr).map(|a| a.port() as i32).unwrap_or(0);
    if s - p > 0 {
        (p, s, s - p)
    } else {
        (s, p, p - s)
    }
}

fn analyze_double_easy(local: &DetectResult, remote: &DetectResult) -> (AnalyzeResult, AnalyzeResult) {
    let lresult = AnalyzeResult {
        local_addrs: vec![local.local_addr.clone()],
        remote_local_addrs: filter(&[&remote.local_addr]),
        remote_mapped_addrs: filter(&[&remote.primary_mapped_addr, &remote.secondary_mapped_addr]),
        role: Role::Client,
        resource: Resource {
            local_port_count: 1,
            remote_port_count: 1,
            ..Default::default()
        },
        actions: vec![
            Action {
                wait: Duration::from_secs(1),
                ..Default::default()
            },
            Action {
                repeat: true,
                try_remote: true,
                ..Default::default()
            },
        ],
    };
    let rresult = AnalyzeResult {
        local_addrs: vec![remote.local_addr.clone()],
        remote_local_addrs: filter(&[&local.local_addr]),
        remote_mapped_addrs: filter(&[&local.primary_mapped_addr, &local.secondary_mapped_addr]),
        role: Role::Server,
        resource: Resource {
            local_port_count: 1,
            remote_port_count: 1,
            ..Default::default()
        },
        actions: vec![
            Action {
                try_remote: true,
                low_ttl: true,
                ..Default::default()
            },
            Action {
                repeat: true,
                try_remote: true,
                low_ttl: true,
                ..Default::default()
            },
        ],
    };
    (lresult, rresult)
}

/// `local` is hard, `remote` is easy.
///
/// The widening clamps below look inverted (`if ls > 10000 { ls = 10000 }`,
/// `if le < 65000 { le = 65000 }`) but that is what the original does, and
/// the effect is intentional: it widens the hard side's remote port guess
/// range rather than narrowing it. Preserved as observed — see DESIGN.md.
fn analyze_has_easy(local: &DetectResult, remote: &DetectResult) -> Result<(AnalyzeResult, AnalyzeResult)> {
    let remote_secondary_port = parse_addr(&remote.secondary_mapped_addr)
        .map(|a| a.port() as i32)
        .unwrap_or(0);

    let lresult = AnalyzeResult {
        local_addrs: vec![local.local_addr.clone()],
        remote_local_addrs: filter(&[&remote.local_addr]),
        remote_mapped_addrs: filter(&[&remote.primary_mapped_addr, &remote.secondary_mapped_addr]),
        role: Role::Client,
        resource: Resource {
            local_port_count: 256,
            remote_port_count: 1,
            remote_port_start: remote_secondary_port,
            ..Default::default()
        },
        actions: vec![
            Action {
                wait: Duration::from_secs(1),
                ..Default::default()
            },
            Action {
                repeat: true,
                try_remote: true,
                ..Default::default()
            },
        ],
    };

    let (mut ls, mut le, _) = ports_distance(local);
    if ls > 10000 {
        ls = 10000;
    }
    if le < 65000 {
        le = 65000;
    }
    let rresult = AnalyzeResult {
        local_addrs: vec![remote.local_addr.clone()],
        remote_local_addrs: filter(&[&local.local_addr]),
        remote_mapped_addrs: filter(&[&local.primary_mapped_addr, &local.secondary_mapped_addr]),
        role: Role::Server,
        resource: Resource {
            local_port_count: 1,
            remote_port_count: 1024,
            remote_port_start: ls,
            remote_port_end: le,
        },
        actions: vec![
            Action {
                try_remote: true,
                low_ttl: true,
                ..Default::default()
            },
            Action {
                repeat: true,
                try_remote: true,
                low_ttl: true,
                ..Default::default()
            },
        ],
    };
    Ok((lresult, rresult))
}

fn analyze_double_hard(local: &DetectResult, remote: &DetectResult) -> (AnalyzeResult, AnalyzeResult) {
    let lresult = AnalyzeResult {
        local_addrs: vec![local.local_addr.clone()],
        remote_local_addrs: Vec::new(),
        remote_mapped_addrs: filter(&[&remote.local_addr, &remote.primary_mapped_addr, &remote.secondary_mapped_addr]),
        role: Role::Client,
        resource: Resource {
            local_port_count: 256,
            remote_port_count: 1024,
            remote_port_start: 10000,
            remote_port_end: 65000,
        },
        actions: vec![
            Action {
                try_remote: true,
                low_ttl: true,
                ..Default::default()
            },
            Action {
                try_remote: true,
                repeat: true,
                ..Default::default()
            },
        ],
    };

    let (mut ls, mut le, _) = ports_distance(local);
    if ls > 10000 {
        ls = 10000;
    }
    if le < 65000 {
        le = 65000;
    }
    let rresult = AnalyzeResult {
        local_addrs: vec![remote.local_addr.clone()],
        remote_local_addrs: Vec::new(),
        remote_mapped_addrs: filter(&[&local.local_addr, &local.primary_mapped_addr, &local.secondary_mapped_addr]),
        role: Role::Server,
        resource: Resource {
            local_port_count: 256,
            remote_port_count: 1024,
            remote_port_start: ls,
            remote_port_end: le,
        },
        actions: vec![
            Action {
                try_remote: true,
                low_ttl: true,
                ..Default::default()
            },
            Action {
                try_remote: true,
                repeat: true,
                ..Default::default()
            },
        ],
    };
    (lresult, rresult)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result(local: &str, primary: &str, secondary: &str) -> DetectResult {
        DetectResult {
            local_addr: local.to_string(),
            primary_mapped_addr: primary.to_string(),
            secondary_mapped_addr: secondary.to_string(),
        }
    }

    #[test]
    fn two_cone_nats_get_the_double_easy_plan() {
        let local = result("10.0.0.1:1", "1.2.3.4:10", "1.2.3.4:10");
        let remote = result("10.0.0.2:1", "5.6.7.8:20", "5.6.7.8:20");
        let (l, r) = analyze(&local, &remote).unwrap();
        assert_eq!(l.role, Role::Client);
        assert_eq!(r.role, Role::Server);
        assert!(r.actions[0].low_ttl);
    }

    #[test]
    fn a_symmetric_local_nat_gets_the_has_easy_plan() {
        let local = result("10.0.0.1:1", "1.2.3.4:10", "1.2.3.4:11");
        let remote = result("10.0.0.2:1", "5.6.7.8:20", "5.6.7.8:20");
        let (l, r) = analyze(&local, &remote).unwrap();
        assert_eq!(l.role, Role::Client);
        assert_eq!(l.resource.local_port_count, 256);
        assert_eq!(r.role, Role::Server);
        assert_eq!(r.resource.remote_port_count, 1024);
    }

    #[test]
    fn two_symmetric_nats_get_the_double_hard_plan() {
        let local = result("10.0.0.1:1", "1.2.3.4:10", "1.2.3.4:11");
        let remote = result("10.0.0.2:1", "5.6.7.8:20", "5.6.7.8:21");
        let (l, r) = analyze(&local, &remote).unwrap();
        assert_eq!(l.resource.remote_port_start, 10000);
        assert_eq!(l.resource.remote_port_end, 65000);
        assert_eq!(r.resource.local_port_count, 256);
    }
}
