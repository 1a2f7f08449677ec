//! Keeps the host's NAT masquerade rules in sync with the peer subnets a
//! bridge currently serves. Grounded in the original's `pkg/device/rule.go`.

use std::collections::HashMap;

use ipnet::IpNet;
use tokio::process::Command;
use tokio::sync::Mutex;
use tracing::debug;

use crate::error::Result;

const TABLE: &str = "nat";
const CHAIN: &str = "POSTROUTING";

/// Tracks which MASQUERADE rules are currently installed, keyed by
/// destination subnet, and reconciles them against a new desired set.
pub struct RuleManager {
    rules: Mutex<HashMap<String, Vec<String>>>,
}

impl RuleManager {
    pub fn new() -> Self {
        Self { rules: Mutex::new(HashMap::new()) }
    }

    /// Adds a MASQUERADE rule for every `dsts` entry not already present,
    /// then removes any previously installed rule whose destination is no
    /// longer in `dsts`.
    pub async fn update_iptables(&self, peer_net: &str, dsts: &[IpNet]) -> Result<()> {
        let mut rules = self.rules.lock().await;
        let mut updated = std::collections::HashSet::new();

        for dst in dsts {
            let dst_str = dst.to_string();
            let rule = vec![
                "-s".to_string(),
                peer_net.to_string(),
                "-d".to_string(),
                dst_str.clone(),
                "-j".to_string(),
                "MASQUERADE".to_string(),
            ];
            if !iptables_exists(&rule).await? {
                iptables_append(&rule).await?;
            }
            rules.insert(dst_str.clone(), rule);
            updated.insert(dst_str);
        }

        let stale: Vec<String> = rules.keys().filter(|k| !updated.contains(*k)).cloned().collect();
        for key in stale {
            if let Some(rule) = rules.get(&key) {
                if iptables_exists(rule).await? {
                    iptables_delete(rule).await?;
                }
            }
            rules.remove(&key);
        }

        debug!(rule_count = rules.len(), "updated iptables");
        Ok(())
    }

    /// Removes every rule this manager has installed.
    pub async fn clear_all_rules(&self) {
        let mut rules = self.rules.lock().await;
        for (key, rule) in rules.clone() {
            match iptables_exists(&rule).await {
                Ok(true) => {}
                _ => continue,
            }
            if iptables_delete(&rule).await.is_ok() {
                rules.remove(&key);
            }
        }
        debug!("cleared iptables rules");
    }
}

impl Default for RuleManager {
    fn default() -> Self {
        Self::new()
    }
}

async fn iptables_exists(rule: &[String]) -> Result<bool> {
    let status = Command::new("iptables")
        .arg("-t").arg(TABLE)
        .arg("-C").arg(CHAIN)
        .args(rule)
        .status()
        .await?;
    Ok(status.success())
}

async fn iptables_append(rule: &[String]) -> Result<()> {
    Command::new("iptables")
        .arg("-t").arg(TABLE)
        .arg("-A").arg(CHAIN)
        .args(rule)
        .status()
        .await?;
    Ok(())
}

async fn iptables_delete(rule: &[String]) -> Result<()> {
    Command::new("iptables")
        .arg("-t").arg(TABLE)
        .arg("-D").arg(CHAIN)
        .args(rule)
        .status()
        .await?;
    Ok(())
}
