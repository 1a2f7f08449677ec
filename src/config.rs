//! TOML configuration for both binaries. Grounded in the original's
//! `app/config/{common,client,server}.go`; `viper`'s runtime search-path
//! and env-prefix behavior is replaced with an explicit search list and
//! `toml::from_str`, since there's no equivalent crate in this stack.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::{PtunError, Result};

/// Search order the original's `viper` instance used, relative to the
/// working directory: `.`, `..`, `./conf`, `../conf`, `/etc/ptun`,
/// `$HOME/.ptun`, `../..`, `../../conf`.
fn config_search_paths(file_name: &str) -> Vec<PathBuf> {
    let mut paths = vec![
        PathBuf::from(".").join(file_name),
        PathBuf::from("..").join(file_name),
        PathBuf::from("./conf").join(file_name),
        PathBuf::from("../conf").join(file_name),
        PathBuf::from("/etc/ptun").join(file_name),
        PathBuf::from("../..").join(file_name),
        PathBuf::from("../../conf").join(file_name),
    ];
    if let Some(home) = std::env::var_os("HOME") {
        paths.push(PathBuf::from(home).join(".ptun").join(file_name));
    }
    paths
}

fn load_toml<T: for<'de> Deserialize<'de>>(path: Option<&str>, default_name: &str) -> Result<T> {
    if let Some(path) = path {
        let text = std::fs::read_to_string(path)
            .map_err(|e| PtunError::InvalidConfig(format!("reading {path}: {e}")))?;
        return toml::from_str(&text).map_err(|e| PtunError::InvalidConfig(format!("parsing {path}: {e}")));
    }

    for candidate in config_search_paths(default_name) {
        if candidate.exists() {
            return load_toml(Some(candidate.to_string_lossy().as_ref()), default_name);
        }
    }
    Err(PtunError::InvalidConfig(format!("{default_name} not found on the search path")))
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommonConfig {
    #[serde(default)]
    pub name: String,
    pub token: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StunServerType {
    Simple,
    Standard,
}

fn validate_stun_server_type(_t: StunServerType) -> Result<()> {
    Ok(())
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StunClientConfig {
    #[serde(rename = "Type")]
    pub kind: StunServerType,
    #[serde(rename = "Host")]
    pub host: String,
    #[serde(rename = "PrimaryPort")]
    pub primary_port: u16,
    #[serde(rename = "SecondaryPort")]
    pub secondary_port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouterConfig {
    #[serde(rename = "Next")]
    pub next: String,
    #[serde(rename = "Networks")]
    pub networks: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetConfig {
    #[serde(rename = "Tun")]
    pub tun: String,
    #[serde(rename = "IP")]
    pub ip: String,
    #[serde(rename = "AllowNets", default)]
    pub allow_nets: Vec<String>,
    #[serde(rename = "Routers", default)]
    pub routers: Vec<RouterConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    #[serde(flatten)]
    pub common: CommonConfig,
    #[serde(rename = "ServerHost")]
    pub server_host: String,
    #[serde(rename = "ServerPort")]
    pub server_port: u16,
    #[serde(rename = "Stun")]
    pub stun: StunClientConfig,
    #[serde(rename = "Net")]
    pub net: NetConfig,
}

impl NodeConfig {
    pub const DEFAULT_FILE: &'static str = "ptun-node1.toml";

    pub fn load(path: Option<&str>) -> Result<Self> {
        let cfg: NodeConfig = load_toml(path, Self::DEFAULT_FILE)?;
        Ok(cfg)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StunServerConfig {
    #[serde(rename = "Type")]
    pub kind: StunServerType,
    #[serde(rename = "PrimaryPort")]
    pub primary_port: u16,
    #[serde(rename = "SecondaryPort")]
    pub secondary_port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HubConfig {
    #[serde(flatten)]
    pub common: CommonConfig,
    #[serde(rename = "ServerPort")]
    pub server_port: u16,
    #[serde(rename = "Stun")]
    pub stun: StunServerConfig,
}

impl HubConfig {
    pub const DEFAULT_FILE: &'static str = "ptun-hub.toml";

    pub fn load(path: Option<&str>) -> Result<Self> {
        let cfg: HubConfig = load_toml(path, Self::DEFAULT_FILE)?;
        validate_stun_server_type(cfg.stun.kind)?;
        if cfg.stun.primary_port == cfg.stun.secondary_port {
            return Err(PtunError::InvalidConfig("cannot use same stun ports".into()));
        }
        Ok(cfg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hub_config_rejects_matching_stun_ports() {
        let toml = r#"
            Token = "secret"
            ServerPort = 9000
            [Stun]
            Type = "simple"
            PrimaryPort = 3478
            SecondaryPort = 3478
        "#;
        let dir = std::env::temp_dir().join(format!("ptun-hub-test-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("ptun-hub.toml");
        std::fs::write(&path, toml).unwrap();

        let err = HubConfig::load(Some(path.to_str().unwrap())).unwrap_err();
        assert!(matches!(err, PtunError::InvalidConfig(_)));
        std::fs::remove_dir_all(&dir).ok();
    }
}
