//! The node process lifecycle: build the local network, then loop forever
//! logging into the hub, asking for peers, and punching holes to new
//! ones. Grounded in the original's `cmd/node/service/service.go`.

use std::time::Duration;

use tokio::sync::{watch, Mutex};
use tracing::{debug, error, info};

use crate::app::{P2pNetwork, P2pNetworkConfig};
use crate::config::NodeConfig;
use crate::error::Result;
use crate::hub::{DetectConfig, Exchanger, HubClient, TcpHubClient};

const HUB_LOGIN_RETRY_WAIT: Duration = Duration::from_secs(5);
const PEER_POLL_INTERVAL: Duration = Duration::from_secs(5);

pub struct NodeService {
    config: NodeConfig,
    network: Mutex<Option<P2pNetwork>>,
    cancel_tx: watch::Sender<bool>,
    cancel_rx: watch::Receiver<bool>,
}

impl NodeService {
    pub fn new(config: NodeConfig) -> Self {
        let (cancel_tx, cancel_rx) = watch::channel(false);
        Self { config, network: Mutex::new(None), cancel_tx, cancel_rx }
    }

    fn is_cancelled(&self) -> bool {
        *self.cancel_rx.borrow()
    }

    async fn cancelled(&self) {
        let mut rx = self.cancel_rx.clone();
        if *rx.borrow() {
            return;
        }
        while rx.changed().await.is_ok() {
            if *rx.borrow() {
                return;
            }
        }
    }

    pub async fn start(&self) -> Result<()> {
        let network = P2pNetwork::create(&P2pNetworkConfig {
            tun: self.config.net.tun.clone(),
            ip: self.config.net.ip.clone(),
            allow_nets: self.config.net.allow_nets.clone(),
            routers: self.config.net.routers.clone(),
        })
        .await?;
        *self.network.lock().await = Some(network);
        Ok(())
    }

    /// Runs until cancelled by [`Self::close`]: repeatedly logs in (its own
    /// name, once assigned by the hub, is reused on reconnect), streams
    /// punch plans into the local network, and polls for new peers.
    pub async fn run(&self) {
        let mut client_name = self.config.common.name.clone();

        while !self.is_cancelled() {
            let detect = DetectConfig {
                stun_host: self.config.stun.host.clone(),
                primary_port: self.config.stun.primary_port,
                secondary_port: self.config.stun.secondary_port,
            };
            let client: std::sync::Arc<dyn HubClient> = std::sync::Arc::new(TcpHubClient::new(
                self.config.server_host.clone(),
                self.config.server_port,
                client_name.clone(),
                self.config.common.token.clone(),
            ));

            let exchanger = match Exchanger::new(client, detect, self.config.net.ip.clone()).await {
                Ok(e) => e,
                Err(e) => {
                    error!("hub login failed, {e}");
                    tokio::time::sleep(HUB_LOGIN_RETRY_WAIT).await;
                    continue;
                }
            };
            client_name = exchanger.name().to_string();

            tokio::select! {
                _ = self.cancelled() => break,
                _ = self.serve_one_connection(&exchanger) => {}
            }
            exchanger.close().await;
        }
    }

    async fn serve_one_connection(&self, exchanger: &Exchanger) {
        let accept_loop = async {
            loop {
                let Some(info) = exchanger.accept().await else { return };
                debug!(peer = %info.peer_name, ip = %info.peer_ip, "peer come");
                let network = self.network.lock().await;
                if let Some(network) = network.as_ref() {
                    if let Err(e) = network.new_nat_peer(&info.peer_name, &info.peer_ip, &info.nat).await {
                        info!("new nat peer err, {e}");
                    }
                }
            }
        };

        let poll_loop = async {
            loop {
                let peers = match exchanger.get_peers().await {
                    Ok(p) => p,
                    Err(_) => return,
                };
                for peer in peers {
                    if peer == exchanger.name() {
                        continue;
                    }
                    let already_connected = {
                        let network = self.network.lock().await;
                        network.as_ref().is_some_and(|n| n.has_peer(&peer))
                    };
                    if already_connected {
                        continue;
                    }
                    if let Err(e) = exchanger.punch_peer(&peer, &self.config.net.ip).await {
                        debug!("punch peer {peer} failed, {e}");
                    }
                }
                tokio::time::sleep(PEER_POLL_INTERVAL).await;
            }
        };

        tokio::select! {
            _ = accept_loop => {}
            _ = poll_loop => {}
        }
    }

    pub async fn close(&self) {
        let _ = self.cancel_tx.send(true);
        if let Some(network) = self.network.lock().await.as_ref() {
            network.on_shutdown().await;
        }
    }
}
