//! The hub process lifecycle: run the simple NAT-detect probe server and
//! the TCP rendezvous hub side by side until cancelled. Grounded in the
//! original's `cmd/hub/service/service.go`.

use std::sync::Arc;

use tokio::sync::watch;

use crate::config::HubConfig;
use crate::error::Result;
use crate::hub::{Hub, TcpHubServer};
use crate::nat::Server as NatServer;

pub struct HubService {
    config: HubConfig,
    nat_server: Arc<NatServer>,
    hub: std::sync::Mutex<Option<Arc<Hub>>>,
    cancel_tx: watch::Sender<bool>,
    cancel_rx: watch::Receiver<bool>,
}

impl HubService {
    pub fn new(config: HubConfig) -> Self {
        let nat_server = Arc::new(NatServer::new(config.stun.primary_port, config.stun.secondary_port));
        let (cancel_tx, cancel_rx) = watch::channel(false);
        Self { config, nat_server, hub: std::sync::Mutex::new(None), cancel_tx, cancel_rx }
    }

    pub async fn start(&self) -> Result<()> {
        self.nat_server.start().await?;

        let hub = Hub::new(vec![Arc::new(TcpHubServer::new(self.config.server_port, self.config.common.token.clone()))]);
        hub.start().await?;
        *self.hub.lock().unwrap() = Some(hub);
        Ok(())
    }

    pub async fn run(&self) {
        let mut rx = self.cancel_rx.clone();
        while !*rx.borrow() {
            if rx.changed().await.is_err() {
                break;
            }
        }
        if let Some(hub) = self.hub.lock().unwrap().take() {
            hub.close().await;
        }
        self.nat_server.stop().await;
    }

    pub fn close(&self) {
        let _ = self.cancel_tx.send(true);
    }
}
