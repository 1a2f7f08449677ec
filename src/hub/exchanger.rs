//! The node side of the hub protocol: logs in (retrying on failure),
//! answers the hub's NAT-detect probes, and turns punch responses into an
//! [`ExchangeInfo`] stream the bridge acts on. Grounded in the original's
//! `pkg/hub/exchanger.go`.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::debug;

use crate::error::Result;
use crate::hub::client::HubClient;
use crate::hub::session::Session;
use crate::model::{DetectNatRequest, DetectNatResponse, PeerListRequest, PeerListResponse, PeerNatInfo, PunchRequest, PunchResponse};
use crate::nat::{self, Nat};
use crate::proto::message::{Request, Response};

const LOGIN_REPEAT_WAIT: Duration = Duration::from_secs(10);
const LOGIN_REPEAT_COUNT: usize = 3;
const GET_PEERS_TIMEOUT: Duration = Duration::from_secs(10);

/// A resolved punch plan, ready to hand to [`crate::nat::make_hole`], plus
/// who it's for.
pub struct ExchangeInfo {
    pub nat: Nat,
    pub peer_name: String,
    pub peer_ip: String,
}

/// Host/port pair this node answers the hub's NAT-detect probes against.
#[derive(Clone)]
pub struct DetectConfig {
    pub stun_host: String,
    pub primary_port: u16,
    pub secondary_port: u16,
}

pub struct Exchanger {
    session: Session,
    detect: DetectConfig,
    ip: String,
    info_tx: mpsc::Sender<ExchangeInfo>,
    info_rx: tokio::sync::Mutex<mpsc::Receiver<ExchangeInfo>>,
}

impl Exchanger {
    pub async fn new(client: Arc<dyn HubClient>, detect: DetectConfig, ip: String) -> Result<Arc<Self>> {
        let session = try_login(client.as_ref()).await?;
        let (info_tx, info_rx) = mpsc::channel(8);

        let exchanger = Arc::new(Self { session, detect, ip, info_tx, info_rx: tokio::sync::Mutex::new(info_rx) });

        exchanger.session.request_dispatcher().add_handler("DetectNatRequest", {
            let exchanger = exchanger.clone();
            Arc::new(move |req: Request| {
                let exchanger = exchanger.clone();
                tokio::spawn(async move { exchanger.handle_detect_nat(req).await });
            })
        });

        exchanger.session.response_dispatcher().add_handler("PunchResponse", {
            let exchanger = exchanger.clone();
            Arc::new(move |resp: Response| {
                let exchanger = exchanger.clone();
                tokio::spawn(async move { exchanger.handle_punch(resp).await });
            })
        });

        Ok(exchanger)
    }

    pub async fn close(&self) {
        self.session.close().await;
    }

    pub fn name(&self) -> &str {
        &self.session.name
    }

    pub async fn get_peers(&self) -> Result<Vec<String>> {
        let resp = self.session.send_message(PeerListRequest {}, GET_PEERS_TIMEOUT).await?;
        let payload: PeerListResponse = resp.payload.try_into()?;
        Ok(payload.peer_names)
    }

    pub async fn punch_peer(&self, name: &str, local_ip: &str) -> Result<()> {
        let mapping = nat::detect(&self.detect.stun_host, self.detect.primary_port, self.detect.secondary_port).await?;
        self.session
            .send_request(PunchRequest {
                peer_name: name.to_string(),
                local_ip: local_ip.to_string(),
                local: PeerNatInfo { name: self.session.name.clone(), mapping },
            })
            .await?;
        Ok(())
    }

    /// Yields each resolved punch plan as the hub brokers it. Only one
    /// caller should hold this at a time.
    pub async fn accept(&self) -> Option<ExchangeInfo> {
        self.info_rx.lock().await.recv().await
    }

    async fn handle_detect_nat(&self, req: Request) {
        let mapping = match nat::detect(&self.detect.stun_host, self.detect.primary_port, self.detect.secondary_port).await {
            Ok(m) => m,
            Err(e) => {
                debug!("detect nat failed: {e}");
                return;
            }
        };
        let _ = self
            .session
            .reply_success(
                &req,
                DetectNatResponse {
                    local: PeerNatInfo { name: self.session.name.clone(), mapping },
                    ip: self.ip.clone(),
                },
            )
            .await;
    }

    async fn handle_punch(&self, resp: Response) {
        let payload: PunchResponse = match resp.payload.try_into() {
            Ok(p) => p,
            Err(e) => {
                debug!("punch response parse error: {e}");
                return;
            }
        };

        let local_nat = match nat::nat_from_analyze(&payload.local_nat) {
            Ok(n) => n,
            Err(e) => {
                debug!("resolving punch addresses failed: {e}");
                return;
            }
        };

        let info = ExchangeInfo { nat: local_nat, peer_name: payload.remote_peer_name, peer_ip: payload.remote_ip };
        tokio::select! {
            result = self.info_tx.send(info) => { let _ = result; }
            _ = self.session.closed() => {}
        }
    }
}

async fn try_login(client: &dyn HubClient) -> Result<Session> {
    let mut attempt = 0;
    loop {
        match client.login().await {
            Ok(session) => return Ok(session),
            Err(e) => {
                attempt += 1;
                if attempt > LOGIN_REPEAT_COUNT {
                    return Err(e);
                }
                debug!("login attempt {attempt} failed: {e}");
                tokio::time::sleep(LOGIN_REPEAT_WAIT).await;
            }
        }
    }
}
