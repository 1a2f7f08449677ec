//! The hub process: a pluggable set of [`HubServer`] listeners feeding
//! logged-in sessions into one session table, plus the peer-list and
//! punch-brokering request handlers. Grounded in the original's
//! `pkg/hub/hub.go` and `pkg/hub/hub_tcp.go`.
//!
//! The original's `HubServer.Accept() <-chan *session` is replaced with a
//! sender the hub hands each listener at `start` time — same fan-in shape,
//! one less interface method to implement per transport kind.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::error::Result;
use crate::hub::session::Session;
use crate::model::{LoginRequest, LoginResponse, PeerListResponse, PunchRequest, PunchResponse};
use crate::nat::analyze;
use crate::proto::message::Request;
use crate::proto::Transport;

const LOGIN_TIMEOUT: Duration = Duration::from_secs(5);
const PUNCH_DETECT_TIMEOUT: Duration = Duration::from_secs(3);

/// Something that accepts connections, runs the login handshake, and
/// forwards each resulting [`Session`] to the hub.
#[async_trait]
pub trait HubServer: Send + Sync {
    async fn start(&self, sessions: mpsc::UnboundedSender<Session>) -> Result<()>;
    async fn close(&self);
}

/// A bare TCP listener speaking the proto framing directly — no transport
/// encryption, matching the original (the hub is a trusted rendezvous
/// point, not a relay for peer traffic).
pub struct TcpHubServer {
    port: u16,
    token: String,
    accept_task: tokio::sync::Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl TcpHubServer {
    pub fn new(port: u16, token: impl Into<String>) -> Self {
        Self { port, token: token.into(), accept_task: tokio::sync::Mutex::new(None) }
    }

    async fn handle_login(transport: Transport, token: String, sessions: mpsc::UnboundedSender<Session>) {
        let req = match transport.read_request(LOGIN_TIMEOUT).await {
            Ok(req) => req,
            Err(e) => {
                info!("wait for login failed, {e}");
                transport.close().await;
                return;
            }
        };
        let login: LoginRequest = match req.payload.clone().try_into() {
            Ok(l) => l,
            Err(e) => {
                info!("login failed, {e}");
                transport.close().await;
                return;
            }
        };
        if login.token != token {
            info!("login failed, invalid token");
            transport.close().await;
            return;
        }
        let name = if login.name.is_empty() { uuid::Uuid::new_v4().to_string() } else { login.name };
        if let Err(e) = transport
            .reply_success(&req, LoginResponse { name: name.clone(), connection_id: String::new() })
            .await
        {
            info!("login failed, {e}");
            transport.close().await;
            return;
        }
        let _ = sessions.send(Session::new(name, transport));
    }
}

#[async_trait]
impl HubServer for TcpHubServer {
    async fn start(&self, sessions: mpsc::UnboundedSender<Session>) -> Result<()> {
        let addr: SocketAddr = format!("0.0.0.0:{}", self.port).parse().expect("valid listen addr");
        let listener = TcpListener::bind(addr).await?;

        let token = self.token.clone();
        let task = tokio::spawn(async move {
            loop {
                let (stream, _) = match listener.accept().await {
                    Ok(pair) => pair,
                    Err(_) => {
                        debug!("tcp hub server accept loop exit");
                        return;
                    }
                };
                let transport = Transport::new(Box::new(stream));
                let token = token.clone();
                let sessions = sessions.clone();
                tokio::spawn(TcpHubServer::handle_login(transport, token, sessions));
            }
        });
        *self.accept_task.lock().await = Some(task);
        Ok(())
    }

    async fn close(&self) {
        if let Some(task) = self.accept_task.lock().await.take() {
            task.abort();
        }
    }
}

/// Aggregates sessions from one or more [`HubServer`]s into a single named
/// table, and brokers the peer-list and punch-plan exchange between them.
pub struct Hub {
    sessions: DashMap<String, Session>,
    servers: Vec<Arc<dyn HubServer>>,
}

impl Hub {
    pub fn new(servers: Vec<Arc<dyn HubServer>>) -> Arc<Self> {
        Arc::new(Self { sessions: DashMap::new(), servers })
    }

    pub async fn start(self: &Arc<Self>) -> Result<()> {
        let (tx, mut rx) = mpsc::unbounded_channel();
        for server in &self.servers {
            server.start(tx.clone()).await?;
        }
        let hub = self.clone();
        tokio::spawn(async move {
            while let Some(session) = rx.recv().await {
                let hub = hub.clone();
                tokio::spawn(async move { hub.handle(session).await });
            }
        });
        Ok(())
    }

    pub async fn close(&self) {
        for server in &self.servers {
            server.close().await;
        }
    }

    fn save_session(&self, session: Session) {
        if let Some((_, old)) = self.sessions.remove(&session.name) {
            tokio::spawn(async move { old.close().await });
        }
        self.sessions.insert(session.name.clone(), session);
    }

    fn remove_session(&self, name: &str) {
        if let Some((_, old)) = self.sessions.remove(name) {
            tokio::spawn(async move { old.close().await });
        }
    }

    fn load_session(&self, name: &str) -> Option<Session> {
        self.sessions.get(name).map(|entry| entry.value().clone())
    }

    fn all_session_names(&self) -> Vec<String> {
        self.sessions.iter().map(|entry| entry.key().clone()).collect()
    }

    async fn handle(self: Arc<Self>, session: Session) {
        debug!(name = %session.name, "new session");

        session.request_dispatcher().add_handler("PeerListRequest", {
            let hub = self.clone();
            let session = session.clone();
            Arc::new(move |req: Request| {
                let hub = hub.clone();
                let session = session.clone();
                tokio::spawn(async move {
                    debug!(name = %session.name, "recv peer list request");
                    let _ = session
                        .reply_success(&req, PeerListResponse { peer_names: hub.all_session_names() })
                        .await;
                });
            })
        });

        session.request_dispatcher().add_handler("PunchRequest", {
            let hub = self.clone();
            let session = session.clone();
            Arc::new(move |req: Request| {
                let hub = hub.clone();
                let session = session.clone();
                tokio::spawn(async move { hub.handle_punch(session, req).await });
            })
        });

        self.save_session(session.clone());
        session.closed().await;
        self.remove_session(&session.name);
        session.close().await;
        debug!(name = %session.name, "session leave");
    }

    async fn handle_punch(&self, session: Session, req: Request) {
        debug!(name = %session.name, "recv punch request");
        let punch_req: PunchRequest = match req.payload.clone().try_into() {
            Ok(r) => r,
            Err(e) => {
                debug!("malformed punch request: {e}");
                return;
            }
        };

        let remote = match self.load_session(&punch_req.peer_name) {
            Some(s) => s,
            None => {
                debug!(peer = %punch_req.peer_name, "peer not found in sessions");
                return;
            }
        };

        let resp = match remote
            .send_message(crate::model::DetectNatRequest::default(), PUNCH_DETECT_TIMEOUT)
            .await
        {
            Ok(r) => r,
            Err(_) => {
                debug!(peer = %punch_req.peer_name, "peer send failed");
                return;
            }
        };
        let detect_result: crate::model::DetectNatResponse = match resp.payload.try_into() {
            Ok(d) => d,
            Err(_) => {
                debug!(peer = %punch_req.peer_name, "peer did not give a usable response");
                return;
            }
        };

        let remote_ip = detect_result.ip;
        let remote_mapping = detect_result.local.mapping;
        let local_mapping = punch_req.local.mapping;

        let (local_plan, remote_plan) = match analyze(&local_mapping, &remote_mapping) {
            Ok(plans) => plans,
            Err(e) => {
                debug!("nat analyze failed: {e}");
                return;
            }
        };

        let _ = session
            .reply(
                &req,
                0,
                "success",
                PunchResponse {
                    local_ip: punch_req.local_ip.clone(),
                    remote_ip: remote_ip.clone(),
                    local_nat: local_plan.clone(),
                    remote_nat: remote_plan.clone(),
                    remote_peer_name: remote.name.clone(),
                },
            )
            .await;

        let _ = remote
            .send_success(PunchResponse {
                local_ip: remote_ip,
                remote_ip: punch_req.local_ip,
                local_nat: remote_plan,
                remote_nat: local_plan,
                remote_peer_name: session.name.clone(),
            })
            .await;
    }
}
