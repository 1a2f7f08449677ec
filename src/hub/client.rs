//! The node side of the login handshake: dials the hub and exchanges a
//! [`LoginRequest`]/[`LoginResponse`] pair for a [`Session`]. Grounded in
//! the original's `pkg/hub/hub_tcp.go` (`TcpHubClient`).

use std::time::Duration;

use async_trait::async_trait;
use tokio::net::TcpStream;

use crate::error::{PtunError, Result};
use crate::hub::session::Session;
use crate::model::{LoginRequest, LoginResponse};
use crate::proto::Transport;

pub const LOGIN_CONNECTION_TIMEOUT: Duration = Duration::from_secs(10);

/// Something that can produce a logged-in [`Session`], so [`super::exchanger::Exchanger`]
/// can retry login without caring which transport it dials over.
#[async_trait]
pub trait HubClient: Send + Sync {
    async fn login(&self) -> Result<Session>;
}

pub struct TcpHubClient {
    host: String,
    port: u16,
    client_name: String,
    token: String,
}

impl TcpHubClient {
    pub fn new(host: impl Into<String>, port: u16, client_name: impl Into<String>, token: impl Into<String>) -> Self {
        Self { host: host.into(), port, client_name: client_name.into(), token: token.into() }
    }
}

#[async_trait]
impl HubClient for TcpHubClient {
    async fn login(&self) -> Result<Session> {
        let stream = TcpStream::connect((self.host.as_str(), self.port)).await?;
        let transport = Transport::new(Box::new(stream));

        if let Err(e) = transport
            .send_request(LoginRequest { name: self.client_name.clone(), token: self.token.clone() })
            .await
        {
            transport.close().await;
            return Err(e);
        }

        let resp = match transport.read_response(LOGIN_CONNECTION_TIMEOUT).await {
            Ok(r) => r,
            Err(e) => {
                transport.close().await;
                return Err(e);
            }
        };
        if resp.code != 0 {
            transport.close().await;
            return Err(PtunError::LoginRejected(resp.message));
        }
        let login: LoginResponse = match resp.payload.try_into() {
            Ok(l) => l,
            Err(e) => {
                transport.close().await;
                return Err(e);
            }
        };

        Ok(Session::new(login.name, transport))
    }
}
