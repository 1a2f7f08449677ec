//! RFC 5780 mapping/filtering behavior discovery against a STUN server.
//! Grounded in the original's `pkg/nat/service_stun.go` (itself built on
//! `pion/stun`); here on `stun_codec`/`bytecodec`.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytecodec::{DecodeExt, EncodeExt};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use stun_codec::rfc5389::attributes::{MappedAddress, Software, XorMappedAddress};
use stun_codec::rfc5389::methods::BINDING;
use stun_codec::rfc5780::attributes::{ChangeRequest, OtherAddress, ResponseOrigin};
use stun_codec::{Message, MessageClass, MessageDecoder, MessageEncoder, TransactionId};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::time::timeout;

use crate::error::{PtunError, Result};

stun_codec::define_attribute_enums!(
    Attribute,
    AttributeDecoder,
    AttributeEncoder,
    [MappedAddress, XorMappedAddress, Software, ChangeRequest, OtherAddress, ResponseOrigin]
);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Behavior {
    NoNAT,
    EndpointIndependent,
    AddressDependent,
    AddressPortDependent,
    Unknown,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct StunBehavior {
    pub mapping_behavior: Behavior,
    pub filter_behavior: Behavior,
    pub local_addr: SocketAddr,
    pub mapped_ip_list: Vec<String>,
    pub mapped_port_list: Vec<u16>,
}

struct StunConn {
    socket: Arc<UdpSocket>,
    local_addr: SocketAddr,
    remote_addr: SocketAddr,
    other_addr: Option<SocketAddr>,
    mapped_addrs: Vec<SocketAddr>,
    replies: mpsc::Receiver<Message<Attribute>>,
}

async fn connect_stun(stun_addr: &str) -> Result<StunConn> {
    let remote_addr = tokio::net::lookup_host(stun_addr)
        .await?
        .next()
        .ok_or_else(|| PtunError::InvalidAddress(format!("could not resolve {stun_addr}")))?;
    let socket = Arc::new(UdpSocket::bind("0.0.0.0:0").await?);
    let local_addr = socket.local_addr()?;

    let (tx, rx) = mpsc::channel(8);
    let recv_socket = socket.clone();
    tokio::spawn(async move {
        let mut buf = [0u8; 1024];
        loop {
            let n = match recv_socket.recv(&mut buf).await {
                Ok(n) => n,
                Err(_) => return,
            };
            let mut decoder = MessageDecoder::<Attribute>::new();
            let decoded = match decoder.decode_from_bytes(&buf[..n]) {
                Ok(Ok(m)) => m,
                _ => continue,
            };
            if tx.send(decoded).await.is_err() {
                return;
            }
        }
    });

    Ok(StunConn {
        socket,
        local_addr,
        remote_addr,
        other_addr: None,
        mapped_addrs: Vec::new(),
        replies: rx,
    })
}

impl StunConn {
    async fn do_request(&mut self, message: Message<Attribute>, to: SocketAddr) -> Result<Message<Attribute>> {
        let mut encoder = MessageEncoder::new();
        let bytes = encoder
            .encode_into_bytes(message)
            .map_err(|e| PtunError::MalformedFrame(format!("stun encode failed: {e}")))?;
        self.socket.send_to(&bytes, to).await?;
        match timeout(Duration::from_secs(3), self.replies.recv()).await {
            Ok(Some(m)) => Ok(m),
            Ok(None) => Err(PtunError::DetectTimeout),
            Err(_) => Err(PtunError::DetectTimeout),
        }
    }
}

fn new_binding_request() -> Message<Attribute> {
    let mut id = [0u8; 12];
    rand::thread_rng().fill_bytes(&mut id);
    Message::new(MessageClass::Request, BINDING, TransactionId::new(id))
}

fn xor_mapped_addr(msg: &Message<Attribute>) -> Option<SocketAddr> {
    msg.get_attribute::<XorMappedAddress>().map(|a| a.address())
}

fn other_addr(msg: &Message<Attribute>) -> Option<SocketAddr> {
    msg.get_attribute::<OtherAddress>().map(|a| a.address())
}

/// Test 1: no NAT iff our observed address is our local address. Test 2:
/// swap the server IP; unchanged mapping means endpoint-independent. Test
/// 3: swap just the port; unchanged means address-dependent, else
/// address-and-port dependent.
pub async fn mapping_tests(stun_addr: &str) -> Result<Behavior> {
    let mut conn = connect_stun(stun_addr).await?;
    mapping_tests_on(&mut conn).await
}

async fn mapping_tests_on(conn: &mut StunConn) -> Result<Behavior> {
    let req1 = new_binding_request();
    let resp1 = conn.do_request(req1, conn.remote_addr).await?;
    let xor1 = xor_mapped_addr(&resp1).ok_or_else(|| PtunError::AnalyzeFailed("no XOR-MAPPED-ADDRESS".into()))?;
    if xor1 == conn.local_addr {
        return Ok(Behavior::NoNAT);
    }
    conn.other_addr = Some(other_addr(&resp1).ok_or_else(|| PtunError::AnalyzeFailed("no OTHER-ADDRESS".into()))?);
    conn.mapped_addrs.push(xor1);

    let other = conn.other_addr.unwrap();
    let req2 = new_binding_request();
    let resp2 = conn.do_request(req2, other).await?;
    let xor2 = xor_mapped_addr(&resp2);
    if let Some(xor2) = xor2 {
        conn.mapped_addrs.push(xor2);
    }
    if xor2 == Some(xor1) {
        return Ok(Behavior::EndpointIndependent);
    }

    let mut other_port_only = other;
    other_port_only.set_ip(conn.remote_addr.ip());
    let req3 = new_binding_request();
    let resp3 = conn.do_request(req3, other_port_only).await?;
    let xor3 = xor_mapped_addr(&resp3);
    if let Some(xor3) = xor3 {
        conn.mapped_addrs.push(xor3);
    }
    if xor3 == xor2 {
        Ok(Behavior::AddressDependent)
    } else {
        Ok(Behavior::AddressPortDependent)
    }
}

fn change_request(change_ip: bool, change_port: bool) -> ChangeRequest {
    ChangeRequest::new(change_ip, change_port)
}

/// Test 1 just learns `OTHER-ADDRESS`. Test 2 asks the server to reply from
/// a different IP and port; success means endpoint-independent filtering.
/// Test 3 asks for a different port only; success means address-dependent,
/// a timeout means address-and-port dependent.
pub async fn filter_tests(stun_addr: &str) -> Result<Behavior> {
    let mut conn = connect_stun(stun_addr).await?;
    filter_tests_on(&mut conn).await
}

async fn filter_tests_on(conn: &mut StunConn) -> Result<Behavior> {
    let req1 = new_binding_request();
    let resp1 = conn.do_request(req1, conn.remote_addr).await?;
    let xor1 = xor_mapped_addr(&resp1).ok_or_else(|| PtunError::AnalyzeFailed("no XOR-MAPPED-ADDRESS".into()))?;
    conn.other_addr = Some(other_addr(&resp1).ok_or_else(|| PtunError::AnalyzeFailed("no OTHER-ADDRESS".into()))?);
    conn.mapped_addrs.push(xor1);

    let mut req2 = new_binding_request();
    req2.add_attribute(change_request(true, true));
    match conn.do_request(req2, conn.remote_addr).await {
        Ok(resp2) => {
            if let Some(xor2) = xor_mapped_addr(&resp2) {
                conn.mapped_addrs.push(xor2);
            }
            return Ok(Behavior::EndpointIndependent);
        }
        Err(PtunError::DetectTimeout) => {}
        Err(e) => return Err(e),
    }

    let mut req3 = new_binding_request();
    req3.add_attribute(change_request(false, true));
    match conn.do_request(req3, conn.remote_addr).await {
        Ok(resp3) => {
            if let Some(xor3) = xor_mapped_addr(&resp3) {
                conn.mapped_addrs.push(xor3);
            }
            Ok(Behavior::AddressDependent)
        }
        Err(PtunError::DetectTimeout) => Ok(Behavior::AddressPortDependent),
        Err(e) => Err(e),
    }
}

/// Runs both test suites against one shared connection and summarizes the
/// mapped addresses observed along the way, deduplicated into an ip list
/// and a port list.
pub async fn analyze_stun_behavior(stun_addr: &str) -> Result<StunBehavior> {
    let mut conn = connect_stun(stun_addr).await?;
    let local_addr = conn.local_addr;

    let mapping_behavior = mapping_tests_on(&mut conn).await?;
    let filter_behavior = filter_tests_on(&mut conn).await?;
    if mapping_behavior == Behavior::Unknown || filter_behavior == Behavior::Unknown {
        return Err(PtunError::AnalyzeFailed("stun behavior test failure".into()));
    }

    let mut mapped_ip_list = Vec::new();
    let mut mapped_port_list = Vec::new();
    for addr in &conn.mapped_addrs {
        let ip = addr.ip().to_string();
        if !mapped_ip_list.contains(&ip) {
            mapped_ip_list.push(ip);
        }
        let port = addr.port();
        if !mapped_port_list.contains(&port) {
            mapped_port_list.push(port);
        }
    }

    Ok(StunBehavior {
        mapping_behavior,
        filter_behavior,
        local_addr,
        mapped_ip_list,
        mapped_port_list,
    })
}
