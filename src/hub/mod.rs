//! The rendezvous protocol: a hub aggregates logged-in node sessions and
//! brokers NAT punch plans between them; a node logs in, watches for punch
//! plans, and asks for peers. Grounded in the original's `pkg/hub`.

pub mod client;
pub mod exchanger;
pub mod server;
pub mod session;

pub use client::{HubClient, TcpHubClient};
pub use exchanger::{DetectConfig, ExchangeInfo, Exchanger};
pub use server::{Hub, HubServer, TcpHubServer};
pub use session::Session;
