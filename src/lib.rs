//! A peer-to-peer virtual LAN: nodes rendezvous at a hub, punch UDP holes
//! through their NATs, and bridge an encapsulated IP packet stream onto a
//! local TUN interface.

pub mod app;
pub mod bridge;
pub mod config;
pub mod device;
pub mod error;
pub mod hub;
pub mod model;
pub mod nat;
pub mod network;
pub mod proto;
pub mod service;
