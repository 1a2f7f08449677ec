//! Packet inspection, TTL manipulation, and the stream adapters a
//! [`crate::proto::Transport`] can be built on.

pub mod crypto;
pub mod packet;
pub mod stream;
pub mod ttl;

pub use crypto::EncryptedStream;
pub use packet::{is_broadcast, packet_get_payload, parse_ip_nets, parse_packet};
pub use stream::RawConn;
pub use ttl::send_with_lowered_ttl;
