//! Wire framing, message envelopes, and the per-transport dispatcher.

pub mod dispatcher;
pub mod message;
pub mod packet;
pub mod transport;

pub use dispatcher::Dispatcher;
pub use message::{next_id, Request, Response};
pub use packet::{PacketTag, MAX_PAYLOAD_SIZE};
pub use transport::{AsyncReadWrite, BoxedStream, Transport};
