//! Tagged length-prefixed frames, `tag(2) || length(2) || body(length)`, big-endian.
//!
//! Grounded in the original's `pkg/proto/packet.go`: a reusable slab pool
//! avoids a per-frame allocation on the hot read path.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{PtunError, Result};

pub const MAX_PAYLOAD_SIZE: usize = 8180;
pub const HEADER_SIZE: usize = 4;
const SLAB_SIZE: usize = HEADER_SIZE + MAX_PAYLOAD_SIZE;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum PacketTag {
    Empty = 10,
    Raw = 11,
    Req = 12,
    Resp = 13,
    Ping = 14,
    Pong = 15,
}

impl PacketTag {
    fn from_u16(v: u16) -> Result<Self> {
        match v {
            10 => Ok(PacketTag::Empty),
            11 => Ok(PacketTag::Raw),
            12 => Ok(PacketTag::Req),
            13 => Ok(PacketTag::Resp),
            14 => Ok(PacketTag::Ping),
            15 => Ok(PacketTag::Pong),
            other => Err(PtunError::MalformedFrame(format!("unknown tag {other}"))),
        }
    }
}

/// A fixed-size slab free-list. Slab ownership transfers on get/put, so no
/// slab is referenced after it is returned to the pool.
#[derive(Clone)]
pub struct BufferPool {
    free: Arc<Mutex<Vec<Box<[u8; SLAB_SIZE]>>>>,
}

impl Default for BufferPool {
    fn default() -> Self {
        Self {
            free: Arc::new(Mutex::new(Vec::new())),
        }
    }
}

impl BufferPool {
    pub fn new() -> Self {
        Self::default()
    }

    fn get(&self) -> Box<[u8; SLAB_SIZE]> {
        if let Some(slab) = self.free.lock().pop() {
            return slab;
        }
        Box::new([0u8; SLAB_SIZE])
    }

    fn put(&self, slab: Box<[u8; SLAB_SIZE]>) {
        self.free.lock().push(slab);
    }
}

/// A decoded frame. The backing slab is released back to the pool on drop.
pub struct Packet {
    tag: PacketTag,
    len: u16,
    slab: Option<Box<[u8; SLAB_SIZE]>>,
    pool: BufferPool,
}

impl Packet {
    pub fn tag(&self) -> PacketTag {
        self.tag
    }

    pub fn body(&self) -> &[u8] {
        match &self.slab {
            Some(slab) => &slab[HEADER_SIZE..HEADER_SIZE + self.len as usize],
            None => &[],
        }
    }
}

impl Drop for Packet {
    fn drop(&mut self) {
        if let Some(slab) = self.slab.take() {
            self.pool.put(slab);
        }
    }
}

/// Writes `tag || length || body` as one flushed unit. `body.len()` must be
/// `<= MAX_PAYLOAD_SIZE`.
pub async fn pack_into<W: AsyncWrite + Unpin>(
    w: &mut W,
    tag: PacketTag,
    body: Option<&[u8]>,
) -> Result<()> {
    let body = body.unwrap_or(&[]);
    if body.len() > MAX_PAYLOAD_SIZE {
        return Err(PtunError::MalformedFrame("packet is too long".into()));
    }
    let mut header = [0u8; HEADER_SIZE];
    header[0..2].copy_from_slice(&(tag as u16).to_be_bytes());
    header[2..4].copy_from_slice(&(body.len() as u16).to_be_bytes());
    w.write_all(&header).await?;
    if !body.is_empty() {
        w.write_all(body).await?;
    }
    w.flush().await?;
    Ok(())
}

/// Reads exactly one frame. Short reads on header or body are a protocol
/// error (`MalformedFrame`); an EOF propagates as `io::Error` so the caller
/// can distinguish `Closed` from desynchronization.
pub async fn unpack_from<R: AsyncRead + Unpin>(r: &mut R, pool: &BufferPool) -> Result<Packet> {
    let mut slab = pool.get();
    r.read_exact(&mut slab[0..HEADER_SIZE]).await?;
    let tag = PacketTag::from_u16(u16::from_be_bytes([slab[0], slab[1]]))?;
    let len = u16::from_be_bytes([slab[2], slab[3]]);
    if len as usize > MAX_PAYLOAD_SIZE {
        return Err(PtunError::MalformedFrame(format!(
            "length {len} exceeds max payload size {MAX_PAYLOAD_SIZE}"
        )));
    }
    if len > 0 {
        r.read_exact(&mut slab[HEADER_SIZE..HEADER_SIZE + len as usize])
            .await?;
    }
    Ok(Packet {
        tag,
        len,
        slab: Some(slab),
        pool: pool.clone(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[tokio::test]
    async fn round_trips_a_frame() {
        let pool = BufferPool::new();
        let mut buf = Vec::new();
        pack_into(&mut buf, PacketTag::Req, Some(b"hello")).await.unwrap();
        let mut cursor = Cursor::new(buf);
        let pkt = unpack_from(&mut cursor, &pool).await.unwrap();
        assert_eq!(pkt.tag(), PacketTag::Req);
        assert_eq!(pkt.body(), b"hello");
    }

    #[tokio::test]
    async fn empty_body_decodes_to_empty_slice() {
        let pool = BufferPool::new();
        let mut buf = Vec::new();
        pack_into(&mut buf, PacketTag::Ping, None).await.unwrap();
        let mut cursor = Cursor::new(buf);
        let pkt = unpack_from(&mut cursor, &pool).await.unwrap();
        assert_eq!(pkt.tag(), PacketTag::Ping);
        assert!(pkt.body().is_empty());
    }

    #[tokio::test]
    async fn rejects_oversize_length_header() {
        let pool = BufferPool::new();
        let mut buf = Vec::new();
        buf.extend_from_slice(&(PacketTag::Raw as u16).to_be_bytes());
        buf.extend_from_slice(&(8181u16).to_be_bytes());
        let mut cursor = Cursor::new(buf);
        let err = unpack_from(&mut cursor, &pool).await.unwrap_err();
        assert!(matches!(err, PtunError::MalformedFrame(_)));
    }

    #[tokio::test]
    async fn slab_is_reused_after_release() {
        let pool = BufferPool::new();
        for _ in 0..3 {
            let mut buf = Vec::new();
            pack_into(&mut buf, PacketTag::Pong, None).await.unwrap();
            let mut cursor = Cursor::new(buf);
            let pkt = unpack_from(&mut cursor, &pool).await.unwrap();
            drop(pkt);
        }
        assert_eq!(pool.free.lock().len(), 1);
    }
}
