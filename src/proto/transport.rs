//! Wraps a bidirectional byte stream and exposes the raw, request, response
//! and liveness channels described in spec.md §4.2. Grounded in the
//! original's `pkg/proto/transport.go`, with the original's two-consumer
//! (`Read` vs `RunDispatcher`) split on each channel replaced by a single
//! read loop that does the dispatch inline — see DESIGN.md.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex as SyncMutex;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::{mpsc, oneshot, watch, Mutex as AsyncMutex};
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::error::{PtunError, Result};
use crate::model::Payload;
use crate::proto::dispatcher::Dispatcher;
use crate::proto::message::{next_id, Request, Response};
use crate::proto::packet::{self, BufferPool, PacketTag};

/// Liveness token count: every `interval / ALIVE_COUNT` a `Ping` is sent and
/// the counter decremented; any received frame resets it to `ALIVE_COUNT`.
const ALIVE_COUNT: i64 = 5;
const RAW_CHANNEL_CAPACITY: usize = 100;

/// Any duplex byte stream a [`Transport`] can be built on — a TCP
/// connection, the punched UDP socket wrapped as a stream, or a
/// [`crate::network::crypto::EncryptedStream`]/other `StreamWrap`.
pub trait AsyncReadWrite: AsyncRead + AsyncWrite + Send + Unpin {}
impl<T: AsyncRead + AsyncWrite + Send + Unpin + ?Sized> AsyncReadWrite for T {}

pub type BoxedStream = Box<dyn AsyncReadWrite>;

struct KeepaliveState {
    generation: u64,
}

struct Inner {
    write: AsyncMutex<WriteHalf<BoxedStream>>,
    pool: BufferPool,

    raw_tx: mpsc::Sender<Vec<u8>>,
    raw_rx: AsyncMutex<mpsc::Receiver<Vec<u8>>>,

    reply_waiters: DashMap<u32, oneshot::Sender<Response>>,
    pending_request: SyncMutex<Option<oneshot::Sender<Request>>>,
    pending_response: SyncMutex<Option<oneshot::Sender<Response>>>,

    request_dispatcher: Dispatcher<Request>,
    response_dispatcher: Dispatcher<Response>,

    alive_count: AtomicI64,
    keepalive: SyncMutex<KeepaliveState>,

    closed_tx: watch::Sender<bool>,
    closed_rx: watch::Receiver<bool>,
}

/// A cheaply-cloneable handle to one framed, multiplexed connection.
#[derive(Clone)]
pub struct Transport(Arc<Inner>);

impl Transport {
    pub fn new(conn: BoxedStream) -> Self {
        let (read_half, write_half) = tokio::io::split(conn);
        let (raw_tx, raw_rx) = mpsc::channel(RAW_CHANNEL_CAPACITY);
        let (closed_tx, closed_rx) = watch::channel(false);

        let inner = Arc::new(Inner {
            write: AsyncMutex::new(write_half),
            pool: BufferPool::new(),
            raw_tx,
            raw_rx: AsyncMutex::new(raw_rx),
            reply_waiters: DashMap::new(),
            pending_request: SyncMutex::new(None),
            pending_response: SyncMutex::new(None),
            request_dispatcher: Dispatcher::new(),
            response_dispatcher: Dispatcher::new(),
            alive_count: AtomicI64::new(ALIVE_COUNT),
            keepalive: SyncMutex::new(KeepaliveState { generation: 0 }),
            closed_tx,
            closed_rx,
        });

        let t = Transport(inner);
        t.spawn_read_loop(read_half);
        t
    }

    pub fn request_dispatcher(&self) -> &Dispatcher<Request> {
        &self.0.request_dispatcher
    }

    pub fn response_dispatcher(&self) -> &Dispatcher<Response> {
        &self.0.response_dispatcher
    }

    pub fn is_closed(&self) -> bool {
        *self.0.closed_rx.borrow()
    }

    /// Cancels all waiters with `Closed` and closes the underlying stream.
    /// Idempotent.
    pub async fn close(&self) {
        if self.0.closed_tx.send_if_modified(|c| {
            let was_open = !*c;
            *c = true;
            was_open
        }) {
            self.0.reply_waiters.retain(|_, _| false);
            *self.0.pending_request.lock() = None;
            *self.0.pending_response.lock() = None;
            let mut write = self.0.write.lock().await;
            let _ = write.shutdown().await;
        }
    }

    /// Resolves once the transport has closed, for callers that just need
    /// to know a session's connection ended (the hub's per-session task).
    pub async fn closed(&self) {
        self.wait_closed().await
    }

    async fn wait_closed(&self) {
        let mut rx = self.0.closed_rx.clone();
        if *rx.borrow() {
            return;
        }
        while rx.changed().await.is_ok() {
            if *rx.borrow() {
                return;
            }
        }
    }

    async fn write_frame(&self, tag: PacketTag, body: Option<&[u8]>) -> Result<()> {
        if self.is_closed() {
            return Err(PtunError::Closed);
        }
        let mut write = self.0.write.lock().await;
        packet::pack_into(&mut *write, tag, body).await
    }

    /// Serializes `payload` to its typed envelope, assigns a fresh id,
    /// writes a `Req` frame, and returns the id.
    pub async fn send_request(&self, payload: impl Into<Payload>) -> Result<u32> {
        let req = Request::new(payload.into());
        let id = req.id;
        let body = req.pack()?;
        self.write_frame(PacketTag::Req, Some(&body)).await?;
        Ok(id)
    }

    /// Writes a `Req` frame and synchronously awaits the correlated
    /// response (matched by id), or `MessageTimeout`/`Closed`.
    pub async fn send_message(&self, payload: impl Into<Payload>, wait: Duration) -> Result<Response> {
        let req = Request::new(payload.into());
        let body = req.pack()?;
        let (tx, rx) = oneshot::channel();
        self.0.reply_waiters.insert(req.id, tx);
        if let Err(e) = self.write_frame(PacketTag::Req, Some(&body)).await {
            self.0.reply_waiters.remove(&req.id);
            return Err(e);
        }
        let result = timeout(wait, rx).await;
        self.0.reply_waiters.remove(&req.id);
        match result {
            Ok(Ok(resp)) => Ok(resp),
            Ok(Err(_)) => Err(PtunError::Closed),
            Err(_) => Err(PtunError::MessageTimeout),
        }
    }

    pub async fn reply(
        &self,
        req: &Request,
        code: i32,
        message: impl Into<String>,
        payload: impl Into<Payload>,
    ) -> Result<()> {
        let resp = Response::reply_to(req, code, message, payload.into());
        let body = resp.pack()?;
        self.write_frame(PacketTag::Resp, Some(&body)).await
    }

    pub async fn reply_success(&self, req: &Request, payload: impl Into<Payload>) -> Result<()> {
        self.reply(req, 0, "success", payload).await
    }

    /// Writes an unsolicited `Resp` frame carrying a fresh id, for pushing a
    /// message to a peer that never sent a matching `Request` (the hub's
    /// notification to the non-requesting side of a punch).
    pub async fn send_success(&self, payload: impl Into<Payload>) -> Result<()> {
        let resp = Response::success(next_id(), payload.into());
        let body = resp.pack()?;
        self.write_frame(PacketTag::Resp, Some(&body)).await
    }

    /// Awaits exactly one inbound request, for use before a dispatcher is
    /// registered (the hub's pre-login handshake).
    pub async fn read_request(&self, wait: Duration) -> Result<Request> {
        let (tx, rx) = oneshot::channel();
        *self.0.pending_request.lock() = Some(tx);
        match timeout(wait, rx).await {
            Ok(Ok(req)) => Ok(req),
            Ok(Err(_)) => Err(PtunError::Closed),
            Err(_) => {
                *self.0.pending_request.lock() = None;
                Err(PtunError::MessageTimeout)
            }
        }
    }

    /// Awaits exactly one inbound response not otherwise correlated by
    /// `send_message` (the hub client's post-login handshake).
    pub async fn read_response(&self, wait: Duration) -> Result<Response> {
        let (tx, rx) = oneshot::channel();
        *self.0.pending_response.lock() = Some(tx);
        match timeout(wait, rx).await {
            Ok(Ok(resp)) => Ok(resp),
            Ok(Err(_)) => Err(PtunError::Closed),
            Err(_) => {
                *self.0.pending_response.lock() = None;
                Err(PtunError::MessageTimeout)
            }
        }
    }

    /// Writes one IP packet on the raw channel.
    pub async fn write_raw(&self, body: &[u8]) -> Result<()> {
        self.write_frame(PacketTag::Raw, Some(body)).await
    }

    /// Reads one IP packet from the raw channel, or `Closed` if the
    /// transport has closed with nothing buffered.
    pub async fn read_raw(&self) -> Result<Vec<u8>> {
        let mut raw_rx = self.0.raw_rx.lock().await;
        tokio::select! {
            biased;
            frame = raw_rx.recv() => frame.ok_or(PtunError::Closed),
            _ = self.wait_closed() => Err(PtunError::Closed),
        }
    }

    /// Starts (or reconfigures) the liveness service. Calling this twice
    /// stops the previous timers before starting new ones.
    pub fn set_keepalive(&self, interval: Duration) {
        let generation = {
            let mut state = self.0.keepalive.lock();
            state.generation += 1;
            state.generation
        };
        if interval.is_zero() {
            return;
        }
        self.0.alive_count.store(ALIVE_COUNT, Ordering::SeqCst);

        let ping_interval = interval / ALIVE_COUNT as u32;
        let this = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(ping_interval);
            loop {
                ticker.tick().await;
                if this.is_closed() || this.0.keepalive.lock().generation != generation {
                    return;
                }
                this.0.alive_count.fetch_sub(1, Ordering::SeqCst);
                if this.write_frame(PacketTag::Ping, None).await.is_err() {
                    return;
                }
            }
        });

        let this = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(1));
            loop {
                ticker.tick().await;
                if this.is_closed() || this.0.keepalive.lock().generation != generation {
                    return;
                }
                if this.0.alive_count.load(Ordering::SeqCst) < 0 {
                    this.close().await;
                    return;
                }
            }
        });
    }

    fn spawn_read_loop(&self, mut read: ReadHalf<BoxedStream>) {
        let this = self.clone();
        tokio::spawn(async move {
            loop {
                let pkt = match packet::unpack_from(&mut read, &this.0.pool).await {
                    Ok(pkt) => pkt,
                    Err(PtunError::Io(_)) => {
                        debug!("transport read loop exit: stream closed");
                        break;
                    }
                    Err(PtunError::MalformedFrame(msg)) => {
                        warn!("transport desynchronized: {msg}");
                        break;
                    }
                    Err(e) => {
                        warn!("transport frame decode error, skipping: {e}");
                        continue;
                    }
                };
                this.0.alive_count.store(ALIVE_COUNT, Ordering::SeqCst);

                match pkt.tag() {
                    PacketTag::Raw => {
                        let _ = this.0.raw_tx.try_send(pkt.body().to_vec());
                    }
                    PacketTag::Req => match Request::decode(pkt.body()) {
                        Ok(req) => this.handle_inbound_request(req),
                        Err(e) => warn!("dropping malformed request: {e}"),
                    },
                    PacketTag::Resp => match Response::decode(pkt.body()) {
                        Ok(resp) => this.handle_inbound_response(resp),
                        Err(e) => warn!("dropping malformed response: {e}"),
                    },
                    PacketTag::Ping => {
                        let _ = this.write_frame(PacketTag::Pong, None).await;
                    }
                    PacketTag::Pong | PacketTag::Empty => {}
                }
            }
            this.close().await;
        });
    }

    fn handle_inbound_request(&self, req: Request) {
        if let Some(tx) = self.0.pending_request.lock().take() {
            let _ = tx.send(req);
            return;
        }
        if let Err(PtunError::NoHandler(key)) = self.0.request_dispatcher.dispatch(req.key, req) {
            debug!("no handler for request key {key}");
        }
    }

    fn handle_inbound_response(&self, resp: Response) {
        if let Some((_, tx)) = self.0.reply_waiters.remove(&resp.id) {
            let _ = tx.send(resp);
            return;
        }
        if let Some(tx) = self.0.pending_response.lock().take() {
            let _ = tx.send(resp);
            return;
        }
        if let Err(PtunError::NoHandler(key)) = self.0.response_dispatcher.dispatch(resp.key, resp) {
            debug!("no handler for response key {key}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{PeerListRequest, PeerListResponse};

    fn pair() -> (Transport, Transport) {
        let (a, b) = tokio::io::duplex(64 * 1024);
        (
            Transport::new(Box::new(a)),
            Transport::new(Box::new(b)),
        )
    }

    #[tokio::test]
    async fn send_message_round_trips_a_reply() {
        let (client, server) = pair();
        server.request_dispatcher().add_handler(
            "PeerListRequest",
            Arc::new({
                let server = server.clone();
                move |req: Request| {
                    let server = server.clone();
                    tokio::spawn(async move {
                        let _ = server
                            .reply_success(
                                &req,
                                PeerListResponse {
                                    peer_names: vec!["a".into()],
                                },
                            )
                            .await;
                    });
                }
            }),
        );

        let resp = client
            .send_message(PeerListRequest {}, Duration::from_secs(1))
            .await
            .unwrap();
        let payload: PeerListResponse = resp.payload.try_into().unwrap();
        assert_eq!(payload.peer_names, vec!["a".to_string()]);
    }

    #[tokio::test]
    async fn send_message_times_out_without_a_reply() {
        let (client, _server) = pair();
        let err = client
            .send_message(PeerListRequest {}, Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(matches!(err, PtunError::MessageTimeout));
    }

    #[tokio::test]
    async fn raw_frames_round_trip() {
        let (a, b) = pair();
        a.write_raw(b"an ip packet").await.unwrap();
        let got = b.read_raw().await.unwrap();
        assert_eq!(got, b"an ip packet");
    }

    #[tokio::test]
    async fn closing_drains_pending_send_message() {
        let (client, server) = pair();
        let wait = tokio::spawn(async move {
            client
                .send_message(PeerListRequest {}, Duration::from_secs(5))
                .await
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        server.close().await;
        let err = wait.await.unwrap().unwrap_err();
        assert!(matches!(err, PtunError::Closed));
    }
}
