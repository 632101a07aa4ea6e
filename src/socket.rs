//! The per-client session state machine: [`Socket`].
//!
//! Rather than an explicit write-buffer-plus-callback-list, this crate
//! drives a session as a cooperative task per socket: outbound packets are
//! pushed onto an internal `mpsc` channel that the bound transport task
//! drains, and liveness is driven by a background heartbeat task talking to
//! the socket over a second channel. Both achieve the same ordering and
//! single-transport guarantees with less bookkeeping than an explicit
//! buffer-plus-callback list.

use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use http::{request::Parts, HeaderMap, Uri};
use tokio::sync::{mpsc, Mutex};
use tokio::time::Instant;

use crate::errors::Error;
use crate::packet::Packet;
use crate::sid::Sid;
use crate::transport::TransportType;

/// The reason a [`Socket`] was closed. Exposed to the application exactly
/// once per socket via `EngineIoHandler::on_disconnect`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    /// The transport's underlying connection was closed by the peer.
    TransportClose,
    /// An I/O error occurred on the transport.
    TransportError,
    /// A packet failed to parse; treated as fatal rather than recoverable.
    PacketParsingError,
    /// No pong was received within `ping_timeout` of the last ping.
    HeartbeatTimeout,
    /// A second GET was parked on an already-parked polling session.
    MultipleHttpPollingError,
    /// `Socket::close` was called directly by the application.
    ForcedClose,
    /// `Engine::close` tore down every session for a server shutdown.
    ServerClose,
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DisconnectReason::TransportClose => "transport close",
            DisconnectReason::TransportError => "transport error",
            DisconnectReason::PacketParsingError => "parse error",
            DisconnectReason::HeartbeatTimeout => "ping timeout",
            DisconnectReason::MultipleHttpPollingError => "multiple http polling error",
            DisconnectReason::ForcedClose => "forced close",
            DisconnectReason::ServerClose => "server close",
        };
        f.write_str(s)
    }
}

/// Request metadata captured at socket construction time: immutable for
/// the lifetime of the socket.
#[derive(Debug, Clone)]
pub struct SocketReq {
    pub headers: HeaderMap,
    pub uri: Uri,
    pub remote_addr: Option<SocketAddr>,
}

impl From<Parts> for SocketReq {
    fn from(parts: Parts) -> Self {
        Self {
            headers: parts.headers,
            uri: parts.uri,
            remote_addr: parts
                .extensions
                .get::<SocketAddr>()
                .copied(),
        }
    }
}

impl From<&Parts> for SocketReq {
    fn from(parts: &Parts) -> Self {
        Self {
            headers: parts.headers.clone(),
            uri: parts.uri.clone(),
            remote_addr: parts.extensions.get::<SocketAddr>().copied(),
        }
    }
}

impl SocketReq {
    /// Capture request metadata without consuming the request (used by
    /// `verify()`'s `allow_request` hook, which only gets a shared borrow).
    pub fn from_request<B>(req: &http::Request<B>) -> Self {
        Self {
            headers: req.headers().clone(),
            uri: req.uri().clone(),
            remote_addr: req.extensions().get::<SocketAddr>().copied(),
        }
    }
}

/// Internal transport-type encoding backing the socket's atomic state.
const TRANSPORT_POLLING: u8 = 0;
const TRANSPORT_WEBSOCKET: u8 = 1;

/// Bound on how long the graceful `Socket::close` path waits for its close
/// packet to actually reach the wire before giving up and tearing the
/// session down anyway — a transport task that vanished mid-drain must not
/// be able to wedge the caller's close forever.
const CLOSE_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// A live session bound to exactly one [`crate::transport::TransportType`]
/// at a time.
///
/// Generic over `D`, the application's per-socket user data slot
/// (`EngineIoHandler::Data`), stored inline rather than in a side table.
pub struct Socket<D = ()> {
    pub id: Sid,
    pub req: SocketReq,
    pub data: D,

    transport_type: AtomicU8,
    upgraded: std::sync::atomic::AtomicBool,
    closed: std::sync::atomic::AtomicBool,
    /// Whether the client can receive binary frames, derived from the `b64`
    /// query flag at handshake time. Recorded for introspection; this
    /// crate's polling batch format always base64-frames binary packets as
    /// text regardless of this flag (see `transport::polling::payload`),
    /// so it currently has no effect on wire encoding.
    supports_binary: std::sync::atomic::AtomicBool,
    /// Spec §3/§4.1: once discarded, the transport silently swallows any
    /// further send rather than erroring. Distinct from `closed` — a
    /// transport can be discarded (e.g. superseded mid-upgrade) without the
    /// session itself closing.
    discarded: std::sync::atomic::AtomicBool,

    internal_tx: mpsc::UnboundedSender<Packet>,
    /// Guarded by a lock rather than taken by value so "only one reader at
    /// a time" (the polling long-poll/GET concurrency rule) can be
    /// enforced with `try_lock`.
    pub internal_rx: Mutex<mpsc::UnboundedReceiver<Packet>>,

    /// Serializes concurrent POSTs on the same polling session: at most
    /// one POST may be in flight at a time.
    post_lock: Mutex<()>,

    pub heartbeat_tx: mpsc::Sender<()>,
    heartbeat_rx: std::sync::Mutex<Option<mpsc::Receiver<()>>>,
    heartbeat_handle: std::sync::Mutex<Option<tokio::task::JoinHandle<()>>>,

    /// Signaled by whichever transport task dequeues a `close` packet, so
    /// the graceful `Socket::close` path can wait for it to actually reach
    /// the wire before tearing the session down (spec §4.4: "wait for the
    /// next drain").
    close_drained: tokio::sync::Notify,

    /// Weak back-reference to the owning engine, used only by the
    /// application-facing [`Socket::close`]. Weak so the engine's client
    /// table (which owns an `Arc<Socket>`) and the socket never keep each
    /// other alive in a cycle.
    closer: std::sync::Mutex<Option<Weak<dyn SocketCloser>>>,
}

impl<D> fmt::Debug for Socket<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Socket")
            .field("id", &self.id)
            .field("transport", &self.transport_type())
            .field("upgraded", &self.is_upgraded())
            .finish()
    }
}

impl<D: Default> Socket<D> {
    /// `id` is passed in rather than generated here so the engine can
    /// consult `EngineIoConfig::id_generator` first (spec §9: "`generateId`
    /// must be overridable, for deterministic test ids").
    pub(crate) fn new(id: Sid, transport: TransportType, req: SocketReq) -> Arc<Self> {
        let (tx, rx) = mpsc::unbounded_channel();
        // heartbeat channel: bounded to 1, only the liveness signal matters,
        // back pressure just means "already know you're alive".
        let (hb_tx, hb_rx) = mpsc::channel(1);
        let socket = Arc::new(Self {
            id,
            req,
            data: D::default(),
            transport_type: AtomicU8::new(encode_transport(transport)),
            upgraded: std::sync::atomic::AtomicBool::new(false),
            closed: std::sync::atomic::AtomicBool::new(false),
            supports_binary: std::sync::atomic::AtomicBool::new(true),
            discarded: std::sync::atomic::AtomicBool::new(false),
            internal_tx: tx,
            internal_rx: Mutex::new(rx),
            post_lock: Mutex::new(()),
            heartbeat_tx: hb_tx,
            heartbeat_rx: std::sync::Mutex::new(Some(hb_rx)),
            heartbeat_handle: std::sync::Mutex::new(None),
            close_drained: tokio::sync::Notify::new(),
            closer: std::sync::Mutex::new(None),
        });
        socket
    }
}

impl<D> Socket<D> {
    pub fn transport_type(&self) -> TransportType {
        decode_transport(self.transport_type.load(Ordering::Acquire))
    }

    pub fn is_http(&self) -> bool {
        self.transport_type() == TransportType::Polling
    }

    pub fn is_ws(&self) -> bool {
        self.transport_type() == TransportType::Websocket
    }

    pub fn is_upgraded(&self) -> bool {
        self.upgraded.load(Ordering::Acquire)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Has this transport been discarded (spec §3 `discarded` attribute)?
    /// Distinct from [`Socket::is_closed`]: a discarded transport swallows
    /// further sends, but the session itself may still be alive on another
    /// transport.
    pub fn is_discarded(&self) -> bool {
        self.discarded.load(Ordering::Acquire)
    }

    /// Mark this transport discarded (spec §4.1 `discard()`): idempotent —
    /// calling it any number of times has the same effect as calling it
    /// once (R3).
    pub(crate) fn discard(&self) {
        self.discarded.store(true, Ordering::Release);
    }

    pub fn supports_binary(&self) -> bool {
        self.supports_binary.load(Ordering::Acquire)
    }

    pub fn set_supports_binary(&self, value: bool) {
        self.supports_binary.store(value, Ordering::Release);
    }

    /// Commit a websocket upgrade: from this point on the socket is bound
    /// to the websocket transport, `upgraded` is sticky true, and any
    /// further inbound/outbound traffic belongs to the new transport.
    /// Idempotent beyond the first call.
    pub fn upgrade_to_websocket(&self) {
        self.transport_type
            .store(encode_transport(TransportType::Websocket), Ordering::Release);
        self.upgraded.store(true, Ordering::Release);
    }

    /// Enqueue a packet for delivery to the client. Silently dropped if the
    /// socket is already closed or its transport discarded (spec §4.1:
    /// "subsequent errors are swallowed" once a transport is discarded).
    pub fn send(&self, packet: Packet) -> Result<(), Error> {
        if self.is_closed() || self.is_discarded() {
            return Ok(());
        }
        self.internal_tx
            .send(packet)
            .map_err(|_| Error::HttpErrorResponse(http::StatusCode::GONE))
    }

    /// Notify a waiting [`Socket::close`] that a close packet has just been
    /// dequeued by the bound transport task. Called from the transport side
    /// once it has actually written (or is about to write) the packet out.
    pub(crate) fn mark_drained(&self) {
        self.close_drained.notify_one();
    }

    /// Acquire the POST-serialization lock for a polling session; a second
    /// concurrent POST is a protocol error. Returns `None` if another POST
    /// already holds it.
    pub fn try_lock_post(&self) -> Option<tokio::sync::MutexGuard<'_, ()>> {
        self.post_lock.try_lock().ok()
    }

    /// Mark this socket closed and release its heartbeat task. Idempotent:
    /// calling it twice has the same effect as calling it once. Returns
    /// `true` the first time (the caller that gets `true` is responsible
    /// for emitting `on_disconnect` and for removing the socket from the
    /// engine's client table in the same step).
    pub(crate) fn mark_closed(&self, _reason: DisconnectReason) -> bool {
        if self.closed.swap(true, Ordering::AcqRel) {
            return false;
        }
        if let Some(handle) = self.heartbeat_handle.lock().unwrap().take() {
            handle.abort();
        }
        true
    }

    /// Register the engine this socket belongs to, so the application-facing
    /// [`Socket::close`] can reach back into the client table (spec §9:
    /// "break the cycle by weak back-references") without `Socket` itself
    /// being generic over the handler type.
    pub(crate) fn bind_closer(&self, closer: std::sync::Weak<dyn SocketCloser>) {
        *self.closer.lock().unwrap() = Some(closer);
    }

    /// Application-facing close (spec §4.4: `close(discard?)`).
    ///
    /// Enqueues a `close` packet so it is delivered after anything already
    /// queued (the unbounded channel's FIFO order satisfies I3: "a packet
    /// accepted at time t is never sent after one accepted at t+ε"). Unless
    /// `discard` is set, waits (bounded by [`CLOSE_DRAIN_TIMEOUT`]) for the
    /// bound transport to actually dequeue that packet before tearing the
    /// session down — "A transmitted, then close packet, then close event"
    /// (spec scenario S6) requires the disconnect not fire until the close
    /// packet has reached the wire. Once drained (or discarded, or the wait
    /// times out), removes the session from the engine's client table and
    /// fires `on_disconnect` with [`DisconnectReason::ForcedClose`].
    /// Idempotent (R2): a second call on an already-closed socket is a
    /// no-op.
    ///
    /// `discard = true` skips the drain wait entirely and marks the
    /// transport [`discard`](Socket::discard)ed first, so any send still in
    /// flight is swallowed rather than attempted — the forced, immediate
    /// variant of close.
    pub async fn close(self: &Arc<Self>, discard: bool) {
        if self.is_closed() {
            return;
        }
        if discard {
            self.discard();
        } else {
            let _ = self.internal_tx.send(Packet::Close);
            let _ = tokio::time::timeout(CLOSE_DRAIN_TIMEOUT, self.close_drained.notified()).await;
        }
        self.notify_engine(DisconnectReason::ForcedClose).await;
    }

    /// Tear the session down from the engine's side: reach back through the
    /// weak `closer` handle so the client table entry is removed and
    /// `on_disconnect` fires in the same step (I4), same as a client-driven
    /// close. Falls back to local-only bookkeeping if no closer was bound
    /// (e.g. a bare `Socket` built directly in a unit test).
    pub(crate) async fn notify_engine(self: &Arc<Self>, reason: DisconnectReason) {
        if self.is_closed() {
            return;
        }
        let closer = self.closer.lock().unwrap().as_ref().and_then(Weak::upgrade);
        match closer {
            Some(c) => c.close_socket(self.id, reason).await,
            None => {
                self.mark_closed(reason);
            }
        }
    }
}

/// Type-erased handle back to the owning `EngineIo<H>`, letting `Socket<D>`
/// call back into the client table without being generic over `H` itself.
pub(crate) trait SocketCloser: Send + Sync {
    fn close_socket<'a>(
        &'a self,
        sid: Sid,
        reason: DisconnectReason,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send + 'a>>;
}

impl<D: Send + Sync + 'static> Socket<D> {
    /// Spawn the heartbeat scheduler: the server pings on `ping_interval`,
    /// and if no pong (or any other inbound packet) arrives within
    /// `ping_interval + ping_timeout` of the last reset, the socket is
    /// closed with `HeartbeatTimeout`.
    ///
    /// The server is the active pinger rather than the client, since this
    /// is the only scheme that works uniformly across long-polling, which
    /// has no client-driven ping.
    pub fn spawn_heartbeat(self: Arc<Self>, ping_interval: Duration, ping_timeout: Duration) {
        let mut hb_rx = self
            .heartbeat_rx
            .lock()
            .unwrap()
            .take()
            .expect("spawn_heartbeat called more than once for the same socket");
        let handle = tokio::spawn(async move {
            let mut deadline = Instant::now() + ping_interval;
            loop {
                tokio::select! {
                    _ = tokio::time::sleep_until(deadline) => {
                        if self.is_closed() {
                            return;
                        }
                        if self.send(Packet::Ping).is_err() {
                            return;
                        }
                        let pong_deadline = Instant::now() + ping_timeout;
                        tokio::select! {
                            got = hb_rx.recv() => {
                                if got.is_none() {
                                    return;
                                }
                                deadline = Instant::now() + ping_interval;
                            }
                            _ = tokio::time::sleep_until(pong_deadline) => {
                                self.notify_engine(DisconnectReason::HeartbeatTimeout).await;
                                return;
                            }
                        }
                    }
                    got = hb_rx.recv() => {
                        if got.is_none() {
                            return;
                        }
                        // Any inbound packet before the interval expires
                        // counts as liveness and resets the clock.
                        deadline = Instant::now() + ping_interval;
                    }
                }
            }
        });
        *self.heartbeat_handle.lock().unwrap() = Some(handle);
    }
}

fn encode_transport(t: TransportType) -> u8 {
    match t {
        TransportType::Polling => TRANSPORT_POLLING,
        TransportType::Websocket => TRANSPORT_WEBSOCKET,
    }
}

fn decode_transport(v: u8) -> TransportType {
    match v {
        TRANSPORT_WEBSOCKET => TransportType::Websocket,
        _ => TransportType::Polling,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::Request;

    fn test_req() -> SocketReq {
        let (parts, _) = Request::builder()
            .uri("/engine.io/")
            .body(())
            .unwrap()
            .into_parts();
        SocketReq::from(parts)
    }

    fn new_socket() -> Arc<Socket<()>> {
        Socket::new(Sid::new(), TransportType::Polling, test_req())
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let socket = new_socket();
        socket.close(true).await;
        socket.close(true).await;
        assert!(socket.is_closed());
    }

    #[tokio::test]
    async fn send_after_close_is_a_silent_noop() {
        let socket = new_socket();
        socket.close(true).await;
        assert!(socket.send(Packet::Noop).is_ok());
    }

    #[tokio::test]
    async fn close_without_a_bound_engine_still_marks_closed() {
        // A bare `Socket` built outside an `Engine` (as in these unit tests)
        // has no closer bound; `close()` still falls back to local bookkeeping.
        // `discard = true` so this doesn't wait out `CLOSE_DRAIN_TIMEOUT`
        // with no transport task ever around to drain the close packet.
        let socket = new_socket();
        assert!(!socket.is_closed());
        socket.close(true).await;
        assert!(socket.is_closed());
    }

    #[test]
    fn discard_is_idempotent_and_swallows_further_sends() {
        let socket = new_socket();
        assert!(!socket.is_discarded());
        socket.discard();
        socket.discard();
        assert!(socket.is_discarded());
        assert!(!socket.is_closed(), "discard must not by itself close the session");
        assert!(socket.send(Packet::Message("late".into())).is_ok());
    }

    #[test]
    fn upgrade_to_websocket_is_sticky() {
        let socket = new_socket();
        assert!(socket.is_http());
        socket.upgrade_to_websocket();
        assert!(socket.is_ws());
        assert!(socket.is_upgraded());
    }

    #[test]
    fn concurrent_post_lock_rejects_second_holder() {
        let socket = new_socket();
        let _first = socket.try_lock_post().expect("first POST acquires the lock");
        assert!(socket.try_lock_post().is_none(), "second POST must be rejected");
    }
}
