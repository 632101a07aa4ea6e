//! The server-side client table and session lifecycle (spec §4.5, §5):
//! [`Engine`]. The only process-wide mutable structure is `sockets`; it is
//! written only at handshake time and in [`Engine::close_session`], the
//! same two places spec §5 names.

use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Weak};

use dashmap::DashMap;

use crate::{
    config::EngineIoConfig,
    handler::EngineIoHandler,
    service::ProtocolVersion,
    sid::Sid,
    socket::{DisconnectReason, Socket, SocketCloser, SocketReq},
    transport::TransportType,
};

/// The multiplexing core: owns the client table and drives handshake /
/// close for every [`Socket`] it creates.
pub struct EngineIo<H: EngineIoHandler> {
    pub config: EngineIoConfig,
    pub handler: H,
    sockets: DashMap<Sid, Arc<Socket<H::Data>>>,
}

impl<H: EngineIoHandler> EngineIo<H> {
    pub fn new(handler: H, config: EngineIoConfig) -> Arc<Self> {
        Arc::new(Self {
            config,
            handler,
            sockets: DashMap::new(),
        })
    }

    /// Handshake (spec §4.5.2): construct a fresh session bound to
    /// `transport` and register it in the client table. The caller is
    /// responsible for sending the resulting socket's open packet and for
    /// calling `on_connect` — this only allocates the socket and its id.
    pub fn create_session(
        self: &Arc<Self>,
        _protocol: ProtocolVersion,
        transport: TransportType,
        req: SocketReq,
        #[cfg(feature = "v3")] supports_binary: bool,
    ) -> Arc<Socket<H::Data>> {
        let id = self.config.id_generator.as_ref().map(|f| f()).unwrap_or_else(Sid::new);
        let socket = Socket::<H::Data>::new(id, transport, req);
        #[cfg(feature = "v3")]
        socket.set_supports_binary(supports_binary);
        let closer: Weak<dyn SocketCloser> = Arc::downgrade(self);
        socket.bind_closer(closer);
        self.sockets.insert(socket.id, socket.clone());
        socket
    }

    /// Look up a live session by id (invariant I5: unique while live).
    pub fn get_socket(&self, sid: Sid) -> Option<Arc<Socket<H::Data>>> {
        self.sockets.get(&sid).map(|e| e.value().clone())
    }

    /// Number of sockets currently registered (spec P6: `clientsCount == |clients|`).
    pub fn sockets_count(&self) -> usize {
        self.sockets.len()
    }

    /// Close a session and remove it from the client table in the same
    /// step (invariant I4), then notify the handler exactly once (spec §7).
    ///
    /// Idempotent: a session already closed by a concurrent path (e.g. a
    /// heartbeat timeout racing a client-initiated close packet) is only
    /// reported to the handler by whichever caller wins the race.
    pub async fn close_session(&self, sid: Sid, reason: DisconnectReason) {
        if let Some((_, socket)) = self.sockets.remove(&sid) {
            if socket.mark_closed(reason) {
                self.handler.on_disconnect(socket, reason).await;
            }
        }
    }

    /// Close every session, discarding their transports immediately, and
    /// drop the client table (spec §4.5: "close(): close every session with
    /// discard=true").
    pub async fn close(&self) {
        let sids: Vec<Sid> = self.sockets.iter().map(|e| *e.key()).collect();
        for sid in sids {
            self.close_session(sid, DisconnectReason::ServerClose).await;
        }
    }
}

/// Lets a [`Socket`] reach back into its owning engine (spec §9: "break the
/// cycle by weak back-references") so the application-facing `Socket::close`
/// and a heartbeat timeout can both remove the session from the client
/// table and fire `on_disconnect`, exactly as a client-driven close does.
impl<H: EngineIoHandler> SocketCloser for EngineIo<H> {
    fn close_socket<'a>(
        &'a self,
        sid: Sid,
        reason: DisconnectReason,
    ) -> Pin<Box<dyn Future<Output = ()> + Send + 'a>> {
        Box::pin(self.close_session(sid, reason))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::Request;

    struct NoopHandler;
    #[async_trait::async_trait]
    impl EngineIoHandler for NoopHandler {
        type Data = ();
        async fn on_connect(&self, _socket: Arc<Socket<()>>) {}
        async fn on_disconnect(&self, _socket: Arc<Socket<()>>, _reason: DisconnectReason) {}
        async fn on_message(&self, _msg: String, _socket: Arc<Socket<()>>) {}
        async fn on_binary(&self, _data: bytes::Bytes, _socket: Arc<Socket<()>>) {}
    }

    fn test_req() -> SocketReq {
        let (parts, _) = Request::builder().uri("/engine.io/").body(()).unwrap().into_parts();
        SocketReq::from(parts)
    }

    #[tokio::test]
    async fn clients_count_matches_table_size() {
        let engine = EngineIo::new(NoopHandler, EngineIoConfig::default());
        assert_eq!(engine.sockets_count(), 0);
        let socket = engine.create_session(
            ProtocolVersion::V4,
            TransportType::Polling,
            test_req(),
            #[cfg(feature = "v3")]
            false,
        );
        assert_eq!(engine.sockets_count(), 1);
        engine.close_session(socket.id, DisconnectReason::ForcedClose).await;
        assert_eq!(engine.sockets_count(), 0);
    }

    #[tokio::test]
    async fn double_close_only_reaches_the_handler_once() {
        use std::sync::atomic::{AtomicUsize, Ordering};
        struct CountingHandler(AtomicUsize);
        #[async_trait::async_trait]
        impl EngineIoHandler for CountingHandler {
            type Data = ();
            async fn on_connect(&self, _socket: Arc<Socket<()>>) {}
            async fn on_disconnect(&self, _socket: Arc<Socket<()>>, _reason: DisconnectReason) {
                self.0.fetch_add(1, Ordering::SeqCst);
            }
            async fn on_message(&self, _msg: String, _socket: Arc<Socket<()>>) {}
            async fn on_binary(&self, _data: bytes::Bytes, _socket: Arc<Socket<()>>) {}
        }

        let engine = EngineIo::new(CountingHandler(AtomicUsize::new(0)), EngineIoConfig::default());
        let socket = engine.create_session(
            ProtocolVersion::V4,
            TransportType::Polling,
            test_req(),
            #[cfg(feature = "v3")]
            false,
        );
        let sid = socket.id;
        engine.close_session(sid, DisconnectReason::ForcedClose).await;
        engine.close_session(sid, DisconnectReason::ForcedClose).await;
        assert_eq!(engine.handler.0.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn sid_unknown_after_close() {
        let engine = EngineIo::new(NoopHandler, EngineIoConfig::default());
        let socket = engine.create_session(
            ProtocolVersion::V4,
            TransportType::Polling,
            test_req(),
            #[cfg(feature = "v3")]
            false,
        );
        let sid = socket.id;
        engine.close_session(sid, DisconnectReason::ForcedClose).await;
        assert!(engine.get_socket(sid).is_none());
    }

    /// A socket built through `create_session` has its `closer` bound, so
    /// the application-facing `Socket::close()` reaches all the way back
    /// into the engine's client table, not just the socket's own local
    /// `closed` flag (spec §9's weak-back-reference design).
    #[tokio::test]
    async fn socket_close_removes_it_from_the_engine_table() {
        use std::sync::atomic::{AtomicUsize, Ordering};
        struct CountingHandler(AtomicUsize);
        #[async_trait::async_trait]
        impl EngineIoHandler for CountingHandler {
            type Data = ();
            async fn on_connect(&self, _socket: Arc<Socket<()>>) {}
            async fn on_disconnect(&self, _socket: Arc<Socket<()>>, reason: DisconnectReason) {
                assert_eq!(reason, DisconnectReason::ForcedClose);
                self.0.fetch_add(1, Ordering::SeqCst);
            }
            async fn on_message(&self, _msg: String, _socket: Arc<Socket<()>>) {}
            async fn on_binary(&self, _data: bytes::Bytes, _socket: Arc<Socket<()>>) {}
        }

        let engine = EngineIo::new(CountingHandler(AtomicUsize::new(0)), EngineIoConfig::default());
        let socket = engine.create_session(
            ProtocolVersion::V4,
            TransportType::Polling,
            test_req(),
            #[cfg(feature = "v3")]
            false,
        );
        let sid = socket.id;
        socket.close(true).await;
        assert!(engine.get_socket(sid).is_none());
        assert_eq!(engine.sockets_count(), 0);
        assert_eq!(engine.handler.0.load(Ordering::SeqCst), 1);
    }

    /// spec §9: `generateId` must be overridable for deterministic test ids.
    #[tokio::test]
    async fn id_generator_override_is_consulted_by_create_session() {
        let fixed = Sid::new();
        let config = EngineIoConfig::builder()
            .id_generator(Arc::new(move || fixed))
            .build();
        let engine = EngineIo::new(NoopHandler, config);
        let socket = engine.create_session(
            ProtocolVersion::V4,
            TransportType::Polling,
            test_req(),
            #[cfg(feature = "v3")]
            false,
        );
        assert_eq!(socket.id, fixed);
    }

    /// Scenario S6: a graceful close drains whatever was already queued
    /// (including the close packet itself) before the disconnect event
    /// fires, so a message sent just before `close()` is observed first.
    #[tokio::test]
    async fn graceful_close_orders_drain_before_disconnect_event() {
        use crate::packet::Packet;
        use tokio::sync::Mutex as AsyncMutex;

        let events = Arc::new(AsyncMutex::new(Vec::<&'static str>::new()));

        struct OrderingHandler(Arc<AsyncMutex<Vec<&'static str>>>);
        #[async_trait::async_trait]
        impl EngineIoHandler for OrderingHandler {
            type Data = ();
            async fn on_connect(&self, _socket: Arc<Socket<()>>) {}
            async fn on_disconnect(&self, _socket: Arc<Socket<()>>, _reason: DisconnectReason) {
                self.0.lock().await.push("disconnect");
            }
            async fn on_message(&self, _msg: String, _socket: Arc<Socket<()>>) {}
            async fn on_binary(&self, _data: bytes::Bytes, _socket: Arc<Socket<()>>) {}
        }

        let engine = EngineIo::new(OrderingHandler(events.clone()), EngineIoConfig::default());
        let socket = engine.create_session(
            ProtocolVersion::V4,
            TransportType::Polling,
            test_req(),
            #[cfg(feature = "v3")]
            false,
        );
        socket.send(Packet::Message("A".into())).unwrap();

        // Simulate a draining transport task: read whatever is queued,
        // marking the socket drained once the close packet is seen.
        let drain_socket = socket.clone();
        let drain_events = events.clone();
        let drain = tokio::spawn(async move {
            let mut rx = drain_socket.internal_rx.lock().await;
            while let Some(packet) = rx.recv().await {
                match packet {
                    Packet::Message(m) => drain_events.lock().await.push(if m == "A" { "message:A" } else { "message" }),
                    Packet::Close => {
                        drain_events.lock().await.push("close-packet");
                        drain_socket.mark_drained();
                    }
                    _ => {}
                }
            }
        });

        socket.close(false).await;
        drain.abort();

        let observed = events.lock().await.clone();
        assert_eq!(observed, vec!["message:A", "close-packet", "disconnect"]);
    }
}
