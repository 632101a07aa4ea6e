//! The application-facing observer trait (spec §4.4 "emits"): a handler is
//! notified of connection, message, binary, and disconnection events for
//! every socket the engine manages.

use std::sync::Arc;

use bytes::Bytes;

use crate::socket::{DisconnectReason, Socket};

/// Implemented by the application to observe the lifecycle of every
/// [`Socket`] the engine creates.
///
/// `Data` is a per-socket user data slot stored inline on the socket
/// (`Socket::data`) so the application can stash connection-scoped state
/// without a side table keyed by [`crate::sid::Sid`].
///
/// Methods are `async` (via `#[async_trait]`) so a handler that needs to
/// await I/O — persisting a message, looking up an auth claim — can do so
/// directly instead of spawning its own task per callback. The engine
/// awaits each callback in place on the socket's own request/read task, so
/// a slow handler backs up only that one socket, never the others.
#[async_trait::async_trait]
pub trait EngineIoHandler: Send + Sync + 'static {
    type Data: Default + Send + Sync + 'static;

    /// A new socket finished its handshake and is now open.
    async fn on_connect(&self, socket: Arc<Socket<Self::Data>>);

    /// A socket was closed; emitted at most once per socket (spec §7).
    async fn on_disconnect(&self, socket: Arc<Socket<Self::Data>>, reason: DisconnectReason);

    /// A text message packet was received.
    async fn on_message(&self, msg: String, socket: Arc<Socket<Self::Data>>);

    /// A binary message packet was received.
    async fn on_binary(&self, data: Bytes, socket: Arc<Socket<Self::Data>>);
}
