//! A transport-agnostic, bidirectional realtime session core.
//!
//! This crate presents a single logical [`Socket`] abstraction to
//! application code while internally negotiating between two wire
//! transports — HTTP long-polling and WebSocket — and lets a session
//! started on one seamlessly upgrade to the other without losing buffered
//! packets. A background heartbeat scheduler detects and terminates dead
//! sessions.
//!
//! The engine is exposed as a [`tower::Service`] ([`service::EngineIoService`])
//! so it can be layered in front of any HTTP server built on `hyper`/`tower`;
//! routing, CORS, compression, and the listening socket itself are left to
//! the caller.
//!
//! ```ignore
//! use rtengine::{config::EngineIoConfig, service::EngineIoLayer};
//!
//! let layer = EngineIoLayer::new(MyHandler, EngineIoConfig::default());
//! let svc = tower::ServiceBuilder::new().layer(layer).service(fallback_svc);
//! ```

pub mod body;
pub mod config;
pub mod engine;
pub mod errors;
pub mod handler;
pub mod packet;
pub mod service;
pub mod sid;
pub mod socket;
pub mod transport;

pub(crate) mod futures;

pub use engine::EngineIo;
pub use errors::Error;
pub use handler::EngineIoHandler;
pub use service::{EngineIoLayer, EngineIoService, ProtocolVersion};
pub use sid::Sid;
pub use socket::{DisconnectReason, Socket, SocketReq};
