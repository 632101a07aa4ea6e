//! Error taxonomy for the engine.
//!
//! [`Error`] covers both transport-level failures (I/O, parse, protocol
//! mismatches) and the handshake-time protocol rejections of
//! [`crate::service::verify`]. Protocol rejections never reach application
//! code; they are turned into an HTTP response by the caller. Transport
//! failures are turned into a [`DisconnectReason`] and close the socket.

use http::StatusCode;

use crate::{packet::Packet, sid::Sid, socket::DisconnectReason};

/// Errors that can occur while driving a request through the engine.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("http error: {0}")]
    Http(#[from] http::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("websocket error: {0}")]
    Ws(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("invalid packet: {0}")]
    InvalidPacket(#[from] crate::packet::ParseError),

    #[error("bad packet received: {0:?}")]
    BadPacket(Packet),

    #[error("unknown session id: {0}")]
    UnknownSessionID(Sid),

    #[error("the requested transport does not match the transport currently bound to this session")]
    TransportMismatch,

    #[error("the http long-polling session is already in use by another request")]
    MultipleHttpPollingError,

    #[error("a websocket upgrade handshake failed")]
    UpgradeError,

    #[error("no pong received within the heartbeat timeout")]
    HeartbeatTimeout,

    #[error("payload exceeds the configured max_payload size")]
    PayloadTooLarge,

    #[error("http error response: {0}")]
    HttpErrorResponse(StatusCode),
}

/// Maps a transport-level error to the [`DisconnectReason`] the socket
/// should be closed with, or `None` if the error is not fatal to the
/// session (protocol rejections answered with an HTTP status code, for
/// instance, never reach this conversion).
impl From<&Error> for Option<DisconnectReason> {
    fn from(err: &Error) -> Self {
        use Error::*;
        match err {
            Io(_) | Ws(_) => Some(DisconnectReason::TransportError),
            InvalidPacket(_) | BadPacket(_) => Some(DisconnectReason::PacketParsingError),
            HeartbeatTimeout => Some(DisconnectReason::HeartbeatTimeout),
            UpgradeError => None,
            MultipleHttpPollingError => Some(DisconnectReason::MultipleHttpPollingError),
            PayloadTooLarge => Some(DisconnectReason::PacketParsingError),
            UnknownSessionID(_) | TransportMismatch | Http(_) | HttpErrorResponse(_) => None,
        }
    }
}

impl From<Error> for Option<DisconnectReason> {
    fn from(err: Error) -> Self {
        (&err).into()
    }
}

/// Handshake-time protocol rejection codes, surfaced to the client as
/// `{code, message}` JSON over HTTP 400 (or 403 for `Forbidden`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerifyError {
    UnknownTransport = 0,
    UnknownSessionID = 1,
    BadHandshakeMethod = 2,
    BadRequest = 3,
    Forbidden = 4,
}

impl VerifyError {
    /// The HTTP status this rejection is reported with.
    pub fn http_status(&self) -> StatusCode {
        match self {
            VerifyError::Forbidden => StatusCode::FORBIDDEN,
            _ => StatusCode::BAD_REQUEST,
        }
    }

    /// The human-readable message paired with the numeric code in the JSON
    /// error body.
    pub fn message(&self) -> &'static str {
        match self {
            VerifyError::UnknownTransport => "Transport unknown",
            VerifyError::UnknownSessionID => "Session ID unknown",
            VerifyError::BadHandshakeMethod => "Bad handshake method",
            VerifyError::BadRequest => "Bad request",
            VerifyError::Forbidden => "Forbidden",
        }
    }

    pub fn code(&self) -> u8 {
        *self as u8
    }
}

impl std::fmt::Display for VerifyError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.message(), self.code())
    }
}

impl std::error::Error for VerifyError {}
