//! Small response-building helpers shared by the polling and websocket
//! transport modules, kept out of `service.rs` so each transport stays in
//! charge of its own response shape.

use base64::{engine::general_purpose::STANDARD, Engine};
use http::{header, HeaderValue, Response, StatusCode};

use crate::{body::ResponseBody, errors::Error};

/// Build a plain HTTP response carrying `data` as the body, the way every
/// polling response (handshake, GET flush, POST ack) is built.
pub(crate) fn http_response<B>(
    status: StatusCode,
    data: impl Into<bytes::Bytes>,
    is_binary: bool,
) -> Result<Response<ResponseBody<B>>, http::Error> {
    let content_type = if is_binary {
        "application/octet-stream"
    } else {
        "text/plain; charset=UTF-8"
    };
    Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, content_type)
        .body(ResponseBody::from_bytes(data))
}

/// Build the error body the client sees for a rejected HTTP polling request:
/// `{code, message}` JSON with the matching HTTP status.
pub(crate) fn verify_error_response<B>(
    err: crate::errors::VerifyError,
) -> Result<Response<ResponseBody<B>>, http::Error> {
    let body = serde_json::json!({ "code": err.code(), "message": err.message() }).to_string();
    Response::builder()
        .status(err.http_status())
        .header(header::CONTENT_TYPE, "application/json")
        .body(ResponseBody::from_bytes(body))
}

/// Build the HTTP/1.1 101 Switching Protocols response completing a
/// websocket upgrade handshake.
pub(crate) fn ws_response<B>(ws_key: &HeaderValue) -> Result<Response<ResponseBody<B>>, Error> {
    let accept = derive_accept_key(ws_key.as_bytes());
    Response::builder()
        .status(StatusCode::SWITCHING_PROTOCOLS)
        .header(header::CONNECTION, "Upgrade")
        .header(header::UPGRADE, "websocket")
        .header("Sec-WebSocket-Accept", accept)
        .body(ResponseBody::empty())
        .map_err(Error::Http)
}

/// RFC 6455 §1.3 `Sec-WebSocket-Accept` derivation: base64(SHA-1(key + GUID)).
fn derive_accept_key(key: &[u8]) -> String {
    use sha1::{Digest, Sha1};
    const WS_GUID: &[u8] = b"258EAFA5-E914-47DA-95CA-C5AB0DC85B11";
    let mut hasher = Sha1::new();
    hasher.update(key);
    hasher.update(WS_GUID);
    STANDARD.encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accept_key_matches_the_rfc6455_worked_example() {
        // RFC 6455 §1.3 worked example.
        let accept = derive_accept_key(b"dGhlIHNhbXBsZSBub25jZQ==");
        assert_eq!(accept, "s3pPLMBiTxaQ9kYGzzhZRbK+xOo=");
    }
}
