//! The multiplexing dispatcher: a [`tower::Service`] that classifies
//! inbound requests by URL prefix, runs `verify()`, and routes to
//! handshake, to an existing socket's polling transport, or to the
//! websocket upgrade path. Requests outside our path prefix are forwarded
//! untouched to the wrapped fallback service.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use http::{Method, Request, Response, StatusCode};
use tower::{Layer, Service};

use crate::{
    body::ResponseBody,
    config::EngineIoConfig,
    engine::EngineIo,
    errors::{Error, VerifyError},
    futures::verify_error_response,
    handler::EngineIoHandler,
    sid::Sid,
    socket::SocketReq,
    transport::{polling, ws, TransportType},
};

/// The engine.io wire protocol revision. Only meaningful with the `v3`
/// feature enabled; a build with only `v4` always negotiates V4.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolVersion {
    #[cfg(feature = "v3")]
    V3,
    V4,
}

impl std::str::FromStr for ProtocolVersion {
    type Err = VerifyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            #[cfg(feature = "v3")]
            "3" => Ok(ProtocolVersion::V3),
            "4" => Ok(ProtocolVersion::V4),
            _ => Err(VerifyError::BadRequest),
        }
    }
}

/// Query parameters recognized on the wire.
struct EngineQuery<'a> {
    eio: Option<&'a str>,
    transport: Option<&'a str>,
    sid: Option<&'a str>,
    b64: bool,
}

impl<'a> EngineQuery<'a> {
    fn parse(query: &'a str) -> Self {
        let mut eio = None;
        let mut transport = None;
        let mut sid = None;
        let mut b64 = false;
        for pair in query.split('&') {
            let Some((k, v)) = pair.split_once('=') else { continue };
            match k {
                "EIO" => eio = Some(v),
                "transport" => transport = Some(v),
                "sid" => sid = Some(v),
                "b64" => b64 = v == "1",
                // `j` (JSONP) and `t` (cache buster) are recognized but not
                // acted on: JSONP is a browser-compat shim with no core
                // semantics, `t` is ignored by design.
                _ => {}
            }
        }
        Self { eio, transport, sid, b64 }
    }
}

/// Validate Origin header bytes: printable ASCII excluding DEL, plus the
/// 0x80-0xFF range and horizontal tab.
fn origin_is_valid(value: &http::HeaderValue) -> bool {
    value.as_bytes().iter().all(|&b| matches!(b, 0x09 | 0x20..=0x7e | 0x80..=0xff))
}

/// The admission check run before handshake or before dispatching to an
/// existing socket's transport.
fn verify<H: EngineIoHandler, B>(
    engine: &EngineIo<H>,
    req: &Request<B>,
    query: &EngineQuery<'_>,
    is_upgrade: bool,
) -> Result<(), VerifyError> {
    let transport: TransportType = query
        .transport
        .ok_or(VerifyError::UnknownTransport)?
        .parse()
        .map_err(|_| VerifyError::UnknownTransport)?;
    if !engine.config.transport_enabled(transport) {
        return Err(VerifyError::UnknownTransport);
    }

    if let Some(origin) = req.headers().get(http::header::ORIGIN) {
        if !origin_is_valid(origin) {
            return Err(VerifyError::BadRequest);
        }
    }

    if let Some(sid) = query.sid {
        let sid: Sid = sid.parse().map_err(|_| VerifyError::BadRequest)?;
        let socket = engine.get_socket(sid).ok_or(VerifyError::UnknownSessionID)?;
        if !is_upgrade && socket.transport_type() != transport {
            return Err(VerifyError::BadRequest);
        }
    } else {
        if req.method() != Method::GET {
            return Err(VerifyError::BadHandshakeMethod);
        }
        if let Some(allow) = &engine.config.allow_request {
            if !allow(&SocketReq::from_request(req)) {
                return Err(VerifyError::Forbidden);
            }
        }
    }
    Ok(())
}

/// Does this request carry a websocket upgrade request (`Connection:
/// Upgrade`, `Upgrade: websocket`)?
fn is_upgrade_request<B>(req: &Request<B>) -> bool {
    let has_upgrade_token = req
        .headers()
        .get(http::header::CONNECTION)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_ascii_lowercase().contains("upgrade"))
        .unwrap_or(false);
    let is_websocket = req
        .headers()
        .get(http::header::UPGRADE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.eq_ignore_ascii_case("websocket"))
        .unwrap_or(false);
    has_upgrade_token && is_websocket
}

/// A [`tower::Service`] that dispatches HTTP requests between the engine
/// and a fallback inner service, and handles websocket upgrades inline.
#[derive(Clone)]
pub struct EngineIoService<S, H: EngineIoHandler> {
    inner: S,
    engine: Arc<EngineIo<H>>,
}

impl<S, H: EngineIoHandler> EngineIoService<S, H> {
    pub fn new(inner: S, handler: H, config: EngineIoConfig) -> Self {
        Self { inner, engine: EngineIo::new(handler, config) }
    }

    pub fn with_engine(inner: S, engine: Arc<EngineIo<H>>) -> Self {
        Self { inner, engine }
    }

    pub fn engine(&self) -> &Arc<EngineIo<H>> {
        &self.engine
    }

    fn matches_path(&self, uri: &http::Uri) -> bool {
        uri.path().trim_end_matches('/') == self.engine.config.req_path.trim_end_matches('/')
    }
}

impl<S, H> Service<Request<hyper::Body>> for EngineIoService<S, H>
where
    H: EngineIoHandler,
    S: Service<Request<hyper::Body>, Response = Response<hyper::Body>> + Clone + Send + 'static,
    S::Future: Send + 'static,
    S::Error: Send + 'static,
{
    type Response = Response<ResponseBody<hyper::Body>>;
    type Error = S::Error;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Request<hyper::Body>) -> Self::Future {
        if !self.matches_path(req.uri()) {
            let mut inner = self.inner.clone();
            return Box::pin(async move {
                let resp = inner.call(req).await?;
                Ok(resp.map(ResponseBody::custom))
            });
        }

        let engine = self.engine.clone();
        Box::pin(async move { Ok(Self::handle(engine, req).await) })
    }
}

impl<S, H: EngineIoHandler> EngineIoService<S, H> {
    async fn handle(
        engine: Arc<EngineIo<H>>,
        req: Request<hyper::Body>,
    ) -> Response<ResponseBody<hyper::Body>> {
        let is_upgrade = is_upgrade_request(&req);
        let query_string = req.uri().query().unwrap_or_default().to_string();
        let query = EngineQuery::parse(&query_string);
        let protocol = query
            .eio
            .unwrap_or("4")
            .parse::<ProtocolVersion>()
            .unwrap_or(ProtocolVersion::V4);

        if let Err(e) = verify(&engine, &req, &query, is_upgrade) {
            return error_response(e);
        }

        let sid: Option<Sid> = query.sid.and_then(|s| s.parse().ok());
        #[cfg(feature = "v3")]
        let supports_binary = !query.b64;

        let result = if is_upgrade {
            ws::new_req(engine, protocol, sid, req)
        } else if let Some(sid) = sid {
            match req.method() {
                &Method::GET => polling::polling_req(engine, protocol, sid).await,
                &Method::POST => polling::post_req(engine, protocol, sid, req).await,
                _ => Err(Error::HttpErrorResponse(StatusCode::BAD_REQUEST)),
            }
        } else {
            polling::open_req(
                engine,
                protocol,
                req,
                #[cfg(feature = "v3")]
                supports_binary,
            )
            .await
        };

        result.unwrap_or_else(error_response_from_err)
    }
}

fn error_response<B>(err: VerifyError) -> Response<ResponseBody<B>> {
    verify_error_response(err).unwrap_or_else(|_| {
        Response::builder()
            .status(StatusCode::INTERNAL_SERVER_ERROR)
            .body(ResponseBody::empty())
            .unwrap()
    })
}

fn error_response_from_err<B>(err: Error) -> Response<ResponseBody<B>> {
    match err {
        Error::HttpErrorResponse(status) => {
            Response::builder().status(status).body(ResponseBody::empty()).unwrap()
        }
        Error::UnknownSessionID(_) => error_response(VerifyError::UnknownSessionID),
        _ => Response::builder()
            .status(StatusCode::BAD_REQUEST)
            .body(ResponseBody::empty())
            .unwrap(),
    }
}

/// [`tower::Layer`] installing [`EngineIoService`] in front of a fallback service.
#[derive(Clone)]
pub struct EngineIoLayer<H: EngineIoHandler> {
    engine: Arc<EngineIo<H>>,
}

impl<H: EngineIoHandler> EngineIoLayer<H> {
    pub fn new(handler: H, config: EngineIoConfig) -> Self {
        Self { engine: EngineIo::new(handler, config) }
    }

    pub fn engine(&self) -> &Arc<EngineIo<H>> {
        &self.engine
    }
}

impl<S, H: EngineIoHandler> Layer<S> for EngineIoLayer<H> {
    type Service = EngineIoService<S, H>;

    fn layer(&self, inner: S) -> Self::Service {
        EngineIoService::with_engine(inner, self.engine.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn origin_rejects_del_and_control_bytes_outside_tab() {
        let bad = http::HeaderValue::from_bytes(&[0x7f]).unwrap();
        assert!(!origin_is_valid(&bad));
        let ok = http::HeaderValue::from_static("https://example.com");
        assert!(origin_is_valid(&ok));
    }

    #[test]
    fn query_parse_picks_out_recognized_params() {
        let q = EngineQuery::parse("EIO=4&transport=polling&sid=abc&b64=1&t=xyz");
        assert_eq!(q.eio, Some("4"));
        assert_eq!(q.transport, Some("polling"));
        assert_eq!(q.sid, Some("abc"));
        assert!(q.b64);
    }

    #[test]
    fn protocol_version_defaults_and_parses() {
        assert_eq!("4".parse::<ProtocolVersion>().unwrap(), ProtocolVersion::V4);
        assert!("9".parse::<ProtocolVersion>().is_err());
    }

    #[test]
    fn upgrade_request_requires_both_headers() {
        let req = Request::builder()
            .header(http::header::CONNECTION, "Upgrade")
            .header(http::header::UPGRADE, "websocket")
            .body(())
            .unwrap();
        assert!(is_upgrade_request(&req));

        let req = Request::builder().body(()).unwrap();
        assert!(!is_upgrade_request(&req));
    }
}
