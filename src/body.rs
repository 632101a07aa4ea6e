//! A small `http_body::Body` wrapper so every response the engine produces
//! — a handshake, a polling flush, a websocket upgrade ack, or a
//! passthrough from the caller's fallback service — can share one concrete
//! response type.
//!
//! HTTP server plumbing itself (the listener, routing, CORS, compression)
//! is out of scope for this crate; this wrapper exists only so the engine's
//! `tower::Service` has a single `Response<ResponseBody<B>>` to return
//! regardless of which branch (ours or the fallback's) produced it.

use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::Bytes;
use http::HeaderMap;
use http_body::Body;
use pin_project::pin_project;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// The body of any response the engine returns.
#[pin_project(project = ResponseBodyProj)]
pub enum ResponseBody<B> {
    /// A fully-buffered in-memory body — every engine-generated response.
    Full { data: Option<Bytes> },
    /// A request forwarded to the caller's fallback service untouched.
    Custom(#[pin] B),
}

impl<B> ResponseBody<B> {
    pub fn empty() -> Self {
        Self::from_bytes(Bytes::new())
    }

    pub fn from_bytes(data: impl Into<Bytes>) -> Self {
        Self::Full { data: Some(data.into()) }
    }

    pub fn custom(body: B) -> Self {
        Self::Custom(body)
    }
}

impl<B> Body for ResponseBody<B>
where
    B: Body<Data = Bytes>,
    B::Error: Into<BoxError>,
{
    type Data = Bytes;
    type Error = BoxError;

    fn poll_data(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Self::Data, Self::Error>>> {
        match self.project() {
            ResponseBodyProj::Full { data } => Poll::Ready(data.take().map(Ok)),
            ResponseBodyProj::Custom(b) => b.poll_data(cx).map(|opt| opt.map(|r| r.map_err(Into::into))),
        }
    }

    fn poll_trailers(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Result<Option<HeaderMap>, Self::Error>> {
        match self.project() {
            ResponseBodyProj::Full { .. } => Poll::Ready(Ok(None)),
            ResponseBodyProj::Custom(b) => b.poll_trailers(cx).map_err(Into::into),
        }
    }

    fn is_end_stream(&self) -> bool {
        match self {
            ResponseBody::Full { data } => data.is_none(),
            ResponseBody::Custom(b) => b.is_end_stream(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn full_body_yields_its_bytes_once_then_ends() {
        let mut body: ResponseBody<hyper::Body> = ResponseBody::from_bytes("hello");
        let mut pinned = Pin::new(&mut body);
        let first = futures::future::poll_fn(|cx| pinned.as_mut().poll_data(cx)).await;
        assert_eq!(first.unwrap().unwrap(), Bytes::from_static(b"hello"));
        assert!(pinned.is_end_stream());
    }
}
