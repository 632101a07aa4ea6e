//! Payload (de)multiplexing for the polling transport (spec §4.2): the
//! batching format that concatenates several packets into one HTTP body
//! since polling, unlike websocket, does not preserve packet boundaries on
//! its own (`supportsFraming = false`).

use bytes::Bytes;
use futures::{Stream, StreamExt};
use http::Request;
use http_body::Body;
use tokio::sync::{mpsc, MutexGuard};

use crate::{errors::Error, packet::Packet, service::ProtocolVersion};

/// v4 packet separator: ASCII record separator, chosen because it can never
/// appear inside a base64 or JSON packet payload.
const V4_SEPARATOR: char = '\u{1e}';

/// The encoded result of a polling flush.
pub struct Payload {
    pub data: String,
    /// Whether the drained batch included a close packet — `polling_req`
    /// uses this to signal the socket's graceful-close drain wait (spec §4.4).
    pub has_close: bool,
}

/// Wait for at least one packet to be queued, then drain and encode every
/// packet currently available without blocking further.
///
/// Waiting via `rx.recv()` *is* the park: the HTTP response this feeds is
/// held open by the caller until this future resolves, which is exactly
/// the "park the GET until writeBuffer is non-empty" behavior of spec §4.2.
///
/// `supports_binary` is parsed from the client's `b64` query flag (spec §6)
/// but does not change anything here: every packet in this crate's polling
/// batch is multiplexed as a record-separated (v4) or length-prefixed (v3)
/// *text* payload, with `Packet::Binary` always base64-framed inside it
/// (`packet.rs`). A true raw, non-base64 binary XHR polling mode — a
/// separate, unbatched wire format old engine.io clients used — is not
/// implemented; see DESIGN.md's "Dropped" section.
pub async fn encoder(
    mut rx: MutexGuard<'_, mpsc::UnboundedReceiver<Packet>>,
    protocol: ProtocolVersion,
    #[cfg(feature = "v3")] _supports_binary: bool,
    _max_payload: u64,
) -> Result<Payload, Error> {
    let mut packets = match rx.recv().await {
        Some(p) => vec![p],
        // The sending half was dropped: the socket was torn down while this
        // request was parked. Answer with a close packet rather than
        // hanging the connection open.
        None => vec![Packet::Close],
    };
    while let Ok(p) = rx.try_recv() {
        packets.push(p);
    }
    drop(rx);

    let mut has_close = false;
    let mut parts = Vec::with_capacity(packets.len());
    for packet in packets {
        if matches!(packet, Packet::Close) {
            has_close = true;
        }
        let encoded: String = packet.try_into().map_err(Error::InvalidPacket)?;
        parts.push(encoded);
    }

    let data = match protocol {
        #[cfg(feature = "v3")]
        ProtocolVersion::V3 => parts
            .into_iter()
            .map(|p| format!("{}:{}", v3_len(&p), p))
            .collect::<String>(),
        _ => parts.join(&V4_SEPARATOR.to_string()),
    };

    Ok(Payload { data, has_close })
}

/// The v3 wire format prefixes every packet with its length before encoding
/// it into a batch. Counted in grapheme clusters rather than raw `char`s so
/// a combining-mark sequence is never split across a length boundary.
#[cfg(feature = "v3")]
pub(crate) fn v3_len(s: &str) -> usize {
    use unicode_segmentation::UnicodeSegmentation;
    s.graphemes(true).count()
}

/// Decode a POST body into a stream of packets (spec §4.2: "Inbound client
/// messages arrive as POST with encoded packet(s) in the body").
pub fn decoder<R>(
    req: Request<R>,
    protocol: ProtocolVersion,
    max_payload: u64,
) -> impl Stream<Item = Result<Packet, Error>>
where
    R: Body + Send + Unpin + 'static,
    <R as Body>::Error: std::fmt::Debug,
    <R as Body>::Data: Send,
{
    let body = req.into_body();
    futures::stream::once(async move { collect_packets(body, protocol, max_payload).await }).flat_map(
        |res| match res {
            Ok(packets) => futures::stream::iter(packets).left_stream(),
            Err(e) => futures::stream::iter(vec![Err(e)]).right_stream(),
        },
    )
}

async fn collect_packets<R>(
    body: R,
    protocol: ProtocolVersion,
    max_payload: u64,
) -> Result<Vec<Result<Packet, Error>>, Error>
where
    R: Body + Send + Unpin + 'static,
    <R as Body>::Error: std::fmt::Debug,
    <R as Body>::Data: Send,
{
    let bytes: Bytes = hyper::body::to_bytes(body)
        .await
        .map_err(|_| Error::HttpErrorResponse(http::StatusCode::BAD_REQUEST))?;
    if bytes.len() as u64 > max_payload {
        return Err(Error::PayloadTooLarge);
    }
    let text = String::from_utf8_lossy(&bytes).into_owned();

    let packets = match protocol {
        #[cfg(feature = "v3")]
        ProtocolVersion::V3 => split_v3(&text),
        _ => text.split(V4_SEPARATOR).map(str::to_string).collect(),
    };

    Ok(packets
        .into_iter()
        .filter(|s| !s.is_empty())
        .map(|s| Packet::try_from(s).map_err(Error::InvalidPacket))
        .collect())
}

/// Split a v3 length-prefixed payload (`"<graphemelen>:<packet>"...`) into
/// its individual packet strings. `memchr` locates each `:` delimiter (the
/// digits ahead of it are always single-byte ASCII, so scanning raw bytes
/// is safe); the length itself is read off in grapheme clusters via
/// [`v3_len`]'s counting convention.
#[cfg(feature = "v3")]
fn split_v3(text: &str) -> Vec<String> {
    use unicode_segmentation::UnicodeSegmentation;

    let mut out = Vec::new();
    let bytes = text.as_bytes();
    let mut pos = 0;
    while pos < bytes.len() {
        let colon = match memchr::memchr(b':', &bytes[pos..]) {
            Some(off) => pos + off,
            None => break, // malformed; stop rather than panic, decode() turns this into a parse error downstream
        };
        let digits = &text[pos..colon];
        if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
            break;
        }
        let len: usize = match digits.parse() {
            Ok(n) => n,
            Err(_) => break,
        };

        let body_start = colon + 1;
        let remainder = &text[body_start..];
        let mut end_byte = remainder.len();
        let mut count = 0;
        for (offset, grapheme) in remainder.grapheme_indices(true) {
            if count == len {
                end_byte = offset;
                break;
            }
            count += 1;
            end_byte = offset + grapheme.len();
        }
        if count < len {
            break; // fewer graphemes available than the prefix declared
        }
        out.push(remainder[..end_byte].to_string());
        pos = body_start + end_byte;
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test(flavor = "current_thread")]
    async fn encoder_batches_everything_ready_without_blocking_further() {
        let (tx, rx) = mpsc::unbounded_channel();
        tx.send(Packet::Message("a".into())).unwrap();
        tx.send(Packet::Message("b".into())).unwrap();
        let lock = tokio::sync::Mutex::new(rx);
        let guard = lock.lock().await;
        let payload = encoder(
            guard,
            ProtocolVersion::V4,
            #[cfg(feature = "v3")]
            true,
            1_000_000,
        )
        .await
        .unwrap();
        assert_eq!(payload.data, format!("4a{}4b", V4_SEPARATOR));
    }

    #[tokio::test]
    async fn encoder_parks_until_a_packet_arrives() {
        let (tx, rx) = mpsc::unbounded_channel();
        let lock = tokio::sync::Mutex::new(rx);
        let guard = lock.lock().await;
        let fut = encoder(
            guard,
            ProtocolVersion::V4,
            #[cfg(feature = "v3")]
            true,
            1_000_000,
        );
        tokio::pin!(fut);
        tokio::select! {
            _ = &mut fut => panic!("encoder resolved before any packet was sent"),
            _ = tokio::time::sleep(Duration::from_millis(20)) => {}
        }
        tx.send(Packet::Noop).unwrap();
        let payload = fut.await.unwrap();
        assert_eq!(payload.data, "6");
    }

    #[cfg(feature = "v3")]
    #[test]
    fn v3_length_prefix_counts_grapheme_clusters() {
        // "é" here is `e` + combining acute accent: two chars, one grapheme.
        let combining = "e\u{0301}";
        assert_eq!(v3_len(combining), 1);
        assert_eq!(v3_len("hello"), 5);
    }

    #[cfg(feature = "v3")]
    #[test]
    fn split_v3_recovers_multiple_packets_including_multibyte_ones() {
        let combining = "e\u{0301}";
        let payload = format!("3:4hi1:{combining}");
        let parts = split_v3(&payload);
        assert_eq!(parts, vec!["4hi".to_string(), combining.to_string()]);
    }

    #[cfg(feature = "v3")]
    #[test]
    fn split_v3_stops_on_truncated_trailer_without_panicking() {
        assert_eq!(split_v3("3:4h"), Vec::<String>::new());
        assert_eq!(split_v3("not-a-prefix"), Vec::<String>::new());
    }
}
