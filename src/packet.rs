//! The engine.io packet format: a closed set of small control/data packets
//! multiplexed over whatever byte transport is underneath.
//!
//! This module is the in-crate stand-in for what spec.md treats as an
//! external "PacketCodec" collaborator — there is no separate published
//! crate for this wire format, so encode/decode lives here as a pure
//! function pair (`TryFrom`/`TryInto`) with no dependency on the rest of
//! the crate beyond [`Sid`] and [`TransportType`] for [`OpenPacket`].

use base64::{engine::general_purpose::STANDARD, Engine};
use bytes::Bytes;
use serde::Serialize;

use crate::{config::EngineIoConfig, sid::Sid, transport::TransportType};

/// The payload of the `open` packet, serialized as JSON and sent as the
/// first packet of every new session (spec §4.4.1, §6). Field names are
/// camelCased on the wire (`pingInterval`, `pingTimeout`, `maxPayload`) to
/// match every engine.io client; only the Rust-side struct fields are snake
/// case.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OpenPacket {
    pub sid: Sid,
    pub upgrades: Vec<TransportType>,
    pub ping_interval: u64,
    pub ping_timeout: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    #[cfg_attr(not(feature = "v3"), allow(dead_code))]
    pub max_payload: Option<u64>,
}

impl OpenPacket {
    /// Build the open packet for a freshly created socket bound to `transport`.
    ///
    /// `upgrades` is derived from the upgrade map of spec §4.4.1: `polling`
    /// can reach `websocket`; `websocket` has no further upgrades.
    pub fn new(transport: TransportType, sid: Sid, config: &EngineIoConfig) -> Self {
        let upgrades = match transport {
            TransportType::Polling if config.allow_upgrades => vec![TransportType::Websocket],
            _ => vec![],
        };
        Self {
            sid,
            upgrades,
            ping_interval: config.ping_interval.as_millis() as u64,
            ping_timeout: config.ping_timeout.as_millis() as u64,
            #[cfg(feature = "v3")]
            max_payload: Some(config.max_payload),
            #[cfg(not(feature = "v3"))]
            max_payload: None,
        }
    }
}

/// A single engine.io packet.
#[derive(Debug, Clone)]
pub enum Packet {
    Open(OpenPacket),
    Close,
    Ping,
    Pong,
    /// `ping` with data `"probe"`, used to test a candidate transport before
    /// committing an upgrade (spec §4.4.4).
    PingUpgrade,
    /// `pong` with data `"probe"`, the reply to [`Packet::PingUpgrade`].
    PongUpgrade,
    Message(String),
    Upgrade,
    Noop,
    /// A binary message. Sent natively as a websocket binary frame; base64
    /// framed with a leading `b` over polling / unsupported-binary clients.
    Binary(Bytes),
    /// A binary message framed per the engine.io v3 wire format (length
    /// prefixed, no `b` marker) rather than the v4 base64-in-text form.
    #[cfg(feature = "v3")]
    BinaryV3(Bytes),
}

/// A packet failed to parse. Treated by the session as a fatal, non-recoverable
/// error (spec §3: "malformed bytes yield a distinguished parse-error packet
/// type that the session treats as fatal").
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("unknown packet type: {0}")]
    UnknownPacketType(char),
    #[error("empty packet")]
    Empty,
    #[error("invalid open packet payload")]
    InvalidOpenPayload,
    #[error("invalid base64 payload")]
    InvalidBase64,
}

impl TryFrom<Packet> for String {
    type Error = ParseError;

    fn try_from(packet: Packet) -> Result<Self, Self::Error> {
        let s = match packet {
            Packet::Open(open) => {
                let data = serde_json::to_string(&open).map_err(|_| ParseError::InvalidOpenPayload)?;
                format!("0{data}")
            }
            Packet::Close => "1".to_string(),
            Packet::Ping => "2".to_string(),
            Packet::Pong => "3".to_string(),
            Packet::PingUpgrade => "2probe".to_string(),
            Packet::PongUpgrade => "3probe".to_string(),
            Packet::Message(msg) => format!("4{msg}"),
            Packet::Upgrade => "5".to_string(),
            Packet::Noop => "6".to_string(),
            Packet::Binary(bin) => format!("b{}", STANDARD.encode(bin)),
            #[cfg(feature = "v3")]
            Packet::BinaryV3(_) => return Err(ParseError::InvalidBase64),
        };
        Ok(s)
    }
}

impl TryFrom<String> for Packet {
    type Error = ParseError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        let mut chars = value.chars();
        let first = chars.next().ok_or(ParseError::Empty)?;
        let rest = chars.as_str();
        let packet = match first {
            '0' => {
                let open: OpenPacketWire =
                    serde_json::from_str(rest).map_err(|_| ParseError::InvalidOpenPayload)?;
                Packet::Open(open.into())
            }
            '1' => Packet::Close,
            '2' if rest == "probe" => Packet::PingUpgrade,
            '2' => Packet::Ping,
            '3' if rest == "probe" => Packet::PongUpgrade,
            '3' => Packet::Pong,
            '4' => Packet::Message(rest.to_string()),
            '5' => Packet::Upgrade,
            '6' => Packet::Noop,
            'b' => {
                let bytes = STANDARD.decode(rest).map_err(|_| ParseError::InvalidBase64)?;
                Packet::Binary(Bytes::from(bytes))
            }
            other => return Err(ParseError::UnknownPacketType(other)),
        };
        Ok(packet)
    }
}

/// Intermediate type used only to deserialize an inbound `open` packet (the
/// server never receives one in practice, but decode must stay total over
/// every packet type the format defines).
#[derive(serde::Deserialize)]
#[serde(rename_all = "camelCase")]
struct OpenPacketWire {
    sid: Sid,
    upgrades: Vec<TransportType>,
    ping_interval: u64,
    ping_timeout: u64,
    #[serde(default)]
    max_payload: Option<u64>,
}

impl From<OpenPacketWire> for OpenPacket {
    fn from(w: OpenPacketWire) -> Self {
        OpenPacket {
            sid: w.sid,
            upgrades: w.upgrades,
            ping_interval: w.ping_interval,
            ping_timeout: w.ping_timeout,
            max_payload: w.max_payload,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn probe_ping_pong_round_trip() {
        let s: String = Packet::PingUpgrade.try_into().unwrap();
        assert_eq!(s, "2probe");
        assert!(matches!(Packet::try_from(s).unwrap(), Packet::PingUpgrade));

        let s: String = Packet::PongUpgrade.try_into().unwrap();
        assert_eq!(s, "3probe");
        assert!(matches!(Packet::try_from(s).unwrap(), Packet::PongUpgrade));
    }

    #[test]
    fn plain_ping_is_distinct_from_probe() {
        let s: String = Packet::Ping.try_into().unwrap();
        assert_eq!(s, "2");
        assert!(matches!(Packet::try_from(s).unwrap(), Packet::Ping));
    }

    #[test]
    fn message_round_trip() {
        let s: String = Packet::Message("hello".into()).try_into().unwrap();
        assert_eq!(s, "4hello");
        match Packet::try_from(s).unwrap() {
            Packet::Message(m) => assert_eq!(m, "hello"),
            p => panic!("unexpected {p:?}"),
        }
    }

    #[test]
    fn binary_packet_round_trips_through_base64() {
        let bin = Bytes::from_static(b"\x00\x01\xff");
        let s: String = Packet::Binary(bin.clone()).try_into().unwrap();
        assert!(s.starts_with('b'));
        match Packet::try_from(s).unwrap() {
            Packet::Binary(b) => assert_eq!(b, bin),
            p => panic!("unexpected {p:?}"),
        }
    }

    #[test]
    fn unknown_packet_type_is_a_parse_error() {
        assert_eq!(
            Packet::try_from("z".to_string()).unwrap_err(),
            ParseError::UnknownPacketType('z')
        );
    }

    #[test]
    fn empty_payload_is_a_parse_error() {
        assert_eq!(Packet::try_from(String::new()).unwrap_err(), ParseError::Empty);
    }

    #[test]
    fn open_packet_lists_websocket_upgrade_from_polling() {
        let config = EngineIoConfig {
            ping_interval: Duration::from_millis(25_000),
            ping_timeout: Duration::from_millis(5_000),
            ..EngineIoConfig::default()
        };
        let open = OpenPacket::new(TransportType::Polling, Sid::new(), &config);
        assert_eq!(open.upgrades, vec![TransportType::Websocket]);
        assert_eq!(open.ping_interval, 25_000);

        let open = OpenPacket::new(TransportType::Websocket, Sid::new(), &config);
        assert!(open.upgrades.is_empty());
    }

    #[test]
    fn open_packet_wire_json_uses_camel_case_keys() {
        let config = EngineIoConfig {
            ping_interval: Duration::from_millis(25_000),
            ping_timeout: Duration::from_millis(5_000),
            allow_upgrades: false,
            ..EngineIoConfig::default()
        };
        let sid = Sid::new();
        let open = OpenPacket::new(TransportType::Polling, sid, &config);
        let json = serde_json::to_string(&open).unwrap();

        #[cfg(not(feature = "v3"))]
        assert_eq!(
            json,
            format!(r#"{{"sid":"{sid}","upgrades":[],"pingInterval":25000,"pingTimeout":5000}}"#)
        );
        #[cfg(feature = "v3")]
        assert_eq!(
            json,
            format!(
                r#"{{"sid":"{sid}","upgrades":[],"pingInterval":25000,"pingTimeout":5000,"maxPayload":1000000}}"#
            )
        );
    }
}
