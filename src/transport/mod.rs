//! Transport abstraction (spec §4.1): the two concrete wire realizations of
//! a session, plus the shared vocabulary ([`TransportType`]) used to
//! negotiate and upgrade between them.

pub mod polling;
pub mod ws;

use serde::{Deserialize, Serialize};

/// Which concrete transport a socket is currently bound to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportType {
    Polling,
    Websocket,
}

impl TransportType {
    /// Does this transport preserve packet boundaries on its own (true for
    /// websocket, one frame per packet) or does it concatenate multiple
    /// packets into a single batch (true for polling, spec §4.2)?
    pub fn supports_framing(&self) -> bool {
        matches!(self, TransportType::Websocket)
    }

    /// Is this transport a legal target for [`crate::socket::Socket::upgrade_to_websocket`]?
    /// Only websocket can be upgraded to; polling never handles an upgrade *into* it.
    pub fn handles_upgrades(&self) -> bool {
        matches!(self, TransportType::Websocket)
    }
}

impl std::fmt::Display for TransportType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TransportType::Polling => "polling",
            TransportType::Websocket => "websocket",
        };
        f.write_str(s)
    }
}

impl std::str::FromStr for TransportType {
    type Err = UnknownTransport;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "polling" => Ok(TransportType::Polling),
            "websocket" => Ok(TransportType::Websocket),
            _ => Err(UnknownTransport),
        }
    }
}

/// Returned when a `transport` query value doesn't name a known transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnknownTransport;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn websocket_handles_upgrades_polling_does_not() {
        assert!(TransportType::Websocket.handles_upgrades());
        assert!(!TransportType::Polling.handles_upgrades());
    }

    #[test]
    fn display_round_trips_through_from_str() {
        for t in [TransportType::Polling, TransportType::Websocket] {
            let s = t.to_string();
            assert_eq!(s.parse::<TransportType>().unwrap(), t);
        }
    }
}
