//! Session identifiers (`sid`): opaque, URL-safe, unguessable tokens assigned
//! to each [`Socket`](crate::socket::Socket) at handshake time.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use std::fmt;

/// An opaque session identifier.
///
/// Backed by 16 random bytes, the same entropy a browser-facing engine.io
/// server hands out. Displayed as URL-safe unpadded base64, which is also
/// the wire representation sent to clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Sid(u128);

impl Sid {
    /// Generate a new random [`Sid`].
    ///
    /// [`EngineIoConfig::id_generator`](crate::config::EngineIoConfig::id_generator)
    /// lets a caller override what [`EngineIo::create_session`](crate::engine::EngineIo::create_session)
    /// uses instead of this function, for tests that need deterministic ids;
    /// this function itself is always backed by the OS RNG.
    pub fn new() -> Self {
        Self(rand::random())
    }
}

impl Default for Sid {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for Sid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&URL_SAFE_NO_PAD.encode(self.0.to_be_bytes()))
    }
}

impl std::str::FromStr for Sid {
    type Err = base64::DecodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = URL_SAFE_NO_PAD.decode(s)?;
        let mut buf = [0u8; 16];
        let len = bytes.len().min(16);
        buf[..len].copy_from_slice(&bytes[..len]);
        Ok(Self(u128::from_be_bytes(buf)))
    }
}

impl serde::Serialize for Sid {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.collect_str(self)
    }
}

impl<'de> serde::Deserialize<'de> for Sid {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::str::FromStr;

    #[test]
    fn sids_are_unique_across_many_generations() {
        let mut seen = HashSet::new();
        for _ in 0..10_000 {
            assert!(seen.insert(Sid::new()));
        }
    }

    #[test]
    fn display_is_url_safe_and_round_trips() {
        let sid = Sid::new();
        let s = sid.to_string();
        assert!(!s.contains('+') && !s.contains('/') && !s.contains('='));
        assert_eq!(Sid::from_str(&s).unwrap(), sid);
    }
}
