//! Engine configuration: every knob a consumer can set when constructing an
//! [`Engine`](crate::engine::Engine) / [`EngineIoService`](crate::service::EngineIoService).

use std::sync::Arc;
use std::time::Duration;

use crate::sid::Sid;
use crate::transport::TransportType;

/// Cookie injected into the first polling response for sticky-session
/// routing by an upstream load balancer.
#[derive(Debug, Clone)]
pub struct CookieConfig {
    pub name: String,
    pub path: String,
    pub http_only: bool,
    pub same_site: SameSite,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SameSite {
    Strict,
    Lax,
    None,
}

impl Default for CookieConfig {
    fn default() -> Self {
        Self {
            name: "io".to_string(),
            path: "/".to_string(),
            http_only: true,
            same_site: SameSite::Lax,
        }
    }
}

/// Custom admission callback consulted during handshake when no `sid` is
/// present. Returning `false` rejects the handshake as
/// [`VerifyError::Forbidden`](crate::errors::VerifyError::Forbidden).
pub type AllowRequestFn =
    std::sync::Arc<dyn Fn(&crate::socket::SocketReq) -> bool + Send + Sync + 'static>;

/// Overrides the engine's session id generator, consulted once per
/// handshake in place of [`Sid::new`]. Spec §9: "`generateId` must be
/// overridable (for deterministic test ids)."
pub type IdGeneratorFn = Arc<dyn Fn() -> Sid + Send + Sync + 'static>;

/// Per-message compression for the websocket transport (spec §4.3, §6) —
/// distinct from HTTP response compression, which is out of scope for this
/// crate (see DESIGN.md). Negotiating `permessage-deflate` on the upgrade
/// itself and compressing frames is not implemented; this struct exists as
/// the documented configuration surface spec §6 names, pending a deflate
/// dependency the teacher's stack doesn't currently carry.
#[derive(Debug, Clone, Copy)]
pub struct PerMessageDeflateConfig {
    /// Packets smaller than this many bytes bypass compression even when
    /// negotiated (spec §4.3: "small packets bypass compression").
    pub threshold: usize,
}

impl Default for PerMessageDeflateConfig {
    fn default() -> Self {
        Self { threshold: 1024 }
    }
}

/// Engine-wide configuration.
#[derive(Clone)]
pub struct EngineIoConfig {
    /// Time between server-initiated pings (default 25s).
    pub ping_interval: Duration,
    /// Time to wait for a pong before declaring the session dead (default 5s).
    pub ping_timeout: Duration,
    /// Max time to complete an upgrade before the candidate transport is
    /// closed and the session stays on its current transport (default 10s).
    pub upgrade_timeout: Duration,
    /// Max decoded body size for a single polling POST, in bytes (default 1e6).
    pub max_payload: u64,
    /// Transports the engine will accept (default: both).
    pub transports: Vec<TransportType>,
    /// Whether a polling session may be upgraded to websocket (default true).
    pub allow_upgrades: bool,
    /// URL path prefix this engine listens under (default `/engine.io`).
    pub req_path: String,
    /// Cookie configuration; `None` disables cookie injection.
    pub cookie: Option<CookieConfig>,
    /// Custom handshake admission check.
    pub allow_request: Option<AllowRequestFn>,
    /// Extra message appended right after the open packet.
    pub initial_payload: Option<String>,
    /// Grace window before an orphaned upgrade socket is forcibly destroyed,
    /// consulted by `attach`-style callers that bridge raw upgrade sockets.
    pub destroy_upgrade_timeout: Duration,
    /// Overrides session id generation; `None` uses [`Sid::new`].
    pub id_generator: Option<IdGeneratorFn>,
    /// Websocket per-message compression; `None` disables it (default).
    pub per_message_deflate: Option<PerMessageDeflateConfig>,
}

impl Default for EngineIoConfig {
    fn default() -> Self {
        Self {
            ping_interval: Duration::from_millis(25_000),
            ping_timeout: Duration::from_millis(5_000),
            upgrade_timeout: Duration::from_millis(10_000),
            max_payload: 1_000_000,
            transports: vec![TransportType::Polling, TransportType::Websocket],
            allow_upgrades: true,
            req_path: "/engine.io".to_string(),
            cookie: None,
            allow_request: None,
            initial_payload: None,
            destroy_upgrade_timeout: Duration::from_millis(1_000),
            id_generator: None,
            per_message_deflate: None,
        }
    }
}

impl std::fmt::Debug for EngineIoConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineIoConfig")
            .field("ping_interval", &self.ping_interval)
            .field("ping_timeout", &self.ping_timeout)
            .field("upgrade_timeout", &self.upgrade_timeout)
            .field("max_payload", &self.max_payload)
            .field("transports", &self.transports)
            .field("allow_upgrades", &self.allow_upgrades)
            .field("req_path", &self.req_path)
            .field("cookie", &self.cookie)
            .field("allow_request", &self.allow_request.is_some())
            .field("initial_payload", &self.initial_payload)
            .field("destroy_upgrade_timeout", &self.destroy_upgrade_timeout)
            .field("id_generator", &self.id_generator.is_some())
            .field("per_message_deflate", &self.per_message_deflate)
            .finish()
    }
}

impl EngineIoConfig {
    pub fn builder() -> EngineIoConfigBuilder {
        EngineIoConfigBuilder::default()
    }

    pub fn transport_enabled(&self, t: TransportType) -> bool {
        self.transports.contains(&t)
    }
}

/// Builder for [`EngineIoConfig`].
#[derive(Default)]
pub struct EngineIoConfigBuilder {
    config: EngineIoConfig,
}

impl EngineIoConfigBuilder {
    pub fn ping_interval(mut self, d: Duration) -> Self {
        self.config.ping_interval = d;
        self
    }
    pub fn ping_timeout(mut self, d: Duration) -> Self {
        self.config.ping_timeout = d;
        self
    }
    pub fn upgrade_timeout(mut self, d: Duration) -> Self {
        self.config.upgrade_timeout = d;
        self
    }
    pub fn max_payload(mut self, bytes: u64) -> Self {
        self.config.max_payload = bytes;
        self
    }
    pub fn transports(mut self, transports: Vec<TransportType>) -> Self {
        self.config.transports = transports;
        self
    }
    pub fn allow_upgrades(mut self, allow: bool) -> Self {
        self.config.allow_upgrades = allow;
        self
    }
    pub fn req_path(mut self, path: impl Into<String>) -> Self {
        self.config.req_path = path.into();
        self
    }
    pub fn cookie(mut self, cookie: CookieConfig) -> Self {
        self.config.cookie = Some(cookie);
        self
    }
    pub fn allow_request(mut self, f: AllowRequestFn) -> Self {
        self.config.allow_request = Some(f);
        self
    }
    pub fn initial_payload(mut self, payload: impl Into<String>) -> Self {
        self.config.initial_payload = Some(payload.into());
        self
    }
    pub fn id_generator(mut self, f: IdGeneratorFn) -> Self {
        self.config.id_generator = Some(f);
        self
    }
    pub fn per_message_deflate(mut self, cfg: PerMessageDeflateConfig) -> Self {
        self.config.per_message_deflate = Some(cfg);
        self
    }
    pub fn build(self) -> EngineIoConfig {
        self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec() {
        let c = EngineIoConfig::default();
        assert_eq!(c.ping_interval, Duration::from_millis(25_000));
        assert_eq!(c.ping_timeout, Duration::from_millis(5_000));
        assert_eq!(c.upgrade_timeout, Duration::from_millis(10_000));
        assert_eq!(c.max_payload, 1_000_000);
        assert!(c.allow_upgrades);
        assert_eq!(c.req_path, "/engine.io");
        assert!(c.transport_enabled(TransportType::Polling));
        assert!(c.transport_enabled(TransportType::Websocket));
    }

    #[test]
    fn builder_overrides_individual_fields() {
        let c = EngineIoConfig::builder()
            .ping_interval(Duration::from_secs(1))
            .transports(vec![TransportType::Websocket])
            .build();
        assert_eq!(c.ping_interval, Duration::from_secs(1));
        assert!(!c.transport_enabled(TransportType::Polling));
    }
}
