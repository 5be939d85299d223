use std::net::IpAddr;
use std::time::Duration;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

const DEFAULT_USER_AGENT: &str = concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION"));

/// Default STUN port used when the server address does not carry one.
pub const DEFAULT_STUN_PORT: u16 = 3478;

const DEFAULT_SHUTDOWN_GRACE_SECS: u64 = 5;

/// Liveness mechanism requested for a connected account.
///
/// `Auto` resolves once the registration outcome is known: `RegisterRefresh`
/// after a successful registration, `None` otherwise.
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum KeepaliveMechanism {
    #[default]
    Auto,
    None,
    RegisterRefresh,
    Ping,
}

/// Preferred transport for outbound signaling.
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TransportPreference {
    #[default]
    Auto,
    Udp,
    Tcp,
    Tls,
}

impl TransportPreference {
    /// URI `transport=` parameter value, `None` when the stack should choose.
    pub fn uri_param(&self) -> Option<&'static str> {
        match self {
            Self::Auto => None,
            Self::Udp => Some("udp"),
            Self::Tcp => Some("tcp"),
            Self::Tls => Some("tls"),
        }
    }
}

/// Connection configuration for a single account.
///
/// Everything is mutable until [`AccountHandle::connect`] is issued; after
/// that only the fields enumerated by [`ConfigUpdate`] may change, and those
/// are re-applied to the live engine idempotently.
///
/// [`AccountHandle::connect`]: crate::account::AccountHandle::connect
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccountConfig {
    /// Public SIP address of the account (SIP URI).
    pub address: String,
    /// Registration username when it differs from the userinfo part of
    /// `address`.
    pub auth_user: Option<String>,
    /// Registration password.
    pub password: Option<String>,
    /// Username for authentication challenges outside the registrar's realm.
    pub extra_auth_user: Option<String>,
    /// Password for authentication challenges outside the registrar's realm.
    pub extra_auth_password: Option<String>,
    pub transport: TransportPreference,
    /// Outbound proxy URI.
    pub proxy: Option<String>,
    /// Registrar URI; defaults to the account's domain when unset.
    pub registrar: Option<String>,
    /// Loose routing as per RFC 3261.
    pub loose_routing: bool,
    pub keepalive_mechanism: KeepaliveMechanism,
    /// Keepalive interval in seconds: `-1` lets the engine decide, `0`
    /// disables keepalives, positive values are applied verbatim.
    /// Re-applied live.
    pub keepalive_interval: i32,
    /// Discover the public binding beyond NAT. Re-applied live.
    pub discover_binding: bool,
    /// Discover a STUN server via DNS SRV when no explicit server is set.
    pub discover_stun: bool,
    /// Explicit STUN server (FQDN or IP literal).
    pub stun_server: Option<String>,
    pub stun_port: u16,
    /// Local IP address; left to the engine when unset.
    pub local_ip: Option<IpAddr>,
    /// Local signaling port; left to the engine when unset.
    pub local_port: Option<u16>,
    /// User-Agent override applied to outbound signaling.
    pub user_agent: Option<String>,
    /// Treat registration failure as connection failure (default). When
    /// disabled the account still reaches `Connected` in degraded mode.
    pub require_registration: bool,
    /// Bound on waiting for the engine's terminal shutdown event.
    pub shutdown_grace_secs: u64,
}

impl AccountConfig {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            auth_user: None,
            password: None,
            extra_auth_user: None,
            extra_auth_password: None,
            transport: TransportPreference::default(),
            proxy: None,
            registrar: None,
            loose_routing: true,
            keepalive_mechanism: KeepaliveMechanism::default(),
            keepalive_interval: -1,
            discover_binding: true,
            discover_stun: true,
            stun_server: None,
            stun_port: DEFAULT_STUN_PORT,
            local_ip: None,
            local_port: None,
            user_agent: None,
            require_registration: true,
            shutdown_grace_secs: DEFAULT_SHUTDOWN_GRACE_SECS,
        }
    }

    pub fn resolved_user_agent(&self) -> String {
        self.user_agent
            .as_ref()
            .map(|value| value.trim())
            .filter(|value| !value.is_empty())
            .map(|value| value.to_string())
            .unwrap_or_else(|| DEFAULT_USER_AGENT.to_string())
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }
}

/// A configuration change applicable to a live connection.
///
/// These are the fields the engine accepts after creation; anything else
/// requires a fresh account.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigUpdate {
    Registrar(Option<String>),
    KeepaliveMechanism(KeepaliveMechanism),
    KeepaliveInterval(i32),
    DiscoverBinding(bool),
}
