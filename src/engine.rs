//! Contract with the foreign signaling engine.
//!
//! The engine owns SIP message exchange, transaction retransmission and the
//! actual keepalive timers. This crate only sequences it: every call below
//! returns immediately, and completions arrive as [`EngineEvent`]s on the
//! sink handed to [`SignalingEngine::create`]. Implementations must deliver
//! events for one operation in the order they occur.

use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use tokio::sync::mpsc;

use crate::config::TransportPreference;
use crate::error::Result;

/// Opaque identifier of an engine instance.
///
/// Exclusively owned by the lifecycle state machine; other components only
/// see it for the duration of a call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EngineHandle(u64);

impl EngineHandle {
    pub fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    pub fn raw(&self) -> u64 {
        self.0
    }
}

/// Opaque identifier of an asynchronous engine operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct OperationId(u64);

impl OperationId {
    pub fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    pub fn raw(&self) -> u64 {
        self.0
    }
}

/// Creation-time engine parameters. Fixed for the engine's lifetime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineParams {
    /// Normalized account address, used as the From identity.
    pub from: String,
    /// Registration username.
    pub username: Option<String>,
    pub user_agent: String,
    /// Explicit local binding; the engine chooses when unset.
    pub local_ip: Option<IpAddr>,
    pub local_port: Option<u16>,
    pub transport: TransportPreference,
}

/// Outbound behavior toggles, re-applied live.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OutboundOptions {
    pub discover_binding: bool,
    pub loose_routing: bool,
}

/// Resolved keepalive action; `Auto` never reaches the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum KeepaliveAction {
    #[default]
    None,
    RegisterRefresh,
    Ping,
}

/// Keepalive cadence handed to the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum KeepaliveTimer {
    #[default]
    EngineDefault,
    Disabled,
    Every(Duration),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct KeepaliveSetting {
    pub action: KeepaliveAction,
    pub timer: KeepaliveTimer,
}

/// Mutable engine configuration.
///
/// Applied as a whole; engines must treat a repeated application of an equal
/// value as a no-op. `keepalive` stays `None` until the scheduler arms it.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct EngineSettings {
    pub proxy: Option<String>,
    pub registrar: Option<String>,
    pub outbound: Option<OutboundOptions>,
    pub keepalive: Option<KeepaliveSetting>,
    pub stun: Option<SocketAddr>,
}

/// Credential answering an authentication challenge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthCredential {
    pub scheme: String,
    pub realm: String,
    pub username: String,
    pub password: String,
}

/// An asynchronous request against the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineRequest {
    /// Register the account with `registrar` (engine default target when
    /// unset). Starts a new operation.
    Register {
        registrar: Option<String>,
        expires: Option<u32>,
    },
    /// Remove the binding established by the live registration operation.
    /// Completion is delivered on that operation's id.
    Unregister,
    /// Answer a pending challenge on an existing operation. The returned
    /// id equals `operation`.
    Authenticate {
        operation: OperationId,
        credential: AuthCredential,
    },
}

/// Terminal outcome of one request on an operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Success,
    Challenge { realm: String, scheme: String },
    Redirect { target: String },
    Failure { code: u16, reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineEvent {
    Operation {
        operation: OperationId,
        outcome: Outcome,
    },
    /// Terminal event after [`SignalingEngine::shutdown`]; the handle is dead
    /// once this is delivered.
    ShutdownComplete,
}

/// Where the engine delivers its events.
pub type EngineEventSink = mpsc::UnboundedSender<EngineEvent>;

/// The foreign signaling engine.
///
/// All methods are non-blocking. Errors returned directly mean the request
/// was never issued; everything else completes through the event sink.
pub trait SignalingEngine: Send + Sync + 'static {
    fn create(&self, params: EngineParams, events: EngineEventSink) -> Result<EngineHandle>;

    fn configure(&self, engine: EngineHandle, settings: &EngineSettings) -> Result<()>;

    fn request(&self, engine: EngineHandle, request: EngineRequest) -> Result<OperationId>;

    fn shutdown(&self, engine: EngineHandle) -> Result<()>;
}
