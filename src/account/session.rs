//! Lifecycle state machine for one account connection.
//!
//! The session is the only owner of the foreign engine handle and the only
//! place state changes happen. Engine events, discovery completions and
//! caller commands each arrive on their own channel and are drained by one
//! loop, so transitions never race; a request that crosses into the engine or
//! resolver returns immediately and is folded back in when its completion
//! message arrives.

use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tokio::time::{sleep_until, Instant};
use tracing::{debug, info, warn};

use crate::account::credentials::CredentialCache;
use crate::account::discovery::{DiscoveryCoordinator, DiscoveryEvent, Disposition, StunPlan};
use crate::account::keepalive::KeepaliveScheduler;
use crate::account::registration::{Progress, RegistrationController};
use crate::config::{AccountConfig, ConfigUpdate};
use crate::engine::{
    EngineEvent, EngineHandle, EngineParams, EngineSettings, OperationId, Outcome,
    OutboundOptions, SignalingEngine,
};
use crate::error::{Error, Result};
use crate::handles::{Handle, HandleRegistry};
use crate::resolver::NameResolver;

/// Holder name under which the session leases the account identity.
const ACCOUNT_HOLDER: &str = "account";

/// Connection lifecycle states. `Disconnected` is terminal; connecting again
/// requires a fresh account.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Idle,
    Connecting,
    Connected,
    Disconnecting,
    Disconnected,
}

impl ConnectionState {
    fn describe(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Disconnecting => "disconnecting",
            Self::Disconnected => "disconnected",
        }
    }
}

/// One entry on the status/error notification channel.
///
/// Sent on every state transition; `error` carries the cause when there is
/// one. Recovered errors (e.g. failed discovery) are reported with the
/// current state unchanged.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusUpdate {
    pub state: ConnectionState,
    pub error: Option<Error>,
}

pub(crate) enum Command {
    Connect { reply: oneshot::Sender<Result<()>> },
    Disconnect { reply: oneshot::Sender<()> },
    Update(ConfigUpdate),
    Inspect { reply: oneshot::Sender<AccountConfig> },
}

struct AccountIdentity {
    handle: Handle,
    address: String,
    user: Option<String>,
    domain: String,
}

pub(crate) struct Session {
    config: AccountConfig,
    engine: Arc<dyn SignalingEngine>,
    resolver: Arc<dyn NameResolver>,
    state: ConnectionState,
    handles: HandleRegistry,
    identity: Option<AccountIdentity>,
    engine_handle: Option<EngineHandle>,
    applied: Option<EngineSettings>,
    registration: Option<RegistrationController>,
    credentials: CredentialCache,
    keepalive: KeepaliveScheduler,
    discovery: DiscoveryCoordinator,
    /// Set once registration completed; drives keepalive re-resolution.
    registration_outcome: Option<bool>,
    pending_error: Option<Error>,
    disconnect_waiters: Vec<oneshot::Sender<()>>,
    status: mpsc::UnboundedSender<StatusUpdate>,
    engine_events_tx: mpsc::UnboundedSender<EngineEvent>,
    discovery_events_tx: mpsc::UnboundedSender<DiscoveryEvent>,
    shutdown_deadline: Option<Instant>,
}

impl Session {
    pub(crate) fn new(
        config: AccountConfig,
        engine: Arc<dyn SignalingEngine>,
        resolver: Arc<dyn NameResolver>,
        status: mpsc::UnboundedSender<StatusUpdate>,
        engine_events_tx: mpsc::UnboundedSender<EngineEvent>,
        discovery_events_tx: mpsc::UnboundedSender<DiscoveryEvent>,
    ) -> Self {
        let keepalive =
            KeepaliveScheduler::new(config.keepalive_mechanism, config.keepalive_interval);
        Self {
            config,
            engine,
            resolver,
            state: ConnectionState::Idle,
            handles: HandleRegistry::new(),
            identity: None,
            engine_handle: None,
            applied: None,
            registration: None,
            credentials: CredentialCache::new(),
            keepalive,
            discovery: DiscoveryCoordinator::new(),
            registration_outcome: None,
            pending_error: None,
            disconnect_waiters: Vec::new(),
            status,
            engine_events_tx,
            discovery_events_tx,
            shutdown_deadline: None,
        }
    }

    pub(crate) async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut engine_events: mpsc::UnboundedReceiver<EngineEvent>,
        mut discovery_events: mpsc::UnboundedReceiver<DiscoveryEvent>,
    ) {
        let mut commands_open = true;
        loop {
            if !commands_open
                && matches!(
                    self.state,
                    ConnectionState::Idle | ConnectionState::Disconnected
                )
            {
                break;
            }

            tokio::select! {
                command = commands.recv(), if commands_open => match command {
                    Some(command) => self.handle_command(command),
                    None => {
                        commands_open = false;
                        // Every caller handle is gone; wind the engine down
                        // rather than leak it.
                        if !matches!(
                            self.state,
                            ConnectionState::Idle | ConnectionState::Disconnected
                        ) {
                            self.begin_disconnect(None);
                        }
                    }
                },
                Some(event) = engine_events.recv() => self.handle_engine_event(event),
                Some(event) = discovery_events.recv() => self.handle_discovery_event(event),
                _ = sleep_until(self.shutdown_deadline.unwrap_or_else(Instant::now)),
                    if self.shutdown_deadline.is_some() =>
                {
                    self.handle_shutdown_timeout();
                }
            }
        }
        debug!("session loop ended");
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Connect { reply } => {
                let _ = reply.send(self.start_connecting());
            }
            Command::Disconnect { reply } => self.begin_disconnect(Some(reply)),
            Command::Update(update) => self.apply_update(update),
            Command::Inspect { reply } => {
                let _ = reply.send(self.config.clone());
            }
        }
    }

    // Connect path ---------------------------------------------------------

    fn start_connecting(&mut self) -> Result<()> {
        if self.state != ConnectionState::Idle {
            debug_assert!(
                self.state != ConnectionState::Connecting && self.state != ConnectionState::Connected,
                "connect issued twice"
            );
            return Err(Error::InvalidState(self.state.describe()));
        }

        let identity = match self.claim_identity() {
            Ok(identity) => identity,
            Err(err) => {
                self.set_state(ConnectionState::Disconnected, Some(err.clone()));
                return Err(err);
            }
        };

        let params = EngineParams {
            from: identity.address.clone(),
            username: self
                .config
                .auth_user
                .clone()
                .or_else(|| identity.user.clone()),
            user_agent: self.config.resolved_user_agent(),
            local_ip: self.config.local_ip,
            local_port: self.config.local_port,
            transport: self.config.transport,
        };
        let engine_handle = match self.engine.create(params, self.engine_events_tx.clone()) {
            Ok(handle) => handle,
            Err(err) => {
                let err = match err {
                    Error::EngineCreationFailed(_) => err,
                    other => Error::EngineCreationFailed(other.to_string()),
                };
                let _ = self.handles.release(ACCOUNT_HOLDER, identity.handle);
                self.set_state(ConnectionState::Disconnected, Some(err.clone()));
                return Err(err);
            }
        };

        info!(address = %identity.address, "engine created, connecting");
        let domain = identity.domain.clone();
        let user = identity.user.clone();
        self.identity = Some(identity);
        self.engine_handle = Some(engine_handle);
        self.set_state(ConnectionState::Connecting, None);

        // Transport, proxy and outbound tags go in before registration;
        // discovery only refines NAT parameters later.
        self.push_settings();
        let plan = StunPlan::from_config(&self.config, &domain);
        self.discovery
            .start(plan, self.resolver.clone(), self.discovery_events_tx.clone());

        let mut controller = RegistrationController::new(&self.config, user.as_deref());
        let started = controller.start(self.engine.as_ref(), engine_handle);
        self.registration = Some(controller);
        if let Err(err) = started {
            // Engine exists, so this is reported asynchronously like any
            // other post-creation failure.
            self.fail_connection(err);
        }
        Ok(())
    }

    fn claim_identity(&mut self) -> Result<AccountIdentity> {
        let handle = self.handles.ensure(ACCOUNT_HOLDER, &self.config.address)?;
        let address = self.handles.inspect(handle)?.to_string();
        let uri = rsip::Uri::try_from(address.as_str())
            .map_err(|err| Error::IdentityResolutionFailed(format!("{address}: {err}")))?;
        let user = uri.auth.map(|auth| auth.user);
        let domain = match uri.host_with_port.host {
            rsip::host_with_port::Host::Domain(domain) => domain.to_string(),
            rsip::host_with_port::Host::IpAddr(ip) => ip.to_string(),
        };
        Ok(AccountIdentity {
            handle,
            address,
            user,
            domain,
        })
    }

    // Engine & discovery completions ---------------------------------------

    fn handle_engine_event(&mut self, event: EngineEvent) {
        match event {
            EngineEvent::Operation { operation, outcome } => {
                self.handle_operation_outcome(operation, outcome)
            }
            EngineEvent::ShutdownComplete => match self.state {
                ConnectionState::Disconnecting => self.finish_disconnect(),
                ConnectionState::Connecting | ConnectionState::Connected => {
                    warn!("engine shut down unsolicited");
                    self.pending_error = Some(Error::Engine("engine shut down unsolicited".into()));
                    self.finish_disconnect();
                }
                _ => debug!("stray shutdown event ignored"),
            },
        }
    }

    fn handle_operation_outcome(&mut self, operation: OperationId, outcome: Outcome) {
        let Some(engine_handle) = self.engine_handle else {
            debug!("operation outcome after engine destruction discarded");
            return;
        };
        let Some(controller) = self.registration.as_mut() else {
            debug!("operation outcome without registration discarded");
            return;
        };

        let progress = controller.handle_outcome(
            self.engine.as_ref(),
            engine_handle,
            operation,
            outcome,
            &mut self.credentials,
        );
        match progress {
            None | Some(Progress::Pending) => {}
            Some(Progress::Registered) => self.registration_succeeded(),
            Some(Progress::Failed(err)) => self.registration_failed(err),
            Some(Progress::Unregistered) => {
                if self.state == ConnectionState::Disconnecting {
                    self.continue_teardown();
                } else {
                    debug!("unregistration completed outside teardown");
                }
            }
        }
    }

    fn registration_succeeded(&mut self) {
        self.registration_outcome = Some(true);
        if self.state == ConnectionState::Disconnecting {
            self.continue_teardown();
            return;
        }
        self.arm_keepalive(true);
        self.set_state(ConnectionState::Connected, None);
    }

    fn registration_failed(&mut self, err: Error) {
        self.registration_outcome = Some(false);
        if self.state == ConnectionState::Disconnecting {
            self.continue_teardown();
            return;
        }

        if self.config.require_registration {
            warn!(error = %err, "registration failed, aborting connection");
            self.fail_connection(err);
        } else {
            info!(error = %err, "registration failed, staying connected unregistered");
            self.report_error(err);
            self.arm_keepalive(false);
            self.set_state(ConnectionState::Connected, None);
        }
    }

    fn handle_discovery_event(&mut self, event: DiscoveryEvent) {
        match self.discovery.complete(event) {
            Disposition::Stale => {}
            Disposition::Resolved(address) => match self.state {
                ConnectionState::Disconnecting => {
                    debug!("late discovery result discarded");
                    self.continue_teardown();
                }
                ConnectionState::Connecting | ConnectionState::Connected => {
                    info!(%address, "STUN server resolved");
                    self.push_settings();
                }
                _ => {}
            },
            Disposition::Failed(err) => {
                if self.state == ConnectionState::Disconnecting {
                    self.continue_teardown();
                    return;
                }
                // Non-fatal: the connection goes on without NAT assistance.
                warn!(error = %err, "discovery failed, proceeding without STUN");
                self.report_error(err);
            }
        }
    }

    // Disconnect path ------------------------------------------------------

    fn begin_disconnect(&mut self, reply: Option<oneshot::Sender<()>>) {
        match self.state {
            ConnectionState::Idle => {
                // Nothing was acquired; the account is simply done.
                self.set_state(ConnectionState::Disconnected, None);
                if let Some(reply) = reply {
                    let _ = reply.send(());
                }
            }
            ConnectionState::Disconnected => {
                if let Some(reply) = reply {
                    let _ = reply.send(());
                }
            }
            ConnectionState::Disconnecting => {
                if let Some(reply) = reply {
                    self.disconnect_waiters.push(reply);
                }
            }
            ConnectionState::Connecting | ConnectionState::Connected => {
                if let Some(reply) = reply {
                    self.disconnect_waiters.push(reply);
                }
                self.set_state(ConnectionState::Disconnecting, None);
                self.continue_teardown();
            }
        }
    }

    /// Report a failure and wind the connection down through the ordinary
    /// teardown sequence.
    fn fail_connection(&mut self, err: Error) {
        self.pending_error = Some(err);
        self.set_state(ConnectionState::Disconnecting, None);
        self.continue_teardown();
    }

    /// Advance teardown as far as the outstanding callbacks allow.
    ///
    /// Called from every completion that lands while disconnecting. In-flight
    /// registration and discovery operations are waited out (their results
    /// discarded), then the binding is removed, then the engine is destroyed.
    fn continue_teardown(&mut self) {
        let Some(engine_handle) = self.engine_handle else {
            self.finish_disconnect();
            return;
        };

        if let Some(controller) = self.registration.as_mut() {
            if controller.awaiting_outcome() {
                return;
            }
            if controller.is_active() {
                match controller.unregister(self.engine.as_ref(), engine_handle) {
                    Ok(true) => return,
                    Ok(false) => {}
                    Err(err) => {
                        warn!(error = %err, "unregister request failed, destroying engine");
                    }
                }
            }
        }

        if self.discovery.is_pending() {
            return;
        }

        self.shutdown_engine();
    }

    fn shutdown_engine(&mut self) {
        if self.shutdown_deadline.is_some() {
            return;
        }
        let Some(engine_handle) = self.engine_handle else {
            self.finish_disconnect();
            return;
        };

        match self.engine.shutdown(engine_handle) {
            Ok(()) => {
                self.shutdown_deadline = Some(Instant::now() + self.config.shutdown_grace());
            }
            Err(err) => {
                warn!(error = %err, "engine shutdown request failed");
                self.finish_disconnect();
            }
        }
    }

    fn handle_shutdown_timeout(&mut self) {
        warn!("engine never confirmed shutdown");
        self.shutdown_deadline = None;
        self.report_error(Error::ShutdownTimeout);
        self.finish_disconnect();
    }

    /// Final transition; releases everything exactly once.
    fn finish_disconnect(&mut self) {
        if self.state == ConnectionState::Disconnected {
            return;
        }
        self.shutdown_deadline = None;
        self.discovery.cancel();
        self.keepalive.reset();
        self.registration = None;
        self.engine_handle = None;
        self.applied = None;
        if let Some(identity) = self.identity.take() {
            if let Err(err) = self.handles.release(ACCOUNT_HOLDER, identity.handle) {
                debug!(error = %err, "account handle already released");
            }
        }

        let error = self.pending_error.take();
        self.set_state(ConnectionState::Disconnected, error);
        for waiter in self.disconnect_waiters.drain(..) {
            let _ = waiter.send(());
        }
        info!("account disconnected");
    }

    // Configuration --------------------------------------------------------

    fn apply_update(&mut self, update: ConfigUpdate) {
        debug!(?update, "configuration update");
        match update {
            ConfigUpdate::Registrar(registrar) => {
                self.config.registrar = registrar.clone();
                if let Some(controller) = self.registration.as_mut() {
                    controller.set_registrar(registrar);
                }
            }
            ConfigUpdate::KeepaliveMechanism(mechanism) => {
                self.config.keepalive_mechanism = mechanism;
                self.keepalive.set_mechanism(mechanism);
            }
            ConfigUpdate::KeepaliveInterval(interval) => {
                self.config.keepalive_interval = interval;
                self.keepalive.set_interval(interval);
            }
            ConfigUpdate::DiscoverBinding(discover) => {
                self.config.discover_binding = discover;
            }
        }

        // Keepalive changes before the registration outcome stay deferred;
        // the scheduler picks them up when it is first armed.
        if let Some(registered) = self.registration_outcome {
            self.arm_keepalive(registered);
        }
        self.push_settings();
    }

    fn arm_keepalive(&mut self, registered: bool) {
        if self.engine_handle.is_none() {
            return;
        }
        let setting = self.keepalive.resolve(registered);
        if !self.keepalive.needs_apply(&setting) {
            return;
        }
        self.keepalive.mark_applied(setting);
        self.push_settings();
    }

    fn desired_settings(&self) -> EngineSettings {
        EngineSettings {
            proxy: self
                .config
                .proxy
                .as_deref()
                .map(|proxy| proxy_with_transport(proxy, self.config.transport)),
            registrar: self.config.registrar.clone(),
            outbound: Some(OutboundOptions {
                discover_binding: self.config.discover_binding,
                loose_routing: self.config.loose_routing,
            }),
            keepalive: self.keepalive.applied(),
            stun: self.discovery.stun_server(),
        }
    }

    /// Apply the current settings to the live engine, once per change.
    fn push_settings(&mut self) {
        let Some(engine_handle) = self.engine_handle else {
            return;
        };
        let desired = self.desired_settings();
        if self.applied.as_ref() == Some(&desired) {
            return;
        }
        match self.engine.configure(engine_handle, &desired) {
            Ok(()) => self.applied = Some(desired),
            Err(err) => {
                warn!(error = %err, "engine configuration failed");
                self.report_error(err);
            }
        }
    }

    // Reporting ------------------------------------------------------------

    fn set_state(&mut self, state: ConnectionState, error: Option<Error>) {
        if self.state == state {
            return;
        }
        debug!(from = self.state.describe(), to = state.describe(), "state transition");
        self.state = state;
        let _ = self.status.send(StatusUpdate { state, error });
    }

    fn report_error(&mut self, error: Error) {
        let _ = self.status.send(StatusUpdate {
            state: self.state,
            error: Some(error),
        });
    }
}

/// Append the configured transport parameter to a proxy URI that does not
/// pin one already.
fn proxy_with_transport(proxy: &str, transport: crate::config::TransportPreference) -> String {
    let Some(param) = transport.uri_param() else {
        return proxy.to_string();
    };
    if proxy.to_ascii_lowercase().contains("transport=") {
        return proxy.to_string();
    }
    format!("{proxy};transport={param}")
}
