//! Caller-facing construction and control surface.

use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};

use crate::account::session::{Command, Session, StatusUpdate};
use crate::config::{AccountConfig, ConfigUpdate};
use crate::engine::SignalingEngine;
use crate::error::{Error, Result};
use crate::resolver::NameResolver;

/// Builds an [`Account`] from configuration plus the engine and resolver
/// collaborators.
pub struct AccountBuilder {
    config: AccountConfig,
    engine: Option<Arc<dyn SignalingEngine>>,
    resolver: Option<Arc<dyn NameResolver>>,
}

impl AccountBuilder {
    pub fn new(config: AccountConfig) -> Self {
        Self {
            config,
            engine: None,
            resolver: None,
        }
    }

    pub fn with_engine<E: SignalingEngine>(self, engine: E) -> Self {
        self.with_shared_engine(Arc::new(engine))
    }

    pub fn with_shared_engine(mut self, engine: Arc<dyn SignalingEngine>) -> Self {
        self.engine = Some(engine);
        self
    }

    pub fn with_resolver<R: NameResolver>(self, resolver: R) -> Self {
        self.with_shared_resolver(Arc::new(resolver))
    }

    pub fn with_shared_resolver(mut self, resolver: Arc<dyn NameResolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    pub fn build(self) -> Result<Account> {
        if self.config.address.trim().is_empty() {
            return Err(Error::Configuration("account address is required".into()));
        }
        let engine = self
            .engine
            .ok_or_else(|| Error::Configuration("a signaling engine is required".into()))?;
        let resolver = match self.resolver {
            Some(resolver) => resolver,
            None => default_resolver()?,
        };
        Ok(Account {
            config: self.config,
            engine,
            resolver,
        })
    }
}

#[cfg(feature = "dns")]
fn default_resolver() -> Result<Arc<dyn NameResolver>> {
    Ok(Arc::new(crate::resolver::DnsResolver::new()))
}

#[cfg(not(feature = "dns"))]
fn default_resolver() -> Result<Arc<dyn NameResolver>> {
    Err(Error::Configuration(
        "a name resolver is required without the dns feature".into(),
    ))
}

/// A built but not yet running account.
pub struct Account {
    config: AccountConfig,
    engine: Arc<dyn SignalingEngine>,
    resolver: Arc<dyn NameResolver>,
}

impl Account {
    /// Spawn the session loop. Returns the control handle and the
    /// status/error notification stream.
    pub fn start(self) -> (AccountHandle, mpsc::UnboundedReceiver<StatusUpdate>) {
        let (status_tx, status_rx) = mpsc::unbounded_channel();
        let (engine_tx, engine_rx) = mpsc::unbounded_channel();
        let (discovery_tx, discovery_rx) = mpsc::unbounded_channel();
        let (command_tx, command_rx) = mpsc::unbounded_channel();

        let session = Session::new(
            self.config,
            self.engine,
            self.resolver,
            status_tx,
            engine_tx,
            discovery_tx,
        );
        tokio::spawn(session.run(command_rx, engine_rx, discovery_rx));

        (
            AccountHandle {
                commands: command_tx,
            },
            status_rx,
        )
    }
}

/// Cloneable control handle over a running account session.
///
/// Dropping every handle winds the connection down.
#[derive(Clone)]
pub struct AccountHandle {
    commands: mpsc::UnboundedSender<Command>,
}

impl AccountHandle {
    /// Start connecting. Resolves once the engine exists and registration is
    /// underway; engine-creation and identity failures surface here, later
    /// ones on the status channel.
    pub async fn connect(&self) -> Result<()> {
        let (reply, answer) = oneshot::channel();
        self.send(Command::Connect { reply })?;
        answer.await.map_err(|_| Error::InvalidState("terminated"))?
    }

    /// Tear the connection down. Resolves once the account is fully
    /// disconnected and every resource is released.
    pub async fn disconnect(&self) -> Result<()> {
        let (reply, answer) = oneshot::channel();
        self.send(Command::Disconnect { reply })?;
        answer.await.map_err(|_| Error::InvalidState("terminated"))
    }

    /// Apply a live configuration change.
    pub fn update(&self, update: ConfigUpdate) -> Result<()> {
        self.send(Command::Update(update))
    }

    /// Snapshot of the current configuration.
    pub async fn config(&self) -> Result<AccountConfig> {
        let (reply, answer) = oneshot::channel();
        self.send(Command::Inspect { reply })?;
        answer.await.map_err(|_| Error::InvalidState("terminated"))
    }

    fn send(&self, command: Command) -> Result<()> {
        self.commands
            .send(command)
            .map_err(|_| Error::InvalidState("terminated"))
    }
}
