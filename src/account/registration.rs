//! Registration operation ownership and retry bookkeeping.

use std::collections::HashSet;

use tracing::{debug, info, warn};

use crate::account::credentials::{Credential, CredentialCache};
use crate::config::AccountConfig;
use crate::engine::{
    AuthCredential, EngineHandle, EngineRequest, OperationId, Outcome, SignalingEngine,
};
use crate::error::{Error, Result};

/// Redirect chains longer than this fail the registration.
const REDIRECT_LIMIT: u32 = 2;

/// What an engine outcome meant for the registration.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Progress {
    /// The account is registered; the operation stays live for refresh and
    /// unregistration.
    Registered,
    /// A retry (credentials or redirect) was submitted.
    Pending,
    Failed(Error),
    /// Unregistration completed; the operation is gone.
    Unregistered,
}

/// Owns the single outstanding registration operation.
///
/// Challenges are answered at most once per realm per attempt and redirects
/// are chased at most [`REDIRECT_LIMIT`] times, so a misbehaving server can
/// never loop the account.
pub(crate) struct RegistrationController {
    registrar: Option<String>,
    primary: Option<Credential>,
    extra: Option<Credential>,
    operation: Option<OperationId>,
    registered: bool,
    unregistering: bool,
    awaiting: bool,
    attempts: u32,
    challenged: HashSet<String>,
    redirects: u32,
    registrar_realm: Option<String>,
}

impl RegistrationController {
    /// `account_user` is the userinfo part of the normalized account
    /// address; it is the registration username unless `auth_user` overrides
    /// it.
    pub(crate) fn new(config: &AccountConfig, account_user: Option<&str>) -> Self {
        let username = config
            .auth_user
            .clone()
            .or_else(|| account_user.map(str::to_string));

        let primary = match (&username, &config.password) {
            (Some(username), Some(password)) => Some(Credential {
                username: username.clone(),
                password: password.clone(),
            }),
            _ => None,
        };

        let extra = config.extra_auth_password.as_ref().map(|password| Credential {
            username: config
                .extra_auth_user
                .clone()
                .or_else(|| username.clone())
                .unwrap_or_default(),
            password: password.clone(),
        });

        Self {
            registrar: config.registrar.clone(),
            primary,
            extra,
            operation: None,
            registered: false,
            unregistering: false,
            awaiting: false,
            attempts: 0,
            challenged: HashSet::new(),
            redirects: 0,
            registrar_realm: None,
        }
    }

    pub(crate) fn is_active(&self) -> bool {
        self.operation.is_some()
    }

    /// Whether a completion callback for the operation is still expected.
    pub(crate) fn awaiting_outcome(&self) -> bool {
        self.awaiting
    }

    /// Registrar target for subsequent attempts. Live-reconfigurable.
    pub(crate) fn set_registrar(&mut self, registrar: Option<String>) {
        self.registrar = registrar;
    }

    /// Issue the initial register request.
    pub(crate) fn start(
        &mut self,
        engine: &dyn SignalingEngine,
        handle: EngineHandle,
    ) -> Result<()> {
        debug_assert!(self.operation.is_none(), "registration already started");
        if self.operation.is_some() {
            return Err(Error::InvalidState("already registering"));
        }

        let operation = engine.request(
            handle,
            EngineRequest::Register {
                registrar: self.registrar.clone(),
                expires: None,
            },
        )?;
        debug!(?operation, registrar = ?self.registrar, "register requested");
        self.operation = Some(operation);
        self.awaiting = true;
        self.attempts = 1;
        self.challenged.clear();
        self.redirects = 0;
        self.registered = false;
        Ok(())
    }

    /// Remove the binding. Returns whether a completion callback is to be
    /// awaited; when no registration ever succeeded there is nothing to undo
    /// and teardown may proceed immediately.
    pub(crate) fn unregister(
        &mut self,
        engine: &dyn SignalingEngine,
        handle: EngineHandle,
    ) -> Result<bool> {
        match self.operation {
            Some(_) if self.unregistering => Ok(true),
            Some(_) if self.registered => {
                engine.request(handle, EngineRequest::Unregister)?;
                self.unregistering = true;
                self.awaiting = true;
                Ok(true)
            }
            Some(_) => {
                debug!("registration never succeeded, nothing to unregister");
                self.operation = None;
                Ok(false)
            }
            None => Ok(false),
        }
    }

    /// Fold an engine outcome into the registration. Returns `None` for
    /// outcomes of operations this controller does not own.
    pub(crate) fn handle_outcome(
        &mut self,
        engine: &dyn SignalingEngine,
        handle: EngineHandle,
        operation: OperationId,
        outcome: Outcome,
        cache: &mut CredentialCache,
    ) -> Option<Progress> {
        if self.operation != Some(operation) {
            debug!(?operation, "outcome for unowned operation discarded");
            return None;
        }
        self.awaiting = false;

        let progress = if self.unregistering {
            self.unregistration_outcome(engine, handle, operation, outcome, cache)
        } else {
            match outcome {
                Outcome::Success => {
                    info!(attempts = self.attempts, "registration succeeded");
                    self.registered = true;
                    Progress::Registered
                }
                Outcome::Challenge { realm, scheme } => {
                    self.answer_challenge(engine, handle, operation, realm, scheme, cache)
                }
                Outcome::Redirect { target } => self.follow_redirect(engine, handle, target),
                Outcome::Failure { code, reason } => {
                    Progress::Failed(Error::RegistrationFailed { code, reason })
                }
            }
        };
        if matches!(progress, Progress::Pending) {
            self.awaiting = true;
        }
        Some(progress)
    }

    fn answer_challenge(
        &mut self,
        engine: &dyn SignalingEngine,
        handle: EngineHandle,
        operation: OperationId,
        realm: String,
        scheme: String,
        cache: &mut CredentialCache,
    ) -> Progress {
        if self.challenged.contains(&realm) {
            warn!(%realm, "repeated challenge within one attempt");
            return Progress::Failed(Error::AuthenticationRejected { realm });
        }

        let credential = match self.credential_for(&realm, cache) {
            Some(credential) => credential,
            None => return Progress::Failed(Error::MissingCredentials { realm }),
        };

        let request = EngineRequest::Authenticate {
            operation,
            credential: AuthCredential {
                scheme,
                realm: realm.clone(),
                username: credential.username,
                password: credential.password,
            },
        };
        if let Err(err) = engine.request(handle, request) {
            return Progress::Failed(err);
        }

        self.challenged.insert(realm);
        self.attempts += 1;
        Progress::Pending
    }

    /// Pick credentials for a realm, seeding the cache on first use: the
    /// realm of the first challenge is the registrar's and gets the primary
    /// pair, anything else gets the extra-auth pair.
    fn credential_for(&mut self, realm: &str, cache: &mut CredentialCache) -> Option<Credential> {
        if let Some(credential) = cache.lookup(realm) {
            return Some(credential.clone());
        }

        if self.registrar_realm.is_none() {
            self.registrar_realm = Some(realm.to_string());
        }
        let credential = if self.registrar_realm.as_deref() == Some(realm) {
            self.primary.clone()
        } else {
            self.extra.clone()
        }?;

        cache.store(realm, credential.clone());
        Some(credential)
    }

    fn follow_redirect(
        &mut self,
        engine: &dyn SignalingEngine,
        handle: EngineHandle,
        target: String,
    ) -> Progress {
        self.redirects += 1;
        if self.redirects > REDIRECT_LIMIT {
            warn!(redirects = self.redirects, "redirect bound exceeded");
            return Progress::Failed(Error::TooManyRedirects);
        }

        info!(%target, "registration redirected");
        self.registrar = Some(target);
        // New server, new attempt: realms may challenge afresh.
        self.challenged.clear();

        match engine.request(
            handle,
            EngineRequest::Register {
                registrar: self.registrar.clone(),
                expires: None,
            },
        ) {
            Ok(operation) => {
                self.operation = Some(operation);
                self.attempts += 1;
                Progress::Pending
            }
            Err(err) => Progress::Failed(err),
        }
    }

    /// Teardown must proceed whatever the server says, so every terminal
    /// outcome but a challenge completes the unregistration.
    fn unregistration_outcome(
        &mut self,
        engine: &dyn SignalingEngine,
        handle: EngineHandle,
        operation: OperationId,
        outcome: Outcome,
        cache: &mut CredentialCache,
    ) -> Progress {
        let kind = outcome_kind(&outcome);
        match outcome {
            Outcome::Success => {
                info!("unregistration acknowledged");
                self.operation = None;
                self.registered = false;
                Progress::Unregistered
            }
            Outcome::Challenge { realm, scheme } => {
                match self.answer_challenge(engine, handle, operation, realm, scheme, cache) {
                    Progress::Pending => Progress::Pending,
                    Progress::Failed(err) => {
                        warn!(error = %err, "unregistration challenge unanswerable");
                        self.operation = None;
                        Progress::Unregistered
                    }
                    other => other,
                }
            }
            Outcome::Redirect { .. } | Outcome::Failure { .. } => {
                warn!(kind, "unregistration not acknowledged cleanly");
                self.operation = None;
                self.registered = false;
                Progress::Unregistered
            }
        }
    }
}

fn outcome_kind(outcome: &Outcome) -> &'static str {
    match outcome {
        Outcome::Success => "success",
        Outcome::Challenge { .. } => "challenge",
        Outcome::Redirect { .. } => "redirect",
        Outcome::Failure { .. } => "failure",
    }
}
