use thiserror::Error;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Failure taxonomy for the account lifecycle.
///
/// `EngineCreationFailed`, `IdentityResolutionFailed` and (under the default
/// policy) `RegistrationFailed` abort a connect attempt. `DiscoveryFailed` is
/// recovered locally: the connection proceeds without NAT assistance.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    #[error("signaling engine creation failed: {0}")]
    EngineCreationFailed(String),

    #[error("account address could not be claimed: {0}")]
    IdentityResolutionFailed(String),

    #[error("discovery failed: {0}")]
    DiscoveryFailed(String),

    #[error("no credentials available for realm \"{realm}\"")]
    MissingCredentials { realm: String },

    #[error("authentication rejected in realm \"{realm}\"")]
    AuthenticationRejected { realm: String },

    #[error("registration redirected too many times")]
    TooManyRedirects,

    #[error("registration failed: {reason} ({code})")]
    RegistrationFailed { code: u16, reason: String },

    #[error("unknown address handle")]
    UnknownHandle,

    #[error("signaling engine did not confirm shutdown in time")]
    ShutdownTimeout,

    #[error("invalid configuration: {0}")]
    Configuration(String),

    #[error("signaling engine error: {0}")]
    Engine(String),

    #[error("connection is {0}")]
    InvalidState(&'static str),
}

impl Error {
    pub fn engine<E: std::fmt::Display>(err: E) -> Self {
        Self::Engine(err.to_string())
    }

    pub fn configuration<E: std::fmt::Display>(err: E) -> Self {
        Self::Configuration(err.to_string())
    }

    pub fn discovery<E: std::fmt::Display>(err: E) -> Self {
        Self::DiscoveryFailed(err.to_string())
    }
}
