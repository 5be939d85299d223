//! Connection and registration lifecycle for a single SIP account.
//! This crate sequences a foreign, callback-driven signaling engine through
//! creation, NAT/STUN discovery, registration with its authentication and
//! redirect retries, keepalive arming, and orderly teardown, exposing one
//! builder plus a command handle and a status/error stream.

pub mod account;
pub mod config;
pub mod engine;
pub mod error;
pub mod handles;
pub mod resolver;

pub use account::{Account, AccountBuilder, AccountHandle, ConnectionState, StatusUpdate};
pub use config::{AccountConfig, ConfigUpdate, KeepaliveMechanism, TransportPreference};
pub use error::{Error, Result};
pub use handles::{Handle, HandleRegistry};

#[cfg(test)]
pub(crate) mod test_support;

#[cfg(test)]
mod tests {
    use super::account::AccountBuilder;
    use super::config::AccountConfig;
    use super::engine::Outcome;
    use super::test_support::{MockEngine, MockResolver};
    use super::ConnectionState;

    // We only test that an account can be brought up and torn down cleanly;
    // the lifecycle corners live next to the session.
    #[tokio::test]
    async fn connect_and_disconnect_cleanly() {
        let mut config = AccountConfig::new("sip:alice@example.com");
        config.discover_stun = false;

        let engine = MockEngine::new();
        let account = AccountBuilder::new(config)
            .with_shared_engine(engine.clone())
            .with_shared_resolver(MockResolver::new())
            .build()
            .expect("build account");

        let (handle, mut status) = account.start();
        handle.connect().await.expect("connect");

        let operation = engine.wait_for_register().await;
        engine.complete(operation, Outcome::Success);

        loop {
            let update = status.recv().await.expect("status stream open");
            if update.state == ConnectionState::Connected {
                break;
            }
        }

        let disconnect = {
            let handle = handle.clone();
            tokio::spawn(async move { handle.disconnect().await })
        };
        engine.wait_for_unregister().await;
        engine.complete(operation, Outcome::Success);
        disconnect.await.expect("join").expect("disconnect");

        loop {
            let update = status.recv().await.expect("status stream open");
            if update.state == ConnectionState::Disconnected {
                assert_eq!(update.error, None);
                break;
            }
        }
    }
}
