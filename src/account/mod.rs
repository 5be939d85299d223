mod builder;
mod credentials;
mod discovery;
mod keepalive;
mod registration;
mod session;

pub use builder::{Account, AccountBuilder, AccountHandle};
pub use credentials::{Credential, CredentialCache};
pub use discovery::{DiscoveryCoordinator, DiscoveryEvent, Disposition, StunPlan};
pub use keepalive::KeepaliveScheduler;
pub use session::{ConnectionState, StatusUpdate};
