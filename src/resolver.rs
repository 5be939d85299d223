//! Name resolution collaborator.
//!
//! Discovery needs two lookups: service records to find a STUN host, and
//! host records to turn it into an address. Both are behind [`NameResolver`]
//! so tests can script them; [`DnsResolver`] is the production
//! implementation.

use std::net::IpAddr;

use async_trait::async_trait;

use crate::error::Result;

/// One DNS service record target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SrvTarget {
    pub host: String,
    pub port: u16,
    pub priority: u16,
    pub weight: u16,
}

#[async_trait]
pub trait NameResolver: Send + Sync + 'static {
    async fn lookup_host(&self, host: &str) -> Result<Vec<IpAddr>>;

    async fn lookup_srv(&self, name: &str) -> Result<Vec<SrvTarget>>;
}

#[cfg(feature = "dns")]
pub use dns::DnsResolver;

#[cfg(feature = "dns")]
mod dns {
    use hickory_resolver::config::{ResolverConfig, ResolverOpts};
    use hickory_resolver::TokioAsyncResolver;

    use super::*;
    use crate::error::Error;

    /// System DNS resolver backed by hickory.
    pub struct DnsResolver {
        inner: TokioAsyncResolver,
    }

    impl DnsResolver {
        /// Resolver with the library's default upstream configuration.
        pub fn new() -> Self {
            Self {
                inner: TokioAsyncResolver::tokio(
                    ResolverConfig::default(),
                    ResolverOpts::default(),
                ),
            }
        }

        /// Resolver configured from `/etc/resolv.conf`.
        pub fn from_system_conf() -> Result<Self> {
            let inner =
                TokioAsyncResolver::tokio_from_system_conf().map_err(Error::configuration)?;
            Ok(Self { inner })
        }
    }

    impl Default for DnsResolver {
        fn default() -> Self {
            Self::new()
        }
    }

    #[async_trait]
    impl NameResolver for DnsResolver {
        async fn lookup_host(&self, host: &str) -> Result<Vec<IpAddr>> {
            let lookup = self.inner.lookup_ip(host).await.map_err(Error::discovery)?;
            Ok(lookup.iter().collect())
        }

        async fn lookup_srv(&self, name: &str) -> Result<Vec<SrvTarget>> {
            let lookup = self.inner.srv_lookup(name).await.map_err(Error::discovery)?;
            Ok(lookup
                .iter()
                .map(|record| SrvTarget {
                    host: record.target().to_utf8().trim_end_matches('.').to_string(),
                    port: record.port(),
                    priority: record.priority(),
                    weight: record.weight(),
                })
                .collect())
        }
    }
}
