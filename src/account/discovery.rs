//! Local binding and STUN server discovery.
//!
//! Discovery never blocks registration: transport and proxy tags are applied
//! before it completes, and its result only feeds the engine's NAT traversal
//! parameters. At most one resolver query is outstanding; completions for
//! superseded queries are discarded by id.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::debug;

use crate::config::AccountConfig;
use crate::error::{Error, Result};
use crate::resolver::{NameResolver, SrvTarget};

/// Identifier of one resolver query; newer queries invalidate older ones.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct QueryId(u64);

/// How the STUN server is found for this connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StunPlan {
    /// An explicit server was configured; resolve it directly.
    Explicit { host: String, port: u16 },
    /// Look up `_stun._udp.<domain>` service records, then the best target.
    Lookup { domain: String },
    Disabled,
}

impl StunPlan {
    pub fn from_config(config: &AccountConfig, account_domain: &str) -> Self {
        if let Some(host) = config
            .stun_server
            .as_deref()
            .map(str::trim)
            .filter(|host| !host.is_empty())
        {
            Self::Explicit {
                host: host.to_string(),
                port: config.stun_port,
            }
        } else if config.discover_stun && !account_domain.is_empty() {
            Self::Lookup {
                domain: account_domain.to_string(),
            }
        } else {
            Self::Disabled
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveryEvent {
    pub query: QueryId,
    pub outcome: Result<SocketAddr>,
}

/// What a completion means to the session.
#[derive(Debug, PartialEq, Eq)]
pub enum Disposition {
    /// Superseded query; ignore.
    Stale,
    Resolved(SocketAddr),
    Failed(Error),
}

/// Owns the resolver query lifecycle for one connection.
#[derive(Debug, Default)]
pub struct DiscoveryCoordinator {
    next_query: u64,
    pending: Option<QueryId>,
    stun: Option<SocketAddr>,
}

impl DiscoveryCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Kick off resolution per `plan`. Returns whether a query is now
    /// outstanding; any prior query becomes stale.
    pub fn start(
        &mut self,
        plan: StunPlan,
        resolver: Arc<dyn NameResolver>,
        events: mpsc::UnboundedSender<DiscoveryEvent>,
    ) -> bool {
        if matches!(plan, StunPlan::Disabled) {
            self.pending = None;
            return false;
        }

        self.next_query += 1;
        let query = QueryId(self.next_query);
        self.pending = Some(query);
        debug!(?query, ?plan, "starting discovery");

        tokio::spawn(async move {
            let outcome = resolve_plan(plan, resolver.as_ref()).await;
            let _ = events.send(DiscoveryEvent { query, outcome });
        });
        true
    }

    /// Fold a completion into the coordinator.
    pub fn complete(&mut self, event: DiscoveryEvent) -> Disposition {
        if self.pending != Some(event.query) {
            return Disposition::Stale;
        }
        self.pending = None;

        match event.outcome {
            Ok(address) => {
                self.stun = Some(address);
                Disposition::Resolved(address)
            }
            Err(err) => Disposition::Failed(err),
        }
    }

    /// Forget the outstanding query; its completion will read as stale.
    pub fn cancel(&mut self) {
        self.pending = None;
    }

    pub fn is_pending(&self) -> bool {
        self.pending.is_some()
    }

    /// Resolved STUN server, retained for diagnostics.
    pub fn stun_server(&self) -> Option<SocketAddr> {
        self.stun
    }
}

async fn resolve_plan(plan: StunPlan, resolver: &dyn NameResolver) -> Result<SocketAddr> {
    match plan {
        StunPlan::Explicit { host, port } => {
            if let Ok(ip) = host.parse::<IpAddr>() {
                return Ok(SocketAddr::new(ip, port));
            }
            let ip = first_address(resolver.lookup_host(&host).await?, &host)?;
            Ok(SocketAddr::new(ip, port))
        }
        StunPlan::Lookup { domain } => {
            let service = format!("_stun._udp.{domain}");
            let target = select_target(resolver.lookup_srv(&service).await?)
                .ok_or_else(|| Error::DiscoveryFailed(format!("no {service} records")))?;
            let ip = match target.host.parse::<IpAddr>() {
                Ok(ip) => ip,
                Err(_) => first_address(resolver.lookup_host(&target.host).await?, &target.host)?,
            };
            Ok(SocketAddr::new(ip, target.port))
        }
        StunPlan::Disabled => Err(Error::DiscoveryFailed("discovery disabled".into())),
    }
}

fn first_address(addresses: Vec<IpAddr>, host: &str) -> Result<IpAddr> {
    addresses
        .into_iter()
        .next()
        .ok_or_else(|| Error::DiscoveryFailed(format!("no addresses for {host}")))
}

/// Lowest priority wins; among equals, the heaviest weight.
fn select_target(mut targets: Vec<SrvTarget>) -> Option<SrvTarget> {
    targets.sort_by(|a, b| {
        a.priority
            .cmp(&b.priority)
            .then(b.weight.cmp(&a.weight))
    });
    targets.into_iter().next()
}
