use std::net::{IpAddr, SocketAddr};

use ahash::AHashMap;
use futures::future::BoxFuture;
use hickory_resolver::config::{LookupIpStrategy, ResolverConfig, ResolverOpts};
use hickory_resolver::name_server::TokioConnectionProvider;
use hickory_resolver::{Resolver, TokioResolver};

use super::{Address, ResolvedAddress};
use crate::error::{Error, Result};

/// Turns an unresolved [`Address`] into one or more IP endpoints.
///
/// The emission order is significant: callers try the endpoints in the order
/// they are returned.
pub trait Resolve: Send + Sync + 'static {
    fn resolve<'a>(&'a self, address: &'a Address) -> BoxFuture<'a, Result<Vec<ResolvedAddress>>>;
}

/// The default [`Resolve`] implementation, backed by DNS.
pub struct DnsResolver {
    resolver: TokioResolver,
}

impl DnsResolver {
    /// Build a new `DnsResolver` through `ResolverConfig` and `ResolverOpts`.
    ///
    /// For using system config, you can create a new instance by
    /// `DnsResolver::default()`.
    pub fn new(config: ResolverConfig, options: ResolverOpts) -> Self {
        let mut builder = Resolver::builder_with_config(config, TokioConnectionProvider::default());
        builder.options_mut().clone_from(&options);
        let resolver = builder.build();
        Self { resolver }
    }
}

impl Default for DnsResolver {
    fn default() -> Self {
        let (conf, mut opts) = hickory_resolver::system_conf::read_system_conf()
            .expect("DnsResolver: failed to parse dns config");
        if conf
            .name_servers()
            .first()
            .expect("DnsResolver: no nameserver found")
            .socket_addr
            .is_ipv6()
        {
            opts.ip_strategy = LookupIpStrategy::Ipv6thenIpv4;
        }
        Self::new(conf, opts)
    }
}

impl Resolve for DnsResolver {
    fn resolve<'a>(&'a self, address: &'a Address) -> BoxFuture<'a, Result<Vec<ResolvedAddress>>> {
        Box::pin(async move {
            // IP literals need no lookup.
            if let Ok(ip) = address.host().parse::<IpAddr>() {
                return Ok(vec![ResolvedAddress::new(
                    SocketAddr::new(ip, address.port()),
                    address.host().clone(),
                )]);
            }
            let lookup = self
                .resolver
                .lookup_ip(address.host().as_str())
                .await
                .map_err(|e| {
                    Error::service_unavailable(format!("failed to resolve {address}: {e}"))
                })?;
            Ok(lookup
                .into_iter()
                .map(|ip| {
                    ResolvedAddress::new(
                        SocketAddr::new(ip, address.port()),
                        address.host().clone(),
                    )
                })
                .collect())
        })
    }
}

/// A [`Resolve`] implementation over a fixed address book, for clusters with
/// known endpoints and for tests.
///
/// Addresses without an entry fall back to parsing the host as an IP literal.
#[derive(Default)]
pub struct StaticResolver {
    entries: AHashMap<Address, Vec<ResolvedAddress>>,
}

impl StaticResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_entry(
        mut self,
        address: Address,
        endpoints: impl IntoIterator<Item = SocketAddr>,
    ) -> Self {
        let host = address.host().clone();
        self.entries.insert(
            address,
            endpoints
                .into_iter()
                .map(|sa| ResolvedAddress::new(sa, host.clone()))
                .collect(),
        );
        self
    }
}

impl Resolve for StaticResolver {
    fn resolve<'a>(&'a self, address: &'a Address) -> BoxFuture<'a, Result<Vec<ResolvedAddress>>> {
        Box::pin(async move {
            if let Some(endpoints) = self.entries.get(address) {
                return Ok(endpoints.clone());
            }
            if let Ok(ip) = address.host().parse::<IpAddr>() {
                return Ok(vec![ResolvedAddress::new(
                    SocketAddr::new(ip, address.port()),
                    address.host().clone(),
                )]);
            }
            Err(Error::service_unavailable(format!(
                "no static entry for {address}"
            )))
        })
    }
}
