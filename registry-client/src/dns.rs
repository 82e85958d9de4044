// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Production DNS resolver over the cluster's internal nameservers.

use crate::{DnsClient, ResolveError};
use async_trait::async_trait;
use hickory_resolver::config::{
    NameServerConfig, Protocol, ResolverConfig, ResolverOpts,
};
use hickory_resolver::error::ResolveErrorKind;
use hickory_resolver::TokioAsyncResolver;
use slog::{info, Logger};
use std::net::{IpAddr, SocketAddr};

/// A wrapper around a DNS resolver pointed at the cluster's internal
/// nameservers, answering "which admin IPs does this service name resolve
/// to right now".
pub struct Resolver {
    log: Logger,
    resolver: TokioAsyncResolver,
}

impl Resolver {
    /// Constructs a resolver from specific nameserver addresses.
    pub fn new_from_addrs(
        log: Logger,
        dns_addrs: Vec<SocketAddr>,
    ) -> Resolver {
        info!(log, "new DNS resolver"; "addresses" => ?dns_addrs);
        let mut rc = ResolverConfig::new();
        for socket_addr in dns_addrs {
            rc.add_name_server(NameServerConfig {
                socket_addr,
                protocol: Protocol::Udp,
                tls_dns_name: None,
                trust_negative_responses: false,
                bind_addr: None,
            });
        }
        let mut opts = ResolverOpts::default();
        opts.use_hosts_file = false;
        // Responses must reflect current registrations, not a stale cache:
        // the waiters poll this resolver to observe propagation.
        opts.cache_size = 0;
        let resolver = TokioAsyncResolver::tokio(rc, opts);
        Resolver { log, resolver }
    }

    /// A resolver over the system configuration, for operation from a host
    /// already inside the admin network.
    pub fn new_from_system_conf(log: Logger) -> Result<Resolver, ResolveError> {
        let resolver = TokioAsyncResolver::tokio_from_system_conf()?;
        Ok(Resolver { log, resolver })
    }
}

#[async_trait]
impl DnsClient for Resolver {
    async fn resolve(
        &self,
        domain: &str,
    ) -> Result<Vec<IpAddr>, ResolveError> {
        match self.resolver.lookup_ip(domain).await {
            Ok(lookup) => {
                let ips: Vec<IpAddr> = lookup.iter().collect();
                slog::trace!(
                    self.log, "resolved service name";
                    "domain" => domain,
                    "ips" => ?ips,
                );
                Ok(ips)
            }
            // A name with no current members is an ordinary answer for the
            // membership waiters, not a failure.
            Err(err) => match err.kind() {
                ResolveErrorKind::NoRecordsFound { .. } => Ok(Vec::new()),
                _ => Err(err.into()),
            },
        }
    }
}
