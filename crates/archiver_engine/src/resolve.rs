use std::collections::HashMap;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use archiver_logging::archiver_warn;
use reqwest::dns::{Addrs, Name, Resolve, Resolving};

use crate::BlockList;

/// Hostname resolution seam used by the validator and the fetch-time guard.
#[async_trait::async_trait]
pub trait Resolver: Send + Sync {
    async fn resolve(&self, host: &str) -> io::Result<Vec<IpAddr>>;
}

/// Resolves through the operating system.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemResolver;

#[async_trait::async_trait]
impl Resolver for SystemResolver {
    async fn resolve(&self, host: &str) -> io::Result<Vec<IpAddr>> {
        let addrs = tokio::net::lookup_host((host, 0)).await?;
        Ok(prefer_ipv4(addrs.map(|addr| addr.ip())))
    }
}

/// Fixed host table, for tests and air-gapped deployments.
#[derive(Debug, Default, Clone)]
pub struct StaticResolver {
    records: HashMap<String, Vec<IpAddr>>,
}

impl StaticResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_host(mut self, host: &str, ips: impl IntoIterator<Item = IpAddr>) -> Self {
        self.records
            .insert(host.to_ascii_lowercase(), ips.into_iter().collect());
        self
    }
}

#[async_trait::async_trait]
impl Resolver for StaticResolver {
    async fn resolve(&self, host: &str) -> io::Result<Vec<IpAddr>> {
        self.records
            .get(&host.to_ascii_lowercase())
            .map(|ips| prefer_ipv4(ips.iter().copied()))
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, format!("no records for {host}")))
    }
}

/// A records win; AAAA records are used only when there are no A records.
pub fn prefer_ipv4(ips: impl IntoIterator<Item = IpAddr>) -> Vec<IpAddr> {
    let mut v4 = Vec::new();
    let mut v6 = Vec::new();
    for ip in ips {
        let bucket = if ip.is_ipv4() { &mut v4 } else { &mut v6 };
        if !bucket.contains(&ip) {
            bucket.push(ip);
        }
    }
    if v4.is_empty() {
        v6
    } else {
        v4
    }
}

/// An address the fetcher refused to connect to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockedTarget {
    pub host: String,
    pub ip: IpAddr,
}

#[derive(Debug, thiserror::Error)]
pub enum DnsGuardError {
    #[error("dns lookup for {host} failed: {source}")]
    Lookup {
        host: String,
        #[source]
        source: io::Error,
    },
    #[error("dns lookup for {host} timed out")]
    Timeout { host: String },
    #[error("no addresses found for {host}")]
    NoRecords { host: String },
    #[error("{host} resolves to blocked address {ip}")]
    Blocked { host: String, ip: IpAddr },
}

/// reqwest resolver that re-applies the block list on every connection the
/// client opens, including connections made while following redirects.
pub(crate) struct GuardedDnsResolver {
    inner: Arc<dyn Resolver>,
    block_list: Arc<BlockList>,
    timeout: Duration,
    blocked: Arc<Mutex<Option<BlockedTarget>>>,
}

impl GuardedDnsResolver {
    pub(crate) fn new(
        inner: Arc<dyn Resolver>,
        block_list: Arc<BlockList>,
        timeout: Duration,
        blocked: Arc<Mutex<Option<BlockedTarget>>>,
    ) -> Self {
        Self {
            inner,
            block_list,
            timeout,
            blocked,
        }
    }
}

impl Resolve for GuardedDnsResolver {
    fn resolve(&self, name: Name) -> Resolving {
        Box::pin(guarded_lookup(
            Arc::clone(&self.inner),
            Arc::clone(&self.block_list),
            self.timeout,
            Arc::clone(&self.blocked),
            name.as_str().to_string(),
        ))
    }
}

type BoxError = Box<dyn std::error::Error + Send + Sync>;

async fn guarded_lookup(
    inner: Arc<dyn Resolver>,
    block_list: Arc<BlockList>,
    timeout: Duration,
    blocked: Arc<Mutex<Option<BlockedTarget>>>,
    host: String,
) -> Result<Addrs, BoxError> {
    let ips = match tokio::time::timeout(timeout, inner.resolve(&host)).await {
        Ok(Ok(ips)) => ips,
        Ok(Err(source)) => return Err(DnsGuardError::Lookup { host, source }.into()),
        Err(_) => return Err(DnsGuardError::Timeout { host }.into()),
    };
    if ips.is_empty() {
        return Err(DnsGuardError::NoRecords { host }.into());
    }
    if let Some(ip) = block_list.first_blocked(&ips) {
        archiver_warn!("Refusing connection to {} ({})", host, ip);
        if let Ok(mut slot) = blocked.lock() {
            *slot = Some(BlockedTarget {
                host: host.clone(),
                ip,
            });
        }
        return Err(DnsGuardError::Blocked { host, ip }.into());
    }
    let addrs: Addrs = Box::new(ips.into_iter().map(|ip| SocketAddr::new(ip, 0)));
    Ok(addrs)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[test]
    fn ipv4_results_hide_ipv6() {
        let ips = prefer_ipv4([ip("2001:db8::1"), ip("93.184.216.34"), ip("93.184.216.34")]);
        assert_eq!(ips, vec![ip("93.184.216.34")]);
    }

    #[test]
    fn ipv6_used_when_no_ipv4() {
        let ips = prefer_ipv4([ip("2001:db8::1")]);
        assert_eq!(ips, vec![ip("2001:db8::1")]);
    }

    #[tokio::test]
    async fn static_resolver_is_case_insensitive() {
        let resolver = StaticResolver::new().with_host("Example.COM", [ip("93.184.216.34")]);
        assert_eq!(
            resolver.resolve("example.com").await.unwrap(),
            vec![ip("93.184.216.34")]
        );
        assert!(resolver.resolve("missing.example").await.is_err());
    }
}
