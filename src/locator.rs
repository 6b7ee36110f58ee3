//! ==============================================================================
//! locator.rs - collector discovery over DNS
//! ==============================================================================
//!
//! purpose:
//!     the collector lives on the LAN under a name only the router's DNS knows,
//!     so lookups go to one fixed nameserver instead of the system resolver.
//!     a lookup that fails for any reason (NXDOMAIN, unreachable, empty answer)
//!     is retried forever with the quadratic backoff; the first address wins.
//!
//! ==============================================================================

use std::net::{IpAddr, SocketAddr};

use anyhow::{anyhow, Result};
use hickory_resolver::config::{NameServerConfigGroup, ResolverConfig, ResolverOpts};
use hickory_resolver::TokioAsyncResolver;
use tracing::{debug, info};

use crate::retry::RetryPolicy;

pub const DNS_PORT: u16 = 53;

#[allow(async_fn_in_trait)]
pub trait NameResolver {
    async fn lookup(&self, name: &str) -> Result<Vec<IpAddr>>;
}

pub struct DnsResolver {
    nameserver: SocketAddr,
    inner: TokioAsyncResolver,
}

impl DnsResolver {
    pub fn new(nameserver: IpAddr) -> Self {
        let servers = NameServerConfigGroup::from_ips_clear(&[nameserver], DNS_PORT, true);
        let config = ResolverConfig::from_parts(None, vec![], servers);
        Self {
            nameserver: SocketAddr::new(nameserver, DNS_PORT),
            inner: TokioAsyncResolver::tokio(config, ResolverOpts::default()),
        }
    }
}

impl NameResolver for DnsResolver {
    async fn lookup(&self, name: &str) -> Result<Vec<IpAddr>> {
        debug!(name, nameserver = %self.nameserver, "resolving");
        let answer = self.inner.lookup_ip(name).await?;
        Ok(answer.iter().collect())
    }
}

pub struct ServiceLocator<R> {
    resolver: R,
    retry: RetryPolicy,
}

impl<R: NameResolver> ServiceLocator<R> {
    pub fn new(resolver: R, retry: RetryPolicy) -> Self {
        Self { resolver, retry }
    }

    /// Resolve `name`, retrying until an address comes back.
    pub async fn locate(&self, name: &str) -> IpAddr {
        let addr = self
            .retry
            .until_success("resolve collector", || async move {
                self.resolver
                    .lookup(name)
                    .await?
                    .into_iter()
                    .next()
                    .ok_or_else(|| anyhow!("{} resolved to no addresses", name))
            })
            .await;
        info!(name, %addr, "collector located");
        addr
    }
}

// ==============================================================================
// tests
// ==============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::collections::VecDeque;
    use std::net::Ipv4Addr;
    use tokio::time::Instant;

    struct ScriptedResolver {
        answers: RefCell<VecDeque<Result<Vec<IpAddr>>>>,
        asked_at: RefCell<Vec<u64>>,
        started: Instant,
    }

    impl ScriptedResolver {
        fn new(answers: Vec<Result<Vec<IpAddr>>>) -> Self {
            Self {
                answers: RefCell::new(answers.into()),
                asked_at: RefCell::new(Vec::new()),
                started: Instant::now(),
            }
        }
    }

    impl NameResolver for ScriptedResolver {
        async fn lookup(&self, _name: &str) -> Result<Vec<IpAddr>> {
            self.asked_at.borrow_mut().push(self.started.elapsed().as_secs());
            self.answers
                .borrow_mut()
                .pop_front()
                .unwrap_or_else(|| Err(anyhow!("script exhausted")))
        }
    }

    fn ip(last: u8) -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(192, 168, 1, last))
    }

    #[tokio::test(start_paused = true)]
    async fn test_three_failures_back_off_1_4_9() {
        let resolver = ScriptedResolver::new(vec![
            Err(anyhow!("timed out")),
            Err(anyhow!("NXDOMAIN")),
            Ok(vec![]),
            Ok(vec![ip(20), ip(21)]),
        ]);
        let locator = ServiceLocator::new(resolver, RetryPolicy::forever());

        let addr = locator.locate("jorg.eggs").await;

        assert_eq!(addr, ip(20));
        assert_eq!(*locator.resolver.asked_at.borrow(), vec![0, 1, 5, 14]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_first_address_without_retry() {
        let resolver = ScriptedResolver::new(vec![Ok(vec![ip(7), ip(8)])]);
        let locator = ServiceLocator::new(resolver, RetryPolicy::forever());

        assert_eq!(locator.locate("collector").await, ip(7));
        assert_eq!(*locator.resolver.asked_at.borrow(), vec![0]);
    }
}
