//! Floating-address pool management.
//!
//! Free addresses are those not bound to any port. When none is free, one is
//! allocated from a pool (the first listed pool unless one is named) and the
//! free list is fetched again.

use std::net::{IpAddr, Ipv4Addr};

use thiserror::Error;
use tracing::{info, warn};

use crate::cloud::{Cloud, FloatingIp, FloatingPool};
use crate::poll::{PollStop, Poller};

/// Errors raised while acquiring a floating address.
#[derive(Debug, Error)]
pub enum FloatingError<E>
where
    E: std::error::Error + 'static,
{
    /// The requested address is neither an IPv4 literal nor a resolvable
    /// hostname.
    #[error("'{target}' is not an IPv4 address or a resolvable hostname")]
    InvalidTarget {
        /// Value supplied by the operator.
        target: String,
    },
    /// No pool exists to allocate from.
    #[error("no floating address pools are available")]
    NoPools,
    /// The named pool does not exist.
    #[error("floating address pool '{pool}' does not exist")]
    UnknownPool {
        /// Requested pool name.
        pool: String,
    },
    /// The free list was still empty after an allocation.
    #[error("pool {pool} allocated an address but none is free")]
    NothingFree {
        /// Pool the allocation was made from.
        pool: String,
    },
    /// Waiting for the requested address stopped.
    #[error("stopped waiting for floating address {address}: {reason}")]
    Stopped {
        /// Address being waited on.
        address: String,
        /// Why polling stopped.
        reason: PollStop,
    },
    /// A control-plane call failed.
    #[error("floating address operation failed: {0}")]
    Provider(#[source] E),
}

/// Resolves an operator supplied target to an IPv4 address.
///
/// Literals are accepted as is; anything else must look like a hostname
/// and resolve to at least one IPv4 address.
///
/// # Errors
///
/// Returns [`FloatingError::InvalidTarget`] when the target cannot be
/// turned into an IPv4 address.
pub async fn resolve_target<E>(target: &str) -> Result<Ipv4Addr, FloatingError<E>>
where
    E: std::error::Error + 'static,
{
    let invalid = || FloatingError::InvalidTarget {
        target: target.to_owned(),
    };
    if let Ok(addr) = target.parse::<Ipv4Addr>() {
        return Ok(addr);
    }
    if !is_hostname(target) {
        return Err(invalid());
    }

    let resolved = tokio::net::lookup_host((target, 0))
        .await
        .map_err(|_| invalid())?;
    resolved
        .filter_map(|socket| match socket.ip() {
            IpAddr::V4(addr) => Some(addr),
            IpAddr::V6(_) => None,
        })
        .next()
        .ok_or_else(invalid)
}

fn is_hostname(candidate: &str) -> bool {
    !candidate.is_empty()
        && candidate.len() <= 253
        && candidate.split('.').all(|label| {
            !label.is_empty()
                && label.len() <= 63
                && !label.starts_with('-')
                && !label.ends_with('-')
                && label
                    .chars()
                    .all(|ch| ch.is_ascii_alphanumeric() || ch == '-')
        })
        && candidate.chars().any(|ch| ch.is_ascii_alphabetic())
}

/// Lists, allocates, and picks floating addresses.
#[derive(Debug)]
pub struct FloatingAddresses<'a, C> {
    cloud: &'a C,
    pool: Option<String>,
}

impl<'a, C> FloatingAddresses<'a, C>
where
    C: Cloud,
{
    /// Creates a manager bound to `cloud`.
    #[must_use]
    pub const fn new(cloud: &'a C) -> Self {
        Self { cloud, pool: None }
    }

    /// Allocates from the named pool instead of the first listed one.
    #[must_use]
    pub fn with_pool(mut self, pool: Option<String>) -> Self {
        self.pool = pool;
        self
    }

    /// Returns every allocated address not bound to an instance.
    ///
    /// # Errors
    ///
    /// Returns [`FloatingError::Provider`] when listing fails.
    pub async fn list_free(&self) -> Result<Vec<FloatingIp>, FloatingError<C::Error>> {
        let all = self
            .cloud
            .list_floating_ips()
            .await
            .map_err(FloatingError::Provider)?;
        Ok(all.into_iter().filter(FloatingIp::is_free).collect())
    }

    /// Allocates one address from `pool`, or from the first listed pool.
    ///
    /// The new address is not returned; callers re-list the free set.
    /// Allocation faults are propagated unchanged.
    ///
    /// # Errors
    ///
    /// Returns [`FloatingError::NoPools`] or [`FloatingError::UnknownPool`]
    /// when no pool can be selected, and [`FloatingError::Provider`] when a
    /// call fails.
    pub async fn allocate(&self, pool: Option<&str>) -> Result<FloatingPool, FloatingError<C::Error>> {
        let pools = self
            .cloud
            .list_floating_pools()
            .await
            .map_err(FloatingError::Provider)?;
        let selected = match pool {
            Some(name) => pools
                .into_iter()
                .find(|candidate| candidate.name == name || candidate.id == name)
                .ok_or_else(|| FloatingError::UnknownPool {
                    pool: name.to_owned(),
                })?,
            None => pools.into_iter().next().ok_or(FloatingError::NoPools)?,
        };

        info!(pool = %selected.name, "allocating a floating address");
        if let Err(err) = self.cloud.allocate_floating_ip(&selected).await {
            warn!(pool = %selected.name, error = %err, "most likely no more addresses in pool");
            return Err(FloatingError::Provider(err));
        }
        Ok(selected)
    }

    /// Returns a free address to bind.
    ///
    /// Without `requested`, the first free address is returned, allocating
    /// one first when the free list is empty. With `requested`, the target
    /// is resolved to IPv4 and the loop allocates and re-lists until that
    /// address shows up as free.
    ///
    /// # Errors
    ///
    /// Returns [`FloatingError`] when the target is invalid, a call fails,
    /// or `poller` stops.
    pub async fn acquire_or_allocate(
        &self,
        requested: Option<&str>,
        poller: &mut Poller,
    ) -> Result<FloatingIp, FloatingError<C::Error>> {
        let Some(target) = requested else {
            return self.first_free().await;
        };

        let address = resolve_target::<C::Error>(target).await?.to_string();
        loop {
            if let Some(found) = self
                .list_free()
                .await?
                .into_iter()
                .find(|ip| ip.address == address)
            {
                return Ok(found);
            }
            info!(%address, "requested floating address is not free yet");
            self.allocate(self.pool.as_deref()).await?;
            if let Some(found) = self
                .list_free()
                .await?
                .into_iter()
                .find(|ip| ip.address == address)
            {
                return Ok(found);
            }
            poller
                .pause()
                .await
                .map_err(|reason| FloatingError::Stopped {
                    address: address.clone(),
                    reason,
                })?;
        }
    }

    async fn first_free(&self) -> Result<FloatingIp, FloatingError<C::Error>> {
        if let Some(ip) = self.list_free().await?.into_iter().next() {
            return Ok(ip);
        }
        info!("no free floating address; allocating one");
        let pool = self.allocate(self.pool.as_deref()).await?;
        self.list_free()
            .await?
            .into_iter()
            .next()
            .ok_or(FloatingError::NothingFree { pool: pool.name })
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use rstest::rstest;
    use tokio_util::sync::CancellationToken;

    use super::*;
    use crate::poll::PollPolicy;
    use crate::test_support::{FakeCloud, FakeCloudError, floating_ip};

    fn poller() -> Poller {
        Poller::new(
            PollPolicy::every(Duration::from_secs(1)).with_max_attempts(Some(5)),
            CancellationToken::new(),
        )
    }

    fn cloud_with_pool() -> FakeCloud {
        let cloud = FakeCloud::new();
        cloud.add_pool("net-public", "public");
        cloud
    }

    #[tokio::test]
    async fn empty_free_list_triggers_exactly_one_allocation() {
        let cloud = cloud_with_pool();
        cloud.add_floating_ip(floating_ip("198.51.100.1", Some("port-x")));
        cloud.queue_allocation("198.51.100.2");

        let ip = FloatingAddresses::new(&cloud)
            .acquire_or_allocate(None, &mut poller())
            .await
            .expect("an address is allocated");

        assert_eq!(ip.address, "198.51.100.2");
        let calls = cloud.calls();
        assert_eq!(calls.allocate_floating_ip, 1);
        assert_eq!(calls.list_floating_ips, 2);
    }

    #[tokio::test]
    async fn requested_free_address_needs_no_allocation() {
        let cloud = cloud_with_pool();
        cloud.add_floating_ip(floating_ip("198.51.100.7", None));

        let ip = FloatingAddresses::new(&cloud)
            .acquire_or_allocate(Some("198.51.100.7"), &mut poller())
            .await
            .expect("address already free");

        assert_eq!(ip.address, "198.51.100.7");
        assert_eq!(cloud.calls().allocate_floating_ip, 0);
    }

    #[tokio::test]
    async fn hostnames_resolve_to_their_ipv4_address() {
        let addr = resolve_target::<FakeCloudError>("localhost")
            .await
            .expect("localhost resolves");
        assert_eq!(addr, Ipv4Addr::LOCALHOST);

        let cloud = cloud_with_pool();
        cloud.add_floating_ip(floating_ip("127.0.0.1", None));

        let ip = FloatingAddresses::new(&cloud)
            .acquire_or_allocate(Some("localhost"), &mut poller())
            .await
            .expect("resolved address already free");

        assert_eq!(ip.address, "127.0.0.1");
        assert_eq!(cloud.calls().allocate_floating_ip, 0);
    }

    #[tokio::test]
    async fn first_free_address_is_reused() {
        let cloud = cloud_with_pool();
        cloud.add_floating_ip(floating_ip("198.51.100.3", None));
        cloud.add_floating_ip(floating_ip("198.51.100.4", None));

        let ip = FloatingAddresses::new(&cloud)
            .acquire_or_allocate(None, &mut poller())
            .await
            .expect("free address available");

        assert_eq!(ip.address, "198.51.100.3");
        assert_eq!(cloud.calls().allocate_floating_ip, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn requested_address_is_awaited_across_allocations() {
        let cloud = cloud_with_pool();
        cloud.queue_allocation("198.51.100.20");
        cloud.queue_allocation("198.51.100.21");

        let ip = FloatingAddresses::new(&cloud)
            .acquire_or_allocate(Some("198.51.100.21"), &mut poller())
            .await
            .expect("second allocation yields the requested address");

        assert_eq!(ip.address, "198.51.100.21");
        assert_eq!(cloud.calls().allocate_floating_ip, 2);
    }

    #[rstest]
    #[case("not an address")]
    #[case("-bad-.example")]
    #[case("300.1.2.3")]
    #[tokio::test]
    async fn invalid_targets_fail_before_allocation(#[case] target: &str) {
        let cloud = cloud_with_pool();

        let err = FloatingAddresses::new(&cloud)
            .acquire_or_allocate(Some(target), &mut poller())
            .await
            .expect_err("target is invalid");

        assert!(matches!(err, FloatingError::InvalidTarget { .. }));
        assert_eq!(cloud.calls().allocate_floating_ip, 0);
    }

    #[tokio::test]
    async fn allocation_faults_propagate_unchanged() {
        let cloud = cloud_with_pool();
        cloud.fail_allocations(FakeCloudError::PoolExhausted {
            pool: String::from("public"),
        });

        let err = FloatingAddresses::new(&cloud)
            .allocate(None)
            .await
            .expect_err("pool is exhausted");

        assert!(matches!(
            err,
            FloatingError::Provider(FakeCloudError::PoolExhausted { .. })
        ));
    }

    #[tokio::test]
    async fn named_pool_is_used_for_allocation() {
        let cloud = cloud_with_pool();
        cloud.add_pool("net-lab", "lab");

        let ip = FloatingAddresses::new(&cloud)
            .with_pool(Some(String::from("lab")))
            .acquire_or_allocate(None, &mut poller())
            .await
            .expect("lab pool allocates");

        assert_eq!(ip.pool, "net-lab");
    }

    #[tokio::test]
    async fn unknown_pool_is_rejected() {
        let cloud = cloud_with_pool();

        let err = FloatingAddresses::new(&cloud)
            .allocate(Some("missing"))
            .await
            .expect_err("pool does not exist");

        assert!(matches!(err, FloatingError::UnknownPool { ref pool } if pool == "missing"));
        assert_eq!(cloud.calls().allocate_floating_ip, 0);
    }

    #[tokio::test]
    async fn missing_pools_are_reported() {
        let cloud = FakeCloud::new();

        let err = FloatingAddresses::new(&cloud)
            .allocate(None)
            .await
            .expect_err("no pools");

        assert!(matches!(err, FloatingError::NoPools));
    }
}
