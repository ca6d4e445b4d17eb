//! Binds a floating address and security groups to a ready instance.

use thiserror::Error;
use tracing::info;

use crate::cloud::{Cloud, FloatingIp, Instance, SecurityGroup};
use crate::floating::{FloatingAddresses, FloatingError};
use crate::poll::Poller;
use crate::resolver::{self, MatchMode, ResolveError, ResourceKind};

/// Errors raised while binding an instance.
#[derive(Debug, Error)]
pub enum BindError<E>
where
    E: std::error::Error + 'static,
{
    /// The instance has no private address to map the floating one to.
    #[error("instance {instance_id} has no private address")]
    NoPrivateAddress {
        /// Identifier of the instance.
        instance_id: String,
    },
    /// No floating address could be acquired.
    #[error(transparent)]
    Floating(#[from] FloatingError<E>),
    /// A security group name did not resolve.
    #[error(transparent)]
    Resolve(#[from] ResolveError<E>),
    /// A control-plane call failed.
    #[error("binding failed: {0}")]
    Provider(#[source] E),
}

/// Splits a group list given as comma or whitespace separated names.
#[must_use]
pub fn split_group_names<S: AsRef<str>>(raw: &[S]) -> Vec<String> {
    raw.iter()
        .flat_map(|item| {
            item.as_ref()
                .split(|ch: char| ch == ',' || ch.is_whitespace())
                .filter(|name| !name.is_empty())
                .map(str::to_owned)
                .collect::<Vec<_>>()
        })
        .collect()
}

/// Attaches addresses and access rules to an instance.
#[derive(Debug)]
pub struct Binder<'a, C> {
    cloud: &'a C,
    floating_pool: Option<String>,
}

impl<'a, C> Binder<'a, C>
where
    C: Cloud,
{
    /// Creates a binder bound to `cloud`.
    #[must_use]
    pub const fn new(cloud: &'a C) -> Self {
        Self {
            cloud,
            floating_pool: None,
        }
    }

    /// Allocates new floating addresses from `pool`.
    #[must_use]
    pub fn with_floating_pool(mut self, pool: Option<String>) -> Self {
        self.floating_pool = pool;
        self
    }

    /// Acquires a floating address and associates it with the first
    /// private address of `instance`.
    ///
    /// # Errors
    ///
    /// Returns [`BindError`] when the instance has no private address, no
    /// floating address can be acquired, or association fails.
    pub async fn bind_address(
        &self,
        instance: &Instance,
        requested: Option<&str>,
        poller: &mut Poller,
    ) -> Result<FloatingIp, BindError<C::Error>> {
        let fixed = instance
            .first_fixed_address()
            .ok_or_else(|| BindError::NoPrivateAddress {
                instance_id: instance.id.clone(),
            })?;

        let ip = FloatingAddresses::new(self.cloud)
            .with_pool(self.floating_pool.clone())
            .acquire_or_allocate(requested, poller)
            .await?;

        info!(address = %ip.address, instance_id = %instance.id, "assigning floating address");
        self.cloud
            .associate_floating_ip(&ip, instance, fixed)
            .await
            .map_err(BindError::Provider)?;
        Ok(ip)
    }

    /// Replaces the security groups of every port of `instance` with
    /// `names`, resolved by exact name within the instance's project.
    ///
    /// An empty list leaves the ports untouched. A resolution failure
    /// aborts before any port is updated; a failed port update may leave
    /// earlier ports changed.
    ///
    /// # Errors
    ///
    /// Returns [`BindError`] when a name does not resolve or a call fails.
    pub async fn apply_security_groups(
        &self,
        instance: &Instance,
        names: &[String],
    ) -> Result<Vec<String>, BindError<C::Error>> {
        if names.is_empty() {
            return Ok(Vec::new());
        }

        let listing = self
            .cloud
            .list_security_groups(instance.project_id.as_deref())
            .await
            .map_err(|source| ResolveError::Listing {
                kind: ResourceKind::SecurityGroup,
                source,
            })?;
        let group_ids = resolve_groups::<C::Error>(names, &listing)?;

        let ports = self
            .cloud
            .list_ports(&instance.id)
            .await
            .map_err(BindError::Provider)?;
        for port in &ports {
            info!(port_id = %port.id, groups = ?names, "applying security groups");
            self.cloud
                .set_port_security_groups(&port.id, &group_ids)
                .await
                .map_err(BindError::Provider)?;
        }
        Ok(group_ids)
    }
}

fn resolve_groups<E>(names: &[String], listing: &[SecurityGroup]) -> Result<Vec<String>, ResolveError<E>>
where
    E: std::error::Error + 'static,
{
    names
        .iter()
        .map(|name| {
            if resolver::is_uuid(name) {
                Ok(name.clone())
            } else {
                resolver::select(ResourceKind::SecurityGroup, name, MatchMode::Exact, listing)
            }
        })
        .collect()
}
