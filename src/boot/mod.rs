//! Orchestrates the boot workflow.
//!
//! Names are resolved, the instance is created, the loop waits for a
//! private address, a floating address is bound, and the requested security
//! groups are applied to every port. Nothing is rolled back when a later
//! step fails.

use std::collections::BTreeMap;
use std::time::Duration;

use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::binder::{BindError, Binder};
use crate::cloud::Cloud;
use crate::floating::resolve_target;
use crate::launch::{LaunchError, LaunchRequest, Launcher, generate_name};
use crate::poll::{PollPolicy, Poller};
use crate::readiness::{ReadinessError, ReadinessPoller};
use crate::resolver::{self, MatchMode, ResolveError, ResourceKind};

const DEFAULT_BOOT_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Errors surfaced by the boot workflow.
#[derive(Debug, Error)]
pub enum BootError<E>
where
    E: std::error::Error + 'static,
{
    /// An image or flavor name did not resolve.
    #[error(transparent)]
    Resolve(#[from] ResolveError<E>),
    /// The instance could not be launched.
    #[error(transparent)]
    Launch(#[from] LaunchError<E>),
    /// The instance never became ready.
    #[error(transparent)]
    Readiness(#[from] ReadinessError<E>),
    /// Address or security-group binding failed.
    #[error(transparent)]
    Bind(#[from] BindError<E>),
}

/// Operator inputs of a single boot.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct BootRequest {
    /// Instance name; generated from the base name when absent.
    pub name: Option<String>,
    /// Image name or identifier.
    pub image: String,
    /// Flavor name or identifier.
    pub flavor: String,
    /// Cloud-init user data.
    pub user_data: Option<String>,
    /// Explicit metadata entries.
    pub metadata: BTreeMap<String, String>,
    /// Host groups stored in the metadata.
    pub groups: Vec<String>,
    /// Security group names applied after readiness.
    pub security_groups: Vec<String>,
    /// Specific floating address or hostname to bind.
    pub floating_ip: Option<String>,
    /// Resolve and validate only; change nothing.
    pub dry_run: bool,
}

/// Settings shared by every boot.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct BootSettings {
    /// Key pair injected into every guest.
    pub key_name: String,
    /// Prefix of generated instance names.
    pub base_name: String,
    /// Polling used while waiting for readiness and a requested address.
    pub poll: PollPolicy,
    /// Pool new floating addresses are allocated from.
    pub floating_pool: Option<String>,
}

impl BootSettings {
    /// Settings with the default one second readiness interval.
    #[must_use]
    pub fn new(key_name: impl Into<String>, base_name: impl Into<String>) -> Self {
        Self {
            key_name: key_name.into(),
            base_name: base_name.into(),
            poll: PollPolicy::every(DEFAULT_BOOT_POLL_INTERVAL),
            floating_pool: None,
        }
    }
}

/// Result of a successful boot.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct BootOutcome {
    /// Image the instance was booted from.
    pub image_id: String,
    /// Identifier of the new instance.
    pub instance_id: String,
    /// Name of the new instance.
    pub instance_name: String,
    /// Floating address bound to the instance.
    pub address: String,
}

/// Executes the boot workflow against a cloud.
#[derive(Debug)]
pub struct BootOrchestrator<'a, C> {
    cloud: &'a C,
    settings: BootSettings,
    cancel: CancellationToken,
}

impl<'a, C> BootOrchestrator<'a, C>
where
    C: Cloud,
{
    /// Creates an orchestrator bound to `cloud`.
    #[must_use]
    pub const fn new(cloud: &'a C, settings: BootSettings, cancel: CancellationToken) -> Self {
        Self {
            cloud,
            settings,
            cancel,
        }
    }

    /// Returns the settings used by this orchestrator.
    #[must_use]
    pub const fn settings(&self) -> &BootSettings {
        &self.settings
    }

    /// Boots an instance and binds a floating address to it.
    ///
    /// Returns `None` for a dry run, after resolution and validation but
    /// before any mutating call.
    ///
    /// # Errors
    ///
    /// Returns [`BootError`] when any step fails. Earlier side effects are
    /// left in place.
    pub async fn boot(&self, request: &BootRequest) -> Result<Option<BootOutcome>, BootError<C::Error>> {
        let image_id = resolver::resolve(ResourceKind::Image, &request.image, MatchMode::Exact, || {
            self.cloud.list_images()
        })
        .await?;
        let flavor_id =
            resolver::resolve(ResourceKind::Flavor, &request.flavor, MatchMode::Exact, || {
                self.cloud.list_flavors()
            })
            .await?;

        let launch = LaunchRequest {
            name: request
                .name
                .clone()
                .unwrap_or_else(|| generate_name(&self.settings.base_name)),
            image_id,
            flavor_id,
            key_name: self.settings.key_name.clone(),
            user_data: request.user_data.clone(),
            metadata: request.metadata.clone(),
            groups: request.groups.clone(),
        };
        let payload = launch
            .to_server_create()
            .map_err(LaunchError::<C::Error>::from)?;
        if let Some(target) = request.floating_ip.as_deref() {
            resolve_target::<C::Error>(target)
                .await
                .map_err(BindError::<C::Error>::Floating)?;
        }

        info!(
            name = %payload.name,
            image_id = %payload.image_id,
            flavor_id = %payload.flavor_id,
            key_name = %payload.key_name,
            metadata = ?payload.metadata,
            security_groups = ?request.security_groups,
            floating_ip = ?request.floating_ip,
            "launch parameters"
        );
        if request.dry_run {
            info!("dry run, not booting the instance");
            return Ok(None);
        }

        let created = Launcher::new(self.cloud).launch(&launch).await?;
        let mut poller = Poller::new(self.settings.poll, self.cancel.clone());
        let ready = ReadinessPoller::new(self.cloud)
            .wait(&created.id, &mut poller)
            .await?;

        let binder = Binder::new(self.cloud).with_floating_pool(self.settings.floating_pool.clone());
        let mut address_poller = Poller::new(self.settings.poll, self.cancel.clone());
        let ip = binder
            .bind_address(&ready, request.floating_ip.as_deref(), &mut address_poller)
            .await?;
        binder
            .apply_security_groups(&ready, &request.security_groups)
            .await?;

        info!(instance_id = %ready.id, address = %ip.address, "instance booted");
        Ok(Some(BootOutcome {
            image_id: launch.image_id,
            instance_id: ready.id,
            instance_name: ready.name,
            address: ip.address,
        }))
    }
}

#[cfg(test)]
mod tests;
