//! Waits for a freshly created instance to obtain a private address.

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::cloud::{Cloud, Instance, InstanceStatus};
use crate::poll::{PollStop, Poller};

/// Errors raised while waiting for an instance.
#[derive(Debug, Error)]
pub enum ReadinessError<E>
where
    E: std::error::Error + 'static,
{
    /// The control plane moved the instance to `ERROR`.
    #[error("instance {instance_id} reached ERROR status")]
    InstanceFailed {
        /// Identifier of the failed instance.
        instance_id: String,
    },
    /// The loop was cancelled or ran out of attempts.
    #[error("stopped waiting for instance {instance_id}: {reason}")]
    Stopped {
        /// Identifier of the instance being waited on.
        instance_id: String,
        /// Why polling stopped.
        reason: PollStop,
    },
    /// Fetching the instance failed.
    #[error("failed to fetch instance state: {0}")]
    Provider(#[source] E),
}

/// Polls an instance until it reports a private address.
#[derive(Debug)]
pub struct ReadinessPoller<'a, C> {
    cloud: &'a C,
}

impl<'a, C> ReadinessPoller<'a, C>
where
    C: Cloud,
{
    /// Creates a poller bound to `cloud`.
    #[must_use]
    pub const fn new(cloud: &'a C) -> Self {
        Self { cloud }
    }

    /// Returns the first snapshot of the instance that carries a private
    /// address.
    ///
    /// `ERROR` is fatal and ends the loop immediately. Statuses other than
    /// `BUILD` without an address are logged and polling continues.
    ///
    /// # Errors
    ///
    /// Returns [`ReadinessError`] on `ERROR`, on a failed fetch, or when
    /// `poller` stops.
    pub async fn wait(
        &self,
        instance_id: &str,
        poller: &mut Poller,
    ) -> Result<Instance, ReadinessError<C::Error>> {
        info!(instance_id, "waiting for the instance to get a private address");
        loop {
            let instance = self
                .cloud
                .get_server(instance_id)
                .await
                .map_err(ReadinessError::Provider)?;

            if instance.status == InstanceStatus::Error {
                return Err(ReadinessError::InstanceFailed {
                    instance_id: instance_id.to_owned(),
                });
            }
            if instance.has_private_address() {
                info!(
                    instance_id,
                    address = instance.first_fixed_address().unwrap_or_default(),
                    "instance has a private address"
                );
                return Ok(instance);
            }
            match &instance.status {
                InstanceStatus::Build => debug!(instance_id, "instance still building"),
                other => warn!(instance_id, status = %other, "instance in unexpected status"),
            }

            poller
                .pause()
                .await
                .map_err(|reason| ReadinessError::Stopped {
                    instance_id: instance_id.to_owned(),
                    reason,
                })?;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::time::Instant;
    use tokio_util::sync::CancellationToken;

    use super::*;
    use crate::poll::PollPolicy;
    use crate::test_support::{FakeCloud, instance};

    fn poller(max_attempts: Option<u32>) -> Poller {
        Poller::new(
            PollPolicy::every(Duration::from_secs(1)).with_max_attempts(max_attempts),
            CancellationToken::new(),
        )
    }

    fn cloud_with(steps: &[(InstanceStatus, &[&str])]) -> FakeCloud {
        let cloud = FakeCloud::new();
        cloud.add_server(instance("vm-1", "vm", InstanceStatus::Build, &[]));
        cloud.script_server("vm-1", steps);
        cloud
    }

    #[tokio::test(start_paused = true)]
    async fn succeeds_after_two_sleeps() {
        let cloud = cloud_with(&[
            (InstanceStatus::Build, &[]),
            (InstanceStatus::Build, &[]),
            (InstanceStatus::Active, &["10.0.0.5"]),
        ]);
        let mut poller = poller(None);
        let started = Instant::now();

        let ready = ReadinessPoller::new(&cloud)
            .wait("vm-1", &mut poller)
            .await
            .expect("instance becomes ready");

        assert_eq!(ready.first_fixed_address(), Some("10.0.0.5"));
        assert_eq!(poller.attempts(), 2);
        assert_eq!(cloud.calls().get_server, 3);
        assert_eq!(started.elapsed(), Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn error_status_is_fatal_without_further_polls() {
        let cloud = cloud_with(&[(InstanceStatus::Build, &[]), (InstanceStatus::Error, &[])]);
        let mut poller = poller(None);

        let err = ReadinessPoller::new(&cloud)
            .wait("vm-1", &mut poller)
            .await
            .expect_err("ERROR is fatal");

        assert!(matches!(err, ReadinessError::InstanceFailed { ref instance_id } if instance_id == "vm-1"));
        assert_eq!(cloud.calls().get_server, 2);
        assert_eq!(poller.attempts(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn unknown_status_keeps_polling() {
        let cloud = cloud_with(&[
            (InstanceStatus::Unknown(String::from("REBUILD")), &[]),
            (InstanceStatus::Active, &["10.0.0.7"]),
        ]);
        let mut poller = poller(None);

        let ready = ReadinessPoller::new(&cloud)
            .wait("vm-1", &mut poller)
            .await
            .expect("unknown status is not fatal");

        assert_eq!(ready.status, InstanceStatus::Active);
        assert_eq!(poller.attempts(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn attempt_bound_stops_the_loop() {
        let cloud = cloud_with(&[(InstanceStatus::Build, &[])]);
        let mut poller = poller(Some(3));

        let err = ReadinessPoller::new(&cloud)
            .wait("vm-1", &mut poller)
            .await
            .expect_err("bounded loop gives up");

        assert!(matches!(
            err,
            ReadinessError::Stopped {
                reason: PollStop::AttemptsExhausted(3),
                ..
            }
        ));
        assert_eq!(cloud.calls().get_server, 3);
    }
}
