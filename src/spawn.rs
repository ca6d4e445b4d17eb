//! Boots an instance for a playbook and runs the playbook against it.

use camino::{Utf8Path, Utf8PathBuf};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::boot::{BootError, BootOrchestrator, BootOutcome, BootRequest};
use crate::cloud::Cloud;
use crate::command::{CommandError, CommandRunner};
use crate::launch::generate_name;
use crate::poll::{PollPolicy, Poller};
use crate::provision::PlaybookRunner;
use crate::ssh::{SshError, SshHelper, needs_escalation};

/// Errors surfaced by the spawn workflow.
#[derive(Debug, Error)]
pub enum SpawnError<E>
where
    E: std::error::Error + 'static,
{
    /// The playbook file does not exist.
    #[error("playbook {path} does not exist")]
    MissingPlaybook {
        /// Path supplied by the operator.
        path: Utf8PathBuf,
    },
    /// The playbook failed its syntax check or its run.
    #[error(transparent)]
    Playbook(#[from] CommandError),
    /// Booting the instance failed.
    #[error(transparent)]
    Boot(#[from] BootError<E>),
    /// The instance never became reachable.
    #[error(transparent)]
    Ssh(#[from] SshError<E>),
}

/// Inputs of a spawn run.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct SpawnRequest {
    /// Playbook applied to the new instance.
    pub playbook: Utf8PathBuf,
    /// Boot parameters; the name defaults to `<playbook stem>-<hex>`.
    pub boot: BootRequest,
}

/// Result of a completed spawn.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SpawnOutcome {
    /// Boot result.
    pub boot: BootOutcome,
    /// User the playbook connected as.
    pub login_user: String,
}

/// Default instance name for a playbook.
#[must_use]
pub fn default_name(playbook: &Utf8Path) -> String {
    generate_name(playbook.file_stem().unwrap_or("spawn"))
}

/// Boots, waits for SSH, and provisions.
#[derive(Debug)]
pub struct SpawnOrchestrator<'a, C, P, R> {
    boot: BootOrchestrator<'a, C>,
    ssh: SshHelper<'a, C, P>,
    playbooks: PlaybookRunner<R>,
    ssh_poll: PollPolicy,
    cancel: CancellationToken,
}

impl<'a, C, P, R> SpawnOrchestrator<'a, C, P, R>
where
    C: Cloud,
    P: CommandRunner,
    R: CommandRunner,
{
    /// Creates an orchestrator from its collaborators.
    #[must_use]
    pub const fn new(
        boot: BootOrchestrator<'a, C>,
        ssh: SshHelper<'a, C, P>,
        playbooks: PlaybookRunner<R>,
        ssh_poll: PollPolicy,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            boot,
            ssh,
            playbooks,
            ssh_poll,
            cancel,
        }
    }

    /// Runs the spawn workflow. Returns `None` for a dry run, after the
    /// playbook has been syntax checked.
    ///
    /// # Errors
    ///
    /// Returns [`SpawnError`] when the playbook is missing or invalid, the
    /// boot fails, the instance never answers, or the playbook run fails.
    pub async fn spawn(&self, request: &SpawnRequest) -> Result<Option<SpawnOutcome>, SpawnError<C::Error>> {
        if !request.playbook.is_file() {
            return Err(SpawnError::MissingPlaybook {
                path: request.playbook.clone(),
            });
        }
        self.playbooks.syntax_check(&request.playbook)?;

        let mut boot = request.boot.clone();
        let name = boot
            .name
            .get_or_insert_with(|| default_name(&request.playbook))
            .clone();
        info!(%name, playbook = %request.playbook, "spawning instance");

        let Some(outcome) = self.boot.boot(&boot).await? else {
            info!("dry run, not running the playbook");
            return Ok(None);
        };

        let mut poller = Poller::new(self.ssh_poll, self.cancel.clone());
        let target = self
            .ssh
            .wait_until_reachable(&name, None, &mut poller)
            .await?;
        self.playbooks.run(
            &request.playbook,
            &outcome.address,
            needs_escalation(&target.user),
        )?;

        Ok(Some(SpawnOutcome {
            boot: outcome,
            login_user: target.user,
        }))
    }
}
