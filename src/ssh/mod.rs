//! Remote shell access to instances through the system `ssh` and `scp`
//! clients.
//!
//! Instances are located by name fragment (or identifier fragment when the
//! argument is a UUID) and reached on their floating address. The login
//! user is derived from the image name unless overridden.

use std::ffi::OsString;

use camino::{Utf8Path, Utf8PathBuf};
use thiserror::Error;
use tracing::info;

use crate::cloud::{Cloud, Instance, SecurityGroup};
use crate::command::{CommandError, CommandRunner, render_command, run_checked};
use crate::poll::{PollStop, Poller};
use crate::resolver::{MatchMode, is_uuid};

/// Port checked by `--sshcheck`.
pub const SSH_PORT: u16 = 22;

const ROOT_USER: &str = "root";

/// Errors raised by the SSH helper.
#[derive(Debug, Error)]
pub enum SshError<E>
where
    E: std::error::Error + 'static,
{
    /// No instance matched the argument.
    #[error("no instance matches '{name}'")]
    NoMatch {
        /// Argument supplied by the operator.
        name: String,
    },
    /// The instance has no floating address.
    #[error("instance {instance} does not have a floating address")]
    NoFloatingAddress {
        /// Name of the instance.
        instance: String,
    },
    /// None of the instance's security groups opens the port.
    #[error("port {port} is not open in any security group of instance {instance}")]
    PortClosed {
        /// Name of the instance.
        instance: String,
        /// Port that was checked.
        port: u16,
    },
    /// Waiting for the instance stopped.
    #[error("stopped waiting for SSH on {name}: {reason}")]
    Stopped {
        /// Instance being waited on.
        name: String,
        /// Why polling stopped.
        reason: PollStop,
    },
    /// A control-plane call failed.
    #[error("failed to query the cloud: {0}")]
    Provider(#[source] E),
    /// The `ssh` or `scp` process failed.
    #[error(transparent)]
    Command(#[from] CommandError),
}

/// Returns the default login user for an image name.
///
/// Matching is case-insensitive on OS-family substrings.
#[must_use]
pub fn login_user_for_image(image_name: &str) -> &'static str {
    let lowered = image_name.to_lowercase();
    if lowered.contains("ubuntu") {
        "ubuntu"
    } else if lowered.contains("centos") {
        if lowered.contains('7') {
            "centos"
        } else {
            "cloud-user"
        }
    } else if lowered.contains("debian") {
        "debian"
    } else if lowered.contains("core") {
        "core"
    } else {
        ROOT_USER
    }
}

/// Returns `true` when the user needs privilege escalation.
#[must_use]
pub fn needs_escalation(user: &str) -> bool {
    user != ROOT_USER
}

/// Returns instances whose name contains `needle`, or whose identifier
/// contains it when `needle` is a UUID. Listing order is preserved.
#[must_use]
pub fn matching_instances(instances: Vec<Instance>, needle: &str) -> Vec<Instance> {
    let by_id = is_uuid(needle);
    instances
        .into_iter()
        .filter(|instance| {
            let haystack = if by_id { &instance.id } else { &instance.name };
            MatchMode::Substring.matches(needle, haystack)
        })
        .collect()
}

/// Returns `true` when a rule of one of the instance's security groups
/// opens `port`.
#[must_use]
pub fn port_open(instance: &Instance, groups: &[SecurityGroup], port: u16) -> bool {
    groups
        .iter()
        .filter(|group| instance.security_groups.contains(&group.name))
        .flat_map(|group| &group.rules)
        .any(|rule| rule.covers(port))
}

/// Builds the DNS name `ip-a-b-c-d.<domain>` for a floating address.
#[must_use]
pub fn forge_hostname(address: &str, domain: &str) -> String {
    format!("ip-{}.{domain}", address.replace('.', "-"))
}

/// User and address a connection is made to.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SshTarget {
    /// Login user.
    pub user: String,
    /// Floating address.
    pub address: String,
}

impl SshTarget {
    /// Returns `user@address`.
    #[must_use]
    pub fn destination(&self) -> String {
        format!("{}@{}", self.user, self.address)
    }
}

/// Client binaries and options used for remote access.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ShellSettings {
    /// `ssh` executable.
    pub ssh_bin: String,
    /// `scp` executable.
    pub scp_bin: String,
    /// Private key passed with `-i`.
    pub private_key: Option<Utf8PathBuf>,
    /// Connect timeout of a reachability probe, in seconds.
    pub connect_timeout_secs: u64,
}

impl Default for ShellSettings {
    fn default() -> Self {
        Self {
            ssh_bin: String::from("ssh"),
            scp_bin: String::from("scp"),
            private_key: None,
            connect_timeout_secs: 3,
        }
    }
}

/// Builds and runs `ssh`/`scp` command lines.
#[derive(Clone, Debug)]
pub struct RemoteShell<R> {
    runner: R,
    settings: ShellSettings,
}

impl<R: CommandRunner> RemoteShell<R> {
    /// Creates a shell using `runner`.
    #[must_use]
    pub const fn new(runner: R, settings: ShellSettings) -> Self {
        Self { runner, settings }
    }

    fn identity_args(&self) -> Vec<OsString> {
        self.settings
            .private_key
            .as_ref()
            .map(|key| vec![OsString::from("-i"), OsString::from(key.as_str())])
            .unwrap_or_default()
    }

    /// Arguments of a no-op connection attempt.
    #[must_use]
    pub fn probe_args(&self, target: &SshTarget) -> Vec<OsString> {
        let mut args = vec![
            OsString::from("-q"),
            OsString::from("-o"),
            OsString::from(format!(
                "ConnectTimeout={}",
                self.settings.connect_timeout_secs
            )),
            OsString::from("-o"),
            OsString::from("BatchMode=yes"),
            OsString::from("-o"),
            OsString::from("StrictHostKeyChecking=accept-new"),
        ];
        args.extend(self.identity_args());
        args.push(OsString::from(target.destination()));
        args.push(OsString::from("exit"));
        args
    }

    /// Attempts one no-op connection and reports whether it succeeded.
    ///
    /// # Errors
    ///
    /// Returns [`CommandError::Spawn`] when `ssh` cannot be started.
    pub fn probe(&self, target: &SshTarget) -> Result<bool, CommandError> {
        let args = self.probe_args(target);
        let output = self.runner.run(&self.settings.ssh_bin, &args)?;
        if output.is_success() {
            info!(address = %target.address, "successfully connected");
            Ok(true)
        } else {
            info!(
                command = %render_command(&self.settings.ssh_bin, &args),
                "failed to open an ssh connection"
            );
            Ok(false)
        }
    }

    /// Opens an interactive session with X11 forwarding.
    ///
    /// # Errors
    ///
    /// Returns [`CommandError`] when `ssh` fails.
    pub fn connect(&self, target: &SshTarget) -> Result<(), CommandError> {
        let mut args = vec![OsString::from("-X")];
        args.extend(self.identity_args());
        args.push(OsString::from(target.destination()));
        run_checked(&self.runner, &self.settings.ssh_bin, &args).map(drop)
    }

    /// Copies a local file to the remote home directory.
    ///
    /// # Errors
    ///
    /// Returns [`CommandError`] when `scp` fails.
    pub fn upload(&self, target: &SshTarget, local: &Utf8Path) -> Result<(), CommandError> {
        let mut args = self.identity_args();
        args.push(OsString::from(local.as_str()));
        args.push(OsString::from(format!("{}:", target.destination())));
        run_checked(&self.runner, &self.settings.scp_bin, &args).map(drop)
    }

    /// Copies a remote file into the current directory.
    ///
    /// # Errors
    ///
    /// Returns [`CommandError`] when `scp` fails.
    pub fn download(&self, target: &SshTarget, remote: &str) -> Result<(), CommandError> {
        let mut args = self.identity_args();
        args.push(OsString::from(format!("{}:{remote}", target.destination())));
        args.push(OsString::from("./"));
        run_checked(&self.runner, &self.settings.scp_bin, &args).map(drop)
    }
}

/// Locates instances and connects to them.
#[derive(Debug)]
pub struct SshHelper<'a, C, R> {
    cloud: &'a C,
    shell: RemoteShell<R>,
}

impl<'a, C, R> SshHelper<'a, C, R>
where
    C: Cloud,
    R: CommandRunner,
{
    /// Creates a helper bound to `cloud`.
    #[must_use]
    pub const fn new(cloud: &'a C, shell: RemoteShell<R>) -> Self {
        Self { cloud, shell }
    }

    /// Returns the underlying shell.
    #[must_use]
    pub const fn shell(&self) -> &RemoteShell<R> {
        &self.shell
    }

    /// Returns every instance matching `name`.
    ///
    /// # Errors
    ///
    /// Returns [`SshError::NoMatch`] when nothing matches.
    pub async fn find(&self, name: &str) -> Result<Vec<Instance>, SshError<C::Error>> {
        let listing = self
            .cloud
            .list_servers()
            .await
            .map_err(SshError::Provider)?;
        let found = matching_instances(listing, name);
        if found.is_empty() {
            return Err(SshError::NoMatch {
                name: name.to_owned(),
            });
        }
        Ok(found)
    }

    /// Returns the login user for an image, `root` when unknown.
    ///
    /// # Errors
    ///
    /// Returns [`SshError::Provider`] when the image cannot be fetched.
    pub async fn login_user(&self, image_id: Option<&str>) -> Result<String, SshError<C::Error>> {
        let Some(id) = image_id else {
            return Ok(ROOT_USER.to_owned());
        };
        let image = self
            .cloud
            .get_image(id)
            .await
            .map_err(SshError::Provider)?;
        Ok(login_user_for_image(&image.name).to_owned())
    }

    /// Builds the connection target of `instance`.
    ///
    /// # Errors
    ///
    /// Returns [`SshError::NoFloatingAddress`] when the instance has no
    /// floating address, or the errors of [`Self::login_user`].
    pub async fn target(
        &self,
        instance: &Instance,
        user: Option<&str>,
    ) -> Result<SshTarget, SshError<C::Error>> {
        let address = instance
            .first_floating_address()
            .ok_or_else(|| SshError::NoFloatingAddress {
                instance: instance.name.clone(),
            })?
            .to_owned();
        let login = match user {
            Some(explicit) => explicit.to_owned(),
            None => self.login_user(instance.image_id.as_deref()).await?,
        };
        Ok(SshTarget {
            user: login,
            address,
        })
    }

    /// Fails unless a security group of `instance` opens `port`.
    ///
    /// # Errors
    ///
    /// Returns [`SshError::PortClosed`] when no rule opens the port.
    pub async fn ensure_port_open(
        &self,
        instance: &Instance,
        port: u16,
    ) -> Result<(), SshError<C::Error>> {
        info!(instance = %instance.name, port, "checking security groups");
        let groups = self
            .cloud
            .list_security_groups(instance.project_id.as_deref())
            .await
            .map_err(SshError::Provider)?;
        if port_open(instance, &groups, port) {
            Ok(())
        } else {
            Err(SshError::PortClosed {
                instance: instance.name.clone(),
                port,
            })
        }
    }

    /// Makes one reachability attempt against the first instance matching
    /// `name`.
    ///
    /// # Errors
    ///
    /// Returns [`SshError`] when the instance cannot be located or `ssh`
    /// cannot be started.
    pub async fn probe(
        &self,
        name: &str,
        user: Option<&str>,
    ) -> Result<Option<SshTarget>, SshError<C::Error>> {
        let found = self.find(name).await?;
        let Some(instance) = found.first() else {
            return Err(SshError::NoMatch {
                name: name.to_owned(),
            });
        };
        info!(instance = %instance.name, "will attempt to reach sshd");
        let target = self.target(instance, user).await?;
        Ok(self.shell.probe(&target)?.then_some(target))
    }

    /// Probes `name` until it accepts a connection.
    ///
    /// A missing instance or floating address counts as a failed attempt.
    ///
    /// # Errors
    ///
    /// Returns [`SshError::Stopped`] when `poller` stops, and other
    /// [`SshError`] variants for fatal failures.
    pub async fn wait_until_reachable(
        &self,
        name: &str,
        user: Option<&str>,
        poller: &mut Poller,
    ) -> Result<SshTarget, SshError<C::Error>> {
        loop {
            match self.probe(name, user).await {
                Ok(Some(target)) => return Ok(target),
                Ok(None)
                | Err(SshError::NoMatch { .. } | SshError::NoFloatingAddress { .. }) => {
                    info!(name, "instance is not reachable yet");
                }
                Err(err) => return Err(err),
            }
            poller.pause().await.map_err(|reason| SshError::Stopped {
                name: name.to_owned(),
                reason,
            })?;
        }
    }
}
