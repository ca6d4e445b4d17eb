//! Operator preferences: key pair, defaults for `boot`, external programs,
//! polling cadence and the inventory cache location.

use std::collections::BTreeMap;
use std::time::Duration;

use camino::Utf8PathBuf;
use ortho_config::OrthoConfig;
use serde::Deserialize;

use crate::binder::split_group_names;
use crate::boot::BootSettings;
use crate::config::{ConfigError, FieldMetadata};
use crate::poll::PollPolicy;
use crate::secgroup::parse_aliases;
use crate::ssh::ShellSettings;

/// Default directory of the inventory cache.
pub const DEFAULT_CACHE_DIR: &str = "/tmp/os_cache";

/// Operator settings loaded via `ortho-config`.
#[derive(Clone, Debug, Deserialize, OrthoConfig, PartialEq, Eq)]
#[ortho_config(
    prefix = "NOVASPAWN",
    discovery(
        app_name = "novaspawn",
        env_var = "NOVASPAWN_CONFIG_PATH",
        config_file_name = "novaspawn.toml",
        dotfile_name = ".novaspawn.toml",
        project_file_name = "novaspawn.toml"
    )
)]
pub struct OperatorConfig {
    /// Key pair injected into new instances. Required by `boot` and `spawn`.
    pub key_pair: Option<String>,
    /// Private key handed to `ssh -i`. Supports `~/` expansion.
    pub private_key_file: Option<String>,
    /// Image used when `--image` is omitted.
    pub default_image: Option<String>,
    /// Flavor used when `--flavor` is omitted.
    #[ortho_config(default = "m1.small".to_owned())]
    pub default_flavor: String,
    /// Security groups used when `--secgroups` is omitted, separated by
    /// commas or whitespace.
    #[ortho_config(default = "default".to_owned())]
    pub default_security_groups: String,
    /// Prefix of generated instance names.
    #[ortho_config(default = "novaspawn".to_owned())]
    pub base_name: String,
    /// Path to the `ssh` executable.
    #[ortho_config(default = "ssh".to_owned())]
    pub ssh_bin: String,
    /// Path to the `scp` executable.
    #[ortho_config(default = "scp".to_owned())]
    pub scp_bin: String,
    /// Path to the `ansible-playbook` executable.
    #[ortho_config(default = "ansible-playbook".to_owned())]
    pub playbook_bin: String,
    /// `ConnectTimeout` of a reachability probe.
    #[ortho_config(default = 3)]
    pub ssh_connect_timeout_secs: u64,
    /// Delay between two readiness checks.
    #[ortho_config(default = 1000)]
    pub boot_poll_interval_ms: u64,
    /// Delay between two SSH probes.
    #[ortho_config(default = 3000)]
    pub ssh_poll_interval_ms: u64,
    /// Bound applied to every polling loop; unbounded when unset.
    pub max_poll_attempts: Option<u32>,
    /// External network new floating addresses come from; the first one
    /// listed when unset.
    pub floating_pool: Option<String>,
    /// Domain appended by `ssh --print-hostname`.
    pub hostname_domain: Option<String>,
    /// `alias=cidr` pairs accepted by `secgroup --cidrs`.
    pub cidr_aliases: Option<String>,
    /// Directory holding the inventory cache.
    #[ortho_config(default = DEFAULT_CACHE_DIR.to_owned())]
    pub cache_dir: String,
    /// Projects snapshotted by `cache build` when none are given.
    pub cache_projects: Option<String>,
    /// Reuse one identity token for the whole process.
    #[ortho_config(default = true)]
    pub reuse_session: bool,
}

impl OperatorConfig {
    /// Loads configuration without attempting to parse CLI arguments.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] when the merge fails.
    pub fn load_without_cli_args() -> Result<Self, ConfigError> {
        Self::load_from_iter([std::ffi::OsString::from("novaspawn")])
            .map_err(|err| ConfigError::Parse(err.to_string()))
    }

    /// Performs semantic validation.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] when the private key path is blank, an
    /// interval is zero, or the CIDR aliases are malformed.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if let Some(path) = &self.private_key_file {
            FieldMetadata::new(
                "private key path",
                "NOVASPAWN_PRIVATE_KEY_FILE",
                "private_key_file",
                "novaspawn",
            )
            .require(path)?;
        }
        for (field, value) in [
            ("boot_poll_interval_ms", self.boot_poll_interval_ms),
            ("ssh_poll_interval_ms", self.ssh_poll_interval_ms),
        ] {
            if value == 0 {
                return Err(ConfigError::Invalid {
                    field: field.to_owned(),
                    message: String::from("must be greater than zero"),
                });
            }
        }
        self.aliases()?;
        Ok(())
    }

    /// Key pair for new instances.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::MissingField`] naming `NOVASPAWN_KEY_PAIR` when
    /// no key pair is configured.
    pub fn key_pair(&self) -> Result<&str, ConfigError> {
        let key = self.key_pair.as_deref().unwrap_or_default();
        FieldMetadata::new("key pair name", "NOVASPAWN_KEY_PAIR", "key_pair", "novaspawn")
            .require(key)?;
        Ok(key)
    }

    /// Private key path with `~/` expanded.
    #[must_use]
    pub fn private_key_path(&self) -> Option<Utf8PathBuf> {
        self.private_key_file
            .as_deref()
            .map(|path| Utf8PathBuf::from(expand_tilde(path)))
    }

    /// Settings of the `ssh`/`scp` wrapper.
    #[must_use]
    pub fn shell_settings(&self) -> ShellSettings {
        ShellSettings {
            ssh_bin: self.ssh_bin.clone(),
            scp_bin: self.scp_bin.clone(),
            private_key: self.private_key_path(),
            connect_timeout_secs: self.ssh_connect_timeout_secs,
        }
    }

    /// Policy of the readiness and address loops.
    #[must_use]
    pub const fn boot_poll_policy(&self) -> PollPolicy {
        PollPolicy::every(Duration::from_millis(self.boot_poll_interval_ms))
            .with_max_attempts(self.max_poll_attempts)
    }

    /// Policy of the SSH reachability loop.
    #[must_use]
    pub const fn ssh_poll_policy(&self) -> PollPolicy {
        PollPolicy::every(Duration::from_millis(self.ssh_poll_interval_ms))
            .with_max_attempts(self.max_poll_attempts)
    }

    /// Settings of the boot workflow.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::MissingField`] when no key pair is configured.
    pub fn boot_settings(&self) -> Result<BootSettings, ConfigError> {
        Ok(BootSettings {
            key_name: self.key_pair()?.to_owned(),
            base_name: self.base_name.clone(),
            poll: self.boot_poll_policy(),
            floating_pool: self.floating_pool.clone(),
        })
    }

    /// Default security groups as individual names.
    #[must_use]
    pub fn security_groups(&self) -> Vec<String> {
        split_group_names(&[self.default_security_groups.as_str()])
    }

    /// Parsed CIDR aliases; empty when none are configured.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] when an entry is not `alias=cidr`.
    pub fn aliases(&self) -> Result<BTreeMap<String, String>, ConfigError> {
        let Some(raw) = self.cidr_aliases.as_deref() else {
            return Ok(BTreeMap::new());
        };
        parse_aliases(raw).map_err(|err| ConfigError::Invalid {
            field: String::from("cidr_aliases"),
            message: err.to_string(),
        })
    }

    /// Projects snapshotted by `cache build` when the command line names
    /// none.
    #[must_use]
    pub fn cache_projects(&self) -> Vec<String> {
        self.cache_projects
            .as_deref()
            .map(|raw| split_group_names(&[raw]))
            .unwrap_or_default()
    }
}

/// Expands a leading `~/` using `HOME`. Other paths are returned unchanged.
#[must_use]
pub fn expand_tilde(path: &str) -> String {
    if let Some(rest) = path.strip_prefix("~/")
        && let Some(home) = std::env::var_os("HOME")
    {
        return format!("{}/{rest}", home.to_string_lossy());
    }
    path.to_owned()
}
