//! Identity configuration loaded via `ortho-config`.
//!
//! The variables are the usual `OS_*` ones exported by an `openrc.sh`, so an
//! existing OpenStack shell environment works unchanged.

use ortho_config::OrthoConfig;
use serde::Deserialize;
use thiserror::Error;

/// Keystone credentials and endpoint selection.
#[derive(Clone, Debug, Deserialize, OrthoConfig, PartialEq, Eq)]
#[ortho_config(prefix = "OS")]
pub struct OpenStackConfig {
    /// Identity service URL, with or without the `/v3` suffix.
    pub auth_url: String,
    /// User name.
    pub username: String,
    /// Password.
    pub password: String,
    /// Project name the token is scoped to.
    pub tenant_name: String,
    /// Project identifier; preferred over the name when set.
    pub tenant_id: Option<String>,
    /// Domain of the user. Defaults to `Default`.
    #[ortho_config(default = "Default".to_owned())]
    pub user_domain_name: String,
    /// Domain of the project. Defaults to `Default`.
    #[ortho_config(default = "Default".to_owned())]
    pub project_domain_name: String,
    /// Region used to pick catalog endpoints; any region when unset.
    pub region_name: Option<String>,
    /// Catalog interface. Defaults to `public`.
    #[ortho_config(default = "public".to_owned())]
    pub interface: String,
}

/// Metadata for a configuration field, used to generate actionable error messages.
pub(crate) struct FieldMetadata {
    description: &'static str,
    env_var: &'static str,
    toml_key: &'static str,
    section: &'static str,
}

impl FieldMetadata {
    pub(crate) const fn new(
        description: &'static str,
        env_var: &'static str,
        toml_key: &'static str,
        section: &'static str,
    ) -> Self {
        Self {
            description,
            env_var,
            toml_key,
            section,
        }
    }

    pub(crate) fn require(&self, value: &str) -> Result<(), ConfigError> {
        if value.trim().is_empty() {
            return Err(ConfigError::MissingField(format!(
                "missing {}: set {} or add {} to [{}] in novaspawn.toml",
                self.description, self.env_var, self.toml_key, self.section
            )));
        }
        Ok(())
    }
}

impl OpenStackConfig {
    /// Loads configuration without attempting to parse CLI arguments. Values
    /// merge defaults, configuration files, and environment variables.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] when the merge fails.
    pub fn load_without_cli_args() -> Result<Self, ConfigError> {
        Self::load_from_iter([std::ffi::OsString::from("novaspawn")])
            .map_err(|err| ConfigError::Parse(err.to_string()))
    }

    /// Returns a copy scoped to another project by name.
    #[must_use]
    pub fn for_project(&self, project: &str) -> Self {
        Self {
            tenant_name: project.to_owned(),
            tenant_id: None,
            ..self.clone()
        }
    }

    /// Performs semantic validation on required fields.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::MissingField`] naming the environment variable
    /// and TOML key of the first empty required field.
    pub fn validate(&self) -> Result<(), ConfigError> {
        FieldMetadata::new("identity endpoint", "OS_AUTH_URL", "auth_url", "openstack")
            .require(&self.auth_url)?;
        FieldMetadata::new("user name", "OS_USERNAME", "username", "openstack")
            .require(&self.username)?;
        FieldMetadata::new("password", "OS_PASSWORD", "password", "openstack")
            .require(&self.password)?;
        FieldMetadata::new("project name", "OS_TENANT_NAME", "tenant_name", "openstack")
            .require(&self.tenant_name)?;
        FieldMetadata::new(
            "catalog interface",
            "OS_INTERFACE",
            "interface",
            "openstack",
        )
        .require(&self.interface)?;
        Ok(())
    }
}

/// Errors raised during configuration loading and validation.
#[derive(Debug, Error, Eq, PartialEq)]
pub enum ConfigError {
    /// Indicates a required configuration field is empty or missing.
    #[error("missing configuration field: {0}")]
    MissingField(String),
    /// A field holds a value that cannot be used.
    #[error("invalid configuration value for {field}: {message}")]
    Invalid {
        /// Offending field.
        field: String,
        /// Description of the problem.
        message: String,
    },
    /// Surfaces errors from the `ortho-config` loader.
    #[error("configuration parsing failed: {0}")]
    Parse(String),
}

impl From<ortho_config::OrthoError> for ConfigError {
    fn from(value: ortho_config::OrthoError) -> Self {
        Self::Parse(value.to_string())
    }
}
