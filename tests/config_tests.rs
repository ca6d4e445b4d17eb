//! Integration tests for configuration validation.

#[path = "common/identity.rs"]
mod identity;

use novaspawn::{OpenStackClient, OpenStackConfig, OpenStackError, SessionPolicy, config::ConfigError};
use rstest::*;

use identity::{PROJECT, identity};

#[fixture]
fn valid_config() -> OpenStackConfig {
    identity()
}

#[rstest]
fn complete_identity_validates(valid_config: OpenStackConfig) {
    assert_eq!(valid_config.validate(), Ok(()));
}

#[rstest]
fn missing_password_produces_actionable_error(valid_config: OpenStackConfig) {
    let cfg = OpenStackConfig {
        password: String::new(),
        ..valid_config
    };

    let error = cfg.validate().expect_err("password is required");
    let ConfigError::MissingField(ref message) = error else {
        panic!("expected MissingField error");
    };
    assert!(
        message.contains("OS_PASSWORD"),
        "error should mention env var: {message}"
    );
    assert!(
        message.contains("novaspawn.toml"),
        "error should mention config file: {message}"
    );
    assert!(
        message.contains("[openstack]"),
        "error should mention the section: {message}"
    );
}

/// Every required field names its environment variable and TOML key.
#[rstest]
#[case::auth_url(|cfg: &mut OpenStackConfig| cfg.auth_url.clear(), "OS_AUTH_URL", "auth_url")]
#[case::username(|cfg: &mut OpenStackConfig| cfg.username.clear(), "OS_USERNAME", "username")]
#[case::tenant(|cfg: &mut OpenStackConfig| cfg.tenant_name = String::from("  "), "OS_TENANT_NAME", "tenant_name")]
#[case::interface(|cfg: &mut OpenStackConfig| cfg.interface.clear(), "OS_INTERFACE", "interface")]
fn validation_errors_are_actionable(
    valid_config: OpenStackConfig,
    #[case] mutate: fn(&mut OpenStackConfig),
    #[case] env_var: &str,
    #[case] toml_key: &str,
) {
    let mut cfg = valid_config;
    mutate(&mut cfg);

    let message = cfg.validate().expect_err("validation should fail").to_string();
    assert!(
        message.contains(env_var),
        "error should mention env var {env_var}: {message}"
    );
    assert!(
        message.contains(toml_key),
        "error should mention TOML key {toml_key}: {message}"
    );
}

#[rstest]
fn project_switch_drops_the_project_id(valid_config: OpenStackConfig) {
    let cfg = OpenStackConfig {
        tenant_id: Some(String::from("p-1")),
        ..valid_config
    };

    let other = cfg.for_project("finance");

    assert_eq!(other.tenant_name, "finance");
    assert_eq!(other.tenant_id, None);
    assert_eq!(other.username, cfg.username);
    assert_eq!(cfg.tenant_name, PROJECT);
}

#[rstest]
fn client_refuses_incomplete_identity(valid_config: OpenStackConfig) {
    let cfg = OpenStackConfig {
        auth_url: String::new(),
        ..valid_config
    };

    let err = OpenStackClient::new(cfg, SessionPolicy::Reuse).expect_err("auth_url is required");

    assert!(
        matches!(err, OpenStackError::Config(ref message) if message.contains("OS_AUTH_URL")),
        "unexpected error: {err}"
    );
}
