//! Identity configuration shared by integration tests.
//!
//! Included with `#[path = "common/identity.rs"]` so no extra test binary is
//! produced.

use novaspawn::OpenStackConfig;

/// Project the fixture authenticates against.
pub const PROJECT: &str = "research";

/// Complete identity configuration pointing at a non-routable endpoint.
pub fn identity() -> OpenStackConfig {
    OpenStackConfig {
        auth_url: String::from("https://keystone.example.test:5000/v3"),
        username: String::from("alice"),
        password: String::from("correct horse"),
        tenant_name: String::from(PROJECT),
        tenant_id: None,
        user_domain_name: String::from("Default"),
        project_domain_name: String::from("Default"),
        region_name: None,
        interface: String::from("public"),
    }
}
