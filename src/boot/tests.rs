//! Unit tests for the boot workflow.

use std::time::Duration;

use rstest::{fixture, rstest};

use super::*;
use crate::cloud::InstanceStatus;
use crate::floating::FloatingError;
use crate::launch::MetadataError;
use crate::test_support::{FakeCloud, floating_ip, security_group};

const IMAGE_ID: &str = "img-ubuntu";

#[fixture]
fn cloud() -> FakeCloud {
    let cloud = FakeCloud::new();
    cloud.add_image(IMAGE_ID, "ubuntu-22.04");
    cloud.add_flavor("flv-small", "m1.small");
    cloud.add_pool("net-public", "public");
    cloud.add_security_group(security_group("sg-web", "web"));
    cloud.script_boot(&[
        (InstanceStatus::Build, &[]),
        (InstanceStatus::Active, &["10.0.0.5"]),
    ]);
    cloud
}

fn settings() -> BootSettings {
    let mut settings = BootSettings::new("operator-key", "vm");
    settings.poll = PollPolicy::every(Duration::from_secs(1)).with_max_attempts(Some(10));
    settings
}

fn request() -> BootRequest {
    BootRequest {
        image: String::from("ubuntu-22.04"),
        flavor: String::from("m1.small"),
        ..BootRequest::default()
    }
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn boot_binds_floating_address_and_groups(cloud: FakeCloud) {
    cloud.add_floating_ip(floating_ip("198.51.100.5", None));
    let orchestrator = BootOrchestrator::new(&cloud, settings(), CancellationToken::new());
    let req = BootRequest {
        name: Some(String::from("web-1")),
        security_groups: vec![String::from("web")],
        ..request()
    };

    let outcome = orchestrator
        .boot(&req)
        .await
        .expect("boot succeeds")
        .expect("not a dry run");

    assert_eq!(outcome.image_id, IMAGE_ID);
    assert_eq!(outcome.instance_name, "web-1");
    assert_eq!(outcome.address, "198.51.100.5");
    let calls = cloud.calls();
    assert_eq!(calls.create_server, 1);
    assert_eq!(calls.associate_floating_ip, 1);
    assert_eq!(calls.set_port_security_groups, 1);
    assert!(
        cloud
            .ports()
            .iter()
            .all(|port| port.security_groups == vec![String::from("sg-web")])
    );
}

#[rstest]
#[tokio::test]
async fn dry_run_performs_no_mutation(cloud: FakeCloud) {
    let orchestrator = BootOrchestrator::new(&cloud, settings(), CancellationToken::new());
    let req = BootRequest {
        dry_run: true,
        security_groups: vec![String::from("web")],
        ..request()
    };

    let outcome = orchestrator.boot(&req).await.expect("dry run succeeds");

    assert!(outcome.is_none());
    let calls = cloud.calls();
    assert_eq!(calls.mutations(), 0);
    assert_eq!(calls.get_server, 0);
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn generated_names_use_the_base_prefix(cloud: FakeCloud) {
    let orchestrator = BootOrchestrator::new(&cloud, settings(), CancellationToken::new());

    let outcome = orchestrator
        .boot(&request())
        .await
        .expect("boot succeeds")
        .expect("not a dry run");

    assert!(outcome.instance_name.starts_with("vm-"));
    assert_eq!(outcome.instance_name.len(), "vm-".len() + 4);
    assert_eq!(cloud.calls().allocate_floating_ip, 1);
}

#[rstest]
#[tokio::test]
async fn oversized_metadata_fails_before_launch(cloud: FakeCloud) {
    let orchestrator = BootOrchestrator::new(&cloud, settings(), CancellationToken::new());
    let req = BootRequest {
        metadata: (0..5)
            .map(|idx| (format!("k{idx}"), String::from("v")))
            .collect(),
        groups: vec![String::from("web")],
        ..request()
    };

    let err = orchestrator.boot(&req).await.expect_err("six entries");

    assert!(matches!(
        err,
        BootError::Launch(LaunchError::Metadata(MetadataError::TooLarge { count: 6 }))
    ));
    assert_eq!(cloud.calls().mutations(), 0);
}

#[rstest]
#[tokio::test]
async fn invalid_floating_target_fails_before_launch(cloud: FakeCloud) {
    let orchestrator = BootOrchestrator::new(&cloud, settings(), CancellationToken::new());
    let req = BootRequest {
        floating_ip: Some(String::from("not/an/address")),
        ..request()
    };

    let err = orchestrator.boot(&req).await.expect_err("invalid target");

    assert!(matches!(
        err,
        BootError::Bind(BindError::Floating(FloatingError::InvalidTarget { .. }))
    ));
    assert_eq!(cloud.calls().create_server, 0);
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn error_status_aborts_before_binding(cloud: FakeCloud) {
    cloud.script_boot(&[(InstanceStatus::Build, &[]), (InstanceStatus::Error, &[])]);
    let orchestrator = BootOrchestrator::new(&cloud, settings(), CancellationToken::new());

    let err = orchestrator.boot(&request()).await.expect_err("ERROR status");

    assert!(matches!(
        err,
        BootError::Readiness(ReadinessError::InstanceFailed { .. })
    ));
    let calls = cloud.calls();
    assert_eq!(calls.allocate_floating_ip, 0);
    assert_eq!(calls.associate_floating_ip, 0);
}

#[rstest]
#[tokio::test]
async fn unknown_image_is_reported(cloud: FakeCloud) {
    let orchestrator = BootOrchestrator::new(&cloud, settings(), CancellationToken::new());
    let req = BootRequest {
        image: String::from("fedora"),
        ..request()
    };

    let err = orchestrator.boot(&req).await.expect_err("no such image");

    assert!(matches!(
        err,
        BootError::Resolve(ResolveError::NotFound {
            kind: ResourceKind::Image,
            ..
        })
    ));
}

#[rstest]
#[tokio::test]
async fn uuid_image_skips_the_listing(cloud: FakeCloud) {
    let orchestrator = BootOrchestrator::new(&cloud, settings(), CancellationToken::new());
    let image = "6f1b7a4e-0c1d-4a0e-9a43-3d2d1f1e8b11";
    let req = BootRequest {
        image: String::from(image),
        dry_run: true,
        ..request()
    };

    orchestrator.boot(&req).await.expect("dry run succeeds");

    let calls = cloud.calls();
    assert_eq!(calls.list_images, 0);
    assert_eq!(calls.list_flavors, 1);
}
