//! In-memory cloud fixtures shared by workflow tests.

use novaspawn::InstanceStatus;
use novaspawn::test_support::{FakeCloud, security_group};

/// Identifier of the image every fixture boots from.
pub const IMAGE_ID: &str = "img-ubuntu";

/// Cloud with one image, one flavor, one pool and a `web` security group,
/// whose next instance builds once before becoming active on `10.0.0.5`.
pub fn booting_cloud() -> FakeCloud {
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
