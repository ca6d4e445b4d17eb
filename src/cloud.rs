//! Control-plane abstraction for the compute, image, and network services.
//!
//! The workflow only ever talks to the cloud through [`Cloud`], so the
//! OpenStack client and the in-memory double used by tests are
//! interchangeable.

use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;

/// Status reported by the compute service for an instance.
///
/// The vocabulary is open-ended; statuses this crate does not act on are kept
/// verbatim in [`InstanceStatus::Unknown`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum InstanceStatus {
    /// The guest is still being built.
    Build,
    /// The guest is running.
    Active,
    /// The control plane gave up on the guest.
    Error,
    /// Any other status string.
    Unknown(String),
}

impl InstanceStatus {
    /// Parses a raw status string; matching is case-insensitive.
    #[must_use]
    pub fn parse(raw: &str) -> Self {
        match raw.to_ascii_uppercase().as_str() {
            "BUILD" => Self::Build,
            "ACTIVE" => Self::Active,
            "ERROR" => Self::Error,
            _ => Self::Unknown(raw.to_owned()),
        }
    }

    /// Returns the status as reported by the compute service.
    #[must_use]
    pub fn as_str(&self) -> &str {
        match self {
            Self::Build => "BUILD",
            Self::Active => "ACTIVE",
            Self::Error => "ERROR",
            Self::Unknown(raw) => raw,
        }
    }
}

impl fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Whether an instance address is private or externally routable.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum AddressKind {
    /// Address on a private network.
    Fixed,
    /// Floating address bound to the instance.
    Floating,
}

/// One address of an instance on a given network.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct InstanceAddress {
    /// Address value.
    pub addr: String,
    /// Address type.
    pub kind: AddressKind,
}

impl InstanceAddress {
    /// Private address.
    #[must_use]
    pub fn fixed(addr: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            kind: AddressKind::Fixed,
        }
    }

    /// Floating address.
    #[must_use]
    pub fn floating(addr: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            kind: AddressKind::Floating,
        }
    }
}

/// Snapshot of a compute instance as observed through the API.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Instance {
    /// Server-assigned identifier.
    pub id: String,
    /// Display name.
    pub name: String,
    /// Current status.
    pub status: InstanceStatus,
    /// Image the instance booted from, when known.
    pub image_id: Option<String>,
    /// Addresses keyed by network name; empty until the guest boots.
    pub addresses: BTreeMap<String, Vec<InstanceAddress>>,
    /// Names of the security groups the instance belongs to.
    pub security_groups: Vec<String>,
    /// Instance metadata.
    pub metadata: BTreeMap<String, String>,
    /// Project owning the instance.
    pub project_id: Option<String>,
}

impl Instance {
    /// Returns `true` once any attached network lists at least one address.
    #[must_use]
    pub fn has_private_address(&self) -> bool {
        self.addresses.values().any(|list| !list.is_empty())
    }

    /// Iterates over addresses of the given kind across all networks.
    pub fn addresses_of(&self, kind: AddressKind) -> impl Iterator<Item = &str> {
        self.addresses
            .values()
            .flatten()
            .filter(move |address| address.kind == kind)
            .map(|address| address.addr.as_str())
    }

    /// First private address, used as the floating-address binding target.
    #[must_use]
    pub fn first_fixed_address(&self) -> Option<&str> {
        self.addresses_of(AddressKind::Fixed).next()
    }

    /// First floating address bound to the instance.
    #[must_use]
    pub fn first_floating_address(&self) -> Option<&str> {
        self.addresses_of(AddressKind::Floating).next()
    }
}

/// Boot image.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Image {
    /// Image identifier.
    pub id: String,
    /// Image name.
    pub name: String,
}

/// Compute sizing template.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Flavor {
    /// Flavor identifier.
    pub id: String,
    /// Flavor name.
    pub name: String,
}

/// Externally routable address drawn from a pool.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct FloatingIp {
    /// Identifier of the address record.
    pub id: String,
    /// Address value.
    pub address: String,
    /// Pool the address was allocated from.
    pub pool: String,
    /// Port the address is bound to; `None` when free.
    pub port_id: Option<String>,
    /// Private address the floating address maps to.
    pub fixed_address: Option<String>,
}

impl FloatingIp {
    /// Returns `true` when the address is not associated with any instance.
    #[must_use]
    pub const fn is_free(&self) -> bool {
        self.port_id.is_none()
    }
}

/// Pool from which floating addresses are allocated.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct FloatingPool {
    /// Pool identifier.
    pub id: String,
    /// Pool name.
    pub name: String,
}

/// Network attachment point of an instance.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Port {
    /// Port identifier.
    pub id: String,
    /// Instance the port belongs to.
    pub device_id: String,
    /// Private addresses on the port.
    pub fixed_addresses: Vec<String>,
    /// Identifiers of the security groups applied to the port.
    pub security_groups: Vec<String>,
}

/// Single access rule of a security group.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SecurityGroupRule {
    /// Protocol (`tcp`, `udp`, ...); `None` matches any.
    pub protocol: Option<String>,
    /// First port of the inclusive range.
    pub from_port: Option<u16>,
    /// Last port of the inclusive range.
    pub to_port: Option<u16>,
    /// Source CIDR.
    pub cidr: Option<String>,
}

impl SecurityGroupRule {
    /// Returns `true` when both bounds are set and include `port`.
    #[must_use]
    pub fn covers(&self, port: u16) -> bool {
        match (self.from_port, self.to_port) {
            (Some(from), Some(to)) => (from..=to).contains(&port),
            _ => false,
        }
    }
}

/// Named set of access rules.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SecurityGroup {
    /// Group identifier.
    pub id: String,
    /// Group name.
    pub name: String,
    /// Free-form description.
    pub description: String,
    /// Ordered rules of the group.
    pub rules: Vec<SecurityGroupRule>,
}

/// Ingress rule to append to a security group.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RuleRequest {
    /// Protocol, usually `tcp`.
    pub protocol: String,
    /// First port of the inclusive range.
    pub from_port: u16,
    /// Last port of the inclusive range.
    pub to_port: u16,
    /// Source CIDR.
    pub cidr: String,
}

/// Parameters of a create-instance call.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct ServerCreate {
    /// Instance display name.
    pub name: String,
    /// Resolved image identifier.
    pub image_id: String,
    /// Resolved flavor identifier.
    pub flavor_id: String,
    /// Key pair injected into the guest.
    pub key_name: String,
    /// Cloud-init user data in plain text.
    pub user_data: Option<String>,
    /// Metadata attached to the instance.
    pub metadata: BTreeMap<String, String>,
}

/// Future returned by control-plane operations.
pub type CloudFuture<'a, T, E> = Pin<Box<dyn Future<Output = Result<T, E>> + Send + 'a>>;

/// Capability surface of the cloud control plane.
pub trait Cloud {
    /// Provider specific error type.
    type Error: std::error::Error + Send + Sync + 'static;

    /// Lists images visible to the current project.
    fn list_images(&self) -> CloudFuture<'_, Vec<Image>, Self::Error>;

    /// Fetches a single image.
    fn get_image<'a>(&'a self, id: &'a str) -> CloudFuture<'a, Image, Self::Error>;

    /// Lists flavors.
    fn list_flavors(&self) -> CloudFuture<'_, Vec<Flavor>, Self::Error>;

    /// Submits a create-instance request and returns immediately.
    fn create_server<'a>(
        &'a self,
        request: &'a ServerCreate,
    ) -> CloudFuture<'a, Instance, Self::Error>;

    /// Fetches the current state of an instance.
    fn get_server<'a>(&'a self, id: &'a str) -> CloudFuture<'a, Instance, Self::Error>;

    /// Lists instances of the current project.
    fn list_servers(&self) -> CloudFuture<'_, Vec<Instance>, Self::Error>;

    /// Lists floating addresses allocated to the current project.
    fn list_floating_ips(&self) -> CloudFuture<'_, Vec<FloatingIp>, Self::Error>;

    /// Lists pools floating addresses can be allocated from.
    fn list_floating_pools(&self) -> CloudFuture<'_, Vec<FloatingPool>, Self::Error>;

    /// Allocates one new floating address from `pool`.
    fn allocate_floating_ip<'a>(
        &'a self,
        pool: &'a FloatingPool,
    ) -> CloudFuture<'a, FloatingIp, Self::Error>;

    /// Binds `ip` to the instance's private address `fixed_address`.
    fn associate_floating_ip<'a>(
        &'a self,
        ip: &'a FloatingIp,
        instance: &'a Instance,
        fixed_address: &'a str,
    ) -> CloudFuture<'a, (), Self::Error>;

    /// Lists security groups, optionally scoped to a project.
    fn list_security_groups<'a>(
        &'a self,
        project_id: Option<&'a str>,
    ) -> CloudFuture<'a, Vec<SecurityGroup>, Self::Error>;

    /// Creates an empty security group.
    fn create_security_group<'a>(
        &'a self,
        name: &'a str,
        description: &'a str,
    ) -> CloudFuture<'a, SecurityGroup, Self::Error>;

    /// Appends an ingress rule to a security group.
    fn add_security_group_rule<'a>(
        &'a self,
        group_id: &'a str,
        rule: &'a RuleRequest,
    ) -> CloudFuture<'a, (), Self::Error>;

    /// Lists the network ports of an instance.
    fn list_ports<'a>(&'a self, instance_id: &'a str) -> CloudFuture<'a, Vec<Port>, Self::Error>;

    /// Replaces the security groups applied to a port.
    fn set_port_security_groups<'a>(
        &'a self,
        port_id: &'a str,
        group_ids: &'a [String],
    ) -> CloudFuture<'a, (), Self::Error>;
}
