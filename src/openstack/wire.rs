//! JSON bodies exchanged with Nova, Glance, and Neutron, and their
//! conversion into the provider-neutral types of [`crate::cloud`].

use std::collections::BTreeMap;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use reqwest::Url;
use serde::{Deserialize, Serialize};

use super::auth::parse_url;
use super::error::OpenStackError;
use crate::cloud::{
    Flavor, FloatingIp, FloatingPool, Image, Instance, InstanceAddress, InstanceStatus, Port,
    RuleRequest, SecurityGroup, SecurityGroupRule, ServerCreate,
};

const FLOATING_TYPE: &str = "floating";
const INGRESS: &str = "ingress";

// Compute

#[derive(Debug, Deserialize)]
pub(crate) struct ServersEnvelope {
    pub(crate) servers: Vec<ServerBody>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct ServerEnvelope {
    pub(crate) server: ServerBody,
}

/// Nova reports `"image": ""` for volume-backed servers.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub(crate) enum ImageField {
    Reference { id: String },
    Other(serde_json::Value),
}

#[derive(Debug, Deserialize)]
pub(crate) struct ServerBody {
    pub(crate) id: String,
    #[serde(default)]
    pub(crate) name: String,
    #[serde(default)]
    pub(crate) status: String,
    pub(crate) image: Option<ImageField>,
    #[serde(default)]
    pub(crate) addresses: BTreeMap<String, Vec<AddressBody>>,
    #[serde(default)]
    pub(crate) security_groups: Vec<NamedRef>,
    #[serde(default)]
    pub(crate) metadata: BTreeMap<String, String>,
    pub(crate) tenant_id: Option<String>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct AddressBody {
    pub(crate) addr: String,
    #[serde(rename = "OS-EXT-IPS:type")]
    pub(crate) kind: Option<String>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct NamedRef {
    pub(crate) name: String,
}

impl From<AddressBody> for InstanceAddress {
    fn from(value: AddressBody) -> Self {
        match value.kind.as_deref() {
            Some(FLOATING_TYPE) => Self::floating(value.addr),
            _ => Self::fixed(value.addr),
        }
    }
}

impl From<ServerBody> for Instance {
    fn from(value: ServerBody) -> Self {
        let image_id = match value.image {
            Some(ImageField::Reference { id }) => Some(id),
            Some(ImageField::Other(_)) | None => None,
        };
        let mut security_groups: Vec<String> = Vec::new();
        for group in value.security_groups {
            if !security_groups.contains(&group.name) {
                security_groups.push(group.name);
            }
        }
        Self {
            id: value.id,
            name: value.name,
            status: InstanceStatus::parse(&value.status),
            image_id,
            addresses: value
                .addresses
                .into_iter()
                .map(|(network, list)| {
                    (network, list.into_iter().map(InstanceAddress::from).collect())
                })
                .collect(),
            security_groups,
            metadata: value.metadata,
            project_id: value.tenant_id,
        }
    }
}

#[derive(Debug, Serialize)]
pub(crate) struct CreateServerEnvelope<'a> {
    pub(crate) server: CreateServerBody<'a>,
}

#[derive(Debug, Serialize)]
pub(crate) struct CreateServerBody<'a> {
    name: &'a str,
    #[serde(rename = "imageRef")]
    image_ref: &'a str,
    #[serde(rename = "flavorRef")]
    flavor_ref: &'a str,
    key_name: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    user_data: Option<String>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    metadata: &'a BTreeMap<String, String>,
}

impl<'a> From<&'a ServerCreate> for CreateServerEnvelope<'a> {
    fn from(value: &'a ServerCreate) -> Self {
        Self {
            server: CreateServerBody {
                name: &value.name,
                image_ref: &value.image_id,
                flavor_ref: &value.flavor_id,
                key_name: &value.key_name,
                user_data: value
                    .user_data
                    .as_deref()
                    .map(|data| STANDARD.encode(data)),
                metadata: &value.metadata,
            },
        }
    }
}

/// The create response only carries the identifier; the rest of the snapshot
/// comes from the request until the first status poll.
#[derive(Debug, Deserialize)]
pub(crate) struct CreatedServerEnvelope {
    pub(crate) server: CreatedServer,
}

#[derive(Debug, Deserialize)]
pub(crate) struct CreatedServer {
    pub(crate) id: String,
}

impl CreatedServer {
    pub(crate) fn into_instance(self, request: &ServerCreate) -> Instance {
        Instance {
            id: self.id,
            name: request.name.clone(),
            status: InstanceStatus::Build,
            image_id: Some(request.image_id.clone()),
            addresses: BTreeMap::new(),
            security_groups: Vec::new(),
            metadata: request.metadata.clone(),
            project_id: None,
        }
    }
}

#[derive(Debug, Deserialize)]
pub(crate) struct FlavorsEnvelope {
    pub(crate) flavors: Vec<IdName>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct IdName {
    pub(crate) id: String,
    #[serde(default)]
    pub(crate) name: String,
}

impl From<IdName> for Flavor {
    fn from(value: IdName) -> Self {
        Self {
            id: value.id,
            name: value.name,
        }
    }
}

impl From<IdName> for FloatingPool {
    fn from(value: IdName) -> Self {
        Self {
            id: value.id,
            name: value.name,
        }
    }
}

// Image

#[derive(Debug, Deserialize)]
pub(crate) struct ImagesPage {
    pub(crate) images: Vec<ImageBody>,
    pub(crate) next: Option<String>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct ImageBody {
    pub(crate) id: String,
    pub(crate) name: Option<String>,
}

impl From<ImageBody> for Image {
    fn from(value: ImageBody) -> Self {
        Self {
            id: value.id,
            name: value.name.unwrap_or_default(),
        }
    }
}

/// Resolves a Glance `next` link against the image endpoint with its
/// version stripped, so `/v2/images?marker=...` keeps any path prefix the
/// endpoint is mounted under. Absolute links are used as given.
pub(crate) fn next_page_url(image_endpoint: &str, next: &str) -> Result<Url, OpenStackError> {
    let trimmed = image_endpoint.trim_end_matches('/');
    let root = trimmed.strip_suffix("/v2").unwrap_or(trimmed);
    // `join` drops the last path segment unless the base ends in a slash.
    parse_url(&format!("{root}/"))?
        .join(next.trim_start_matches('/'))
        .map_err(|err| OpenStackError::InvalidUrl {
            url: next.to_owned(),
            message: err.to_string(),
        })
}

// Network

#[derive(Debug, Deserialize)]
pub(crate) struct NetworksEnvelope {
    pub(crate) networks: Vec<IdName>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct FloatingIpsEnvelope {
    pub(crate) floatingips: Vec<FloatingIpBody>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct FloatingIpEnvelope {
    pub(crate) floatingip: FloatingIpBody,
}

#[derive(Debug, Deserialize)]
pub(crate) struct FloatingIpBody {
    pub(crate) id: String,
    pub(crate) floating_ip_address: String,
    pub(crate) floating_network_id: String,
    pub(crate) port_id: Option<String>,
    pub(crate) fixed_ip_address: Option<String>,
}

impl From<FloatingIpBody> for FloatingIp {
    fn from(value: FloatingIpBody) -> Self {
        Self {
            id: value.id,
            address: value.floating_ip_address,
            pool: value.floating_network_id,
            port_id: value.port_id,
            fixed_address: value.fixed_ip_address,
        }
    }
}

#[derive(Debug, Serialize)]
pub(crate) struct AllocateFloatingIp<'a> {
    pub(crate) floatingip: AllocateBody<'a>,
}

#[derive(Debug, Serialize)]
pub(crate) struct AllocateBody<'a> {
    pub(crate) floating_network_id: &'a str,
}

#[derive(Debug, Serialize)]
pub(crate) struct AssociateFloatingIp<'a> {
    pub(crate) floatingip: AssociateBody<'a>,
}

#[derive(Debug, Serialize)]
pub(crate) struct AssociateBody<'a> {
    pub(crate) port_id: &'a str,
    pub(crate) fixed_ip_address: &'a str,
}

#[derive(Debug, Deserialize)]
pub(crate) struct PortsEnvelope {
    pub(crate) ports: Vec<PortBody>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct PortBody {
    pub(crate) id: String,
    #[serde(default)]
    pub(crate) device_id: String,
    #[serde(default)]
    pub(crate) fixed_ips: Vec<FixedIpBody>,
    #[serde(default)]
    pub(crate) security_groups: Vec<String>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct FixedIpBody {
    pub(crate) ip_address: String,
}

impl From<PortBody> for Port {
    fn from(value: PortBody) -> Self {
        Self {
            id: value.id,
            device_id: value.device_id,
            fixed_addresses: value
                .fixed_ips
                .into_iter()
                .map(|fixed| fixed.ip_address)
                .collect(),
            security_groups: value.security_groups,
        }
    }
}

#[derive(Debug, Serialize)]
pub(crate) struct PortSecurityGroups<'a> {
    pub(crate) port: PortSecurityGroupsBody<'a>,
}

#[derive(Debug, Serialize)]
pub(crate) struct PortSecurityGroupsBody<'a> {
    pub(crate) security_groups: &'a [String],
}

#[derive(Debug, Deserialize)]
pub(crate) struct SecurityGroupsEnvelope {
    pub(crate) security_groups: Vec<SecurityGroupBody>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct SecurityGroupEnvelope {
    pub(crate) security_group: SecurityGroupBody,
}

#[derive(Debug, Deserialize)]
pub(crate) struct SecurityGroupBody {
    pub(crate) id: String,
    pub(crate) name: String,
    pub(crate) description: Option<String>,
    #[serde(default)]
    pub(crate) security_group_rules: Vec<RuleBody>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct RuleBody {
    pub(crate) direction: String,
    pub(crate) protocol: Option<String>,
    pub(crate) port_range_min: Option<u16>,
    pub(crate) port_range_max: Option<u16>,
    pub(crate) remote_ip_prefix: Option<String>,
}

impl From<SecurityGroupBody> for SecurityGroup {
    fn from(value: SecurityGroupBody) -> Self {
        Self {
            id: value.id,
            name: value.name,
            description: value.description.unwrap_or_default(),
            rules: value
                .security_group_rules
                .into_iter()
                .filter(|rule| rule.direction == INGRESS)
                .map(|rule| SecurityGroupRule {
                    protocol: rule.protocol,
                    from_port: rule.port_range_min,
                    to_port: rule.port_range_max,
                    cidr: rule.remote_ip_prefix,
                })
                .collect(),
        }
    }
}

#[derive(Debug, Serialize)]
pub(crate) struct CreateSecurityGroup<'a> {
    pub(crate) security_group: CreateSecurityGroupBody<'a>,
}

#[derive(Debug, Serialize)]
pub(crate) struct CreateSecurityGroupBody<'a> {
    pub(crate) name: &'a str,
    pub(crate) description: &'a str,
}

#[derive(Debug, Serialize)]
pub(crate) struct CreateRule<'a> {
    pub(crate) security_group_rule: CreateRuleBody<'a>,
}

#[derive(Debug, Serialize)]
pub(crate) struct CreateRuleBody<'a> {
    security_group_id: &'a str,
    direction: &'static str,
    ethertype: &'static str,
    protocol: &'a str,
    port_range_min: u16,
    port_range_max: u16,
    remote_ip_prefix: &'a str,
}

impl<'a> CreateRule<'a> {
    pub(crate) fn ingress(group_id: &'a str, rule: &'a RuleRequest) -> Self {
        Self {
            security_group_rule: CreateRuleBody {
                security_group_id: group_id,
                direction: INGRESS,
                ethertype: "IPv4",
                protocol: &rule.protocol,
                port_range_min: rule.from_port,
                port_range_max: rule.to_port,
                remote_ip_prefix: &rule.cidr,
            },
        }
    }
}
