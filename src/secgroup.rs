//! Creates security groups and appends TCP ingress rules to them.

use std::collections::BTreeMap;
use std::net::Ipv4Addr;

use thiserror::Error;
use tracing::info;

use crate::cloud::{Cloud, RuleRequest};
use crate::resolver::{self, MatchMode, ResolveError, ResourceKind};

/// Ports opened when none are given.
pub const DEFAULT_PORTS: [u16; 3] = [443, 80, 22];

/// Errors raised while parsing CIDRs and their aliases.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum CidrError {
    /// The value is not `a.b.c.d/n` with `n` in `0..=32`.
    #[error("'{cidr}' is not a valid CIDR: {reason}")]
    Invalid {
        /// Offending value.
        cidr: String,
        /// What is wrong with it.
        reason: String,
    },
    /// An alias entry is not `name=cidr`.
    #[error("malformed CIDR alias entry '{entry}'")]
    MalformedAlias {
        /// Offending entry.
        entry: String,
    },
}

/// Errors raised while managing a security group.
#[derive(Debug, Error)]
pub enum SecurityGroupError<E>
where
    E: std::error::Error + 'static,
{
    /// A CIDR failed validation; nothing was changed.
    #[error(transparent)]
    Cidr(#[from] CidrError),
    /// The group could not be found by name.
    #[error(transparent)]
    Resolve(#[from] ResolveError<E>),
    /// A control-plane call failed.
    #[error("security group operation failed: {0}")]
    Provider(#[source] E),
}

/// Checks that `cidr` is an IPv4 address followed by a prefix length
/// between 0 and 32.
///
/// # Errors
///
/// Returns [`CidrError::Invalid`] describing the first problem found.
pub fn validate_cidr(cidr: &str) -> Result<(), CidrError> {
    let invalid = |reason: &str| CidrError::Invalid {
        cidr: cidr.to_owned(),
        reason: reason.to_owned(),
    };
    let (address, prefix) = cidr
        .split_once('/')
        .ok_or_else(|| invalid("missing '/<prefix>'"))?;
    let bits: u8 = prefix
        .parse()
        .map_err(|_| invalid("the prefix must be a number"))?;
    if bits > 32 {
        return Err(invalid("the number after the slash must be 0-32"));
    }
    address
        .parse::<Ipv4Addr>()
        .map_err(|_| invalid("the address is not IPv4"))?;
    Ok(())
}

/// Parses `alias=cidr` pairs separated by commas or whitespace.
///
/// # Errors
///
/// Returns [`CidrError::MalformedAlias`] for entries without `=` or with an
/// empty side.
pub fn parse_aliases(raw: &str) -> Result<BTreeMap<String, String>, CidrError> {
    raw.split(|ch: char| ch == ',' || ch.is_whitespace())
        .filter(|entry| !entry.is_empty())
        .map(|entry| match entry.split_once('=') {
            Some((alias, cidr)) if !alias.is_empty() && !cidr.is_empty() => {
                Ok((alias.to_owned(), cidr.to_owned()))
            }
            _ => Err(CidrError::MalformedAlias {
                entry: entry.to_owned(),
            }),
        })
        .collect()
}

/// Requested change to a security group.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct SecurityGroupRequest {
    /// Group name.
    pub name: String,
    /// Create the group instead of looking it up.
    pub create: bool,
    /// Ports to open.
    pub ports: Vec<u16>,
    /// Source CIDRs or aliases.
    pub cidrs: Vec<String>,
    /// Validate and log only.
    pub dry_run: bool,
}

/// Outcome of [`SecurityGroupManager::apply`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SecurityGroupOutcome {
    /// Group the rules were added to; `None` for a dry run.
    pub group_id: Option<String>,
    /// Rules added, or that would have been added.
    pub rules: Vec<RuleRequest>,
}

/// Applies [`SecurityGroupRequest`]s.
#[derive(Debug)]
pub struct SecurityGroupManager<'a, C> {
    cloud: &'a C,
    aliases: BTreeMap<String, String>,
}

impl<'a, C> SecurityGroupManager<'a, C>
where
    C: Cloud,
{
    /// Creates a manager expanding `aliases` in CIDR arguments.
    #[must_use]
    pub const fn new(cloud: &'a C, aliases: BTreeMap<String, String>) -> Self {
        Self { cloud, aliases }
    }

    /// Expands aliases and validates every CIDR.
    ///
    /// # Errors
    ///
    /// Returns [`CidrError`] for the first invalid CIDR.
    pub fn expand_cidrs(&self, cidrs: &[String]) -> Result<Vec<String>, CidrError> {
        cidrs
            .iter()
            .map(|cidr| {
                let expanded = self.aliases.get(cidr).unwrap_or(cidr);
                info!(cidr = %expanded, "checking CIDR");
                validate_cidr(expanded).map(|()| expanded.clone())
            })
            .collect()
    }

    /// Adds one TCP ingress rule per port and CIDR pair.
    ///
    /// All CIDRs are validated before the group is touched.
    ///
    /// # Errors
    ///
    /// Returns [`SecurityGroupError`] when validation, lookup, creation, or
    /// a rule insertion fails.
    pub async fn apply(
        &self,
        request: &SecurityGroupRequest,
    ) -> Result<SecurityGroupOutcome, SecurityGroupError<C::Error>> {
        let cidrs = self.expand_cidrs(&request.cidrs)?;
        let rules: Vec<RuleRequest> = request
            .ports
            .iter()
            .flat_map(|port| {
                cidrs.iter().map(move |cidr| RuleRequest {
                    protocol: String::from("tcp"),
                    from_port: *port,
                    to_port: *port,
                    cidr: cidr.clone(),
                })
            })
            .collect();

        if request.dry_run {
            for rule in &rules {
                info!(port = rule.from_port, cidr = %rule.cidr, "dry run, rule not added");
            }
            return Ok(SecurityGroupOutcome {
                group_id: None,
                rules,
            });
        }

        let group_id = self.group_id(request).await?;
        for rule in &rules {
            info!(port = rule.from_port, cidr = %rule.cidr, group = %request.name, "adding rule");
            self.cloud
                .add_security_group_rule(&group_id, rule)
                .await
                .map_err(SecurityGroupError::Provider)?;
        }
        Ok(SecurityGroupOutcome {
            group_id: Some(group_id),
            rules,
        })
    }

    async fn group_id(&self, request: &SecurityGroupRequest) -> Result<String, SecurityGroupError<C::Error>> {
        if request.create {
            let group = self
                .cloud
                .create_security_group(&request.name, &request.name)
                .await
                .map_err(SecurityGroupError::Provider)?;
            info!(group = %group.name, id = %group.id, "created security group");
            return Ok(group.id);
        }
        let id = resolver::resolve(
            ResourceKind::SecurityGroup,
            &request.name,
            MatchMode::Exact,
            || self.cloud.list_security_groups(None),
        )
        .await?;
        Ok(id)
    }
}
