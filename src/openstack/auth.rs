//! Keystone v3 password authentication and service catalog lookup.

use reqwest::Url;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::OpenStackConfig;

use super::HTTP_CLIENT;
use super::error::OpenStackError;

const TOKEN_HEADER: &str = "X-Subject-Token";

/// Catalog service types the client talks to.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum Service {
    Compute,
    Image,
    Network,
}

impl Service {
    pub(crate) const fn catalog_type(self) -> &'static str {
        match self {
            Self::Compute => "compute",
            Self::Image => "image",
            Self::Network => "network",
        }
    }
}

/// Resolved endpoints, normalised to the API versions used by the client.
#[derive(Clone, Debug, Eq, PartialEq)]
pub(crate) struct Endpoints {
    pub(crate) compute: String,
    pub(crate) image: String,
    pub(crate) network: String,
}

impl Endpoints {
    pub(crate) fn base(&self, service: Service) -> &str {
        match service {
            Service::Compute => &self.compute,
            Service::Image => &self.image,
            Service::Network => &self.network,
        }
    }

    /// Appends `segments` to the service endpoint, percent-encoding each one,
    /// and adds `query` as form-encoded pairs.
    pub(crate) fn url(
        &self,
        service: Service,
        segments: &[&str],
        query: &[(&str, &str)],
    ) -> Result<Url, OpenStackError> {
        let base = self.base(service);
        let mut url = parse_url(base)?;
        url.path_segments_mut()
            .map_err(|()| OpenStackError::InvalidUrl {
                url: base.to_owned(),
                message: String::from("endpoint cannot carry a path"),
            })?
            .pop_if_empty()
            .extend(segments);
        if !query.is_empty() {
            url.query_pairs_mut().extend_pairs(query);
        }
        Ok(url)
    }
}

pub(crate) fn parse_url(raw: &str) -> Result<Url, OpenStackError> {
    Url::parse(raw).map_err(|err| OpenStackError::InvalidUrl {
        url: raw.to_owned(),
        message: err.to_string(),
    })
}

/// Token and endpoints of an authenticated project.
#[derive(Clone, Debug, Eq, PartialEq)]
pub(crate) struct Session {
    pub(crate) token: String,
    pub(crate) project_id: Option<String>,
    pub(crate) endpoints: Endpoints,
}

/// Builds the token URL from the configured identity endpoint.
///
/// `.../v3` gains `/auth/tokens`, a `v2.0` endpoint is rewritten to `v3`,
/// and a bare endpoint gains `/v3/auth/tokens`.
pub(crate) fn token_url(auth_url: &str) -> String {
    let trimmed = auth_url.trim_end_matches('/');
    if trimmed.ends_with("/auth/tokens") {
        return trimmed.to_owned();
    }
    if trimmed.ends_with("/v3") {
        return format!("{trimmed}/auth/tokens");
    }
    if let Some(root) = trimmed.strip_suffix("/v2.0") {
        return format!("{root}/v3/auth/tokens");
    }
    format!("{trimmed}/v3/auth/tokens")
}

fn with_version(url: &str, version: &str) -> String {
    let trimmed = url.trim_end_matches('/');
    if trimmed.ends_with(version) {
        trimmed.to_owned()
    } else {
        format!("{trimmed}{version}")
    }
}

#[derive(Debug, Serialize)]
pub(crate) struct AuthRequest<'a> {
    auth: AuthBody<'a>,
}

#[derive(Debug, Serialize)]
struct AuthBody<'a> {
    identity: Identity<'a>,
    scope: Scope<'a>,
}

#[derive(Debug, Serialize)]
struct Identity<'a> {
    methods: [&'static str; 1],
    password: PasswordMethod<'a>,
}

#[derive(Debug, Serialize)]
struct PasswordMethod<'a> {
    user: User<'a>,
}

#[derive(Debug, Serialize)]
struct User<'a> {
    name: &'a str,
    password: &'a str,
    domain: Domain<'a>,
}

#[derive(Debug, Serialize)]
struct Domain<'a> {
    name: &'a str,
}

#[derive(Debug, Serialize)]
struct Scope<'a> {
    project: ProjectScope<'a>,
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
enum ProjectScope<'a> {
    Id { id: &'a str },
    Name { name: &'a str, domain: Domain<'a> },
}

impl<'a> AuthRequest<'a> {
    /// Password credentials scoped to the project id when one is configured,
    /// otherwise to the project name within its domain.
    pub(crate) fn password(config: &'a OpenStackConfig) -> Self {
        let project = match config.tenant_id.as_deref() {
            Some(id) if !id.trim().is_empty() => ProjectScope::Id { id },
            _ => ProjectScope::Name {
                name: &config.tenant_name,
                domain: Domain {
                    name: &config.project_domain_name,
                },
            },
        };
        Self {
            auth: AuthBody {
                identity: Identity {
                    methods: ["password"],
                    password: PasswordMethod {
                        user: User {
                            name: &config.username,
                            password: &config.password,
                            domain: Domain {
                                name: &config.user_domain_name,
                            },
                        },
                    },
                },
                scope: Scope { project },
            },
        }
    }
}

#[derive(Debug, Deserialize)]
pub(crate) struct TokenResponse {
    pub(crate) token: TokenBody,
}

#[derive(Debug, Deserialize)]
pub(crate) struct TokenBody {
    #[serde(default)]
    pub(crate) catalog: Vec<CatalogEntry>,
    pub(crate) project: Option<ProjectRef>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct ProjectRef {
    pub(crate) id: String,
}

#[derive(Debug, Deserialize)]
pub(crate) struct CatalogEntry {
    #[serde(rename = "type")]
    pub(crate) service_type: String,
    #[serde(default)]
    pub(crate) endpoints: Vec<CatalogEndpoint>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct CatalogEndpoint {
    pub(crate) interface: String,
    pub(crate) region: Option<String>,
    pub(crate) region_id: Option<String>,
    pub(crate) url: String,
}

impl CatalogEndpoint {
    fn in_region(&self, region: Option<&str>) -> bool {
        region.is_none_or(|wanted| {
            self.region_id.as_deref() == Some(wanted) || self.region.as_deref() == Some(wanted)
        })
    }
}

fn find_endpoint<'a>(
    catalog: &'a [CatalogEntry],
    service: Service,
    interface: &str,
    region: Option<&str>,
) -> Result<&'a str, OpenStackError> {
    catalog
        .iter()
        .filter(|entry| entry.service_type == service.catalog_type())
        .flat_map(|entry| entry.endpoints.iter())
        .find(|endpoint| endpoint.interface == interface && endpoint.in_region(region))
        .map(|endpoint| endpoint.url.as_str())
        .ok_or_else(|| OpenStackError::MissingEndpoint {
            service: service.catalog_type().to_owned(),
            interface: interface.to_owned(),
        })
}

/// Picks the compute, image, and network endpoints out of a catalog.
///
/// # Errors
///
/// Returns [`OpenStackError::MissingEndpoint`] when a service is absent.
pub(crate) fn endpoints_from_catalog(
    catalog: &[CatalogEntry],
    interface: &str,
    region: Option<&str>,
) -> Result<Endpoints, OpenStackError> {
    let compute = find_endpoint(catalog, Service::Compute, interface, region)?;
    let image = find_endpoint(catalog, Service::Image, interface, region)?;
    let network = find_endpoint(catalog, Service::Network, interface, region)?;
    Ok(Endpoints {
        compute: compute.trim_end_matches('/').to_owned(),
        image: with_version(image, "/v2"),
        network: with_version(network, "/v2.0"),
    })
}

/// Requests a project-scoped token.
///
/// # Errors
///
/// Returns [`OpenStackError::Authentication`] when the service rejects the
/// credentials or omits the token header, and
/// [`OpenStackError::MissingEndpoint`] when the catalog is incomplete.
pub(crate) async fn authenticate(config: &OpenStackConfig) -> Result<Session, OpenStackError> {
    let url = token_url(&config.auth_url);
    debug!(%url, user = %config.username, project = %config.tenant_name, "requesting token");
    let auth_failed = |message: String| OpenStackError::Authentication {
        url: url.clone(),
        message,
    };

    let response = HTTP_CLIENT
        .post(&url)
        .json(&AuthRequest::password(config))
        .send()
        .await
        .map_err(|err| auth_failed(err.to_string()))?;

    if !response.status().is_success() {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        return Err(auth_failed(format!("{status}: {body}")));
    }

    let token = response
        .headers()
        .get(TOKEN_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::to_owned)
        .ok_or_else(|| auth_failed(format!("response carries no {TOKEN_HEADER} header")))?;
    let body: TokenResponse = response
        .json()
        .await
        .map_err(|err| auth_failed(err.to_string()))?;

    let endpoints = endpoints_from_catalog(
        &body.token.catalog,
        &config.interface,
        config.region_name.as_deref(),
    )?;
    Ok(Session {
        token,
        project_id: body.token.project.map(|project| project.id),
        endpoints,
    })
}
