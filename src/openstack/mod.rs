//! OpenStack implementation of [`Cloud`] over the Keystone, Nova, Glance,
//! and Neutron REST APIs.

mod auth;
mod error;
mod wire;

use std::future::Future;
use std::sync::LazyLock;
use std::time::Duration;

use reqwest::{Method, Url};
use serde::Serialize;
use serde::de::{DeserializeOwned, IgnoredAny};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::cloud::{
    Cloud, CloudFuture, Flavor, FloatingIp, FloatingPool, Image, Instance, Port, RuleRequest,
    SecurityGroup, ServerCreate,
};
use crate::config::OpenStackConfig;
use auth::{Service, Session};
use wire::{
    AllocateBody, AllocateFloatingIp, AssociateBody, AssociateFloatingIp, CreateRule,
    CreateSecurityGroup, CreateSecurityGroupBody, CreateServerEnvelope, CreatedServerEnvelope,
    FlavorsEnvelope, FloatingIpEnvelope, FloatingIpsEnvelope, ImageBody, ImagesPage,
    NetworksEnvelope, PortSecurityGroups, PortSecurityGroupsBody, PortsEnvelope,
    SecurityGroupEnvelope, SecurityGroupsEnvelope, ServerEnvelope, ServersEnvelope,
};

pub use error::OpenStackError;

const HTTP_TIMEOUT: Duration = Duration::from_secs(30);
const AUTH_HEADER: &str = "X-Auth-Token";

static HTTP_CLIENT: LazyLock<reqwest::Client> = LazyLock::new(|| {
    reqwest::Client::builder()
        .timeout(HTTP_TIMEOUT)
        .build()
        .unwrap_or_else(|_| reqwest::Client::new())
});

/// How long an identity token is kept.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum SessionPolicy {
    /// Authenticate once and reuse the token for the client's lifetime.
    #[default]
    Reuse,
    /// Authenticate before every call.
    AlwaysReauthenticate,
}

impl SessionPolicy {
    /// Maps the `reuse_session` setting onto a policy.
    #[must_use]
    pub const fn from_reuse(reuse: bool) -> Self {
        if reuse {
            Self::Reuse
        } else {
            Self::AlwaysReauthenticate
        }
    }
}

/// Control-plane client for one OpenStack project.
#[derive(Debug)]
pub struct OpenStackClient {
    config: OpenStackConfig,
    policy: SessionPolicy,
    session: Mutex<Option<Session>>,
}

impl OpenStackClient {
    /// Creates a client; no request is made until the first call.
    ///
    /// # Errors
    ///
    /// Returns [`OpenStackError::Config`] when the configuration fails
    /// validation.
    pub fn new(config: OpenStackConfig, policy: SessionPolicy) -> Result<Self, OpenStackError> {
        config.validate()?;
        Ok(Self {
            config,
            policy,
            session: Mutex::new(None),
        })
    }

    /// Returns a client for another project by name, sharing credentials
    /// but starting without a session.
    #[must_use]
    pub fn for_project(&self, project: &str) -> Self {
        Self {
            config: self.config.for_project(project),
            policy: self.policy,
            session: Mutex::new(None),
        }
    }

    /// Configuration the client authenticates with.
    #[must_use]
    pub const fn config(&self) -> &OpenStackConfig {
        &self.config
    }

    async fn session(&self) -> Result<Session, OpenStackError> {
        let mut slot = self.session.lock().await;
        if self.policy == SessionPolicy::Reuse
            && let Some(session) = slot.as_ref()
        {
            return Ok(session.clone());
        }
        let session = auth::authenticate(&self.config).await?;
        *slot = Some(session.clone());
        Ok(session)
    }

    async fn reauthenticate(&self) -> Result<Session, OpenStackError> {
        let mut slot = self.session.lock().await;
        *slot = None;
        let session = auth::authenticate(&self.config).await?;
        *slot = Some(session.clone());
        Ok(session)
    }

    /// Runs `request` with the current session. A `401` discards the token
    /// and the request is sent once more with a fresh one.
    async fn authorized<T, F, Fut>(&self, request: F) -> Result<T, OpenStackError>
    where
        F: Fn(Session) -> Fut,
        Fut: Future<Output = Result<T, OpenStackError>>,
    {
        match request(self.session().await?).await {
            Err(err) if err.is_unauthorized() => {
                warn!(project = %self.config.tenant_name, "token rejected, authenticating again");
                request(self.reauthenticate().await?).await
            }
            other => other,
        }
    }

    async fn call<B, T>(
        &self,
        method: Method,
        service: Service,
        segments: &[&str],
        query: &[(&str, &str)],
        body: Option<&B>,
    ) -> Result<T, OpenStackError>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        self.authorized(|session| {
            let verb = method.clone();
            async move {
                let url = session.endpoints.url(service, segments, query)?;
                send(verb, url, &session.token, body).await
            }
        })
        .await
    }

    async fn get<T: DeserializeOwned>(
        &self,
        service: Service,
        segments: &[&str],
        query: &[(&str, &str)],
    ) -> Result<T, OpenStackError> {
        self.call::<(), T>(Method::GET, service, segments, query, None)
            .await
    }

    async fn list_image_pages(&self) -> Result<Vec<Image>, OpenStackError> {
        let mut images = Vec::new();
        let mut next: Option<String> = None;
        loop {
            let link = next.take();
            let page: ImagesPage = self
                .authorized(|session| {
                    let pending = link.clone();
                    async move {
                        let url = match pending {
                            Some(path) => wire::next_page_url(&session.endpoints.image, &path)?,
                            None => session.endpoints.url(Service::Image, &["images"], &[])?,
                        };
                        send::<(), _>(Method::GET, url, &session.token, None).await
                    }
                })
                .await?;
            images.extend(page.images.into_iter().map(Image::from));
            let Some(path) = page.next else {
                break;
            };
            next = Some(path);
        }
        Ok(images)
    }

    async fn scoped_project(&self, project_id: Option<&str>) -> Result<Option<String>, OpenStackError> {
        if let Some(id) = project_id {
            return Ok(Some(id.to_owned()));
        }
        Ok(self.session().await?.project_id)
    }
}

async fn send<B, T>(
    method: Method,
    url: Url,
    token: &str,
    body: Option<&B>,
) -> Result<T, OpenStackError>
where
    B: Serialize + ?Sized,
    T: DeserializeOwned,
{
    let rendered = url.to_string();
    debug!(%method, url = %rendered, "calling control plane");
    let transport = |err: reqwest::Error| OpenStackError::Transport {
        url: rendered.clone(),
        message: err.to_string(),
    };
    let mut request = HTTP_CLIENT
        .request(method.clone(), url)
        .header(AUTH_HEADER, token)
        .header(reqwest::header::ACCEPT, "application/json");
    if let Some(payload) = body {
        request = request.json(payload);
    }
    let response = request.send().await.map_err(transport)?;

    let status = response.status();
    if !status.is_success() {
        let message = response.text().await.unwrap_or_default();
        return Err(OpenStackError::Api {
            method: method.to_string(),
            url: rendered,
            status: status.as_u16(),
            message,
        });
    }

    let bytes = response.bytes().await.map_err(transport)?;
    let payload: &[u8] = if bytes.is_empty() { b"null" } else { &bytes };
    serde_json::from_slice(payload).map_err(|err| OpenStackError::Decode {
        url: rendered,
        message: err.to_string(),
    })
}

impl Cloud for OpenStackClient {
    type Error = OpenStackError;

    fn list_images(&self) -> CloudFuture<'_, Vec<Image>, Self::Error> {
        Box::pin(self.list_image_pages())
    }

    fn get_image<'a>(&'a self, id: &'a str) -> CloudFuture<'a, Image, Self::Error> {
        Box::pin(async move {
            let image: ImageBody = self.get(Service::Image, &["images", id], &[]).await?;
            Ok(image.into())
        })
    }

    fn list_flavors(&self) -> CloudFuture<'_, Vec<Flavor>, Self::Error> {
        Box::pin(async move {
            let body: FlavorsEnvelope = self.get(Service::Compute, &["flavors"], &[]).await?;
            Ok(body.flavors.into_iter().map(Flavor::from).collect())
        })
    }

    fn create_server<'a>(
        &'a self,
        request: &'a ServerCreate,
    ) -> CloudFuture<'a, Instance, Self::Error> {
        Box::pin(async move {
            let payload = CreateServerEnvelope::from(request);
            let body: CreatedServerEnvelope = self
                .call(Method::POST, Service::Compute, &["servers"], &[], Some(&payload))
                .await?;
            Ok(body.server.into_instance(request))
        })
    }

    fn get_server<'a>(&'a self, id: &'a str) -> CloudFuture<'a, Instance, Self::Error> {
        Box::pin(async move {
            let body: ServerEnvelope = self.get(Service::Compute, &["servers", id], &[]).await?;
            Ok(body.server.into())
        })
    }

    fn list_servers(&self) -> CloudFuture<'_, Vec<Instance>, Self::Error> {
        Box::pin(async move {
            let body: ServersEnvelope = self
                .get(Service::Compute, &["servers", "detail"], &[])
                .await?;
            Ok(body.servers.into_iter().map(Instance::from).collect())
        })
    }

    fn list_floating_ips(&self) -> CloudFuture<'_, Vec<FloatingIp>, Self::Error> {
        Box::pin(async move {
            let body: FloatingIpsEnvelope = self
                .get(Service::Network, &["floatingips"], &[])
                .await?;
            Ok(body.floatingips.into_iter().map(FloatingIp::from).collect())
        })
    }

    fn list_floating_pools(&self) -> CloudFuture<'_, Vec<FloatingPool>, Self::Error> {
        Box::pin(async move {
            let body: NetworksEnvelope = self
                .get(Service::Network, &["networks"], &[("router:external", "true")])
                .await?;
            Ok(body.networks.into_iter().map(FloatingPool::from).collect())
        })
    }

    fn allocate_floating_ip<'a>(
        &'a self,
        pool: &'a FloatingPool,
    ) -> CloudFuture<'a, FloatingIp, Self::Error> {
        Box::pin(async move {
            let payload = AllocateFloatingIp {
                floatingip: AllocateBody {
                    floating_network_id: &pool.id,
                },
            };
            let body: FloatingIpEnvelope = self
                .call(Method::POST, Service::Network, &["floatingips"], &[], Some(&payload))
                .await?;
            Ok(body.floatingip.into())
        })
    }

    fn associate_floating_ip<'a>(
        &'a self,
        ip: &'a FloatingIp,
        instance: &'a Instance,
        fixed_address: &'a str,
    ) -> CloudFuture<'a, (), Self::Error> {
        Box::pin(async move {
            let ports = self.list_ports(&instance.id).await?;
            let port = ports
                .iter()
                .find(|port| port.fixed_addresses.iter().any(|addr| addr == fixed_address))
                .or_else(|| ports.first())
                .ok_or_else(|| OpenStackError::NoPort {
                    instance_id: instance.id.clone(),
                })?;
            let payload = AssociateFloatingIp {
                floatingip: AssociateBody {
                    port_id: &port.id,
                    fixed_ip_address: fixed_address,
                },
            };
            let _: IgnoredAny = self
                .call(
                    Method::PUT,
                    Service::Network,
                    &["floatingips", ip.id.as_str()],
                    &[],
                    Some(&payload),
                )
                .await?;
            Ok(())
        })
    }

    fn list_security_groups<'a>(
        &'a self,
        project_id: Option<&'a str>,
    ) -> CloudFuture<'a, Vec<SecurityGroup>, Self::Error> {
        Box::pin(async move {
            let project = self.scoped_project(project_id).await?;
            let query: Vec<(&str, &str)> = project
                .as_deref()
                .map(|id| ("project_id", id))
                .into_iter()
                .collect();
            let body: SecurityGroupsEnvelope = self
                .get(Service::Network, &["security-groups"], &query)
                .await?;
            Ok(body
                .security_groups
                .into_iter()
                .map(SecurityGroup::from)
                .collect())
        })
    }

    fn create_security_group<'a>(
        &'a self,
        name: &'a str,
        description: &'a str,
    ) -> CloudFuture<'a, SecurityGroup, Self::Error> {
        Box::pin(async move {
            let payload = CreateSecurityGroup {
                security_group: CreateSecurityGroupBody { name, description },
            };
            let body: SecurityGroupEnvelope = self
                .call(
                    Method::POST,
                    Service::Network,
                    &["security-groups"],
                    &[],
                    Some(&payload),
                )
                .await?;
            Ok(body.security_group.into())
        })
    }

    fn add_security_group_rule<'a>(
        &'a self,
        group_id: &'a str,
        rule: &'a RuleRequest,
    ) -> CloudFuture<'a, (), Self::Error> {
        Box::pin(async move {
            let payload = CreateRule::ingress(group_id, rule);
            let _: IgnoredAny = self
                .call(
                    Method::POST,
                    Service::Network,
                    &["security-group-rules"],
                    &[],
                    Some(&payload),
                )
                .await?;
            Ok(())
        })
    }

    fn list_ports<'a>(&'a self, instance_id: &'a str) -> CloudFuture<'a, Vec<Port>, Self::Error> {
        Box::pin(async move {
            let body: PortsEnvelope = self
                .get(
                    Service::Network,
                    &["ports"],
                    &[("device_id", instance_id)],
                )
                .await?;
            Ok(body.ports.into_iter().map(Port::from).collect())
        })
    }

    fn set_port_security_groups<'a>(
        &'a self,
        port_id: &'a str,
        group_ids: &'a [String],
    ) -> CloudFuture<'a, (), Self::Error> {
        Box::pin(async move {
            let payload = PortSecurityGroups {
                port: PortSecurityGroupsBody {
                    security_groups: group_ids,
                },
            };
            let _: IgnoredAny = self
                .call(
                    Method::PUT,
                    Service::Network,
                    &["ports", port_id],
                    &[],
                    Some(&payload),
                )
                .await?;
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests;
