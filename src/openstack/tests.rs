//! Unit tests for URL handling and wire conversion.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use rstest::{fixture, rstest};
use serde_json::json;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use super::auth::{AuthRequest, CatalogEntry, Service, endpoints_from_catalog, token_url};
use super::wire::{
    CreateRule, CreateServerEnvelope, FloatingIpBody, PortBody, SecurityGroupBody, ServerBody,
    next_page_url,
};
use super::*;
use crate::cloud::{AddressKind, InstanceStatus};

#[fixture]
fn identity() -> OpenStackConfig {
    OpenStackConfig {
        auth_url: String::from("https://keystone.example.test:5000/v3"),
        username: String::from("alice"),
        password: String::from("secret"),
        tenant_name: String::from("research"),
        tenant_id: None,
        user_domain_name: String::from("Default"),
        project_domain_name: String::from("Default"),
        region_name: None,
        interface: String::from("public"),
    }
}

#[rstest]
#[case("https://id.test:5000/v3", "https://id.test:5000/v3/auth/tokens")]
#[case("https://id.test:5000/v3/", "https://id.test:5000/v3/auth/tokens")]
#[case("https://id.test:5000/v2.0", "https://id.test:5000/v3/auth/tokens")]
#[case("https://id.test:5000", "https://id.test:5000/v3/auth/tokens")]
#[case("https://id.test/v3/auth/tokens", "https://id.test/v3/auth/tokens")]
fn token_url_normalises_identity_endpoint(#[case] auth_url: &str, #[case] expected: &str) {
    assert_eq!(token_url(auth_url), expected);
}

#[rstest]
fn auth_request_scopes_by_name_or_id(mut identity: OpenStackConfig) {
    let by_name = serde_json::to_value(AuthRequest::password(&identity)).expect("serialise");
    assert_eq!(
        by_name.pointer("/auth/scope/project/name"),
        Some(&json!("research"))
    );
    assert_eq!(
        by_name.pointer("/auth/identity/password/user/domain/name"),
        Some(&json!("Default"))
    );

    identity.tenant_id = Some(String::from("p-123"));
    let by_id = serde_json::to_value(AuthRequest::password(&identity)).expect("serialise");
    assert_eq!(by_id.pointer("/auth/scope/project/id"), Some(&json!("p-123")));
    assert_eq!(by_id.pointer("/auth/scope/project/name"), None);
}

fn catalog() -> Vec<CatalogEntry> {
    serde_json::from_value(json!([
        {"type": "compute", "endpoints": [
            {"interface": "internal", "region_id": "one", "url": "http://nova.internal/v2.1"},
            {"interface": "public", "region_id": "one", "url": "https://nova.one/v2.1/"},
            {"interface": "public", "region_id": "two", "url": "https://nova.two/v2.1"}
        ]},
        {"type": "image", "endpoints": [
            {"interface": "public", "region": "two", "url": "https://glance.two"}
        ]},
        {"type": "network", "endpoints": [
            {"interface": "public", "region_id": "two", "url": "https://neutron.two/v2.0"}
        ]}
    ]))
    .expect("catalog parses")
}

#[rstest]
fn catalog_lookup_honours_interface_and_region() {
    let endpoints = endpoints_from_catalog(&catalog(), "public", Some("two")).expect("complete");
    assert_eq!(endpoints.compute, "https://nova.two/v2.1");
    assert_eq!(endpoints.image, "https://glance.two/v2");
    assert_eq!(endpoints.network, "https://neutron.two/v2.0");
    let url = endpoints
        .url(Service::Network, &["floatingips"], &[])
        .expect("endpoint is a URL");
    assert_eq!(url.as_str(), "https://neutron.two/v2.0/floatingips");
}

#[rstest]
fn catalog_without_service_is_reported() {
    let err = endpoints_from_catalog(&catalog(), "internal", None).expect_err("image is missing");
    assert_eq!(
        err,
        OpenStackError::MissingEndpoint {
            service: String::from("image"),
            interface: String::from("internal"),
        }
    );
}

#[rstest]
#[case("https://glance.test/v2", "/v2/images?marker=abc", "https://glance.test/v2/images?marker=abc")]
#[case(
    "https://cloud.test/image/v2/",
    "/v2/images?marker=abc",
    "https://cloud.test/image/v2/images?marker=abc"
)]
#[case(
    "https://glance.test/v2",
    "https://other.test/v2/images?marker=abc",
    "https://other.test/v2/images?marker=abc"
)]
fn image_pages_follow_next_links(#[case] endpoint: &str, #[case] next: &str, #[case] expected: &str) {
    let url = next_page_url(endpoint, next).expect("link resolves");
    assert_eq!(url.as_str(), expected);
}

#[rstest]
#[case(&["servers", "a b/c"], &[], "https://nova.test/v2.1/servers/a%20b%2Fc")]
#[case(&["ports"], &[("device_id", "srv 1")], "https://nova.test/v2.1/ports?device_id=srv+1")]
#[case(
    &["networks"],
    &[("router:external", "true")],
    "https://nova.test/v2.1/networks?router%3Aexternal=true"
)]
fn endpoint_urls_encode_segments_and_queries(
    #[case] segments: &[&str],
    #[case] query: &[(&str, &str)],
    #[case] expected: &str,
) {
    let endpoints = super::auth::Endpoints {
        compute: String::from("https://nova.test/v2.1/"),
        image: String::from("https://glance.test/v2"),
        network: String::from("https://neutron.test/v2.0"),
    };
    let url = endpoints
        .url(Service::Compute, segments, query)
        .expect("endpoint is a URL");
    assert_eq!(url.as_str(), expected);
}

#[rstest]
fn server_body_maps_addresses_and_image() {
    let body: ServerBody = serde_json::from_value(json!({
        "id": "srv-1",
        "name": "web-1",
        "status": "ACTIVE",
        "image": {"id": "img-9", "links": []},
        "tenant_id": "proj-1",
        "security_groups": [{"name": "default"}, {"name": "default"}, {"name": "web"}],
        "metadata": {"groups": "web"},
        "addresses": {"private": [
            {"addr": "10.0.0.5", "version": 4, "OS-EXT-IPS:type": "fixed"},
            {"addr": "198.51.100.7", "version": 4, "OS-EXT-IPS:type": "floating"}
        ]}
    }))
    .expect("server parses");

    let instance = Instance::from(body);
    assert_eq!(instance.status, InstanceStatus::Active);
    assert_eq!(instance.image_id.as_deref(), Some("img-9"));
    assert_eq!(instance.first_fixed_address(), Some("10.0.0.5"));
    assert_eq!(instance.first_floating_address(), Some("198.51.100.7"));
    assert_eq!(instance.security_groups, vec!["default", "web"]);
    assert_eq!(instance.project_id.as_deref(), Some("proj-1"));
}

#[rstest]
fn volume_backed_server_has_no_image() {
    let body: ServerBody = serde_json::from_value(json!({
        "id": "srv-2",
        "name": "vol",
        "status": "BUILD",
        "image": "",
        "addresses": {"private": [{"addr": "10.0.0.6"}]}
    }))
    .expect("server parses");

    let instance = Instance::from(body);
    assert_eq!(instance.image_id, None);
    assert_eq!(
        instance.addresses_of(AddressKind::Fixed).collect::<Vec<_>>(),
        vec!["10.0.0.6"]
    );
}

#[rstest]
fn create_server_encodes_user_data() {
    let request = ServerCreate {
        name: String::from("vm-1"),
        image_id: String::from("img-1"),
        flavor_id: String::from("flv-1"),
        key_name: String::from("ops"),
        user_data: Some(String::from("#cloud-config\n")),
        metadata: BTreeMap::from([(String::from("groups"), String::from("web"))]),
    };

    let body = serde_json::to_value(CreateServerEnvelope::from(&request)).expect("serialise");
    assert_eq!(body.pointer("/server/imageRef"), Some(&json!("img-1")));
    assert_eq!(body.pointer("/server/flavorRef"), Some(&json!("flv-1")));
    assert_eq!(
        body.pointer("/server/user_data"),
        Some(&json!("I2Nsb3VkLWNvbmZpZwo="))
    );
    assert_eq!(body.pointer("/server/metadata/groups"), Some(&json!("web")));
}

#[rstest]
fn network_bodies_map_to_domain_types() {
    let ip: FloatingIpBody = serde_json::from_value(json!({
        "id": "fip-1",
        "floating_ip_address": "203.0.113.4",
        "floating_network_id": "net-ext",
        "port_id": null,
        "fixed_ip_address": null
    }))
    .expect("floating ip parses");
    let ip = FloatingIp::from(ip);
    assert!(ip.is_free());
    assert_eq!(ip.pool, "net-ext");

    let port: PortBody = serde_json::from_value(json!({
        "id": "port-1",
        "device_id": "srv-1",
        "fixed_ips": [{"subnet_id": "sn", "ip_address": "10.0.0.5"}],
        "security_groups": ["sg-1"]
    }))
    .expect("port parses");
    assert_eq!(Port::from(port).fixed_addresses, vec!["10.0.0.5"]);
}

#[rstest]
fn security_groups_keep_ingress_rules_only() {
    let body: SecurityGroupBody = serde_json::from_value(json!({
        "id": "sg-1",
        "name": "web",
        "description": null,
        "security_group_rules": [
            {"direction": "egress", "protocol": null, "port_range_min": null,
             "port_range_max": null, "remote_ip_prefix": null},
            {"direction": "ingress", "protocol": "tcp", "port_range_min": 20,
             "port_range_max": 25, "remote_ip_prefix": "0.0.0.0/0"}
        ]
    }))
    .expect("group parses");

    let group = SecurityGroup::from(body);
    assert_eq!(group.description, "");
    assert_eq!(group.rules.len(), 1);
    assert!(group.rules.iter().any(|rule| rule.covers(22)));
}

#[rstest]
fn rule_requests_are_ipv4_ingress() {
    let rule = RuleRequest {
        protocol: String::from("tcp"),
        from_port: 443,
        to_port: 443,
        cidr: String::from("198.51.100.0/24"),
    };
    let body = serde_json::to_value(CreateRule::ingress("sg-1", &rule)).expect("serialise");
    assert_eq!(
        body,
        json!({"security_group_rule": {
            "security_group_id": "sg-1",
            "direction": "ingress",
            "ethertype": "IPv4",
            "protocol": "tcp",
            "port_range_min": 443,
            "port_range_max": 443,
            "remote_ip_prefix": "198.51.100.0/24"
        }})
    );
}

#[rstest]
fn project_clients_start_without_a_session(identity: OpenStackConfig) {
    let client = OpenStackClient::new(identity, SessionPolicy::Reuse).expect("valid config");
    let other = client.for_project("finance");
    assert_eq!(other.config().tenant_name, "finance");
    assert!(other.session.try_lock().is_ok_and(|slot| slot.is_none()));
}

#[rstest]
fn invalid_identity_is_rejected(mut identity: OpenStackConfig) {
    identity.password = String::new();
    let err = OpenStackClient::new(identity, SessionPolicy::from_reuse(false))
        .expect_err("password is required");
    assert!(matches!(err, OpenStackError::Config(ref msg) if msg.contains("OS_PASSWORD")));
}

/// Keystone, Nova, Glance and Neutron stand-in answering one request per
/// connection. Tokens `tok-1` to `tok-<expired>` are rejected with `401`.
struct StubCloud {
    base: String,
    issued: Arc<AtomicUsize>,
    requests: Arc<StdMutex<Vec<String>>>,
}

impl StubCloud {
    async fn start(expired: usize) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind stub");
        let base = format!("http://{}", listener.local_addr().expect("stub address"));
        let stub = Self {
            base: base.clone(),
            issued: Arc::new(AtomicUsize::new(0)),
            requests: Arc::new(StdMutex::new(Vec::new())),
        };
        let issued = Arc::clone(&stub.issued);
        let requests = Arc::clone(&stub.requests);
        drop(tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let root = base.clone();
                let issued_by_conn = Arc::clone(&issued);
                let requests_by_conn = Arc::clone(&requests);
                drop(tokio::spawn(async move {
                    answer(stream, &root, expired, &issued_by_conn, &requests_by_conn).await;
                }));
            }
        }));
        stub
    }

    fn identity(&self) -> OpenStackConfig {
        OpenStackConfig {
            auth_url: format!("{}/v3", self.base),
            username: String::from("alice"),
            password: String::from("secret"),
            tenant_name: String::from("research"),
            tenant_id: None,
            user_domain_name: String::from("Default"),
            project_domain_name: String::from("Default"),
            region_name: None,
            interface: String::from("public"),
        }
    }

    fn client(&self) -> OpenStackClient {
        OpenStackClient::new(self.identity(), SessionPolicy::Reuse).expect("valid config")
    }

    fn tokens_issued(&self) -> usize {
        self.issued.load(Ordering::SeqCst)
    }

    fn requests(&self) -> Vec<String> {
        self.requests.lock().expect("requests lock").clone()
    }
}

fn header<'a>(head: &'a str, name: &str) -> Option<&'a str> {
    head.lines()
        .filter_map(|line| line.split_once(':'))
        .find(|(key, _)| key.trim().eq_ignore_ascii_case(name))
        .map(|(_, value)| value.trim())
}

async fn read_head(stream: &mut TcpStream) -> Option<String> {
    let mut buf = Vec::new();
    let mut chunk = [0_u8; 1024];
    let head_end = loop {
        let read = stream.read(&mut chunk).await.ok()?;
        if read == 0 {
            return None;
        }
        buf.extend_from_slice(chunk.get(..read)?);
        if let Some(pos) = buf.windows(4).position(|window| window == b"\r\n\r\n") {
            break pos + 4;
        }
    };
    let head = String::from_utf8_lossy(buf.get(..head_end)?).into_owned();
    let length: usize = header(&head, "content-length")
        .and_then(|value| value.parse().ok())
        .unwrap_or(0);
    while buf.len() < head_end + length {
        let read = stream.read(&mut chunk).await.ok()?;
        if read == 0 {
            break;
        }
        buf.extend_from_slice(chunk.get(..read)?);
    }
    Some(head)
}

fn reply(status: &str, token: Option<&str>, body: &str) -> String {
    let mut out = format!(
        "HTTP/1.1 {status}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n",
        body.len()
    );
    if let Some(value) = token {
        out.push_str(&format!("X-Subject-Token: {value}\r\n"));
    }
    out.push_str("\r\n");
    out.push_str(body);
    out
}

fn catalog_body(root: &str) -> String {
    json!({"token": {
        "project": {"id": "p-1"},
        "catalog": [
            {"type": "compute", "endpoints": [{"interface": "public", "url": format!("{root}/compute")}]},
            {"type": "image", "endpoints": [{"interface": "public", "url": format!("{root}/image")}]},
            {"type": "network", "endpoints": [{"interface": "public", "url": format!("{root}/network")}]}
        ]
    }})
    .to_string()
}

async fn answer(
    mut stream: TcpStream,
    root: &str,
    expired: usize,
    issued: &AtomicUsize,
    requests: &StdMutex<Vec<String>>,
) {
    let Some(head) = read_head(&mut stream).await else {
        return;
    };
    let mut request_line = head.lines().next().unwrap_or_default().split_whitespace();
    let method = request_line.next().unwrap_or_default();
    let target = request_line.next().unwrap_or_default();
    requests
        .lock()
        .expect("requests lock")
        .push(format!("{method} {target}"));

    let token_number: usize = header(&head, "x-auth-token")
        .and_then(|token| token.strip_prefix("tok-"))
        .and_then(|number| number.parse().ok())
        .unwrap_or(0);
    let response = if target == "/v3/auth/tokens" {
        let number = issued.fetch_add(1, Ordering::SeqCst) + 1;
        reply("201 Created", Some(&format!("tok-{number}")), &catalog_body(root))
    } else if token_number <= expired {
        reply("401 Unauthorized", None, r#"{"error": {"code": 401}}"#)
    } else if target == "/compute/servers/detail" {
        reply(
            "200 OK",
            None,
            r#"{"servers": [{"id": "srv-1", "name": "web-1", "status": "ACTIVE"}]}"#,
        )
    } else if target == "/image/v2/images" {
        reply(
            "200 OK",
            None,
            r#"{"images": [{"id": "img-1", "name": "a"}], "next": "/v2/images?marker=img-1"}"#,
        )
    } else if target == "/image/v2/images?marker=img-1" {
        reply("200 OK", None, r#"{"images": [{"id": "img-2", "name": "b"}]}"#)
    } else {
        reply("404 Not Found", None, "{}")
    };
    stream.write_all(response.as_bytes()).await.ok();
    stream.shutdown().await.ok();
}

#[tokio::test]
async fn reused_token_is_kept_across_calls() {
    let stub = StubCloud::start(0).await;
    let client = stub.client();

    client.list_servers().await.expect("first listing");
    client.list_servers().await.expect("second listing");

    assert_eq!(stub.tokens_issued(), 1);
}

#[tokio::test]
async fn rejected_token_is_renewed_and_the_call_retried() {
    let stub = StubCloud::start(1).await;
    let client = stub.client();

    let servers = client.list_servers().await.expect("retry succeeds");

    assert_eq!(servers.len(), 1);
    assert_eq!(stub.tokens_issued(), 2);
    assert_eq!(
        stub.requests(),
        vec![
            "POST /v3/auth/tokens",
            "GET /compute/servers/detail",
            "POST /v3/auth/tokens",
            "GET /compute/servers/detail",
        ]
    );
}

#[tokio::test]
async fn second_rejection_is_returned_to_the_caller() {
    let stub = StubCloud::start(usize::MAX).await;
    let client = stub.client();

    let err = client.list_servers().await.expect_err("fresh token rejected too");

    assert!(err.is_unauthorized(), "unexpected error: {err}");
    assert_eq!(stub.tokens_issued(), 2);
}

#[tokio::test]
async fn image_listing_follows_every_page() {
    let stub = StubCloud::start(0).await;

    let images = stub.client().list_images().await.expect("both pages");

    let ids: Vec<&str> = images.iter().map(|image| image.id.as_str()).collect();
    assert_eq!(ids, vec!["img-1", "img-2"]);
}
