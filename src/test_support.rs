//! Test support utilities shared across unit and integration tests.

use std::collections::{BTreeMap, VecDeque};
use std::ffi::OsString;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use thiserror::Error;

use crate::cloud::{
    Cloud, CloudFuture, Flavor, FloatingIp, FloatingPool, Image, Instance, InstanceAddress,
    InstanceStatus, Port, RuleRequest, SecurityGroup, ServerCreate,
};
use crate::command::{CommandError, CommandOutput, CommandRunner};

/// Scripted command runner that returns pre-seeded outputs in FIFO order.
///
/// Used to drive deterministic command outcomes without spawning processes.
#[derive(Clone, Debug, Default)]
pub struct ScriptedRunner {
    responses: Arc<Mutex<VecDeque<CommandOutput>>>,
    invocations: Arc<Mutex<Vec<CommandInvocation>>>,
}

/// Records a single invocation made through [`ScriptedRunner`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CommandInvocation {
    /// Program name as passed to the runner.
    pub program: String,
    /// Arguments passed to the program.
    pub args: Vec<OsString>,
}

impl CommandInvocation {
    /// Returns a shell-like command string for assertions.
    #[must_use]
    pub fn command_string(&self) -> String {
        let mut parts = Vec::with_capacity(self.args.len() + 1);
        parts.push(self.program.clone());
        parts.extend(
            self.args
                .iter()
                .map(|arg| arg.to_string_lossy().into_owned()),
        );
        parts.join(" ")
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl ScriptedRunner {
    /// Creates a new runner with no queued responses.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a snapshot of all invocations recorded so far.
    #[must_use]
    pub fn invocations(&self) -> Vec<CommandInvocation> {
        lock(&self.invocations).clone()
    }

    /// Pushes a successful exit status.
    pub fn push_success(&self) {
        self.push_output(Some(0), "", "");
    }

    /// Pushes a specific exit code.
    pub fn push_exit_code(&self, code: i32) {
        self.push_output(Some(code), "", "");
    }

    /// Pushes an explicit command output response.
    pub fn push_output(
        &self,
        code: Option<i32>,
        stdout: impl Into<String>,
        stderr: impl Into<String>,
    ) {
        lock(&self.responses).push_back(CommandOutput {
            code,
            stdout: stdout.into(),
            stderr: stderr.into(),
        });
    }
}

impl CommandRunner for ScriptedRunner {
    fn run(&self, program: &str, args: &[OsString]) -> Result<CommandOutput, CommandError> {
        lock(&self.invocations).push(CommandInvocation {
            program: program.to_owned(),
            args: args.to_vec(),
        });
        lock(&self.responses)
            .pop_front()
            .ok_or_else(|| CommandError::Spawn {
                program: program.to_owned(),
                message: String::from("no scripted response available"),
            })
    }
}

/// Builds an instance with the given private addresses on network `private`.
#[must_use]
pub fn instance(id: &str, name: &str, status: InstanceStatus, fixed: &[&str]) -> Instance {
    let mut addresses = BTreeMap::new();
    if !fixed.is_empty() {
        addresses.insert(
            String::from("private"),
            fixed
                .iter()
                .map(|addr| InstanceAddress::fixed(*addr))
                .collect(),
        );
    }
    Instance {
        id: id.to_owned(),
        name: name.to_owned(),
        status,
        image_id: None,
        addresses,
        security_groups: Vec::new(),
        metadata: BTreeMap::new(),
        project_id: Some(String::from("project")),
    }
}

/// Builds a floating address record.
#[must_use]
pub fn floating_ip(address: &str, port_id: Option<&str>) -> FloatingIp {
    FloatingIp {
        id: format!("fip-{address}"),
        address: address.to_owned(),
        pool: String::from("public"),
        port_id: port_id.map(str::to_owned),
        fixed_address: None,
    }
}

/// Builds a security group without rules.
#[must_use]
pub fn security_group(id: &str, name: &str) -> SecurityGroup {
    SecurityGroup {
        id: id.to_owned(),
        name: name.to_owned(),
        description: name.to_owned(),
        rules: Vec::new(),
    }
}

/// Errors produced by [`FakeCloud`].
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum FakeCloudError {
    /// Requested resource does not exist.
    #[error("{kind} {id} not found")]
    NotFound {
        /// Resource kind.
        kind: String,
        /// Requested identifier.
        id: String,
    },
    /// The pool has no more addresses.
    #[error("no more floating addresses in pool {pool}")]
    PoolExhausted {
        /// Pool that was asked for an address.
        pool: String,
    },
    /// Failure injected by a test.
    #[error("injected failure: {0}")]
    Injected(String),
}

/// Number of calls received by each [`FakeCloud`] operation.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct CallCounts {
    /// `list_images` calls.
    pub list_images: u32,
    /// `list_flavors` calls.
    pub list_flavors: u32,
    /// `create_server` calls.
    pub create_server: u32,
    /// `get_server` calls.
    pub get_server: u32,
    /// `list_floating_ips` calls.
    pub list_floating_ips: u32,
    /// `allocate_floating_ip` calls.
    pub allocate_floating_ip: u32,
    /// `associate_floating_ip` calls.
    pub associate_floating_ip: u32,
    /// `list_security_groups` calls.
    pub list_security_groups: u32,
    /// `create_security_group` calls.
    pub create_security_group: u32,
    /// `add_security_group_rule` calls.
    pub add_security_group_rule: u32,
    /// `set_port_security_groups` calls.
    pub set_port_security_groups: u32,
}

impl CallCounts {
    /// Total number of calls that change control-plane state.
    #[must_use]
    pub const fn mutations(&self) -> u32 {
        self.create_server
            + self.allocate_floating_ip
            + self.associate_floating_ip
            + self.create_security_group
            + self.add_security_group_rule
            + self.set_port_security_groups
    }
}

#[derive(Debug, Default)]
struct FakeState {
    images: Vec<Image>,
    flavors: Vec<Flavor>,
    servers: BTreeMap<String, Instance>,
    server_order: Vec<String>,
    status_scripts: BTreeMap<String, VecDeque<(InstanceStatus, Vec<String>)>>,
    boot_script: Vec<(InstanceStatus, Vec<String>)>,
    floating_ips: Vec<FloatingIp>,
    pools: Vec<FloatingPool>,
    allocatable: VecDeque<String>,
    allocation_failure: Option<FakeCloudError>,
    security_groups: Vec<SecurityGroup>,
    ports: Vec<Port>,
    created: Vec<ServerCreate>,
    rules: Vec<(String, RuleRequest)>,
    calls: CallCounts,
}

/// In-memory control plane recording every call it receives.
#[derive(Clone, Debug, Default)]
pub struct FakeCloud {
    state: Arc<Mutex<FakeState>>,
}

impl FakeCloud {
    /// Creates an empty fake cloud.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, FakeState> {
        lock(&self.state)
    }

    /// Adds an image to the listing.
    pub fn add_image(&self, id: &str, name: &str) {
        self.state().images.push(Image {
            id: id.to_owned(),
            name: name.to_owned(),
        });
    }

    /// Adds a flavor to the listing.
    pub fn add_flavor(&self, id: &str, name: &str) {
        self.state().flavors.push(Flavor {
            id: id.to_owned(),
            name: name.to_owned(),
        });
    }

    /// Adds a floating-address pool.
    pub fn add_pool(&self, id: &str, name: &str) {
        self.state().pools.push(FloatingPool {
            id: id.to_owned(),
            name: name.to_owned(),
        });
    }

    /// Adds an already allocated floating address.
    pub fn add_floating_ip(&self, ip: FloatingIp) {
        self.state().floating_ips.push(ip);
    }

    /// Queues the address handed out by the next allocation.
    pub fn queue_allocation(&self, address: &str) {
        self.state().allocatable.push_back(address.to_owned());
    }

    /// Makes every subsequent allocation fail with `error`.
    pub fn fail_allocations(&self, error: FakeCloudError) {
        self.state().allocation_failure = Some(error);
    }

    /// Adds a security group.
    pub fn add_security_group(&self, group: SecurityGroup) {
        self.state().security_groups.push(group);
    }

    /// Adds a network port.
    pub fn add_port(&self, port: Port) {
        self.state().ports.push(port);
    }

    /// Registers an existing instance.
    pub fn add_server(&self, instance: Instance) {
        let mut state = self.state();
        state.server_order.push(instance.id.clone());
        state.servers.insert(instance.id.clone(), instance);
    }

    /// Scripts the `(status, private addresses)` snapshots returned by
    /// successive `get_server` calls for `id`; the last one repeats.
    pub fn script_server(&self, id: &str, steps: &[(InstanceStatus, &[&str])]) {
        let queue = steps
            .iter()
            .map(|(status, addrs)| {
                (
                    status.clone(),
                    addrs.iter().map(|addr| (*addr).to_owned()).collect(),
                )
            })
            .collect();
        self.state().status_scripts.insert(id.to_owned(), queue);
    }

    /// Scripts the snapshots of every instance created afterwards.
    pub fn script_boot(&self, steps: &[(InstanceStatus, &[&str])]) {
        self.state().boot_script = steps
            .iter()
            .map(|(status, addrs)| {
                (
                    status.clone(),
                    addrs.iter().map(|addr| (*addr).to_owned()).collect(),
                )
            })
            .collect();
    }

    /// Returns the call counters.
    #[must_use]
    pub fn calls(&self) -> CallCounts {
        self.state().calls.clone()
    }

    /// Returns every create-instance request received.
    #[must_use]
    pub fn created(&self) -> Vec<ServerCreate> {
        self.state().created.clone()
    }

    /// Returns every rule appended, with its group id.
    #[must_use]
    pub fn rules(&self) -> Vec<(String, RuleRequest)> {
        self.state().rules.clone()
    }

    /// Returns the current floating addresses.
    #[must_use]
    pub fn floating_ips(&self) -> Vec<FloatingIp> {
        self.state().floating_ips.clone()
    }

    /// Returns the current ports.
    #[must_use]
    pub fn ports(&self) -> Vec<Port> {
        self.state().ports.clone()
    }

    /// Returns the security groups.
    #[must_use]
    pub fn security_groups(&self) -> Vec<SecurityGroup> {
        self.state().security_groups.clone()
    }
}

fn ready<'a, T: Send + 'a>(value: Result<T, FakeCloudError>) -> CloudFuture<'a, T, FakeCloudError> {
    Box::pin(async move { value })
}

fn apply_step(instance: &mut Instance, status: InstanceStatus, addrs: &[String]) {
    instance.status = status;
    let floating: Vec<InstanceAddress> = instance
        .addresses
        .values()
        .flatten()
        .filter(|address| address.kind == crate::cloud::AddressKind::Floating)
        .cloned()
        .collect();
    instance.addresses.clear();
    if addrs.is_empty() && floating.is_empty() {
        return;
    }
    let mut list: Vec<InstanceAddress> = addrs.iter().map(InstanceAddress::fixed).collect();
    list.extend(floating);
    instance.addresses.insert(String::from("private"), list);
}

impl Cloud for FakeCloud {
    type Error = FakeCloudError;

    fn list_images(&self) -> CloudFuture<'_, Vec<Image>, Self::Error> {
        let mut state = self.state();
        state.calls.list_images += 1;
        ready(Ok(state.images.clone()))
    }

    fn get_image<'a>(&'a self, id: &'a str) -> CloudFuture<'a, Image, Self::Error> {
        let state = self.state();
        let found = state
            .images
            .iter()
            .find(|image| image.id == id)
            .cloned()
            .ok_or_else(|| FakeCloudError::NotFound {
                kind: String::from("image"),
                id: id.to_owned(),
            });
        ready(found)
    }

    fn list_flavors(&self) -> CloudFuture<'_, Vec<Flavor>, Self::Error> {
        let mut state = self.state();
        state.calls.list_flavors += 1;
        ready(Ok(state.flavors.clone()))
    }

    fn create_server<'a>(
        &'a self,
        request: &'a ServerCreate,
    ) -> CloudFuture<'a, Instance, Self::Error> {
        let mut state = self.state();
        state.calls.create_server += 1;
        state.created.push(request.clone());
        let id = format!("server-{}", state.calls.create_server);

        let mut created = instance(&id, &request.name, InstanceStatus::Build, &[]);
        created.image_id = Some(request.image_id.clone());
        created.metadata = request.metadata.clone();

        let script: VecDeque<_> = state.boot_script.iter().cloned().collect();
        let fixed: Vec<String> = script
            .back()
            .map(|(_, addrs)| addrs.clone())
            .unwrap_or_default();
        state.status_scripts.insert(id.clone(), script);
        state.ports.push(Port {
            id: format!("{id}-port"),
            device_id: id.clone(),
            fixed_addresses: fixed,
            security_groups: vec![String::from("default")],
        });
        state.server_order.push(id.clone());
        state.servers.insert(id, created.clone());
        ready(Ok(created))
    }

    fn get_server<'a>(&'a self, id: &'a str) -> CloudFuture<'a, Instance, Self::Error> {
        let mut guard = self.state();
        let state = &mut *guard;
        state.calls.get_server += 1;

        let step = state.status_scripts.get_mut(id).and_then(|queue| {
            if queue.len() > 1 {
                queue.pop_front()
            } else {
                queue.front().cloned()
            }
        });
        let Some(server) = state.servers.get_mut(id) else {
            return ready(Err(FakeCloudError::NotFound {
                kind: String::from("server"),
                id: id.to_owned(),
            }));
        };
        if let Some((status, addrs)) = step {
            apply_step(server, status, &addrs);
        }
        ready(Ok(server.clone()))
    }

    fn list_servers(&self) -> CloudFuture<'_, Vec<Instance>, Self::Error> {
        let state = self.state();
        let servers = state
            .server_order
            .iter()
            .filter_map(|id| state.servers.get(id).cloned())
            .collect();
        ready(Ok(servers))
    }

    fn list_floating_ips(&self) -> CloudFuture<'_, Vec<FloatingIp>, Self::Error> {
        let mut state = self.state();
        state.calls.list_floating_ips += 1;
        ready(Ok(state.floating_ips.clone()))
    }

    fn list_floating_pools(&self) -> CloudFuture<'_, Vec<FloatingPool>, Self::Error> {
        ready(Ok(self.state().pools.clone()))
    }

    fn allocate_floating_ip<'a>(
        &'a self,
        pool: &'a FloatingPool,
    ) -> CloudFuture<'a, FloatingIp, Self::Error> {
        let mut state = self.state();
        state.calls.allocate_floating_ip += 1;
        if let Some(error) = state.allocation_failure.clone() {
            return ready(Err(error));
        }
        let address = state.allocatable.pop_front().unwrap_or_else(|| {
            format!("203.0.113.{}", state.calls.allocate_floating_ip)
        });
        let ip = FloatingIp {
            id: format!("fip-{address}"),
            address,
            pool: pool.id.clone(),
            port_id: None,
            fixed_address: None,
        };
        state.floating_ips.push(ip.clone());
        ready(Ok(ip))
    }

    fn associate_floating_ip<'a>(
        &'a self,
        ip: &'a FloatingIp,
        instance: &'a Instance,
        fixed_address: &'a str,
    ) -> CloudFuture<'a, (), Self::Error> {
        let mut guard = self.state();
        let state = &mut *guard;
        state.calls.associate_floating_ip += 1;

        let port_id = state
            .ports
            .iter()
            .find(|port| port.device_id == instance.id)
            .map_or_else(|| format!("{}-port", instance.id), |port| port.id.clone());
        let Some(record) = state
            .floating_ips
            .iter_mut()
            .find(|record| record.id == ip.id)
        else {
            return ready(Err(FakeCloudError::NotFound {
                kind: String::from("floating ip"),
                id: ip.id.clone(),
            }));
        };
        record.port_id = Some(port_id);
        record.fixed_address = Some(fixed_address.to_owned());

        if let Some(server) = state.servers.get_mut(&instance.id) {
            server
                .addresses
                .entry(String::from("private"))
                .or_default()
                .push(InstanceAddress::floating(ip.address.clone()));
        }
        ready(Ok(()))
    }

    fn list_security_groups<'a>(
        &'a self,
        _project_id: Option<&'a str>,
    ) -> CloudFuture<'a, Vec<SecurityGroup>, Self::Error> {
        let mut state = self.state();
        state.calls.list_security_groups += 1;
        ready(Ok(state.security_groups.clone()))
    }

    fn create_security_group<'a>(
        &'a self,
        name: &'a str,
        description: &'a str,
    ) -> CloudFuture<'a, SecurityGroup, Self::Error> {
        let mut state = self.state();
        state.calls.create_security_group += 1;
        let group = SecurityGroup {
            id: format!("sg-{}", state.security_groups.len() + 1),
            name: name.to_owned(),
            description: description.to_owned(),
            rules: Vec::new(),
        };
        state.security_groups.push(group.clone());
        ready(Ok(group))
    }

    fn add_security_group_rule<'a>(
        &'a self,
        group_id: &'a str,
        rule: &'a RuleRequest,
    ) -> CloudFuture<'a, (), Self::Error> {
        let mut state = self.state();
        state.calls.add_security_group_rule += 1;
        state.rules.push((group_id.to_owned(), rule.clone()));
        if let Some(group) = state
            .security_groups
            .iter_mut()
            .find(|group| group.id == group_id)
        {
            group.rules.push(crate::cloud::SecurityGroupRule {
                protocol: Some(rule.protocol.clone()),
                from_port: Some(rule.from_port),
                to_port: Some(rule.to_port),
                cidr: Some(rule.cidr.clone()),
            });
        }
        ready(Ok(()))
    }

    fn list_ports<'a>(&'a self, instance_id: &'a str) -> CloudFuture<'a, Vec<Port>, Self::Error> {
        let ports = self
            .state()
            .ports
            .iter()
            .filter(|port| port.device_id == instance_id)
            .cloned()
            .collect();
        ready(Ok(ports))
    }

    fn set_port_security_groups<'a>(
        &'a self,
        port_id: &'a str,
        group_ids: &'a [String],
    ) -> CloudFuture<'a, (), Self::Error> {
        let mut state = self.state();
        state.calls.set_port_security_groups += 1;
        let Some(port) = state.ports.iter_mut().find(|port| port.id == port_id) else {
            return ready(Err(FakeCloudError::NotFound {
                kind: String::from("port"),
                id: port_id.to_owned(),
            }));
        };
        port.security_groups = group_ids.to_vec();
        ready(Ok(()))
    }
}
