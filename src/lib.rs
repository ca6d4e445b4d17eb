//! Core library for the `novaspawn` OpenStack provisioning tool.
//!
//! The crate exposes a control-plane abstraction ([`Cloud`]) with an OpenStack
//! implementation, and the workflow built on top of it: resolve an image and
//! flavor, launch an instance, wait until it has an address, bind a floating
//! address and security groups, then hand it to `ansible-playbook` once SSH
//! answers.

pub mod binder;
pub mod boot;
pub mod cloud;
pub mod command;
pub mod config;
pub mod floating;
pub mod inventory;
pub mod launch;
pub mod logging;
pub mod openstack;
pub mod poll;
pub mod provision;
pub mod readiness;
pub mod resolver;
pub mod secgroup;
pub mod settings;
pub mod spawn;
pub mod ssh;
pub mod test_support;
pub mod user_data;

pub use binder::{BindError, Binder};
pub use boot::{BootError, BootOrchestrator, BootOutcome, BootRequest, BootSettings};
pub use cloud::{Cloud, CloudFuture, Instance, InstanceStatus};
pub use command::{
    CommandError, CommandOutput, CommandRunner, InheritedCommandRunner, ProcessCommandRunner,
};
pub use config::{ConfigError, OpenStackConfig};
pub use floating::{FloatingAddresses, FloatingError};
pub use inventory::{CacheError, CacheStore, InventoryError};
pub use launch::{LaunchError, LaunchRequest, Launcher, MetadataError};
pub use openstack::{OpenStackClient, OpenStackError, SessionPolicy};
pub use poll::{PollPolicy, PollStop, Poller};
pub use provision::PlaybookRunner;
pub use readiness::{ReadinessError, ReadinessPoller};
pub use resolver::{MatchMode, ResolveError, ResourceKind};
pub use secgroup::{SecurityGroupError, SecurityGroupManager, SecurityGroupRequest};
pub use settings::OperatorConfig;
pub use spawn::{SpawnError, SpawnOrchestrator, SpawnOutcome, SpawnRequest};
pub use ssh::{RemoteShell, ShellSettings, SshError, SshHelper, SshTarget};
pub use user_data::{UserDataError, load_user_data};
