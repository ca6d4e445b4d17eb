//! Command-line interface definitions for the `novaspawn` binary.
//!
//! This module centralises the clap parser structures so both the main binary
//! and the build script can reuse them when generating the manual page.

use clap::{Args, Parser, Subcommand};

/// Top-level CLI for the `novaspawn` binary.
#[derive(Debug, Parser)]
#[command(
    name = "novaspawn",
    about = "Boot OpenStack instances, bind floating addresses, and hand them to Ansible",
    arg_required_else_help = true
)]
pub(crate) enum Cli {
    /// Boot an instance and bind a floating address to it.
    #[command(name = "boot", about = "Boot an instance and bind a floating address to it")]
    Boot(LaunchArgs),
    /// Boot an instance and provision it with a playbook.
    #[command(name = "spawn", about = "Boot an instance and provision it with a playbook")]
    Spawn(SpawnCommand),
    /// Connect to, copy files to or from, or probe an instance over SSH.
    #[command(name = "ssh", about = "Connect to an instance over SSH")]
    Ssh(SshCommand),
    /// Create a security group or add TCP ingress rules to one.
    #[command(name = "secgroup", about = "Add TCP ingress rules to a security group")]
    Secgroup(SecgroupCommand),
    /// Build or read the local inventory cache.
    #[command(subcommand, about = "Build or read the inventory cache")]
    Cache(CacheCommand),
}

/// Arguments shared by `boot` and `spawn`.
#[derive(Clone, Debug, Default, Args)]
pub(crate) struct LaunchArgs {
    /// Instance name; generated when omitted.
    #[arg(short = 'n', long, value_name = "NAME")]
    pub(crate) name: Option<String>,
    /// Image name or UUID; defaults to `default_image`.
    #[arg(short = 'i', long, value_name = "IMAGE")]
    pub(crate) image: Option<String>,
    /// Flavor name or UUID; defaults to `default_flavor`.
    #[arg(short = 'f', long, value_name = "FLAVOR")]
    pub(crate) flavor: Option<String>,
    /// File holding cloud-init user data.
    #[arg(short = 'u', long = "userdata", value_name = "FILE")]
    pub(crate) user_data: Option<String>,
    /// Resolve and validate only; change nothing.
    #[arg(short = 't', long = "test")]
    pub(crate) dry_run: bool,
    /// Security groups applied once the instance is up.
    #[arg(short = 's', long = "secgroups", value_name = "GROUP", num_args = 1..)]
    pub(crate) security_groups: Vec<String>,
    /// Metadata as a JSON object of strings, at most five entries.
    #[arg(short = 'm', long = "meta", value_name = "JSON")]
    pub(crate) metadata: Option<String>,
    /// Host groups recorded under the `groups` metadata key.
    #[arg(short = 'g', long, value_name = "GROUP", num_args = 1..)]
    pub(crate) groups: Vec<String>,
    /// Floating address, or a hostname resolving to one, to bind.
    #[arg(short = 'a', long = "floating-ip", value_name = "ADDR")]
    pub(crate) floating_ip: Option<String>,
}

/// Arguments for the `novaspawn spawn` subcommand.
#[derive(Debug, Args)]
pub(crate) struct SpawnCommand {
    /// Playbook applied to the new instance.
    #[arg(short = 'p', long, value_name = "FILE")]
    pub(crate) playbook: String,
    #[command(flatten)]
    pub(crate) launch: LaunchArgs,
}

/// Arguments for the `novaspawn ssh` subcommand.
#[derive(Debug, Args)]
pub(crate) struct SshCommand {
    /// Instance name or UUID; partial names match.
    #[arg(value_name = "INSTANCE")]
    pub(crate) instance: String,
    /// Login user; derived from the image when omitted.
    #[arg(short = 'u', long, value_name = "USER")]
    pub(crate) user: Option<String>,
    /// Copy a local file to the login user's home directory.
    #[arg(short = 'l', long, value_name = "FILE", conflicts_with = "download")]
    pub(crate) upload: Option<String>,
    /// Copy a remote file into the current directory.
    #[arg(short = 'd', long, value_name = "REMOTE_FILE", conflicts_with = "upload")]
    pub(crate) download: Option<String>,
    /// Print the DNS name of every matching instance.
    #[arg(short = 'p', long = "print-hostname")]
    pub(crate) print_hostname: bool,
    /// Fail unless a security group opens TCP port 22.
    #[arg(short = 's', long = "sshcheck")]
    pub(crate) ssh_check: bool,
    /// Probe reachability once and exit with its result.
    #[arg(short = 't', long = "test")]
    pub(crate) test: bool,
}

/// Arguments for the `novaspawn secgroup` subcommand.
#[derive(Debug, Args)]
pub(crate) struct SecgroupCommand {
    /// Security group name.
    #[arg(short = 'n', long, value_name = "NAME")]
    pub(crate) name: String,
    /// Create the group before adding rules.
    #[arg(short = 'c', long)]
    pub(crate) create: bool,
    /// TCP ports to open.
    #[arg(short = 'p', long, value_name = "PORT", num_args = 1.., default_values_t = [443_u16, 80, 22])]
    pub(crate) ports: Vec<u16>,
    /// Source CIDRs or configured aliases.
    #[arg(short = 'i', long, value_name = "CIDR", num_args = 1.., required = true)]
    pub(crate) cidrs: Vec<String>,
    /// Validate and log only.
    #[arg(short = 't', long = "test")]
    pub(crate) dry_run: bool,
}

/// Subcommands of `novaspawn cache`.
#[derive(Debug, Subcommand)]
pub(crate) enum CacheCommand {
    /// Snapshot instances, security groups, and images of each project.
    #[command(name = "build")]
    Build {
        /// Project to snapshot; repeatable. Defaults to `cache_projects`.
        #[arg(long = "project", value_name = "NAME")]
        projects: Vec<String>,
    },
    /// List cached instances of the configured project.
    #[command(name = "list")]
    List,
}
