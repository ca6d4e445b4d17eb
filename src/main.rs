//! Binary entry point for the `novaspawn` CLI.

use std::io::{self, Write};
use std::process;

use clap::Parser;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use novaspawn::binder::split_group_names;
use novaspawn::inventory::{self, CacheError, CacheStore, InventoryError};
use novaspawn::launch::{MetadataError, parse_metadata_json};
use novaspawn::logging::init_tracing;
use novaspawn::ssh::{SSH_PORT, forge_hostname};
use novaspawn::user_data::{UserDataError, load_user_data, operator_path};
use novaspawn::{
    BootError, BootOrchestrator, BootRequest, CommandError, ConfigError, InheritedCommandRunner,
    OpenStackClient, OpenStackConfig, OpenStackError, OperatorConfig, PlaybookRunner,
    ProcessCommandRunner, RemoteShell, SecurityGroupError, SecurityGroupManager,
    SecurityGroupRequest, SessionPolicy, SpawnError, SpawnOrchestrator, SpawnRequest, SshError,
    SshHelper,
};

mod cli;

use cli::{CacheCommand, Cli, LaunchArgs, SecgroupCommand, SpawnCommand, SshCommand};

#[derive(Debug, Error)]
enum CliError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("cloud client error: {0}")]
    Client(#[from] OpenStackError),
    #[error("no image given: pass --image or set NOVASPAWN_DEFAULT_IMAGE")]
    MissingImage,
    #[error("hostname domain is not set: set NOVASPAWN_HOSTNAME_DOMAIN or add hostname_domain to novaspawn.toml")]
    MissingHostnameDomain,
    #[error(transparent)]
    Metadata(#[from] MetadataError),
    #[error(transparent)]
    UserData(#[from] UserDataError),
    #[error(transparent)]
    Command(#[from] CommandError),
    #[error("boot failed: {0}")]
    Boot(#[from] BootError<OpenStackError>),
    #[error("spawn failed: {0}")]
    Spawn(#[from] SpawnError<OpenStackError>),
    #[error("ssh failed: {0}")]
    Ssh(#[from] SshError<OpenStackError>),
    #[error("security group update failed: {0}")]
    SecurityGroup(#[from] SecurityGroupError<OpenStackError>),
    #[error("cache build failed: {0}")]
    Inventory(#[from] InventoryError<OpenStackError>),
    #[error(transparent)]
    Cache(#[from] CacheError),
}

/// Configuration and cancellation shared by every subcommand.
struct Context {
    identity: OpenStackConfig,
    operator: OperatorConfig,
    cancel: CancellationToken,
}

impl Context {
    fn load(cancel: CancellationToken) -> Result<Self, CliError> {
        let identity = OpenStackConfig::load_without_cli_args()?;
        let operator = OperatorConfig::load_without_cli_args()?;
        operator.validate()?;
        Ok(Self {
            identity,
            operator,
            cancel,
        })
    }

    fn client(&self) -> Result<OpenStackClient, CliError> {
        let policy = SessionPolicy::from_reuse(self.operator.reuse_session);
        Ok(OpenStackClient::new(self.identity.clone(), policy)?)
    }

    fn cache_store(&self) -> CacheStore {
        CacheStore::new(operator_path(&self.operator.cache_dir))
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_tracing();

    let cancel = CancellationToken::new();
    watch_interrupt(cancel.clone());

    let exit_code = match dispatch(cli, cancel).await {
        Ok(code) => code,
        Err(err) => {
            report_error(&err);
            1
        }
    };

    process::exit(exit_code);
}

fn watch_interrupt(cancel: CancellationToken) {
    drop(tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupted, stopping");
            cancel.cancel();
        }
    }));
}

async fn dispatch(cli: Cli, cancel: CancellationToken) -> Result<i32, CliError> {
    let ctx = Context::load(cancel)?;
    match cli {
        Cli::Boot(args) => boot(&ctx, &args).await,
        Cli::Spawn(command) => spawn(&ctx, &command).await,
        Cli::Ssh(command) => ssh(&ctx, &command).await,
        Cli::Secgroup(command) => secgroup(&ctx, command).await,
        Cli::Cache(CacheCommand::Build { projects }) => cache_build(&ctx, projects).await,
        Cli::Cache(CacheCommand::List) => cache_list(&ctx),
    }
}

fn boot_request(args: &LaunchArgs, operator: &OperatorConfig) -> Result<BootRequest, CliError> {
    let image = args
        .image
        .clone()
        .or_else(|| operator.default_image.clone())
        .ok_or(CliError::MissingImage)?;
    let metadata = args
        .metadata
        .as_deref()
        .map(parse_metadata_json)
        .transpose()?
        .unwrap_or_default();
    let security_groups = if args.security_groups.is_empty() {
        operator.security_groups()
    } else {
        split_group_names(&args.security_groups)
    };
    Ok(BootRequest {
        name: args.name.clone(),
        image,
        flavor: args
            .flavor
            .clone()
            .unwrap_or_else(|| operator.default_flavor.clone()),
        user_data: load_user_data(args.user_data.as_deref())?,
        metadata,
        groups: args.groups.clone(),
        security_groups,
        floating_ip: args.floating_ip.clone(),
        dry_run: args.dry_run,
    })
}

async fn boot(ctx: &Context, args: &LaunchArgs) -> Result<i32, CliError> {
    let request = boot_request(args, &ctx.operator)?;
    let client = ctx.client()?;
    let orchestrator =
        BootOrchestrator::new(&client, ctx.operator.boot_settings()?, ctx.cancel.clone());
    if let Some(outcome) = orchestrator.boot(&request).await? {
        writeln!(io::stdout(), "{} {}", outcome.image_id, outcome.address).ok();
    }
    Ok(0)
}

async fn spawn(ctx: &Context, command: &SpawnCommand) -> Result<i32, CliError> {
    let request = SpawnRequest {
        playbook: operator_path(&command.playbook),
        boot: boot_request(&command.launch, &ctx.operator)?,
    };
    let client = ctx.client()?;
    let orchestrator = SpawnOrchestrator::new(
        BootOrchestrator::new(&client, ctx.operator.boot_settings()?, ctx.cancel.clone()),
        SshHelper::new(
            &client,
            RemoteShell::new(ProcessCommandRunner, ctx.operator.shell_settings()),
        ),
        PlaybookRunner::new(InheritedCommandRunner, ctx.operator.playbook_bin.clone()),
        ctx.operator.ssh_poll_policy(),
        ctx.cancel.clone(),
    );
    if let Some(outcome) = orchestrator.spawn(&request).await? {
        writeln!(
            io::stdout(),
            "{} {}",
            outcome.boot.image_id,
            outcome.boot.address
        )
        .ok();
    }
    Ok(0)
}

async fn ssh(ctx: &Context, command: &SshCommand) -> Result<i32, CliError> {
    let client = ctx.client()?;
    let settings = ctx.operator.shell_settings();
    let helper = SshHelper::new(&client, RemoteShell::new(ProcessCommandRunner, settings.clone()));
    let found = helper.find(&command.instance).await?;

    if command.print_hostname {
        let domain = ctx
            .operator
            .hostname_domain
            .as_deref()
            .ok_or(CliError::MissingHostnameDomain)?;
        write_hostnames(io::stdout(), &found, domain);
        return Ok(0);
    }

    let Some(instance) = found.first() else {
        return Err(CliError::Ssh(SshError::NoMatch {
            name: command.instance.clone(),
        }));
    };
    if command.ssh_check {
        helper.ensure_port_open(instance, SSH_PORT).await?;
    }
    let target = helper.target(instance, command.user.as_deref()).await?;

    if command.test {
        let reachable = helper.shell().probe(&target)?;
        info!(instance = %instance.name, reachable, "reachability probe finished");
        return Ok(i32::from(!reachable));
    }

    let interactive = RemoteShell::new(InheritedCommandRunner, settings);
    match (&command.upload, &command.download) {
        (Some(local), _) => interactive.upload(&target, &operator_path(local))?,
        (None, Some(remote)) => interactive.download(&target, remote)?,
        (None, None) => interactive.connect(&target)?,
    }
    Ok(0)
}

fn write_hostnames(mut target: impl Write, instances: &[novaspawn::Instance], domain: &str) {
    for instance in instances {
        match instance.first_floating_address() {
            Some(address) => {
                writeln!(target, "{}: {}", instance.name, forge_hostname(address, domain)).ok();
            }
            None => warn!(instance = %instance.name, "instance has no floating address"),
        }
    }
}

async fn secgroup(ctx: &Context, command: SecgroupCommand) -> Result<i32, CliError> {
    let client = ctx.client()?;
    let manager = SecurityGroupManager::new(&client, ctx.operator.aliases()?);
    let outcome = manager
        .apply(&SecurityGroupRequest {
            name: command.name,
            create: command.create,
            ports: command.ports,
            cidrs: command.cidrs,
            dry_run: command.dry_run,
        })
        .await?;
    info!(
        group = outcome.group_id.as_deref().unwrap_or("(dry run)"),
        rules = outcome.rules.len(),
        "security group updated"
    );
    Ok(0)
}

async fn cache_build(ctx: &Context, projects: Vec<String>) -> Result<i32, CliError> {
    let mut selected = if projects.is_empty() {
        ctx.operator.cache_projects()
    } else {
        projects
    };
    if selected.is_empty() {
        selected.push(ctx.identity.tenant_name.clone());
    }
    let client = ctx.client()?;
    inventory::build_cache(&ctx.cache_store(), &selected, |project| {
        client.for_project(project)
    })
    .await?;
    Ok(0)
}

fn cache_list(ctx: &Context) -> Result<i32, CliError> {
    let records = ctx.cache_store().read_instances(&ctx.identity.tenant_name)?;
    let mut stdout = io::stdout();
    for record in records {
        writeln!(stdout, "{}", record.listing_line()).ok();
    }
    Ok(0)
}

fn report_error(err: &CliError) {
    write_error(io::stderr(), err);
}

fn write_error(mut target: impl Write, err: &CliError) {
    writeln!(target, "{err}").ok();
}

#[cfg(test)]
#[path = "main_tests.rs"]
mod tests;
