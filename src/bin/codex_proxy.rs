//! CLI front door: wires a profile, port overrides, and an intercept set
//! into the stack orchestrator, then hands off to the run supervisor (§4.13).

use std::collections::HashSet;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use codex_proxy_core::config::{default_config_dir, ConfigStore};
use codex_proxy_core::error::ProxyError;
use codex_proxy_core::orchestrator::{RunningStack, StackOptions};
use codex_proxy_core::run_supervisor::{AgentSpec, RunSupervisor, StackRecovery, SupervisorOutcome};

/// Supervise an external coding agent behind a CONNECT proxy and an SSH tunnel.
#[derive(Parser)]
#[command(name = "codex-proxy", version, about)]
struct Cli {
    /// Profile id to look up in the config store instead of --host/--user.
    #[arg(long)]
    profile: Option<String>,

    /// SSH host, required unless --profile is given.
    #[arg(long)]
    host: Option<String>,

    /// SSH port.
    #[arg(long, default_value_t = 22)]
    ssh_port: u16,

    /// SSH user, required unless --profile is given.
    #[arg(long)]
    user: Option<String>,

    /// Path to an SSH identity file.
    #[arg(long)]
    identity_file: Option<String>,

    /// Fixed local SOCKS port instead of an ephemeral one.
    #[arg(long)]
    socks_port: Option<u16>,

    /// Fixed local HTTP proxy port instead of an ephemeral one.
    #[arg(long)]
    http_port: Option<u16>,

    /// Hostnames to intercept with the MITM engine (repeatable).
    #[arg(long = "intercept")]
    intercept_hosts: Vec<String>,

    /// Directory the config document, MITM CA, and certs are stored under.
    #[arg(long)]
    config_dir: Option<PathBuf>,

    /// Agent command and arguments to supervise.
    #[arg(required = true, trailing_var_arg = true)]
    agent_command: Vec<String>,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging();

    match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            tracing::error!("{e:#}");
            exit_code_for(&e)
        }
    }
}

fn init_logging() {
    if std::env::var_os("RUST_LOG").is_none() {
        std::env::set_var("RUST_LOG", "info");
    }
    let filter = tracing_subscriber::EnvFilter::from_default_env();
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}

async fn run(cli: Cli) -> anyhow::Result<ExitCode> {
    let config_dir = cli.config_dir.clone().unwrap_or_else(default_config_dir);

    let (host, ssh_port, user, identity_file) = match &cli.profile {
        Some(profile_id) => {
            let store = ConfigStore::new(&config_dir);
            let doc = store.load()?;
            let profile = doc
                .profile(profile_id)
                .ok_or_else(|| ProxyError::config(format!("unknown profile id {profile_id:?}")))?;
            (
                profile.host.clone(),
                profile.port,
                profile.user.clone(),
                None,
            )
        }
        None => {
            let host = cli
                .host
                .clone()
                .ok_or_else(|| ProxyError::config("either --profile or --host/--user is required"))?;
            let user = cli
                .user
                .clone()
                .ok_or_else(|| ProxyError::config("either --profile or --host/--user is required"))?;
            (host, cli.ssh_port, user, cli.identity_file.clone())
        }
    };

    let intercept_hosts: HashSet<String> = cli.intercept_hosts.iter().cloned().collect();

    let mut stack_options = StackOptions::new(host, ssh_port, user, config_dir);
    stack_options.identity_file = identity_file;
    stack_options.intercept_hosts = intercept_hosts;
    stack_options = stack_options.with_ports(cli.socks_port, cli.http_port);

    let mut stack = RunningStack::start(stack_options).await?;
    tracing::info!(http_addr = %stack.http_addr, socks_port = stack.socks_port, "stack is up");

    let Some((program, args)) = cli.agent_command.split_first() else {
        unreachable!("clap enforces at least one agent_command argument");
    };
    let agent = AgentSpec {
        program: program.clone(),
        args: args.to_vec(),
        extra_no_proxy_hosts: Vec::new(),
    };

    let supervisor = RunSupervisor::new();
    let recovery: Option<Arc<dyn StackRecovery>> = None;
    let outcome = supervisor.run(agent, stack.http_addr, recovery).await;

    stack.close().await?;

    match outcome? {
        SupervisorOutcome::AgentExited(Some(0)) => Ok(ExitCode::from(0)),
        SupervisorOutcome::AgentExited(Some(code)) => {
            tracing::warn!(code, "agent exited with a non-zero status");
            Ok(ExitCode::from(code as u8))
        }
        SupervisorOutcome::AgentExited(None) => {
            tracing::warn!("agent terminated by a signal");
            Ok(ExitCode::from(1))
        }
    }
}

/// Map a startup failure that never reached the run supervisor to the §6
/// exit code table: configuration/startup failures are `1`.
fn exit_code_for(e: &anyhow::Error) -> ExitCode {
    if matches!(e.downcast_ref::<ProxyError>(), Some(ProxyError::HealthDegraded { .. })) {
        ExitCode::from(2)
    } else {
        ExitCode::from(1)
    }
}
