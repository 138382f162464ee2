// hydra-bridger: tenant network bridging daemon
// One binary for the long-running service and its operator commands

mod daemon;
mod icc;
mod sync;
mod utils;

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};

use daemon::{BridgerConfig, DockerApi, DockerdLauncher, HydraManager, ListenAddr};
use icc::network::{BridgeScanner, LinuxNetworkOperator, NetworkOperator};
use utils::command::CommandExecutor;
use utils::logger::{init_tracing, Logger};

/// Hydra - per-tenant container networks bridged to a shared desktop
#[derive(Parser, Debug)]
#[clap(author, version, about = "Tenant-scoped network bridging for isolated Docker daemons")]
#[clap(propagate_version = true)]
struct HydraCli {
    #[clap(subcommand)]
    command: Commands,

    /// Enable verbose output
    #[clap(long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the bridger service
    Daemon {
        /// Listen address: unix:/path or host:port (overrides HYDRA_LISTEN)
        #[clap(long)]
        listen: Option<String>,

        /// Per-scope runtime directory root
        #[clap(long)]
        socket_dir: Option<PathBuf>,

        /// Per-scope persistent data root
        #[clap(long)]
        data_dir: Option<PathBuf>,

        /// Runtime that manages the shared desktop container
        #[clap(long)]
        desktop_docker_host: Option<String>,

        /// Do not run per-tenant DNS responders
        #[clap(long)]
        no_dns: bool,

        /// Allow desktops to join the shared runtime network on request
        #[clap(long)]
        privileged_mode: bool,
    },

    /// Show the bridge indices a recovery scan would reserve
    Bridges,
}

/// Tools shelled out to at runtime
const REQUIRED_TOOLS: [&str; 3] = ["iptables", "nsenter", "dockerd"];

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = HydraCli::parse();

    match cli.command {
        Commands::Daemon {
            listen,
            socket_dir,
            data_dir,
            desktop_docker_host,
            no_dns,
            privileged_mode,
        } => {
            init_tracing(cli.verbose);

            let mut config = BridgerConfig::from_env()?;
            if let Some(listen) = listen {
                config.listen = ListenAddr::parse(&listen)?;
            }
            if let Some(dir) = socket_dir {
                config.socket_dir = dir;
            }
            if let Some(dir) = data_dir {
                config.data_dir = dir;
            }
            if let Some(host) = desktop_docker_host {
                config.desktop_docker_host = host;
            }
            if no_dns {
                config.dns_enabled = false;
            }
            if privileged_mode {
                config.privileged_mode = true;
            }
            config.validate()?;

            run_daemon(config).await
        }
        Commands::Bridges => list_bridges().await,
    }
}

async fn run_daemon(config: BridgerConfig) -> Result<(), Box<dyn std::error::Error>> {
    if !nix::unistd::geteuid().is_root() {
        tracing::warn!("Not running as root; bridge and namespace operations will fail");
    }
    for tool in REQUIRED_TOOLS {
        if !CommandExecutor::is_command_available(tool) {
            tracing::warn!(tool, "Required tool not found in PATH");
        }
    }

    let net: Arc<dyn NetworkOperator> = Arc::new(LinuxNetworkOperator::new()?);
    let manager = Arc::new(HydraManager::new(
        config.clone(),
        net,
        Arc::new(DockerApi::new()),
        Arc::new(DockerdLauncher::new()),
    )?);

    let report = manager.recover().await?;
    tracing::info!(
        bridges = ?report.bridges,
        orphans_removed = report.removed.len(),
        adopted = manager.active_instances(),
        "Recovery complete"
    );

    let reaper = manager.spawn_reaper(config.reap_interval);
    let served = daemon::server::serve(manager, &config.listen).await;
    reaper.abort();
    served?;
    tracing::info!("Control API stopped");
    Ok(())
}

async fn list_bridges() -> Result<(), Box<dyn std::error::Error>> {
    let net: Arc<dyn NetworkOperator> = Arc::new(LinuxNetworkOperator::new()?);
    let indices = BridgeScanner::new(net).live_bridges().await?;

    if indices.is_empty() {
        Logger::success("No tenant bridges present");
        return Ok(());
    }
    Logger::section("Tenant bridges");
    for index in indices {
        let addressing = sync::TenantAddressing::new(index);
        Logger::detail(&addressing.bridge_name(), &addressing.subnet());
    }
    Ok(())
}
