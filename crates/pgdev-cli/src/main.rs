//! `pgdev` binary.
//!
//! Runs a disposable `PostgreSQL` for one service directory, applies its
//! migrations, optionally re-applies them as they are edited, and removes
//! everything afterwards.
//!
//! # Commands
//!
//! - `up` -- load, init and start the service, print its connection strings,
//!   wait for Ctrl-C, then stop it (and destroy it unless persistent)
//! - `destroy` -- remove the database and migration helper containers
//! - `status` -- show the container, its state and the exported scopes
//!
//! Credentials are read from `PGDEV_POSTGRES_POSTGRES_USER` and
//! `PGDEV_POSTGRES_POSTGRES_PASSWORD`.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use pgdev_container::DockerRunner;
use pgdev_core::{NetworkMapper, ServiceLifecycle, ServiceSettings};
use pgdev_db::EnvCredentialStore;
use pgdev_types::ServiceIdentity;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// Name used when the service directory has no usable name.
const FALLBACK_SERVICE_NAME: &str = "postgres";

#[derive(Parser)]
#[clap(author, version, about, long_about = None)]
#[clap(propagate_version = true)]
struct Cli {
    /// Service directory holding `service.pgdev.yaml` and the migrations
    #[clap(short, long, default_value = ".")]
    location: PathBuf,

    /// Service name, by default the directory name
    #[clap(short, long)]
    name: Option<String>,

    /// Module the service belongs to
    #[clap(short, long, default_value = "default")]
    module: String,

    /// Workspace the module belongs to
    #[clap(short, long, default_value = "local")]
    workspace: String,

    /// Docker-compatible binary to drive
    #[clap(long, default_value = "docker")]
    docker: String,

    #[clap(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the database and keep it running until Ctrl-C
    Up,

    /// Remove the database and migration helper containers
    Destroy,

    /// Show the service container and its exported scopes
    Status,
}

/// Application entry point.
///
/// # Errors
///
/// Returns an error if any lifecycle verb fails.
#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(true)
        .init();

    let cli = Cli::parse();
    let identity = identity(&cli)?;
    let settings = ServiceSettings::load(&identity.location)
        .with_context(|| format!("cannot read settings of {identity}"))?;

    let mut runner = DockerRunner::new(identity.container_name()).with_binary(cli.docker.as_str());
    if settings.silent {
        runner = runner.silence();
    }
    let mut service = ServiceLifecycle::new(identity, runner);

    match cli.command {
        Commands::Up => up(&mut service, settings.port).await,
        Commands::Destroy => {
            service.destroy().await.context("destroy failed")?;
            Ok(())
        }
        Commands::Status => status(&mut service).await,
    }
}

/// Build the service identity from the command line.
fn identity(cli: &Cli) -> Result<ServiceIdentity> {
    let location = std::fs::canonicalize(&cli.location)
        .with_context(|| format!("service directory {} not found", cli.location.display()))?;
    let name = cli
        .name
        .clone()
        .unwrap_or_else(|| directory_name(&location));
    Ok(ServiceIdentity::new(
        name,
        cli.module.as_str(),
        cli.workspace.as_str(),
        location,
    ))
}

fn directory_name(location: &Path) -> String {
    location
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .filter(|n| !n.is_empty())
        .unwrap_or_else(|| FALLBACK_SERVICE_NAME.to_owned())
}

async fn up(service: &mut ServiceLifecycle<DockerRunner>, port: u16) -> Result<()> {
    info!(service = %service.identity(), "pgdev starting");
    service.load().context("load failed")?;

    let instances = NetworkMapper::local(port).instances();
    let configurations = service
        .init(&instances, &EnvCredentialStore)
        .await
        .context("init failed")?;

    if let Err(e) = service.start().await {
        error!(error = %e, "start failed, cleaning up");
        if let Err(cleanup) = service.destroy().await {
            warn!(error = %cleanup, "cleanup failed");
        }
        return Err(e).context("start failed");
    }

    for configuration in &configurations {
        if let Some(connection) = configuration.connection() {
            println!("{}: {connection}", configuration.scope);
        }
    }
    info!("database ready, press Ctrl-C to stop");

    tokio::signal::ctrl_c()
        .await
        .context("cannot listen for Ctrl-C")?;
    info!("shutting down");

    service.stop().await.context("stop failed")?;
    let status = service.status();
    if status.persistent {
        info!(container = %status.container, "data kept, run `pgdev destroy` to remove it");
    } else {
        service.destroy().await.context("destroy failed")?;
    }
    Ok(())
}

async fn status(service: &mut ServiceLifecycle<DockerRunner>) -> Result<()> {
    service.load().context("load failed")?;
    let status = service.status();
    let running = service
        .runtime()
        .is_running()
        .await
        .context("cannot inspect container")?;
    let format = status
        .migration_format
        .map_or_else(|| String::from("none"), |f| f.to_string());
    let port = service.settings().map_or(0, |s| s.port);

    println!("service:    {}", service.identity());
    println!("state:      {}", status.state);
    println!("container:  {}", status.container);
    println!("running:    {running}");
    println!("persistent: {}", status.persistent);
    println!("migrations: {format}");
    for instance in NetworkMapper::local(port).instances() {
        let label = format!("{}:", instance.scope);
        println!("{label:<11} {}", instance.address);
    }
    Ok(())
}
