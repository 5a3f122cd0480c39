//! mysql-tools CLI - migrate and tunnel into MySQL service instances.

use clap::{Parser, Subcommand};
use mysql_tools::{
    AssetUnpacker, CfCli, CfClient, CfSession, CfSshConnector, CommandRunner, Config, Migrator,
    MysqlProbe, Reporter, ServiceInfo, ServiceInstance, SessionInfo, ToolsError, TunnelManager,
};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn, Level};

#[cfg(unix)]
use tokio::signal::unix::{signal, SignalKind};

const DEFAULT_CONFIG: &str = "mysql-tools.yaml";

#[derive(Parser)]
#[command(name = "mysql-tools")]
#[command(about = "Migrate data between MySQL service instances and tunnel into them")]
#[command(version)]
struct Cli {
    /// Path to YAML configuration file [default: mysql-tools.yaml]
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Log format: text or json
    #[arg(long, default_value = "text")]
    log_format: String,

    /// Log verbosity: debug, info, warn, error
    #[arg(long, default_value = "info")]
    verbosity: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Copy all data from one service instance into another
    Migrate {
        /// Instance to copy data from
        donor: String,

        /// Instance to copy data into
        recipient: String,

        /// Keep the worker app when the migration fails
        #[arg(long)]
        no_cleanup: bool,

        /// Skip TLS certificate validation when the worker connects to the databases
        #[arg(long)]
        skip_tls_validation: bool,
    },

    /// Migrate, then give the recipient the donor's name
    Replace {
        /// Instance to copy data from; renamed with the configured suffix
        donor: String,

        /// Instance to copy data into; takes over the donor's name
        recipient: String,

        /// Keep the worker app when the migration fails
        #[arg(long)]
        no_cleanup: bool,

        /// Skip TLS certificate validation when the worker connects to the databases
        #[arg(long)]
        skip_tls_validation: bool,
    },

    /// Forward local ports to the databases of one or more instances
    Tunnel {
        /// Service instance names
        #[arg(required = true, num_args = 1..)]
        instances: Vec<String>,
    },
}

impl Commands {
    fn name(&self) -> &'static str {
        match self {
            Commands::Migrate { .. } => "migrate",
            Commands::Replace { .. } => "replace",
            Commands::Tunnel { .. } => "tunnel",
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{}", e.format_detailed());
            ExitCode::from(e.exit_code())
        }
    }
}

async fn run() -> Result<(), ToolsError> {
    let cli = Cli::parse();

    setup_logging(&cli.verbosity, &cli.log_format);

    let mut config = match cli.config {
        Some(ref path) => {
            let config = Config::load(path)?;
            info!("Loaded configuration from {:?}", path);
            config
        }
        None => {
            let path = Path::new(DEFAULT_CONFIG);
            let found = path.exists();
            let config = Config::load_or_default(path)?;
            if found {
                info!("Loaded configuration from {:?}", path);
            } else {
                info!("No {} found, using built-in defaults", DEFAULT_CONFIG);
            }
            config
        }
    };

    let cancel_token = setup_signal_handler();
    let runner: Arc<dyn CommandRunner> = Arc::new(CfCli::new(&config.cf));
    let session = Arc::new(CfSession::new(runner.clone()));

    require_space_developer(session.clone(), cli.command.name()).await?;

    match cli.command {
        Commands::Migrate {
            donor,
            recipient,
            no_cleanup,
            skip_tls_validation,
        } => {
            config.migration.cleanup &= !no_cleanup;
            config.migration.skip_tls_validation |= skip_tls_validation;
            let mut migrator = build_migrator(&config, runner, session, cancel_token).await?;
            migrator.migrate_data(&donor, &recipient).await?;
        }

        Commands::Replace {
            donor,
            recipient,
            no_cleanup,
            skip_tls_validation,
        } => {
            config.migration.cleanup &= !no_cleanup;
            config.migration.skip_tls_validation |= skip_tls_validation;
            let mut migrator = build_migrator(&config, runner, session, cancel_token).await?;
            migrator.migrate_data(&donor, &recipient).await?;
            migrator.rename_service_instances(&donor, &recipient).await?;
        }

        Commands::Tunnel { instances } => {
            run_tunnel(&config, runner, session, &instances, cancel_token).await?;
        }
    }

    Ok(())
}

async fn require_space_developer(
    session: Arc<dyn SessionInfo>,
    command: &str,
) -> Result<(), ToolsError> {
    if Reporter::new(session).is_space_developer().await? {
        Ok(())
    } else {
        Err(ToolsError::Unauthorized {
            command: command.to_string(),
        })
    }
}

async fn build_migrator(
    config: &Config,
    runner: Arc<dyn CommandRunner>,
    session: Arc<CfSession>,
    cancel_token: CancellationToken,
) -> Result<Migrator, ToolsError> {
    let space = session.current_space().await?;
    let client = CfClient::new(runner, config).with_space_guid(space.guid);
    let unpacker = AssetUnpacker::new(&config.migration.assets_dir);

    Ok(Migrator::new(
        Arc::new(client),
        Arc::new(unpacker),
        config.migration.clone(),
    )
    .with_cancellation(cancel_token))
}

async fn run_tunnel(
    config: &Config,
    runner: Arc<dyn CommandRunner>,
    session: Arc<CfSession>,
    instances: &[String],
    cancel_token: CancellationToken,
) -> Result<(), ToolsError> {
    let space = session.current_space().await?;
    let connector = CfSshConnector::new(runner.clone()).with_space_guid(space.guid);

    let keys: Vec<ServiceInstance> = instances
        .iter()
        .map(|name| ServiceInstance::new(runner.clone(), name, &config.tunnel.service_key_name))
        .collect();

    let work_dir = tempfile::Builder::new().prefix("static_app_").tempdir()?;
    let mut manager = TunnelManager::new(
        runner.clone(),
        Arc::new(connector),
        Arc::new(MysqlProbe),
        config.tunnel.clone(),
        work_dir.path(),
    );

    let result = open_tunnels(&keys, &mut manager, &cancel_token).await;

    manager.close().await;
    for key in &keys {
        key.cleanup().await;
    }
    result
}

async fn open_tunnels(
    keys: &[ServiceInstance],
    manager: &mut TunnelManager,
    cancel_token: &CancellationToken,
) -> Result<(), ToolsError> {
    let mut infos: Vec<ServiceInfo> = Vec::with_capacity(keys.len());
    for key in keys {
        infos.push(key.service_info().await?);
    }

    tokio::select! {
        res = manager.start(&mut infos) => res?,
        _ = cancel_token.cancelled() => return Err(ToolsError::Cancelled),
    }

    for (key, info) in keys.iter().zip(&infos) {
        if let Some(port) = info.local_port {
            println!(
                "{}: 127.0.0.1:{} (database {}, user {})",
                key.instance_name(),
                port,
                info.db_name,
                info.username
            );
        }
    }
    println!("Press Ctrl-C to close the tunnels");

    cancel_token.cancelled().await;
    info!("Closing tunnels");
    Ok(())
}

fn setup_logging(verbosity: &str, format: &str) {
    let level = match verbosity.to_lowercase().as_str() {
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let subscriber = tracing_subscriber::fmt()
        .with_max_level(level)
        .with_target(false)
        .with_writer(std::io::stderr);

    if format == "json" {
        subscriber.json().init();
    } else {
        subscriber.init();
    }
}

/// Cancel the returned token on SIGINT or SIGTERM.
#[cfg(unix)]
fn setup_signal_handler() -> CancellationToken {
    let cancel_token = CancellationToken::new();

    for (kind, name) in [
        (SignalKind::interrupt(), "SIGINT"),
        (SignalKind::terminate(), "SIGTERM"),
    ] {
        let token = cancel_token.clone();
        match signal(kind) {
            Ok(mut stream) => {
                tokio::spawn(async move {
                    stream.recv().await;
                    eprintln!("\nReceived {}. Cleaning up...", name);
                    token.cancel();
                });
            }
            Err(e) => warn!("Failed to install {} handler: {}", name, e),
        }
    }

    cancel_token
}

/// Cancel the returned token on Ctrl-C.
#[cfg(not(unix))]
fn setup_signal_handler() -> CancellationToken {
    let cancel_token = CancellationToken::new();
    let token = cancel_token.clone();

    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                eprintln!("\nReceived Ctrl-C. Cleaning up...");
                token.cancel();
            }
            Err(e) => warn!("Failed to install Ctrl-C handler: {}", e),
        }
    });

    cancel_token
}
