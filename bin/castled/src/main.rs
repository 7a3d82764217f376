//! Castle - Ceph cluster orchestration daemon
//!
//! `castled run` is started on every node. The other subcommands record
//! admin requests in the coordination store and exit; the leader acts on
//! them asynchronously.

mod daemon;
mod settings;

use anyhow::{Result, bail};
use castle_common::Config;
use castle_kv::KvStore;
use castle_services::admin;
use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "castled")]
#[command(about = "Castle Ceph cluster orchestrator")]
#[command(version)]
struct Args {
    /// Configuration file path
    #[arg(short, long, env = "CASTLE_CONFIG", default_value = "/etc/castle/castle.toml")]
    config: PathBuf,

    /// Node ID (overrides the config file)
    #[arg(long)]
    node_id: Option<String>,

    /// Public IP address (overrides the config file)
    #[arg(long)]
    public_ip: Option<String>,

    /// Private IP address (overrides the config file)
    #[arg(long)]
    private_ip: Option<String>,

    /// Log level
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Log output format
    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the node daemon
    Run,
    /// Print cluster info, monitors and applied services as JSON
    Status,
    /// Shared file system operations
    Fs {
        #[command(subcommand)]
        action: FsCommands,
    },
    /// Object store operations
    Object {
        #[command(subcommand)]
        action: ObjectCommands,
    },
    /// Device-backed OSD operations
    Device {
        #[command(subcommand)]
        action: DeviceCommands,
    },
    /// Directory-backed OSD operations
    Dir {
        #[command(subcommand)]
        action: DirCommands,
    },
}

#[derive(Subcommand, Debug)]
enum FsCommands {
    /// Create a file system
    Create {
        /// File system name
        name: String,
        /// Prefix of the data and metadata pools
        #[arg(long)]
        pool: String,
    },
    /// Remove a file system
    Remove {
        /// File system name
        name: String,
    },
}

#[derive(Subcommand, Debug)]
enum ObjectCommands {
    /// Enable the object store
    Enable,
    /// Remove the object store
    Remove,
}

#[derive(Subcommand, Debug)]
enum DeviceCommands {
    /// Back an OSD with a disk
    Add {
        /// Node ID
        node_id: String,
        /// Partition table UUID of the disk
        disk_uuid: String,
    },
    /// Stop backing an OSD with a disk
    Remove {
        /// Node ID
        node_id: String,
        /// Partition table UUID of the disk
        disk_uuid: String,
    },
}

#[derive(Subcommand, Debug)]
enum DirCommands {
    /// Back an OSD with a directory
    Add {
        /// Node ID
        node_id: String,
        /// Directory path on the node
        path: String,
    },
}

fn init_logging(level: &str, format: LogFormat) {
    let json = format == LogFormat::Json;
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| level.into()))
        .with((!json).then(fmt::layer))
        .with(json.then(|| fmt::layer().json()))
        .init();
}

/// Config file plus environment, with command line overrides on top
fn effective_config(args: &Args) -> Result<Config> {
    let mut config = settings::load_config(&args.config)?;
    if let Some(id) = &args.node_id {
        config.node.id.clone_from(id);
    }
    if let Some(ip) = &args.public_ip {
        config.node.public_ip.clone_from(ip);
    }
    if let Some(ip) = &args.private_ip {
        config.node.private_ip.clone_from(ip);
    }
    Ok(config)
}

/// Record an admin request, or print the status
async fn execute(command: Commands, store: &dyn KvStore) -> Result<()> {
    let accepted = match command {
        Commands::Run => bail!("run is not an admin command"),
        Commands::Status => {
            let status = admin::cluster_status(store).await?;
            println!("{}", serde_json::to_string_pretty(&status)?);
            return Ok(());
        }
        Commands::Fs { action } => match action {
            FsCommands::Create { name, pool } => admin::create_filesystem(store, &name, &pool).await?,
            FsCommands::Remove { name } => admin::remove_filesystem(store, &name).await?,
        },
        Commands::Object { action } => match action {
            ObjectCommands::Enable => admin::enable_object_store(store).await?,
            ObjectCommands::Remove => admin::remove_object_store(store).await?,
        },
        Commands::Device { action } => match action {
            DeviceCommands::Add { node_id, disk_uuid } => {
                admin::add_desired_device(store, &node_id, &disk_uuid).await?
            }
            DeviceCommands::Remove { node_id, disk_uuid } => {
                admin::remove_desired_device(store, &node_id, &disk_uuid).await?
            }
        },
        Commands::Dir { action } => match action {
            DirCommands::Add { node_id, path } => admin::add_desired_dir(store, &node_id, &path).await?,
        },
    };
    info!("Request accepted: {:?}", accepted);
    println!("accepted");
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(&args.log_level, args.log_format);
    let config = effective_config(&args)?;

    match args.command {
        Commands::Run => daemon::run(config).await,
        command => {
            let store = daemon::open_store(&config.store)?;
            execute(command, store.as_ref()).await
        }
    }
}
