//! WolfStoreCtl - Command line client for WolfStore servers
//!
//! Usage:
//!   wolfstorectl store <file>    - Upload a file from the local mount
//!   wolfstorectl fetch <file>    - Download a file into the local mount
//!   wolfstorectl delete <file>   - Delete a file on the server
//!   wolfstorectl list            - List files on the server
//!   wolfstorectl mount           - Keep the local mount in sync (Ctrl+C to exit)

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Local, TimeZone};
use clap::{Parser, Subcommand};
use tokio::sync::watch;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use wolfstore::client::{spawn_sync, ClientNode, TransferOutcome};
use wolfstore::config::WolfStoreConfig;
use wolfstore::protocol::FileMetadata;

/// WolfStore Client Tool
#[derive(Parser)]
#[command(name = "wolfstorectl")]
#[command(about = "Store, fetch and synchronize files with a WolfStore server", long_about = None)]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "wolfstore.toml")]
    config: PathBuf,

    /// Server address (overrides client.server_address)
    #[arg(short, long)]
    server: Option<String>,

    /// Local mount directory (overrides client.mount_path)
    #[arg(short, long)]
    mount: Option<PathBuf>,

    /// Client identifier used for write locks (overrides client.client_id)
    #[arg(long)]
    client_id: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "warn")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Upload a file from the local mount
    Store { filename: String },
    /// Download a file into the local mount
    Fetch { filename: String },
    /// Delete a file on the server
    Delete { filename: String },
    /// List files on the server
    List {
        /// Print the catalog as JSON
        #[arg(long)]
        json: bool,
    },
    /// Show the server's metadata for one file
    Stat { filename: String },
    /// Take the write lock for a file
    Lock { filename: String },
    /// Give the write lock for a file back
    Unlock { filename: String },
    /// Mirror the server into the local mount until Ctrl+C
    Mount,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_logging(&cli.log_level);

    if let Err(e) = run(cli).await {
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }
}

/// Initialize logging
fn init_logging(level: &str) {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| level.into());

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer().compact().with_writer(std::io::stderr))
        .init();
}

fn load_config(cli: &Cli) -> Result<WolfStoreConfig> {
    let mut config = if cli.config.exists() {
        WolfStoreConfig::from_file(&cli.config)
            .with_context(|| format!("Failed to load {}", cli.config.display()))?
    } else {
        WolfStoreConfig::default()
    };

    if let Some(server) = &cli.server {
        config.client.server_address = server.clone();
    }
    if let Some(mount) = &cli.mount {
        config.client.mount_path = mount.clone();
    }
    if let Some(client_id) = &cli.client_id {
        config.client.client_id = client_id.clone();
    }
    config.validate()?;
    Ok(config)
}

async fn run(cli: Cli) -> Result<()> {
    let config = load_config(&cli)?;
    let node = ClientNode::from_config(&config);

    match cli.command {
        Commands::Store { filename } => {
            match node.store(&filename).await.with_context(|| format!("Store of '{}' failed", filename))? {
                TransferOutcome::Transferred(meta) => {
                    println!("Stored {} ({} bytes, crc {:08x})", meta.name, meta.size, meta.crc.unwrap_or(0))
                }
                TransferOutcome::AlreadyInSync => println!("{} is already up to date on the server", filename),
            }
        }
        Commands::Fetch { filename } => {
            match node.fetch(&filename).await.with_context(|| format!("Fetch of '{}' failed", filename))? {
                TransferOutcome::Transferred(meta) => {
                    println!("Fetched {} ({} bytes, modified {})", meta.name, meta.size, format_mtime(meta.last_modified))
                }
                TransferOutcome::AlreadyInSync => println!("{} is already up to date locally", filename),
            }
        }
        Commands::Delete { filename } => {
            node.delete(&filename).await.with_context(|| format!("Delete of '{}' failed", filename))?;
            println!("Deleted {}", filename);
        }
        Commands::List { json } => {
            let catalog = node.list().await.context("Listing files failed")?;
            if json {
                println!("{}", serde_json::to_string_pretty(&catalog)?);
            } else {
                print_catalog(&catalog.files);
            }
        }
        Commands::Stat { filename } => {
            let meta = node.stat(&filename).await.with_context(|| format!("Stat of '{}' failed", filename))?;
            println!("Name:      {}", meta.name);
            println!("Size:      {} bytes", meta.size);
            println!("Modified:  {}", format_mtime(meta.last_modified));
        }
        Commands::Lock { filename } => {
            node.request_write_access(&filename).await.with_context(|| format!("Lock of '{}' failed", filename))?;
            println!("Write lock on {} held by {}", filename, node.client_id());
        }
        Commands::Unlock { filename } => {
            node.cede_write_access(&filename).await.with_context(|| format!("Unlock of '{}' failed", filename))?;
            println!("Write lock on {} released", filename);
        }
        Commands::Mount => run_mount(node, &config).await?,
    }

    Ok(())
}

/// Reconcile the local mount against the server until Ctrl+C
async fn run_mount(node: ClientNode, config: &WolfStoreConfig) -> Result<()> {
    tokio::fs::create_dir_all(node.mount_path())
        .await
        .with_context(|| format!("Failed to create {}", node.mount_path().display()))?;

    println!(
        "Syncing {} with {} as client {} (Ctrl+C to stop)",
        node.mount_path().display(),
        config.client.server_address,
        node.client_id()
    );

    let client = node.connection().clone();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let sync = spawn_sync(Arc::new(node), client, config.resubscribe_interval(), shutdown_rx);

    tokio::signal::ctrl_c().await.context("Failed to listen for Ctrl+C")?;
    tracing::info!("Stopping sync...");
    let _ = shutdown_tx.send(true);
    sync.await.context("Sync task failed")?;
    Ok(())
}

fn print_catalog(files: &[FileMetadata]) {
    println!();
    println!("{:<40} {:>12} {:<20}", "NAME", "SIZE", "MODIFIED");
    println!("{}", "-".repeat(74));
    for file in files {
        println!("{:<40} {:>12} {:<20}", file.name, file.size, format_mtime(file.last_modified));
    }
    println!();
    println!("{} files", files.len());
}

fn format_mtime(epoch_secs: u64) -> String {
    let local: Option<DateTime<Local>> = i64::try_from(epoch_secs)
        .ok()
        .and_then(|secs| Local.timestamp_opt(secs, 0).single());
    match local {
        Some(time) => time.format("%Y-%m-%d %H:%M:%S").to_string(),
        None => epoch_secs.to_string(),
    }
}
