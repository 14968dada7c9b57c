//! WolfStore - Distributed File Store
//!
//! Server daemon exposing a mount directory to WolfStore clients.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use wolfstore::config::WolfStoreConfig;
use wolfstore::error::Result;
use wolfstore::server::StoreServer;

/// WolfStore - Distributed File Store
#[derive(Parser)]
#[command(name = "wolfstore")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "wolfstore.toml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error); overrides the config file
    #[arg(short, long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the file server
    Serve {
        /// Directory to expose (overrides server.mount_path)
        #[arg(short, long)]
        mount: Option<PathBuf>,

        /// Address to listen on (overrides server.bind_address)
        #[arg(short, long)]
        bind: Option<String>,
    },

    /// Initialize a new configuration file
    Init {
        /// Output path for configuration file
        #[arg(short, long, default_value = "wolfstore.toml")]
        output: PathBuf,
    },

    /// Validate configuration file
    Validate,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Serve { mount, bind } => run_serve(cli.config, cli.log_level, mount, bind).await,
        Commands::Init { output } => {
            init_logging(cli.log_level.as_deref().unwrap_or("info"), "compact");
            run_init(output)
        }
        Commands::Validate => run_validate(cli.config),
    }
}

/// Initialize logging
fn init_logging(level: &str, format: &str) {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| level.into());

    let registry = tracing_subscriber::registry().with(env_filter);
    match format {
        "pretty" => registry.with(tracing_subscriber::fmt::layer().pretty()).init(),
        _ => registry.with(tracing_subscriber::fmt::layer().compact()).init(),
    }
}

/// Load the config file, falling back to defaults when it does not exist
fn load_config(path: &std::path::Path) -> Result<WolfStoreConfig> {
    if path.exists() {
        WolfStoreConfig::from_file(path)
    } else {
        Ok(WolfStoreConfig::default())
    }
}

/// Start the file server
async fn run_serve(
    config_path: PathBuf,
    log_level: Option<String>,
    mount: Option<PathBuf>,
    bind: Option<String>,
) -> Result<()> {
    let mut config = load_config(&config_path)?;
    if let Some(mount) = mount {
        config.server.mount_path = mount;
    }
    if let Some(bind) = bind {
        config.server.bind_address = bind;
    }
    config.validate()?;

    let level = log_level.unwrap_or_else(|| config.logging.level.clone());
    init_logging(&level, &config.logging.format);

    tracing::info!("Starting WolfStore server v{}", env!("CARGO_PKG_VERSION"));
    tracing::info!("Mount path: {:?}", config.server.mount_path);

    let server = StoreServer::bind(&config).await?;
    let shutdown = server.shutdown_handle();
    let mut server_task = tokio::spawn(server.run());

    tokio::select! {
        result = &mut server_task => {
            return match result {
                Ok(result) => result,
                Err(e) => Err(wolfstore::Error::Internal(format!("Server task failed: {}", e))),
            };
        }
        result = tokio::signal::ctrl_c() => {
            if let Err(e) = result {
                tracing::error!("Failed to listen for shutdown signal: {}", e);
            }
            tracing::info!("Shutting down...");
            shutdown.stop();
        }
    }

    match server_task.await {
        Ok(result) => result?,
        Err(e) => tracing::error!("Server task failed: {}", e),
    }

    tracing::info!("WolfStore server stopped");
    Ok(())
}

/// Write a starter configuration file
fn run_init(output: PathBuf) -> Result<()> {
    if output.exists() {
        return Err(wolfstore::Error::Config(format!(
            "{} already exists",
            output.display()
        )));
    }

    let content = format!(
        "# WolfStore Configuration\n# Generated configuration file\n\n{}",
        WolfStoreConfig::default_toml()?
    );
    std::fs::write(&output, content)?;

    tracing::info!("Created configuration file: {:?}", output);
    println!("Configuration file created: {}", output.display());
    println!("Edit [server] mount_path and [client] server_address before starting.");
    Ok(())
}

/// Validate configuration file
fn run_validate(config_path: PathBuf) -> Result<()> {
    match WolfStoreConfig::from_file(&config_path) {
        Ok(config) => {
            println!("✓ Configuration is valid");
            println!("  Bind Address:   {}", config.server.bind_address);
            println!("  Server Mount:   {}", config.server.mount_path.display());
            println!("  Server Address: {}", config.client.server_address);
            println!("  Client Mount:   {}", config.client.mount_path.display());
            println!("  Client ID:      {}", config.client.client_id);
            println!("  Deadline:       {} ms", config.client.deadline_ms);
            println!("  Chunk Size:     {} bytes", config.transfer.chunk_size);
            Ok(())
        }
        Err(e) => {
            eprintln!("✗ Configuration error: {}", e);
            Err(e)
        }
    }
}
