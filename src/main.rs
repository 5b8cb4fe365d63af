//! nodestore: administer and inspect a node storage table.

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use tablestore_nodestore::NodeStore;
use tablestore_nodestore::config::NodeStoreConfig;
use tablestore_nodestore::logging::{LogFormat, init_logging};

#[derive(Parser, Debug)]
#[command(name = "nodestore", version)]
#[command(about = "Manage a node storage table on a wide-column store")]
struct Cli {
    /// Configuration file
    #[arg(short, long, global = true, default_value = "nodestore.toml")]
    config: PathBuf,

    #[command(flatten)]
    overrides: Overrides,

    /// Log output format (text or json)
    #[arg(long, global = true, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Command,
}

/// Connection settings that take precedence over the configuration file.
#[derive(Args, Debug, Default)]
struct Overrides {
    /// Service endpoint, overriding the configuration file
    #[arg(long, global = true, env = "NODESTORE_END_POINT")]
    end_point: Option<String>,

    /// Access key id, overriding the configuration file
    #[arg(long, global = true, env = "NODESTORE_ACCESS_KEY_ID")]
    access_key_id: Option<String>,

    /// Access key secret, overriding the configuration file
    #[arg(
        long,
        global = true,
        env = "NODESTORE_ACCESS_KEY_SECRET",
        hide_env_values = true
    )]
    access_key_secret: Option<String>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create the table, or reconcile its TTL and throughput
    Bootstrap,
    /// Drop the table and every node in it
    Destroy,
    /// Write a node's data to stdout
    Get { id: String },
    /// Store a node read from a file or stdin
    Set {
        id: String,
        /// Read the data from this file instead of stdin
        #[arg(short, long)]
        file: Option<PathBuf>,
    },
    /// Delete one or more nodes
    Delete {
        #[arg(required = true)]
        ids: Vec<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.log_format);

    let config = load_config(&cli.config, &cli.overrides)?;
    let nodes = NodeStore::from_config(config).context("Failed to initialize node store")?;

    match cli.command {
        Command::Bootstrap => {
            nodes.bootstrap().await.context("Bootstrap failed")?;
            tracing::info!(table = %nodes.config().table, "Bootstrap complete");
        },
        Command::Destroy => {
            nodes.destroy().await.context("Destroy failed")?;
        },
        Command::Get { id } => {
            let data = nodes
                .get(&id)
                .await
                .with_context(|| format!("Failed to read node '{id}'"))?
                .with_context(|| format!("Node not found: {id}"))?;
            let mut stdout = std::io::stdout().lock();
            stdout.write_all(&data).context("Failed to write to stdout")?;
            stdout.flush()?;
        },
        Command::Set { id, file } => {
            let data = read_input(file.as_deref())?;
            nodes
                .set(&id, &data)
                .await
                .with_context(|| format!("Failed to store node '{id}'"))?;
            tracing::info!(id = %id, bytes = data.len(), "Node stored");
        },
        Command::Delete { ids } => {
            nodes
                .delete_multi(&ids)
                .await
                .context("Failed to delete nodes")?;
            tracing::info!(count = ids.len(), "Nodes deleted");
        },
    }

    Ok(())
}

/// Loads the configuration file, if present, and applies overrides from
/// flags and the environment.
fn load_config(path: &Path, overrides: &Overrides) -> Result<NodeStoreConfig> {
    let mut config = if path.exists() {
        NodeStoreConfig::load_from(path)?
    } else {
        let end_point = overrides.end_point.clone().with_context(|| {
            format!(
                "Config file not found: {}\n\nCreate it or pass --end-point",
                path.display()
            )
        })?;
        NodeStoreConfig::new(end_point, String::new(), String::new())
    };

    if let Some(end_point) = &overrides.end_point {
        config.end_point.clone_from(end_point);
    }
    if let Some(id) = &overrides.access_key_id {
        config.access_key_id.clone_from(id);
    }
    if let Some(secret) = &overrides.access_key_secret {
        config.access_key_secret.clone_from(secret);
    }

    config
        .validate()
        .with_context(|| format!("Invalid configuration: {}", path.display()))?;
    Ok(config)
}

fn read_input(file: Option<&Path>) -> Result<Vec<u8>> {
    match file {
        Some(path) => {
            std::fs::read(path).with_context(|| format!("Failed to read {}", path.display()))
        },
        None => {
            let mut data = Vec::new();
            std::io::stdin()
                .lock()
                .read_to_end(&mut data)
                .context("Failed to read stdin")?;
            Ok(data)
        },
    }
}
