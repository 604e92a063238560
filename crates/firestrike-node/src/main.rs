use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use firestrike_crypto::MagnetLink;
use firestrike_network::TcpTransport;
use firestrike_node::config::LoggingConfig;
use firestrike_node::{Config, Node};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "firestrike")]
#[command(version, about = "Anonymous content-addressed file distribution")]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, env = "FIRESTRIKE_CONFIG")]
    config: Option<PathBuf>,

    /// Data directory
    #[arg(short, long, env = "FIRESTRIKE_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// Write a default configuration file and exit
    #[arg(long)]
    init: bool,

    /// Override the listen port
    #[arg(short, long)]
    port: Option<u16>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run a node until interrupted
    Serve,

    /// Encrypt a file, store and replicate it, print its magnet link
    Upload {
        file: PathBuf,

        /// Delete the source file after a successful upload
        #[arg(long)]
        temp: bool,
    },

    /// Fetch and decrypt the file behind a magnet link
    Download {
        link: String,

        #[arg(short, long)]
        output: PathBuf,
    },

    /// List known peers after bootstrapping
    Peers,
}

fn init_logging(logging: &LoggingConfig) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&logging.level));

    if logging.json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if cli.init {
        let config = Config::create_default(cli.config, cli.data_dir)?;
        println!("Configuration written to {}", config.config_path().display());
        println!("Data directory: {}", config.data_directory.display());
        return Ok(());
    }

    let mut config = Config::load(cli.config, cli.data_dir)?;
    if let Some(port) = cli.port {
        config.node.listen_port = port;
    }

    init_logging(&config.logging);

    let command = cli.command.unwrap_or(Command::Serve);
    let bootstrap_nodes = config.dht.bootstrap_nodes.clone();

    let node = Node::new(config, Arc::new(TcpTransport::new()))
        .await
        .context("Failed to open node state")?;
    let address = node.start().await.context("Failed to start node")?;
    node.bootstrap(&bootstrap_nodes).await?;

    let result = run(&node, command, &address).await;

    node.stop().await?;
    result
}

async fn run(node: &Node, command: Command, address: &str) -> Result<()> {
    match command {
        Command::Serve => {
            info!("Serving at {} (Ctrl+C to stop)", address);
            tokio::signal::ctrl_c()
                .await
                .context("Failed to listen for Ctrl+C")?;
            info!("Received Ctrl+C signal");
        }

        Command::Upload { file, temp } => {
            let link = node
                .upload(&file)
                .await
                .with_context(|| format!("Failed to upload {}", file.display()))?;
            println!("{}", link);

            if temp {
                if let Err(e) = std::fs::remove_file(&file) {
                    warn!("Could not delete {}: {}", file.display(), e);
                }
            }
        }

        Command::Download { link, output } => {
            let link: MagnetLink = link.parse().context("Invalid magnet link")?;
            let written = node
                .download(&link, &output)
                .await
                .context("Download failed")?;
            println!("Wrote {} bytes to {}", written, output.display());
        }

        Command::Peers => {
            let peers = node.peers().await;
            if peers.is_empty() {
                println!("No known peers");
            }
            for peer in peers {
                println!(
                    "{}  key={}  files={}",
                    peer.peer_id,
                    peer.public_key,
                    peer.content_ids.len()
                );
            }
        }
    }

    Ok(())
}
