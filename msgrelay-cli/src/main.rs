//! msgrelay-cli - Command-line client for msgrelay
//!
//! One subcommand per relay request. The caller's identity is read from
//! `me.info` unless `--id` is given.

mod commands;
mod identity;

use clap::{Parser, Subcommand};
use colored::Colorize;
use msgrelay_client::{Client, ConnectionConfig};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "msgrelay-cli")]
#[command(about = "Command-line client for the msgrelay message relay")]
#[command(version)]
pub struct Cli {
    /// Server address
    #[arg(short, long, default_value = "127.0.0.1:1357", env = "MSGRELAY_SERVER")]
    server: SocketAddr,

    /// Client id (32 hex digits); defaults to the one in the identity file
    #[arg(long, global = true)]
    id: Option<String>,

    /// Identity file
    #[arg(long, default_value = identity::IDENTITY_FILE, global = true)]
    identity: PathBuf,

    /// Request timeout in seconds
    #[arg(long, default_value = "30")]
    timeout: u64,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Register a new client name
    Register {
        /// Name (letters, digits and '_')
        name: String,

        /// Public key: 320 hex digits, or @file holding 160 raw bytes or hex
        #[arg(short, long)]
        public_key: String,

        /// Save the new identity to the identity file
        #[arg(long)]
        save: bool,
    },

    /// List the other registered clients
    Users,

    /// Fetch a client's public key
    PublicKey {
        /// Target client name or id
        target: String,
    },

    /// Queue a message for another client
    Send {
        /// Target client name or id
        target: String,

        /// Message type: 1 = symmetric key request, 2 = symmetric key,
        /// 3 = text, 4 = file
        #[arg(short = 't', long = "type", default_value = "3")]
        message_type: u8,

        /// Message content, or @file to send a file's bytes
        #[arg(default_value = "")]
        content: String,
    },

    /// Pull all messages queued for this client
    Pull {
        /// Write file messages into this directory
        #[arg(long)]
        save_dir: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .init();

    let cli = Cli::parse();

    let config = ConnectionConfig::new(cli.server)
        .with_request_timeout(Duration::from_secs(cli.timeout.max(1)));
    let client = Client::new(config);

    match commands::execute(client, &cli).await {
        Ok(output) => {
            if !output.is_empty() {
                println!("{}", output);
            }
            Ok(())
        }
        Err(e) => {
            eprintln!("{}: {}", "Error".red(), e);
            std::process::exit(1);
        }
    }
}
