//! nvmf-tcp CLI - NVMe over TCP initiator

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod commands;

#[derive(Parser)]
#[command(name = "nvmf-tcp")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Connect to an NVMe/TCP controller and negotiate the connection
    Connect {
        /// Controller address (host name or IP)
        address: String,
        /// Controller port
        #[arg(short, long, default_value = "4420")]
        port: u16,
        /// Use the discovery port (8009) instead of --port
        #[arg(long, conflicts_with = "port")]
        discovery: bool,
        /// Do not request header digests
        #[arg(long)]
        no_hdgst: bool,
        /// Do not request data digests
        #[arg(long)]
        no_ddgst: bool,
        /// Subsystem NQN; also run Fabrics Connect and read CAP/VS
        #[arg(long)]
        subnqn: Option<String>,
        /// Socket I/O timeout in seconds (0 disables)
        #[arg(long, default_value = "30")]
        timeout: u64,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize tracing
    let filter = match cli.verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| filter.into()))
        .with(tracing_subscriber::fmt::layer())
        .init();

    match cli.command {
        Commands::Connect {
            address,
            port,
            discovery,
            no_hdgst,
            no_ddgst,
            subnqn,
            timeout,
        } => commands::connect::execute(commands::connect::ConnectArgs {
            address: &address,
            port,
            discovery,
            header_digest: !no_hdgst,
            data_digest: !no_ddgst,
            subnqn: subnqn.as_deref(),
            timeout_secs: timeout,
        }),
    }
}
