//! flexctl: command-line client for a flexmidi bridge.
//!
//!   flexctl --peer 192.168.1.20:5004 send ping
//!   flexctl send llm.chat '{"prompt":"hi"}' --corr c-42
//!   flexctl tail 50
//!   flexctl --peer 192.168.1.20:5004 replay c-42

mod cmd;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use flexmidi_core::config::FlexConfig;

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// Bridge to talk to. Overrides `session.peer_addr`.
    #[arg(env = "FLEXCTL_PEER", short, long)]
    peer: Option<SocketAddr>,

    /// Local address for the client session.
    #[arg(env = "FLEXCTL_BIND", long, default_value = "0.0.0.0:0")]
    bind: SocketAddr,

    /// Journal directory. Defaults to `bridge.journal_dir`.
    #[arg(env = "FLEXCTL_JOURNAL", long)]
    journal_dir: Option<PathBuf>,

    /// Seconds to wait for a final reply.
    #[arg(long, default_value_t = 10)]
    timeout: u64,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Send one request and print every reply for it.
    Send {
        intent: String,
        /// JSON object used as the request body.
        #[arg(default_value = "{}")]
        body: String,
        /// Correlation id. A random one is generated when omitted.
        #[arg(long)]
        corr: Option<String>,
    },
    /// Print the most recent journal records.
    Tail {
        #[arg(default_value_t = 20)]
        n: usize,
    },
    /// Send a journaled request again under a fresh timestamp.
    Replay { corr: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let config = FlexConfig::load().context("failed to load config")?;
    let journal_dir = args
        .journal_dir
        .clone()
        .unwrap_or_else(|| config.bridge.journal_dir.clone());
    let timeout = Duration::from_secs(args.timeout);

    match args.command {
        Command::Send { intent, body, corr } => {
            let env = cmd::request::build(&intent, &body, corr)?;
            let mut client = cmd::client::Client::connect(&config, args.bind, args.peer).await?;
            let outcome = client.request(&env, timeout).await;
            client.close().await;
            cmd::request::report(outcome?)
        }
        Command::Tail { n } => cmd::journal::tail(&journal_dir, n).await,
        Command::Replay { corr } => {
            let env = cmd::journal::replay_envelope(&journal_dir, &corr).await?;
            let mut client = cmd::client::Client::connect(&config, args.bind, args.peer).await?;
            let outcome = client.request(&env, timeout).await;
            client.close().await;
            cmd::request::report(outcome?)
        }
    }
}
