//! duet command line
//!
//! Usage:
//!   duet id
//!   duet block <id>
//!   duet unblock <id>
//!   duet blocked
//!   duet config
//!   duet simulate [--clients 10] [--seconds 10] [--skip-rate 0.05] [--fail-rate 0.01]

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use duet::duet_core::ClientId;
use duet::{run_simulation, ClientSettings, LocalState, SimConfig};
use duet_config::{get_state_path, Config};
use std::path::PathBuf;
use std::time::Duration;
use tracing::debug;

#[derive(Parser)]
#[command(name = "duet")]
#[command(about = "Anonymous one-on-one session pairing", long_about = None)]
struct Cli {
    /// Local state file (identity and block-list)
    #[arg(long, global = true)]
    state: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print this device's client id, creating it on first use
    Id,
    /// Never pair with a client again
    Block {
        /// Client id to block
        id: String,
    },
    /// Remove a client from the block-list
    Unblock {
        /// Client id to unblock
        id: String,
    },
    /// List blocked client ids
    Blocked,
    /// Print the effective configuration
    Config,
    /// Run many clients against an in-memory store and check the invariants
    Simulate {
        #[arg(long, default_value_t = 10)]
        clients: usize,
        #[arg(long, default_value_t = 10)]
        seconds: u64,
        /// Chance per 100 ms tick that a connected client skips
        #[arg(long, default_value_t = 0.05)]
        skip_rate: f64,
        /// Chance per 100 ms tick that a connected client's media link drops
        #[arg(long, default_value_t = 0.01)]
        fail_rate: f64,
        #[arg(long, default_value_t = 42)]
        seed: u64,
        /// Use the configured timings instead of fast simulation timings
        #[arg(long)]
        real_timings: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("duet=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let state_path = cli.state.clone().unwrap_or_else(get_state_path);
    debug!("local state at {}", state_path.display());

    match cli.command {
        Commands::Id => {
            let local = LocalState::load_or_create(&state_path)?;
            println!("{}", local.client_id());
        }
        Commands::Block { id } => {
            let mut local = LocalState::load_or_create(&state_path)?;
            let id = ClientId::new(id);
            if local.block(id.clone())? {
                println!("Blocked {}", id);
            } else {
                println!("{} was already blocked", id);
            }
        }
        Commands::Unblock { id } => {
            let mut local = LocalState::load_or_create(&state_path)?;
            let id = ClientId::new(id);
            if local.unblock(&id)? {
                println!("Unblocked {}", id);
            } else {
                println!("{} was not blocked", id);
            }
        }
        Commands::Blocked => {
            let local = LocalState::load_or_create(&state_path)?;
            if local.blocked().is_empty() {
                println!("No blocked clients");
            }
            for id in local.blocked() {
                println!("{}", id);
            }
        }
        Commands::Config => {
            let config = Config::load()?;
            let content = toml::to_string_pretty(&config).context("Failed to render config")?;
            print!("{}", content);
        }
        Commands::Simulate {
            clients,
            seconds,
            skip_rate,
            fail_rate,
            seed,
            real_timings,
        } => {
            let settings = if real_timings {
                ClientSettings::from(&Config::load()?)
            } else {
                ClientSettings::fast()
            };
            let config = SimConfig {
                clients,
                duration: Duration::from_secs(seconds),
                seed,
                skip_rate,
                fail_rate,
                settings,
                ..SimConfig::default()
            };
            let report = run_simulation(config).await;
            println!("{}", report);
            if !report.is_consistent() {
                anyhow::bail!("invariants violated");
            }
        }
    }

    Ok(())
}
