//! Bridge Deployer CLI
//!
//! Deploys and wires OFT bridges across the chains configured in the
//! environment, and inspects or migrates the stored deployment records.

use alloy::primitives::Address;
use clap::{Parser, Subcommand};
use color_eyre::eyre::{eyre, Result, WrapErr};
use futures::StreamExt;
use serde::Serialize;
use std::path::PathBuf;

use bridge_deployer::config::Config;
use bridge_deployer::deployer::{open_store, Deployer};
use bridge_deployer::peers::{ContractPair, ContractRef};
use bridge_deployer::snapshot::{self, Snapshot};
use bridge_deployer::{DeploymentProgress, DeploymentRequest, StepStatus};

#[derive(Parser)]
#[command(name = "bridge-deployer")]
#[command(about = "Resumable cross-chain OFT bridge deployment", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Path to a .env file
    #[arg(long, global = true, default_value = ".env")]
    env_file: String,
}

#[derive(Subcommand)]
enum Commands {
    /// Start or resume a deployment described by a JSON request file
    Deploy {
        request: PathBuf,
    },

    /// Show resume progress of one deployment
    Progress { id: String },

    /// List stored deployments, newest first
    List,

    /// Delete a stored deployment record
    Delete { id: String },

    /// Write every record to a snapshot file (stdout when omitted)
    Export {
        #[arg(short, long)]
        out: Option<PathBuf>,
    },

    /// Import a snapshot, skipping ids that already exist
    Import { snapshot: PathBuf },

    /// Check peer pointers in both directions of a contract pair
    CheckPeers(PairArgs),

    /// Compare send/receive security configs of a contract pair
    CheckSecurity(PairArgs),
}

#[derive(clap::Args)]
struct PairArgs {
    #[arg(long)]
    chain_a: u64,
    #[arg(long)]
    address_a: Address,
    #[arg(long)]
    chain_b: u64,
    #[arg(long)]
    address_b: Address,
}

impl PairArgs {
    fn pair(&self) -> ContractPair {
        ContractPair::new(
            ContractRef::new(self.chain_a, self.address_a),
            ContractRef::new(self.chain_b, self.address_b),
        )
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn main() -> Result<()> {
    // Install color-eyre for better error reporting
    color_eyre::install()?;

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?
        .block_on(async_main())
}

async fn async_main() -> Result<()> {
    let cli = Cli::parse();
    init_logging();

    let config = Config::load_from_file(&cli.env_file)?;
    tracing::debug!(?config, "Configuration loaded");

    match cli.command {
        Commands::Deploy { request } => deploy(&config, request).await,
        Commands::Progress { id } => {
            let store = open_store(&config.store).await?;
            let record = store
                .get(&id)
                .await?
                .ok_or_else(|| eyre!("No deployment with id {}", id))?;
            print_json(&DeploymentProgress::from_record(&record, false))
        }
        Commands::List => {
            let store = open_store(&config.store).await?;
            let progress: Vec<DeploymentProgress> = store
                .list_all()
                .await?
                .iter()
                .map(|r| DeploymentProgress::from_record(r, false))
                .collect();
            print_json(&progress)
        }
        Commands::Delete { id } => {
            let store = open_store(&config.store).await?;
            if store.remove(&id).await? {
                tracing::info!(id = %id, "Deployment record deleted");
                Ok(())
            } else {
                Err(eyre!("No deployment with id {}", id))
            }
        }
        Commands::Export { out } => {
            let store = open_store(&config.store).await?;
            let snapshot = snapshot::export_all(&store).await?;
            let json = serde_json::to_string_pretty(&snapshot)?;
            match out {
                Some(path) => {
                    std::fs::write(&path, json)
                        .wrap_err_with(|| format!("Failed to write {}", path.display()))?;
                    tracing::info!(path = %path.display(), count = snapshot.count, "Snapshot written");
                }
                None => println!("{}", json),
            }
            Ok(())
        }
        Commands::Import { snapshot: path } => {
            let store = open_store(&config.store).await?;
            let raw = std::fs::read(&path)
                .wrap_err_with(|| format!("Failed to read {}", path.display()))?;
            let snapshot: Snapshot = serde_json::from_slice(&raw)
                .wrap_err_with(|| format!("Invalid snapshot {}", path.display()))?;
            let report = snapshot::import_all(&store, &snapshot).await?;
            print_json(&report)
        }
        Commands::CheckPeers(args) => {
            let deployer = Deployer::from_config(&config).await?;
            let report = deployer.check_peer_link(&args.pair()).await?;
            print_json(&report)
        }
        Commands::CheckSecurity(args) => {
            let deployer = Deployer::from_config(&config).await?;
            let report = deployer.check_security_channel_match(&args.pair()).await?;
            print_json(&report)
        }
    }
}

async fn deploy(config: &Config, path: PathBuf) -> Result<()> {
    let raw = std::fs::read(&path).wrap_err_with(|| format!("Failed to read {}", path.display()))?;
    let request: DeploymentRequest = serde_json::from_slice(&raw)
        .wrap_err_with(|| format!("Invalid deployment request {}", path.display()))?;

    let deployer = Deployer::from_config(config).await?;
    let mut handle = deployer.start_deployment(request)?;
    tracing::info!(id = %handle.id, "Deployment started");

    loop {
        tokio::select! {
            event = handle.events().next() => {
                let Some(event) = event else { break };
                println!("{}", serde_json::to_string(&event)?);
                if let StepStatus::Failed(failure) = &event {
                    for action in &failure.recovery_actions {
                        tracing::warn!(step = %failure.step_id, "{}", action);
                    }
                }
            }
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Received Ctrl+C, stopping after the current step");
                handle.cancel();
            }
        }
    }

    let record = handle.join().await?;
    print_json(&record.result_addresses)
}

/// Initialize tracing/logging with structured output
fn init_logging() {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,bridge_deployer=debug"));

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true).with_writer(std::io::stderr))
        .with(filter)
        .init();
}
