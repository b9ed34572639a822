//! Covault node command line
//!
//! `covault keeper -c config.toml` runs the request processor;
//! `covault observer -c config.toml` runs the chain driver and the
//! read-only API.

mod config;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use config::Configuration;
use covault_core::mtg::{MemoryMessenger, MemoryMtgSource, Messenger, MtgSource};
use covault_observer::api::{self, ApiState};
use covault_observer::bond::MemoryBondFactory;
use covault_observer::rpc::ObserverRpc;
use covault_observer::{Node as ObserverNode, ObserverStore};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser)]
#[command(name = "covault")]
#[command(about = "Non-custodial 2-of-3 vault node", version)]
struct Cli {
    /// Path to the TOML configuration
    #[arg(short, long, default_value = "config.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the keeper request processor
    Keeper,
    /// Run the observer chain driver and read-only API
    Observer,
}

#[tokio::main]
async fn main() -> Result<()> {
    FmtSubscriber::builder()
        .with_max_level(Level::INFO)
        .init();

    let cli = Cli::parse();
    let conf = Configuration::load(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;

    match cli.command {
        Commands::Keeper => run_keeper(conf).await,
        Commands::Observer => run_observer(conf).await,
    }
}

async fn run_keeper(conf: Configuration) -> Result<()> {
    let store = covault_keeper::Store::open(conf.keeper_store_path())?;
    let rpc = Arc::new(ObserverRpc::new(&conf.chain_endpoints()?)?);
    let node = covault_keeper::Node::new(store, conf.keeper_conf()?, rpc);
    // a deployment links its transport adapter here; the memory source is
    // the same seam the tests drive
    let source = Arc::new(MemoryMtgSource::new());
    let messenger = Arc::new(MemoryMessenger::new());
    info!("keeper ready, awaiting transport outputs");

    let consumer = async {
        let mut cursor = 0u64;
        loop {
            let outputs = match source.poll(cursor).await {
                Ok(outputs) => outputs,
                Err(e) => {
                    tracing::warn!(error = %e, "transport poll failed");
                    tokio::time::sleep(std::time::Duration::from_secs(3)).await;
                    continue;
                }
            };
            if outputs.is_empty() {
                tokio::time::sleep(std::time::Duration::from_secs(3)).await;
                continue;
            }
            for output in outputs {
                let (payments, shortage) = node.process_output(&output).await;
                if let Some(asset) = shortage {
                    tracing::warn!(%asset, "asset shortage, awaiting redelivery");
                    break;
                }
                for payment in &payments {
                    if let Err(e) = messenger.send(payment).await {
                        tracing::warn!(error = %e, "payment send failed");
                    }
                }
                cursor = output.sequence;
            }
        }
    };

    tokio::select! {
        _ = consumer => {}
        _ = tokio::signal::ctrl_c() => {
            info!("keeper stopped");
        }
    }
    Ok(())
}

async fn run_observer(conf: Configuration) -> Result<()> {
    let store = ObserverStore::open(conf.observer_store_path())?;
    let keeper_store = Arc::new(covault_keeper::Store::open(conf.keeper_store_path())?);
    let rpc = Arc::new(ObserverRpc::new(&conf.chain_endpoints()?)?);
    let node = Arc::new(ObserverNode::new(
        conf.observer_conf()?,
        store,
        Arc::clone(&keeper_store),
        rpc,
        Arc::new(MemoryMessenger::new()),
        Arc::new(MemoryBondFactory::new()),
    ));
    Arc::clone(&node).boot().await;

    let api_state = Arc::new(ApiState { keeper_store });
    let addr = conf.api_listen_addr()?;
    tokio::select! {
        result = api::serve(api_state, addr) => {
            result.context("api server")?;
        }
        _ = tokio::signal::ctrl_c() => {
            info!("observer stopped");
        }
    }
    Ok(())
}
