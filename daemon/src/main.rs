use std::{
    fs,
    sync::{atomic::AtomicBool, atomic::Ordering, Arc},
    time::Duration,
};

use anyhow::{Context, Result};
use clap::Parser;
use log::{info, warn};

use atoll_common::config::{ForgingConfig, GenesisConfig, NetworkConfig};

use atoll_daemon::{
    config::{NodeConfig, MEMPOOL_SWEEP_INTERVAL_MILLIS},
    core::{blockchain::Blockchain, storage::SledStorage},
    events::EventBus,
    forger::Forger,
    p2p::{OfflineNetwork, PeerNetwork, Transport},
    rpc::ApiHandler,
    sync::Synchronizer,
};

#[tokio::main]
async fn main() -> Result<()> {
    let config = NodeConfig::parse();
    env_logger::Builder::new()
        .parse_filters(&config.log_level)
        .init();

    let genesis_json = fs::read_to_string(&config.genesis_config)
        .with_context(|| format!("cannot read genesis config {}", config.genesis_config))?;
    let genesis_config =
        GenesisConfig::from_json(&genesis_json).context("invalid genesis config")?;

    let storage = SledStorage::open(&config.data_dir).context("cannot open storage")?;
    let events = EventBus::new();
    let blockchain = Blockchain::new(storage, genesis_config, events)
        .await
        .context("cannot initialize blockchain")?;

    let sync_active = Arc::new(AtomicBool::new(false));
    let shutdown = Arc::new(AtomicBool::new(false));

    let network_config = match &config.network_config {
        Some(path) => {
            let json = fs::read_to_string(path)
                .with_context(|| format!("cannot read network config {}", path))?;
            serde_json::from_str::<NetworkConfig>(&json).context("invalid network config")?
        }
        None => NetworkConfig {
            network_version: "1.0".to_string(),
            max_peers: 32,
            seed_peers: Vec::new(),
        },
    };

    // Peer networking backend is pluggable; without one the node runs
    // standalone: it forges, serves RPC and keeps its pool.
    if !network_config.seed_peers.is_empty() {
        warn!(
            "{} seed peers configured but no network backend is compiled in",
            network_config.seed_peers.len()
        );
    }
    let network: Arc<dyn PeerNetwork> = Arc::new(OfflineNetwork);

    let transport = Arc::new(Transport::new(
        blockchain.clone(),
        network.clone(),
        sync_active.clone(),
    ));
    {
        let transport = transport.clone();
        tokio::spawn(async move {
            transport.run_broadcast_loop().await;
        });
    }

    let synchronizer = Arc::new(Synchronizer::new(
        blockchain.clone(),
        network.clone(),
        sync_active.clone(),
        shutdown.clone(),
    ));
    {
        let synchronizer = synchronizer.clone();
        tokio::spawn(async move {
            synchronizer.run().await;
        });
    }

    // Pool expiry sweeper
    {
        let blockchain = blockchain.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            let mut ticker =
                tokio::time::interval(Duration::from_millis(MEMPOOL_SWEEP_INTERVAL_MILLIS));
            loop {
                ticker.tick().await;
                if shutdown.load(Ordering::SeqCst) {
                    break;
                }
                blockchain.expire_pool_transactions().await;
            }
        });
    }

    // Forging, when configured
    let forger = match &config.forging_config {
        Some(path) => {
            let forging_json = fs::read_to_string(path)
                .with_context(|| format!("cannot read forging config {}", path))?;
            let forging_config: ForgingConfig =
                serde_json::from_str(&forging_json).context("invalid forging config")?;

            let default_password = forging_config.default_password.clone();
            let force_enable = config.force_forging || forging_config.force;
            let forger = Arc::new(
                Forger::new(
                    blockchain.clone(),
                    forging_config,
                    sync_active.clone(),
                    shutdown.clone(),
                )
                .context("invalid forging setup")?,
            );

            if force_enable {
                match default_password {
                    Some(password) => forger.enable_all(&password).await,
                    None => warn!("force forging requested but no default password configured"),
                }
            }

            let runner = forger.clone();
            tokio::spawn(async move {
                runner.run().await;
            });
            Some(forger)
        }
        None => None,
    };

    let _api = ApiHandler::new(
        blockchain.clone(),
        forger,
        network.clone(),
        network_config.network_version.clone(),
        sync_active.clone(),
    );

    info!(
        "atoll daemon running at height {}, ctrl-c to stop",
        blockchain.get_height().await
    );

    tokio::signal::ctrl_c().await.context("signal handler")?;
    info!("shutting down");

    // Stop forger ticks and timers, let an in-flight sync reach its next
    // chunk boundary, then close the store last
    shutdown.store(true, Ordering::SeqCst);
    while sync_active.load(Ordering::SeqCst) {
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    blockchain.flush().await.context("final storage flush")?;
    info!("storage flushed, bye");
    Ok(())
}
