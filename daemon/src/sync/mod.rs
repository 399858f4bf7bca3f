mod block_sync;
mod fast_switch;

pub use block_sync::BlockSyncMechanism;
pub use fast_switch::FastChainSwitchMechanism;

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use async_trait::async_trait;
use log::{debug, error, info, warn};
use thiserror::Error;
use tokio::sync::broadcast;

use atoll_common::{block::Block, crypto::Hash, crypto::Hashable};

use crate::{
    config::PENALTY_IRRECOVERABLE_FORK,
    core::{blockchain::Blockchain, error::BlockchainError, storage::Storage},
    events::Event,
    p2p::{P2pError, PeerId, PeerNetwork},
};

#[derive(Debug, Error)]
pub enum SyncError {
    #[error(transparent)]
    Chain(#[from] BlockchainError),

    #[error(transparent)]
    P2p(#[from] P2pError),

    #[error("Only {0} peers agree on a tip, not enough to sync")]
    NotEnoughPeers(usize),

    #[error("No common block found with peer {0}")]
    NoCommonBlock(PeerId),

    #[error("Peer {peer} chain requires reverting below the finalized height {finalized}")]
    IrrecoverableFork { peer: PeerId, finalized: u64 },

    #[error("Chunk retries exhausted against peer {0}")]
    RetriesExhausted(PeerId),

    #[error("Distance {distance} exceeds the fast switch bound {max}")]
    TooFarToSwitch { distance: u64, max: u64 },

    #[error("Peer {peer} sent an invalid block: {reason}")]
    InvalidPeerBlock { peer: PeerId, reason: String },

    #[error("Synchronization cancelled")]
    Cancelled,
}

impl SyncError {
    // Errors that are the remote chain's fault earn the full penalty
    pub fn peer_penalty(&self) -> Option<u32> {
        match self {
            SyncError::IrrecoverableFork { .. }
            | SyncError::NoCommonBlock(_)
            | SyncError::InvalidPeerBlock { .. }
            | SyncError::TooFarToSwitch { .. } => Some(PENALTY_IRRECOVERABLE_FORK),
            _ => None,
        }
    }
}

// One recovery strategy. `is_valid_for` is probed in registration order;
// the first match runs.
#[async_trait]
pub trait SyncMechanism<S: Storage>: Send + Sync {
    fn name(&self) -> &'static str;

    async fn is_valid_for(&self, block: &Block, peer: PeerId) -> Result<bool, SyncError>;

    async fn run(&self, block: &Block, peer: PeerId) -> Result<(), SyncError>;
}

// Consumes SyncRequired events and drives one mechanism at a time.
// While `active` is held, the transport drops inbound blocks and the
// forger skips its ticks.
pub struct Synchronizer<S: Storage> {
    blockchain: Arc<Blockchain<S>>,
    network: Arc<dyn PeerNetwork>,
    mechanisms: Vec<Box<dyn SyncMechanism<S>>>,
    active: Arc<AtomicBool>,
    shutdown: Arc<AtomicBool>,
}

impl<S: Storage> Synchronizer<S> {
    pub fn new(
        blockchain: Arc<Blockchain<S>>,
        network: Arc<dyn PeerNetwork>,
        active: Arc<AtomicBool>,
        shutdown: Arc<AtomicBool>,
    ) -> Self {
        let mechanisms: Vec<Box<dyn SyncMechanism<S>>> = vec![
            Box::new(BlockSyncMechanism::new(
                blockchain.clone(),
                network.clone(),
                shutdown.clone(),
            )),
            Box::new(FastChainSwitchMechanism::new(
                blockchain.clone(),
                network.clone(),
                shutdown.clone(),
            )),
        ];

        Self {
            blockchain,
            network,
            mechanisms,
            active,
            shutdown,
        }
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    // Event loop; returns when the bus closes or shutdown is requested
    pub async fn run(&self) {
        let mut events = self.blockchain.get_events().subscribe();
        loop {
            if self.shutdown.load(Ordering::SeqCst) {
                break;
            }

            match events.recv().await {
                Ok(Event::SyncRequired { block, peer_id }) => {
                    self.handle_sync_required(&block, peer_id).await;
                }
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!("synchronizer lagged, skipped {} events", skipped);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    }

    pub async fn handle_sync_required(&self, block: &Block, peer: PeerId) {
        if self.active.swap(true, Ordering::SeqCst) {
            debug!("synchronizer already active, ignoring trigger");
            return;
        }

        let result = self.select_and_run(block, peer).await;
        self.active.store(false, Ordering::SeqCst);

        match result {
            Ok(Some(name)) => {
                info!(
                    "synchronization via {} finished at height {}",
                    name,
                    self.blockchain.get_height().await
                );
            }
            Ok(None) => {
                debug!("no sync mechanism valid for block {}", block.hash());
            }
            Err(err) => {
                error!("synchronization failed: {}", err);
                if let Some(penalty) = err.peer_penalty() {
                    self.network.apply_penalty(peer, penalty).await;
                }
            }
        }
    }

    async fn select_and_run(
        &self,
        block: &Block,
        peer: PeerId,
    ) -> Result<Option<&'static str>, SyncError> {
        for mechanism in &self.mechanisms {
            if mechanism.is_valid_for(block, peer).await? {
                info!("starting {} against peer {}", mechanism.name(), peer);
                mechanism.run(block, peer).await?;
                return Ok(Some(mechanism.name()));
            }
        }

        Ok(None)
    }
}

// Sample of our chain used to locate the highest common block: the last
// ten block ids, then every round-length-th id down to genesis.
pub(crate) async fn build_block_id_sample<S: Storage>(
    blockchain: &Blockchain<S>,
) -> Result<Vec<Hash>, BlockchainError> {
    let tip_height = blockchain.get_height().await;
    let round_length = blockchain.get_slots().get_round_length();

    let mut heights = Vec::new();
    for offset in 0..10 {
        match tip_height.checked_sub(offset) {
            Some(height) => heights.push(height),
            None => break,
        }
    }

    let mut height = tip_height.saturating_sub(tip_height % round_length);
    loop {
        if !heights.contains(&height) {
            heights.push(height);
        }
        if height == 0 {
            break;
        }
        height = height.saturating_sub(round_length);
    }

    let mut ids = Vec::with_capacity(heights.len());
    for height in heights {
        if let Some(id) = blockchain.get_block_id_at_height(height).await? {
            ids.push(id);
        }
    }

    Ok(ids)
}

// Revert the local tip down to `target_height`, parking reverted blocks
// in the temp region. Refuses to cross the finalized height.
pub(crate) async fn revert_to_height<S: Storage>(
    blockchain: &Blockchain<S>,
    target_height: u64,
    peer: PeerId,
) -> Result<(), SyncError> {
    let finalized = blockchain.get_finalized_height().await;
    if target_height < finalized {
        return Err(SyncError::IrrecoverableFork { peer, finalized });
    }

    while blockchain.get_height().await > target_height {
        let height = blockchain.get_height().await;
        if height <= finalized {
            return Err(SyncError::IrrecoverableFork { peer, finalized });
        }

        debug!("reverting block at height {}", height);
        blockchain.delete_last_block_to_temp().await?;
    }

    Ok(())
}

// Cheap structural check on a fetched chunk before it reaches
// processValidated: contiguous heights, linked ids, valid signatures
// and matching payload roots.
pub(crate) fn validate_chunk(
    blocks: &[Block],
    mut previous_id: Hash,
    mut previous_height: u64,
    peer: PeerId,
) -> Result<(), SyncError> {
    for block in blocks {
        let header = block.get_header();
        if header.previous_block_id != previous_id || header.height != previous_height + 1 {
            return Err(SyncError::InvalidPeerBlock {
                peer,
                reason: format!("chunk breaks linkage at height {}", header.height),
            });
        }

        if header.verify_signature().is_err() {
            return Err(SyncError::InvalidPeerBlock {
                peer,
                reason: format!("bad signature at height {}", header.height),
            });
        }

        if !block.verify_transaction_root() {
            return Err(SyncError::InvalidPeerBlock {
                peer,
                reason: format!("bad transaction root at height {}", header.height),
            });
        }

        previous_id = block.hash();
        previous_height = header.height;
    }

    Ok(())
}
