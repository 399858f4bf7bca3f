use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use async_trait::async_trait;
use log::{debug, info};

use atoll_common::{block::Block, crypto::Hash, crypto::Hashable};

use crate::{
    core::{blockchain::Blockchain, storage::Storage},
    p2p::{PeerId, PeerNetwork},
};

use super::{revert_to_height, validate_chunk, SyncError, SyncMechanism};

// Small one- or two-block reorganization: bounded-depth search for a
// common ancestor, revert to it and adopt the peer's branch. Strictly
// rejected beyond two rounds of distance.
pub struct FastChainSwitchMechanism<S: Storage> {
    blockchain: Arc<Blockchain<S>>,
    network: Arc<dyn PeerNetwork>,
    shutdown: Arc<AtomicBool>,
}

impl<S: Storage> FastChainSwitchMechanism<S> {
    pub fn new(
        blockchain: Arc<Blockchain<S>>,
        network: Arc<dyn PeerNetwork>,
        shutdown: Arc<AtomicBool>,
    ) -> Self {
        Self {
            blockchain,
            network,
            shutdown,
        }
    }

    fn max_distance(&self) -> u64 {
        2 * self.blockchain.get_slots().get_round_length()
    }

    // Ids of our last `max_distance` blocks, tip first
    async fn recent_block_ids(&self) -> Result<Vec<Hash>, SyncError> {
        let tip_height = self.blockchain.get_height().await;
        let lowest = tip_height.saturating_sub(self.max_distance());

        let mut ids = Vec::new();
        let mut height = tip_height;
        loop {
            if let Some(id) = self.blockchain.get_block_id_at_height(height).await? {
                ids.push(id);
            }
            if height == lowest {
                break;
            }
            height -= 1;
        }

        Ok(ids)
    }
}

#[async_trait]
impl<S: Storage> SyncMechanism<S> for FastChainSwitchMechanism<S> {
    fn name(&self) -> &'static str {
        "fast chain switching"
    }

    async fn is_valid_for(&self, block: &Block, _peer: PeerId) -> Result<bool, SyncError> {
        let header = block.get_header();
        let tip_height = self.blockchain.get_height().await;

        // a sibling branch no further than one block ahead, forged by an
        // active delegate
        if header.height > tip_height + 1 {
            return Ok(false);
        }
        if tip_height.saturating_sub(header.height) > self.max_distance() {
            return Ok(false);
        }

        let generator = header.generator_public_key.to_address();
        let validators = self.blockchain.get_validators().await;
        Ok(validators.iter().any(|v| *v == generator))
    }

    async fn run(&self, block: &Block, peer: PeerId) -> Result<(), SyncError> {
        let max_distance = self.max_distance();

        // bounded-depth search for the common ancestor
        let sample = self.recent_block_ids().await?;
        let common = self
            .network
            .request_highest_common_block(peer, &sample)
            .await?
            .ok_or(SyncError::NoCommonBlock(peer))?;

        let tip_height = self.blockchain.get_height().await;
        let target_height = block.get_header().height;
        let distance = tip_height
            .saturating_sub(common.height)
            .max(target_height.saturating_sub(common.height));
        if distance > max_distance {
            return Err(SyncError::TooFarToSwitch {
                distance,
                max: max_distance,
            });
        }

        info!(
            "fast switch to branch of peer {} from common height {}",
            peer, common.height
        );

        // fetch and structurally validate the peer branch before touching
        // our own chain
        let mut branch: Vec<Block> = Vec::new();
        let mut from = common.id.clone();
        let mut from_height = common.height;
        while from_height < target_height {
            if self.shutdown.load(Ordering::SeqCst) {
                return Err(SyncError::Cancelled);
            }

            let chunk = self.network.request_blocks_from_id(peer, &from).await?;
            if chunk.is_empty() {
                break;
            }

            validate_chunk(&chunk, from.clone(), from_height, peer)?;
            let last = chunk.last().expect("chunk not empty");
            from = last.hash();
            from_height = last.get_header().height;
            branch.extend(chunk);
        }

        if branch.is_empty() {
            return Err(SyncError::InvalidPeerBlock {
                peer,
                reason: "peer served none of its own branch".into(),
            });
        }

        // adopt: revert to the ancestor, then apply the branch
        revert_to_height(&self.blockchain, common.height, peer).await?;
        for block in branch {
            let height = block.get_header().height;
            if let Err(err) = self.blockchain.process_validated(block).await {
                // reverted blocks are parked in the temp region and will
                // be replayed on restart
                debug!("branch apply failed at height {}: {}", height, err);
                return Err(err.into());
            }
        }

        Ok(())
    }
}
